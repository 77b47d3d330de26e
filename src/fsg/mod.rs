//! Finite-state grammars and the JSGF front end that compiles into them.
pub mod jsgf;
pub mod model;

pub use model::{FsgLink, FsgModel};

#![doc = include_str!("../README.md")]
use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod acoustic;
pub mod config;
pub mod decoder;
pub mod dict;
pub mod error;
pub mod feat;
pub mod fsg;
pub mod lattice;
pub mod lm;
pub mod logmath;
pub mod mdef;
pub mod search;

pub use config::DecoderConfig;
pub use decoder::{Decoder, UttState};
pub use dict::Dict;
pub use error::{Result, SttError};
pub use fsg::FsgModel;
pub use lm::NgramModel;
pub use mdef::BinMdef;

/// Convenience function to setup logging for any binaries I create.
/// Automatically sets all binaries and the library crate to `info` logging
/// by default.
pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("xd_stt=info,app=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}

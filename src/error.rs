//! Error types shared across the crate. Loaders return these so a caller can
//! try another format on `BadFormat` or bail out properly on corruption,
//! instead of the process just falling over mid-decode.
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SttError {
    /// A model file failed a magic/version/structure check. The caller is
    /// free to retry the data with a different format reader.
    #[error("bad format in {what}: {details}")]
    BadFormat { what: &'static str, details: String },
    /// Underlying read or write failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// A quantized index or packed value exceeds its declared width. The
    /// model data is corrupt and decoding cannot safely continue.
    #[error("value out of range in {what}: {details}")]
    OutOfRange { what: &'static str, details: String },
    /// Word or phone not known to the dictionary/model.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    /// API called in the wrong utterance phase, decoder state is unchanged.
    #[error("operation not legal in utterance state {state}: {op}")]
    BadState { state: &'static str, op: &'static str },
    /// No active HMMs survived pruning for a frame. The utterance will
    /// produce an empty hypothesis.
    #[error("beam exhausted at frame {frame}")]
    BeamExhausted { frame: i32 },
}

impl SttError {
    pub fn bad_format(what: &'static str, details: impl Into<String>) -> Self {
        Self::BadFormat {
            what,
            details: details.into(),
        }
    }

    pub fn out_of_range(what: &'static str, details: impl Into<String>) -> Self {
        Self::OutOfRange {
            what,
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SttError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let e: SttError = io::Error::new(io::ErrorKind::NotFound, "nope").into();
        assert!(matches!(e, SttError::Io(_)));
    }

    #[test]
    fn display_formats() {
        let e = SttError::bad_format("mdef", "magic mismatch");
        assert_eq!(e.to_string(), "bad format in mdef: magic mismatch");
    }
}

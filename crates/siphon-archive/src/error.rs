use std::io;

use zip::result::ZipError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("input is not a zip archive")]
    NotZip,

    #[error("archive is truncated at offset {offset}")]
    Truncated { offset: u64 },

    #[error("unexpected signature {signature:#010x} at offset {offset}")]
    BadSignature { signature: u32, offset: u64 },

    #[error("entry '{name}' uses unsupported compression method {method}")]
    UnsupportedCompression { name: String, method: u16 },

    #[error("entry '{name}' is encrypted")]
    Encrypted { name: String },

    #[error("entry '{name}' is stored without a known length")]
    UnknownLength { name: String },

    #[error("payload of '{name}' cannot be decoded: {source}")]
    Payload {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid entry header at offset {offset}: {source}")]
    Header {
        offset: u64,
        #[source]
        source: ZipError,
    },

    #[error("CRC mismatch in '{name}': expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { name: String, expected: u32, actual: u32 },

    #[error("size mismatch in '{name}': header says {expected} bytes, got {actual}")]
    SizeMismatch { name: String, expected: u64, actual: u64 },

    #[error("entry path contains null byte")]
    InvalidPath,

    #[error("entry path '{path}' has no components left after normalization")]
    EmptyPath { path: String },

    #[error("archive decoder stopped")]
    DecoderStopped,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors that describe a single entry's name rather than the
    /// byte stream itself.
    pub fn is_name_error(&self) -> bool {
        matches!(self, Error::InvalidPath | Error::EmptyPath { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

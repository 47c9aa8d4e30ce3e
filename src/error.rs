//! Error types for the catcher library

use thiserror::Error;

use crate::topology::Baseline;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Baseline {0} is not part of this data package")]
    UnknownBaseline(Baseline),

    #[error("Blob from qid #{qid}, fid #{fid} is {got} bytes, expected {expected}")]
    BlobSize {
        qid: usize,
        fid: usize,
        got: usize,
        expected: usize,
    },

    #[error("Channel range at sample {offset} with {len} samples exceeds row of {row_len}")]
    ChannelRange {
        offset: usize,
        len: usize,
        row_len: usize,
    },

    #[error("Malformed data package: {0}")]
    Malformed(String),

    #[error("Failed to encode or decode data package: {0}")]
    Codec(#[from] bincode::Error),

    #[error("{0} thread can't be started, its state was lost when it panicked")]
    StageLost(&'static str),
}

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no {domain} files found in {}", dir.display())]
    EmptyDomain { domain: &'static str, dir: PathBuf },

    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch between domain batches: {x:?} vs {y:?}")]
    ShapeMismatch { x: [usize; 4], y: [usize; 4] },

    #[error("corrupt record in {} at byte {offset}: {reason}", path.display())]
    Record {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("unusable image #{index} in {}: {reason}", path.display())]
    Decode {
        path: PathBuf,
        index: usize,
        reason: String,
    },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("cannot listen on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model record error: {0}")]
    Recorder(#[from] burn::record::RecorderError),

    #[error("config error: {0}")]
    Config(#[from] burn::config::ConfigError),
}

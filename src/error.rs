use thiserror::Error;

/// Error kinds for the detector, solver, and aligner/accumulator surfaces.
///
/// `DetectionEmpty` and `SolveFailed` are ordinary outcomes from the host's
/// point of view; they are still modeled as enum variants rather than
/// silently-empty `Ok` values so that callers who *do* want to distinguish
/// "no stars" from "bad input" can match on them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to allocate working buffers: {0}")]
    AllocationFailure(String),

    #[error("no peaks found above threshold")]
    DetectionEmpty,

    #[error("failed to load index {path}: {source}")]
    IndexLoadFailure {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no depth window reached the log-odds keep threshold")]
    SolveFailed,

    #[error("insufficient correspondences or RANSAC failure: {0}")]
    AlignFailed(String),

    #[error("singular system encountered during affine fit")]
    Singular,
}

pub type Result<T> = std::result::Result<T, Error>;

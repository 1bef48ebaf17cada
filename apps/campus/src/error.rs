use crate::api::ApiError;
use crate::drafts::DraftError;
use crate::realtime::RealtimeError;
use crate::submit::SubmitError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("{0}")]
    Realtime(#[from] RealtimeError),
    #[error("{0}")]
    Draft(#[from] DraftError),
    #[error("{0}")]
    Submit(#[from] SubmitError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

//! Sinks to which decoded trace events are published.
use crate::diag;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to setup sink during I/O:{} {1}", { if let Some(s) = .0 {
        format!(" {}:", s)
    } else {
        "".to_string()
    }})]
    SetupIOError(Option<String>, #[source] std::io::Error),
    #[error("Failed to create FIFO {0}: {1}")]
    MkfifoError(String, #[source] nix::Error),
}

impl diag::DiagnosableError for SinkError {}

pub mod fifo;
pub use fifo::{FifoOptions, FifoSet, HWFIFO_NAME};

mod filewriter;
pub use filewriter::FileWriterSink;

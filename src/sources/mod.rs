//! A source from which raw trace bytes are read. Chunks from a source
//! are pushed through the session decoders and on to the configured
//! sinks.
use crate::diag;

use thiserror::Error;

/// Bytes read from the input per call.
pub const TRANSFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to open trace input: {0}")]
    SetupIOError(#[source] std::io::Error),
    #[error("Failed to connect to trace server {0}: {1}")]
    ConnectError(String, #[source] std::io::Error),
    #[error("Failed to read trace data: {0}")]
    IterIOError(#[source] std::io::Error),
}

impl diag::DiagnosableError for SourceError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            SourceError::ConnectError(..) => vec![
                "Is the trace server running? A file input can be used instead with -f."
                    .to_string(),
            ],
            _ => vec![],
        }
    }
}

/// Byte-chunk sources. Iteration ends at end of input (where the
/// source has one); errors are surfaced in-band.
pub trait Source: Iterator<Item = Result<Vec<u8>, SourceError>> + Send {
    fn describe(&self) -> String;
}

mod file;
pub use file::FileSource;

mod net;
pub use net::NetSource;

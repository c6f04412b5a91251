//! Source which reads raw trace bytes from a file.
use crate::sources::{Source, SourceError, TRANSFER_SIZE};

use std::fs;
use std::io::Read;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// How long to wait for more data when following a growing file.
const EOF_POLL: Duration = Duration::from_millis(100);

/// Raw bytes deserialized from a file. With `end_at_eof` unset the
/// source keeps polling the file for growth, mirroring a live capture
/// being appended to.
pub struct FileSource {
    file: fs::File,
    name: String,
    end_at_eof: bool,
}

impl FileSource {
    pub fn open(path: &Path, end_at_eof: bool) -> Result<Self, SourceError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(SourceError::SetupIOError)?;

        Ok(Self {
            file,
            name: path.display().to_string(),
            end_at_eof,
        })
    }
}

impl Iterator for FileSource {
    type Item = Result<Vec<u8>, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = vec![0u8; TRANSFER_SIZE];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => {
                    if self.end_at_eof {
                        return None;
                    }
                    thread::sleep(EOF_POLL);
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Some(Ok(buf));
                }
                Err(e) => return Some(Err(SourceError::IterIOError(e))),
            }
        }
    }
}

impl Source for FileSource {
    fn describe(&self) -> String {
        format!("file ({})", self.name)
    }
}

//! Sink for the reserved filewriter software channel: the raw payload
//! bytes are appended to a capture file for the host side of the
//! target's file-transfer protocol.
use crate::channels::raw_software_bytes;
use crate::dispatch::FileWriter;
use crate::itm::Software;
use crate::sinks::SinkError;

use std::fs;
use std::io::Write;
use std::path::Path;

pub struct FileWriterSink {
    file: fs::File,
}

impl FileWriterSink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                SinkError::SetupIOError(Some(format!("Failed to open {}", path.display())), e)
            })?;

        Ok(Self { file })
    }
}

impl FileWriter for FileWriterSink {
    fn process(&mut self, m: Software) {
        // Delivery is best-effort, matching the channel FIFOs.
        let _ = self.file.write_all(&raw_software_bytes(&m));
    }
}

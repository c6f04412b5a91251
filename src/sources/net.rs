//! Source which reads raw trace bytes from the trace server over TCP,
//! reconnecting with a backoff when the link drops.
use crate::log;
use crate::sources::{Source, SourceError, TRANSFER_SIZE};

use std::io::Read;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

/// Pause between reconnection attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Raw bytes from the network trace server.
pub struct NetSource {
    server: String,
    stream: Option<TcpStream>,
}

impl NetSource {
    /// Connect to `server` (a `host:port` pair). The initial
    /// connection failing is an error; later drops reconnect silently.
    pub fn connect(server: &str) -> Result<Self, SourceError> {
        let stream = TcpStream::connect(server)
            .map_err(|e| SourceError::ConnectError(server.to_string(), e))?;

        Ok(Self {
            server: server.to_string(),
            stream: Some(stream),
        })
    }

    fn reconnect(&mut self) {
        self.stream = None;
        loop {
            thread::sleep(RECONNECT_BACKOFF);
            match TcpStream::connect(&self.server) {
                Ok(stream) => {
                    log::info(format!("reconnected to {}", self.server));
                    self.stream = Some(stream);
                    return;
                }
                Err(_) => continue,
            }
        }
    }
}

impl Iterator for NetSource {
    type Item = Result<Vec<u8>, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = vec![0u8; TRANSFER_SIZE];
        loop {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => {
                    self.reconnect();
                    continue;
                }
            };

            match stream.read(&mut buf) {
                Ok(0) => {
                    log::warn(format!("lost link to {}", self.server));
                    self.reconnect();
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Some(Ok(buf));
                }
                Err(e) => {
                    log::warn(format!("read from {} failed: {}", self.server, e));
                    self.reconnect();
                }
            }
        }
    }
}

impl Source for NetSource {
    fn describe(&self) -> String {
        format!("trace server ({})", self.server)
    }
}

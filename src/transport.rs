use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::sync::SyncError;

/// Duplex byte channel carrying the sync subprotocol, with a per-operation
/// timeout. The channel is pre-handshaked: the `sync:` service is already
/// selected by the time a [`crate::sync::SyncService`] receives it.
pub trait SyncChannel: Send {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SyncError>;
    fn write_all(&mut self, data: &[u8]) -> Result<(), SyncError>;
    fn set_timeout(&mut self, dur: Duration);
    fn close(&mut self);
}

pub(crate) fn map_io(e: std::io::Error) -> SyncError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => SyncError::Timeout,
        _ => SyncError::Io(e),
    }
}

pub struct TcpTransport {
    stream: TcpStream,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, timeout: Duration) -> Self {
        let transport = Self { stream, timeout };
        transport.apply_timeout();
        transport
    }

    fn apply_timeout(&self) {
        self.stream.set_read_timeout(Some(self.timeout)).ok();
        self.stream.set_write_timeout(Some(self.timeout)).ok();
    }
}

impl SyncChannel for TcpTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SyncError> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.stream.read(&mut buf[read..]).map_err(map_io)?;
            if n == 0 {
                return Err(SyncError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "sync channel closed mid-read",
                )));
            }
            read += n;
        }
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), SyncError> {
        let mut written = 0;
        while written < data.len() {
            let n = self.stream.write(&data[written..]).map_err(map_io)?;
            if n == 0 {
                return Err(SyncError::Io(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "sync channel write returned 0 bytes",
                )));
            }
            written += n;
        }
        Ok(())
    }

    fn set_timeout(&mut self, dur: Duration) {
        self.timeout = dur;
        self.apply_timeout();
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

//! Seam for connecting to the device's I/O port.
//!
//! The session only owns making the connection and handing the raw stream to
//! a subscriber; reassembling that stream into lines is the out-of-scope
//! I/O-port reader's job. Tests substitute [`IoPortConnector`] with an
//! in-memory fake instead of opening a real socket.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};

/// Connects to the device's I/O port given the port number it announced.
pub trait IoPortConnector: Send + Sync {
    /// Opens a connection to `port` on the device, returning a readable
    /// stream of program output.
    fn connect(&self, port: u32) -> std::io::Result<Box<dyn Read + Send>>;
}

/// Connects over plain TCP to the same host as the control channel.
#[derive(Debug, Clone)]
pub struct TcpIoPortConnector {
    host: String,
}

impl TcpIoPortConnector {
    /// Connects to `port` on `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl IoPortConnector for TcpIoPortConnector {
    fn connect(&self, port: u32) -> std::io::Result<Box<dyn Read + Send>> {
        let addr = (self.host.as_str(), port as u16)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
            })?;

        let stream = TcpStream::connect(addr)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::io::Read;
    use std::sync::Mutex;

    use super::IoPortConnector;

    /// A fake connector that hands back pre-seeded bytes instead of opening a
    /// socket.
    pub struct FakeIoPortConnector {
        pub(crate) bytes: Mutex<Option<Vec<u8>>>,
    }

    impl FakeIoPortConnector {
        pub fn new(bytes: Vec<u8>) -> Self {
            Self {
                bytes: Mutex::new(Some(bytes)),
            }
        }
    }

    impl IoPortConnector for FakeIoPortConnector {
        fn connect(&self, _port: u32) -> std::io::Result<Box<dyn Read + Send>> {
            let bytes = self.bytes.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(std::io::Cursor::new(bytes)))
        }
    }
}

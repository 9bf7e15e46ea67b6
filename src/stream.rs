// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Blocking byte streams over established sockets.
//!
//! A [`ByteStream`] is what the connect path hands to the endpoint: a
//! transport-level duplex that can be split into independently owned read
//! and write halves, one per I/O thread. Plain TCP splits by cloning the
//! socket handle; the TLS stream splits by sharing a locked session (see
//! `tls`).
//!
//! Socket shutdown is driven through a separate [`StreamControl`] clone of
//! the raw socket, never through the halves, so a close can unblock a
//! reader stuck in `read` regardless of which wrapper owns the halves.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

use crate::config::TransportSettings;
use crate::error::Result;

// ============================================================================
// ByteStream
// ============================================================================

/// Read and write halves of a split stream.
pub struct StreamHalves {
    /// Half owned by the reader thread
    pub reader: Box<dyn Read + Send>,

    /// Half owned by the writer thread
    pub writer: Box<dyn Write + Send>,
}

/// A duplex byte stream that can be split into per-thread halves.
pub trait ByteStream: Send {
    /// Consume the stream, producing its two halves.
    fn split(self: Box<Self>) -> Result<StreamHalves>;
}

/// Plain TCP stream.
pub struct TcpByteStream {
    stream: TcpStream,
}

impl TcpByteStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl ByteStream for TcpByteStream {
    fn split(self: Box<Self>) -> Result<StreamHalves> {
        let reader = self.stream.try_clone()?;
        Ok(StreamHalves {
            reader: Box::new(reader),
            writer: Box::new(self.stream),
        })
    }
}

// ============================================================================
// StreamControl
// ============================================================================

/// Out-of-band handle to the raw socket beneath a stream.
///
/// Holds a clone of the socket handle. Shutdown through it reaches the
/// shared open file description, so a reader blocked in `read` on another
/// clone returns immediately.
#[derive(Debug)]
pub struct StreamControl {
    stream: TcpStream,
}

impl StreamControl {
    pub fn new(stream: &TcpStream) -> Result<Self> {
        Ok(Self {
            stream: stream.try_clone()?,
        })
    }

    /// Local port of the socket.
    pub fn local_port(&self) -> u16 {
        self.stream
            .local_addr()
            .map(|a| a.port())
            .unwrap_or_default()
    }

    /// Shut the socket down in both directions, unblocking any thread
    /// parked in a socket call. Idempotent; errors are ignored because the
    /// peer may have shut the socket down first.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

// ============================================================================
// Socket tuning
// ============================================================================

/// Apply the configured socket options to a freshly established socket.
pub fn tune_socket(stream: &TcpStream, settings: &TransportSettings) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(settings.nodelay)?;
    if settings.keepalive {
        let keepalive = TcpKeepalive::new()
            .with_time(settings.keepalive_interval)
            .with_interval(settings.keepalive_interval);
        sock.set_tcp_keepalive(&keepalive)?;
    }
    if settings.socket_send_buffer > 0 {
        sock.set_send_buffer_size(settings.socket_send_buffer)?;
    }
    if settings.socket_recv_buffer > 0 {
        sock.set_recv_buffer_size(settings.socket_recv_buffer)?;
    }
    Ok(())
}

/// Connect with a bounded timeout and tune the socket.
pub fn connect_tcp(
    addr: &std::net::SocketAddr,
    timeout: Duration,
    settings: &TransportSettings,
) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(addr, timeout)?;
    tune_socket(&stream, settings)?;
    Ok(stream)
}

// ============================================================================
// Test doubles
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Reader that yields scripted byte runs, then EOF.
    pub struct ScriptedReader {
        runs: VecDeque<Vec<u8>>,
    }

    impl ScriptedReader {
        pub fn new(runs: impl IntoIterator<Item = Vec<u8>>) -> Self {
            Self {
                runs: runs.into_iter().collect(),
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.runs.front_mut() {
                None => Ok(0),
                Some(run) => {
                    let n = run.len().min(buf.len());
                    buf[..n].copy_from_slice(&run[..n]);
                    run.drain(..n);
                    if run.is_empty() {
                        self.runs.pop_front();
                    }
                    Ok(n)
                }
            }
        }
    }

    /// Writer that captures everything into a shared buffer.
    #[derive(Clone, Default)]
    pub struct CapturingWriter {
        pub data: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for CapturingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// ByteStream over a scripted reader and a capturing writer.
    pub struct MockByteStream {
        pub reader: ScriptedReader,
        pub writer: CapturingWriter,
    }

    impl ByteStream for MockByteStream {
        fn split(self: Box<Self>) -> Result<StreamHalves> {
            Ok(StreamHalves {
                reader: Box::new(self.reader),
                writer: Box::new(self.writer),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_split_and_control() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let control = StreamControl::new(&client).unwrap();
        assert_ne!(control.local_port(), 0);

        let halves = Box::new(TcpByteStream::new(client)).split().unwrap();
        let mut writer = halves.writer;
        writer.write_all(b"ping").unwrap();

        let mut buf = [0u8; 4];
        let mut server_reader = server;
        server_reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        // Shutdown through the control unblocks the read half with EOF
        control.shutdown();
        let mut reader = halves.reader;
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_tune_socket_defaults() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        tune_socket(&stream, &TransportSettings::default()).unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[test]
    fn test_scripted_reader() {
        let mut reader = ScriptedReader::new([b"abc".to_vec(), b"de".to_vec()]);
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"c");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"de");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}

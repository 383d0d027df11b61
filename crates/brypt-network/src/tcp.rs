//! Stream-socket link driver.
//!
//! Frames are length-prefixed (u32 little-endian) so message boundaries
//! survive the stream; a zero-length frame is a connection state change
//! tick. Reads use a short receive timeout rather than a poll loop, so
//! the worker never blocks longer than one cycle on a quiet link.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use brypt_types::{BindingAddress, ConnectionHandle, ConnectionHandleGenerator, RemoteAddress};
use tracing::{debug, warn};

use crate::driver::{LinkDriver, LinkEvent};
use crate::endpoint::InternalType;
use crate::{NetworkError, Result};

/// How long a connect attempt may take before it fails.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Receive timeout applied to every stream.
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(1);

/// Bytes pulled from a stream per poll.
const READ_CHUNK: usize = 4096;

struct TcpConnection {
    stream: TcpStream,
    address: RemoteAddress,
    buffer: Vec<u8>,
}

/// A [`LinkDriver`] over reliable stream sockets.
pub struct TcpDriver {
    generator: Arc<ConnectionHandleGenerator>,
    listener: Option<TcpListener>,
    connections: HashMap<ConnectionHandle, TcpConnection>,
}

impl TcpDriver {
    pub fn new(generator: Arc<ConnectionHandleGenerator>) -> Self {
        Self {
            generator,
            listener: None,
            connections: HashMap::new(),
        }
    }

    fn configure(stream: &TcpStream) -> std::io::Result<()> {
        stream.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        stream.set_nodelay(true)
    }

    fn accept_pending(&mut self, events: &mut Vec<LinkEvent>) {
        let Some(listener) = &self.listener else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(error) = Self::configure(&stream) {
                        warn!(%peer, %error, "Dropping connection that could not be configured");
                        continue;
                    }
                    let Ok(address) = RemoteAddress::new(
                        brypt_types::Protocol::Tcp,
                        &format!("{}:{}", peer.ip(), peer.port()),
                    ) else {
                        continue;
                    };
                    let handle = self.generator.next();
                    debug!(%handle, %address, "Accepted connection");
                    self.connections.insert(
                        handle,
                        TcpConnection {
                            stream,
                            address: address.clone(),
                            buffer: Vec::new(),
                        },
                    );
                    events.push(LinkEvent::Connected(handle, address));
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!(%error, "Accept failed");
                    break;
                }
            }
        }
    }

    fn receive_available(&mut self, events: &mut Vec<LinkEvent>) {
        let mut closed = Vec::new();
        for (handle, connection) in &mut self.connections {
            let mut chunk = [0u8; READ_CHUNK];
            match connection.stream.read(&mut chunk) {
                Ok(0) => closed.push(*handle),
                Ok(received) => {
                    connection.buffer.extend_from_slice(&chunk[..received]);
                    while let Some(frame) = take_frame(&mut connection.buffer) {
                        events.push(LinkEvent::Frame(*handle, frame));
                    }
                }
                Err(error)
                    if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(error) => {
                    warn!(handle = %handle, %error, "Receive failed");
                    closed.push(*handle);
                }
            }
        }
        for handle in closed {
            self.connections.remove(&handle);
            events.push(LinkEvent::Closed(handle));
        }
    }
}

fn take_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    if buffer.len() < 4 {
        return None;
    }
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&buffer[..4]);
    let length = u32::from_le_bytes(prefix) as usize;
    if buffer.len() < 4 + length {
        return None;
    }
    let frame = buffer[4..4 + length].to_vec();
    buffer.drain(..4 + length);
    Some(frame)
}

impl LinkDriver for TcpDriver {
    fn internal_type(&self) -> InternalType {
        InternalType::DirectStream
    }

    fn bind(&mut self, binding: &BindingAddress) -> Result<()> {
        let authority = if binding.is_wildcard() {
            binding
                .authority()
                .replacen('*', "0.0.0.0", 1)
        } else {
            binding.authority().to_string()
        };
        let listener = TcpListener::bind(&authority).map_err(|e| NetworkError::BindFailed {
            uri: binding.uri(),
            reason: e.to_string(),
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| NetworkError::BindFailed {
                uri: binding.uri(),
                reason: e.to_string(),
            })?;
        self.listener = Some(listener);
        Ok(())
    }

    fn connect(&mut self, remote: &RemoteAddress) -> Result<ConnectionHandle> {
        let target = remote
            .authority()
            .to_socket_addrs()
            .map_err(|e| NetworkError::ConnectFailed {
                uri: remote.uri(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| NetworkError::ConnectFailed {
                uri: remote.uri(),
                reason: "address did not resolve".to_string(),
            })?;

        let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT).map_err(|e| {
            NetworkError::ConnectFailed {
                uri: remote.uri(),
                reason: e.to_string(),
            }
        })?;
        Self::configure(&stream).map_err(|e| NetworkError::ConnectFailed {
            uri: remote.uri(),
            reason: e.to_string(),
        })?;

        let handle = self.generator.next();
        self.connections.insert(
            handle,
            TcpConnection {
                stream,
                address: remote.clone(),
                buffer: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn poll(&mut self, _timeout: Duration) -> Result<Vec<LinkEvent>> {
        let mut events = Vec::new();
        self.accept_pending(&mut events);
        self.receive_available(&mut events);
        Ok(events)
    }

    fn send(&mut self, handle: ConnectionHandle, frame: &[u8]) -> Result<()> {
        let connection = self
            .connections
            .get_mut(&handle)
            .ok_or(NetworkError::UnknownConnection(handle))?;
        let length = frame.len() as u32;
        let mut framed = Vec::with_capacity(4 + frame.len());
        framed.extend_from_slice(&length.to_le_bytes());
        framed.extend_from_slice(frame);
        connection
            .stream
            .write_all(&framed)
            .map_err(|e| NetworkError::SendFailed(format!("{}: {e}", connection.address)))
    }

    fn disconnect(&mut self, handle: ConnectionHandle) {
        self.connections.remove(&handle);
    }

    fn close(&mut self) {
        self.listener = None;
        self.connections.clear();
    }
}

//! In-memory link driver.
//!
//! Backs endpoint and runtime tests, and stands in for radio or bridge
//! hardware when none is attached. A [`LoopbackHub`] is the shared
//! medium: servers register their binding authority with the hub, and
//! client connects are matched to a registered listener by authority.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use brypt_types::{BindingAddress, ConnectionHandle, ConnectionHandleGenerator, RemoteAddress};
use parking_lot::Mutex;

use crate::driver::{LinkDriver, LinkEvent};
use crate::endpoint::InternalType;
use crate::{NetworkError, Result};

struct PendingConnection {
    handle: ConnectionHandle,
    remote: RemoteAddress,
    outbound: Sender<Vec<u8>>,
    inbound: Receiver<Vec<u8>>,
}

#[derive(Default)]
struct HubState {
    listeners: HashMap<String, Sender<PendingConnection>>,
}

/// The shared medium loopback drivers communicate through.
#[derive(Clone)]
pub struct LoopbackHub {
    generator: Arc<ConnectionHandleGenerator>,
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new(generator: Arc<ConnectionHandleGenerator>) -> Self {
        Self {
            generator,
            state: Arc::new(Mutex::new(HubState::default())),
        }
    }

    /// Create a driver attached to this hub.
    pub fn driver(&self) -> Box<dyn LinkDriver> {
        Box::new(LoopbackDriver {
            hub: self.clone(),
            accepts: None,
            connections: HashMap::new(),
        })
    }
}

struct LoopbackChannel {
    outbound: Sender<Vec<u8>>,
    inbound: Receiver<Vec<u8>>,
}

/// A [`LinkDriver`] whose link is a pair of in-process queues.
pub struct LoopbackDriver {
    hub: LoopbackHub,
    accepts: Option<Receiver<PendingConnection>>,
    connections: HashMap<ConnectionHandle, LoopbackChannel>,
}

impl LinkDriver for LoopbackDriver {
    fn internal_type(&self) -> InternalType {
        InternalType::Loopback
    }

    fn bind(&mut self, binding: &BindingAddress) -> Result<()> {
        let (sender, receiver) = channel();
        self.hub
            .state
            .lock()
            .listeners
            .insert(binding.authority().to_string(), sender);
        self.accepts = Some(receiver);
        Ok(())
    }

    fn connect(&mut self, remote: &RemoteAddress) -> Result<ConnectionHandle> {
        let listener = self
            .hub
            .state
            .lock()
            .listeners
            .get(remote.authority())
            .cloned()
            .ok_or_else(|| NetworkError::ConnectFailed {
                uri: remote.uri(),
                reason: "no listener registered".to_string(),
            })?;

        let client_handle = self.hub.generator.next();
        let server_handle = self.hub.generator.next();
        let (client_to_server, server_inbound) = channel();
        let (server_to_client, client_inbound) = channel();

        let synthetic = RemoteAddress::new(
            remote.protocol(),
            &format!("loopback:{}", client_handle.token()),
        )
        .map_err(|e| NetworkError::ConnectFailed {
            uri: remote.uri(),
            reason: e.to_string(),
        })?;

        listener
            .send(PendingConnection {
                handle: server_handle,
                remote: synthetic,
                outbound: server_to_client,
                inbound: server_inbound,
            })
            .map_err(|_| NetworkError::ConnectFailed {
                uri: remote.uri(),
                reason: "listener dropped".to_string(),
            })?;

        self.connections.insert(
            client_handle,
            LoopbackChannel {
                outbound: client_to_server,
                inbound: client_inbound,
            },
        );
        Ok(client_handle)
    }

    fn poll(&mut self, _timeout: Duration) -> Result<Vec<LinkEvent>> {
        let mut events = Vec::new();

        if let Some(accepts) = &self.accepts {
            while let Ok(pending) = accepts.try_recv() {
                events.push(LinkEvent::Connected(pending.handle, pending.remote));
                self.connections.insert(
                    pending.handle,
                    LoopbackChannel {
                        outbound: pending.outbound,
                        inbound: pending.inbound,
                    },
                );
            }
        }

        let mut closed = Vec::new();
        for (handle, link) in &self.connections {
            loop {
                match link.inbound.try_recv() {
                    Ok(frame) => events.push(LinkEvent::Frame(*handle, frame)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed.push(*handle);
                        break;
                    }
                }
            }
        }
        for handle in closed {
            self.connections.remove(&handle);
            events.push(LinkEvent::Closed(handle));
        }
        Ok(events)
    }

    fn send(&mut self, handle: ConnectionHandle, frame: &[u8]) -> Result<()> {
        let link = self
            .connections
            .get(&handle)
            .ok_or(NetworkError::UnknownConnection(handle))?;
        link.outbound
            .send(frame.to_vec())
            .map_err(|_| NetworkError::SendFailed("remote dropped the link".to_string()))
    }

    fn disconnect(&mut self, handle: ConnectionHandle) {
        self.connections.remove(&handle);
    }

    fn close(&mut self) {
        self.accepts = None;
        self.connections.clear();
    }
}

//! The endpoint abstraction and its worker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use brypt_event::{Event, EventPublisher};
use brypt_identifier::NodeIdentifier;
use brypt_message::MessageContext;
use brypt_types::{
    BindingAddress, ConnectionHandle, DisconnectCause, EndpointIdentifier, Operation, Protocol,
    RemoteAddress,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::driver::{LinkDriver, LinkEvent};
use crate::mediator::{PeerMediator, SessionHandler};
use crate::tracker::ConnectionTracker;
use crate::{
    INSTRUCTION_BACKOFF, INSTRUCTION_RETRY_LIMIT, MESSAGES_PER_CYCLE, MESSAGE_RETRY_LIMIT,
};

/// The concrete transport implementation behind an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternalType {
    /// Stream sockets driven directly by the runtime.
    DirectStream,
    /// Datagram radio hardware.
    Radio,
    /// Stream bridge to an attached co-processor.
    Bridge,
    /// In-memory link used by tests and absent hardware.
    Loopback,
}

/// The uniform surface every per-protocol endpoint exposes.
pub trait Endpoint: Send + Sync {
    fn identifier(&self) -> EndpointIdentifier;
    fn internal_type(&self) -> InternalType;
    fn protocol_type(&self) -> Protocol;
    fn operation(&self) -> Operation;

    /// The bound or most recently connected URI, once known.
    fn uri(&self) -> Option<String>;

    /// Order the worker to bind a server address.
    fn schedule_bind(&self, binding: BindingAddress);

    /// Order the worker to open a connection.
    fn schedule_connect(&self, remote: RemoteAddress);

    /// Spawn the worker. Idempotent.
    fn startup(&self);

    /// Queue bytes for a peer the tracker can translate. Returns false
    /// when no promoted connection exists for the peer.
    fn schedule_send(&self, peer: &NodeIdentifier, frame: Vec<u8>) -> bool;

    /// Stop and join the worker, then release transport descriptors.
    fn shutdown(&self);
}

enum Instruction {
    Bind(BindingAddress),
    Connect(RemoteAddress),
}

struct PendingInstruction {
    instruction: Instruction,
    attempts: u8,
    not_before: Instant,
}

struct OutgoingMessage {
    handle: ConnectionHandle,
    frame: Vec<u8>,
    attempts: u8,
}

#[derive(Default)]
struct SharedState {
    instructions: VecDeque<PendingInstruction>,
    outgoing: VecDeque<OutgoingMessage>,
    terminate: bool,
    uri: Option<String>,
}

#[derive(Default)]
struct WorkerShared {
    state: Mutex<SharedState>,
    signal: Condvar,
}

impl WorkerShared {
    fn enqueue_frame(&self, handle: ConnectionHandle, frame: Vec<u8>) -> bool {
        let mut state = self.state.lock();
        if state.terminate {
            return false;
        }
        state.outgoing.push_back(OutgoingMessage {
            handle,
            frame,
            attempts: 0,
        });
        self.signal.notify_all();
        true
    }
}

/// An endpoint whose transport is a [`LinkDriver`], with the worker
/// lifecycle shared by every protocol variant.
pub struct LinkEndpoint {
    identifier: EndpointIdentifier,
    protocol: Protocol,
    operation: Operation,
    internal: InternalType,
    cycle: Duration,
    shared: Arc<WorkerShared>,
    tracker: Arc<ConnectionTracker>,
    mediator: Arc<dyn PeerMediator>,
    publisher: Arc<EventPublisher>,
    driver: Mutex<Option<Box<dyn LinkDriver>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LinkEndpoint {
    pub fn new(
        identifier: EndpointIdentifier,
        protocol: Protocol,
        operation: Operation,
        cycle: Duration,
        driver: Box<dyn LinkDriver>,
        tracker: Arc<ConnectionTracker>,
        mediator: Arc<dyn PeerMediator>,
        publisher: Arc<EventPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            protocol,
            operation,
            internal: driver.internal_type(),
            cycle,
            shared: Arc::new(WorkerShared::default()),
            tracker,
            mediator,
            publisher,
            driver: Mutex::new(Some(driver)),
            worker: Mutex::new(None),
        })
    }
}

impl Endpoint for LinkEndpoint {
    fn identifier(&self) -> EndpointIdentifier {
        self.identifier
    }

    fn internal_type(&self) -> InternalType {
        self.internal
    }

    fn protocol_type(&self) -> Protocol {
        self.protocol
    }

    fn operation(&self) -> Operation {
        self.operation
    }

    fn uri(&self) -> Option<String> {
        self.shared.state.lock().uri.clone()
    }

    fn schedule_bind(&self, binding: BindingAddress) {
        let mut state = self.shared.state.lock();
        state.instructions.push_back(PendingInstruction {
            instruction: Instruction::Bind(binding),
            attempts: 0,
            not_before: Instant::now(),
        });
        self.shared.signal.notify_all();
    }

    fn schedule_connect(&self, remote: RemoteAddress) {
        let mut state = self.shared.state.lock();
        state.instructions.push_back(PendingInstruction {
            instruction: Instruction::Connect(remote),
            attempts: 0,
            not_before: Instant::now(),
        });
        self.shared.signal.notify_all();
    }

    fn startup(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let Some(driver) = self.driver.lock().take() else {
            return;
        };

        let mut runner = Worker {
            endpoint: self.identifier,
            protocol: self.protocol,
            operation: self.operation,
            cycle: self.cycle,
            driver,
            shared: self.shared.clone(),
            tracker: self.tracker.clone(),
            mediator: self.mediator.clone(),
            publisher: self.publisher.clone(),
            sessions: HashMap::new(),
            awaiting_request: HashMap::new(),
        };
        *worker = Some(std::thread::spawn(move || runner.run()));
    }

    fn schedule_send(&self, peer: &NodeIdentifier, frame: Vec<u8>) -> bool {
        let Some(handle) = self.tracker.translate_identifier(peer) else {
            return false;
        };
        self.shared.enqueue_frame(handle, frame)
    }

    fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.terminate = true;
            self.shared.signal.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(endpoint = %self.identifier, "Worker terminated abnormally");
            }
        }
    }
}

impl Drop for LinkEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The thread-owned half of an endpoint.
struct Worker {
    endpoint: EndpointIdentifier,
    protocol: Protocol,
    operation: Operation,
    cycle: Duration,
    driver: Box<dyn LinkDriver>,
    shared: Arc<WorkerShared>,
    tracker: Arc<ConnectionTracker>,
    mediator: Arc<dyn PeerMediator>,
    publisher: Arc<EventPublisher>,
    sessions: HashMap<ConnectionHandle, Weak<dyn SessionHandler>>,
    /// Server-side request/response alternation: true while the remote
    /// owes us a request, during which outbound frames are not allowed.
    awaiting_request: HashMap<ConnectionHandle, bool>,
}

impl Worker {
    fn run(&mut self) {
        info!(
            endpoint = %self.endpoint,
            protocol = %self.protocol,
            operation = %self.operation,
            "Endpoint worker starting"
        );
        self.publisher.publish(Event::EndpointStarted {
            endpoint: self.endpoint,
            protocol: self.protocol,
            operation: self.operation,
        });

        loop {
            self.process_instructions();
            self.receive_available();
            self.flush_outgoing();

            let mut state = self.shared.state.lock();
            if state.terminate {
                break;
            }
            if state.instructions.is_empty() && state.outgoing.is_empty() {
                self.shared.signal.wait_for(&mut state, self.cycle);
            }
            if state.terminate {
                break;
            }
        }

        self.driver.close();
        self.publisher.publish(Event::EndpointStopped {
            endpoint: self.endpoint,
            protocol: self.protocol,
            operation: self.operation,
        });
        info!(endpoint = %self.endpoint, "Endpoint worker stopped");
    }

    fn process_instructions(&mut self) {
        let now = Instant::now();
        let due: Vec<PendingInstruction> = {
            let mut state = self.shared.state.lock();
            let mut due = Vec::new();
            let mut deferred = VecDeque::new();
            while let Some(pending) = state.instructions.pop_front() {
                if pending.not_before <= now {
                    due.push(pending);
                } else {
                    deferred.push_back(pending);
                }
            }
            state.instructions = deferred;
            due
        };

        for pending in due {
            match &pending.instruction {
                Instruction::Bind(binding) => self.execute_bind(binding.clone(), pending.attempts),
                Instruction::Connect(remote) => {
                    self.execute_connect(remote.clone(), pending.attempts)
                }
            }
        }
    }

    fn execute_bind(&mut self, binding: BindingAddress, attempts: u8) {
        match self.driver.bind(&binding) {
            Ok(()) => {
                info!(endpoint = %self.endpoint, uri = %binding.uri(), "Endpoint bound");
                self.shared.state.lock().uri = Some(binding.uri());
            }
            Err(error) => {
                self.retry_instruction(Instruction::Bind(binding), attempts, &error.to_string());
            }
        }
    }

    fn execute_connect(&mut self, remote: RemoteAddress, attempts: u8) {
        if self.tracker.is_uri_tracked(&remote.uri()) {
            debug!(uri = %remote.uri(), "Skipping connect to an already tracked address");
            return;
        }

        match self.driver.connect(&remote) {
            Ok(handle) => {
                info!(endpoint = %self.endpoint, uri = %remote.uri(), "Connection opened");
                self.shared.state.lock().uri = Some(remote.uri());
                let initial = self.mediator.declare_resolving_peer(&remote);
                self.attach_connection(handle, remote);
                if let Some(frame) = initial {
                    self.shared.enqueue_frame(handle, frame);
                }
            }
            Err(error) => {
                self.retry_instruction(Instruction::Connect(remote), attempts, &error.to_string());
            }
        }
    }

    fn retry_instruction(&mut self, instruction: Instruction, attempts: u8, reason: &str) {
        let attempts = attempts + 1;
        let uri = match &instruction {
            Instruction::Bind(binding) => binding.uri(),
            Instruction::Connect(remote) => remote.uri(),
        };
        if attempts >= INSTRUCTION_RETRY_LIMIT {
            warn!(endpoint = %self.endpoint, %uri, %reason, "Instruction abandoned");
            if let Instruction::Connect(remote) = &instruction {
                self.mediator.rescind_resolving_peer(remote);
            }
            self.publisher.publish(Event::EndpointFailed {
                endpoint: self.endpoint,
                protocol: self.protocol,
                failure: format!("{uri}: {reason}"),
            });
            return;
        }

        let backoff = INSTRUCTION_BACKOFF * 2u32.saturating_pow(u32::from(attempts) - 1);
        warn!(
            endpoint = %self.endpoint,
            %uri,
            %reason,
            attempt = attempts,
            delay_ms = backoff.as_millis() as u64,
            "Instruction failed; retrying"
        );
        let mut state = self.shared.state.lock();
        state.instructions.push_back(PendingInstruction {
            instruction,
            attempts,
            not_before: Instant::now() + backoff,
        });
    }

    fn attach_connection(&mut self, handle: ConnectionHandle, address: RemoteAddress) {
        self.tracker.track(handle, Some(address.clone()));
        let session = self.mediator.link_connection(&address);

        let shared = self.shared.clone();
        let hook: crate::mediator::SendHook =
            Arc::new(move |frame: Vec<u8>| shared.enqueue_frame(handle, frame));
        session.register_endpoint(
            MessageContext::new(self.endpoint, self.protocol),
            Some(address),
            hook,
        );

        self.sessions.insert(handle, Arc::downgrade(&session));
        self.awaiting_request.insert(handle, true);
    }

    fn receive_available(&mut self) {
        let events = match self.driver.poll(self.cycle) {
            Ok(events) => events,
            Err(error) => {
                warn!(endpoint = %self.endpoint, %error, "Receive poll failed");
                return;
            }
        };

        for event in events {
            match event {
                LinkEvent::Connected(handle, address) => {
                    debug!(endpoint = %self.endpoint, %handle, %address, "Connection observed");
                    self.attach_connection(handle, address);
                }
                LinkEvent::Frame(handle, frame) if frame.is_empty() => {
                    // Zero-length stream frames are connection state ticks.
                    self.tracker.touch(handle);
                }
                LinkEvent::Frame(handle, frame) => self.deliver(handle, &frame),
                LinkEvent::Closed(handle) => self.detach(handle, DisconnectCause::SessionClosure),
            }
        }
    }

    fn deliver(&mut self, handle: ConnectionHandle, frame: &[u8]) {
        let Some(session) = self
            .sessions
            .get(&handle)
            .and_then(std::sync::Weak::upgrade)
        else {
            warn!(endpoint = %self.endpoint, %handle, "Dropping frame for a released session");
            self.tracker.untrack(handle);
            self.driver.disconnect(handle);
            self.sessions.remove(&handle);
            return;
        };

        self.awaiting_request.insert(handle, false);
        if !session.schedule_receive(self.endpoint, frame) {
            debug!(endpoint = %self.endpoint, %handle, "Session rejected received frame");
        }

        // Promote once resolution has yielded the node identifier.
        if self.tracker.translate_handle(handle).is_none() {
            if let Some(identifier) = session.node_identifier() {
                self.tracker.promote(handle, identifier);
            }
        }
    }

    fn detach(&mut self, handle: ConnectionHandle, cause: DisconnectCause) {
        debug!(endpoint = %self.endpoint, %handle, %cause, "Connection closed");
        if let Some(session) = self
            .sessions
            .remove(&handle)
            .and_then(|weak| weak.upgrade())
        {
            session.withdraw_endpoint(self.endpoint, cause);
        }
        self.awaiting_request.remove(&handle);
        self.tracker.untrack(handle);
        self.driver.disconnect(handle);
    }

    fn flush_outgoing(&mut self) {
        for _ in 0..MESSAGES_PER_CYCLE {
            let Some(message) = self.shared.state.lock().outgoing.pop_front() else {
                break;
            };

            // When serving, request/response alternation holds: no second
            // consecutive outbound frame until the remote speaks again.
            if self.operation == Operation::Server
                && self.awaiting_request.get(&message.handle) == Some(&true)
            {
                warn!(
                    endpoint = %self.endpoint,
                    handle = %message.handle,
                    "Skipping outbound frame awaiting the remote's request"
                );
                continue;
            }

            match self.driver.send(message.handle, &message.frame) {
                Ok(()) => {
                    if self.operation == Operation::Server {
                        self.awaiting_request.insert(message.handle, true);
                    }
                }
                Err(error) => {
                    let attempts = message.attempts + 1;
                    if attempts >= MESSAGE_RETRY_LIMIT {
                        warn!(
                            endpoint = %self.endpoint,
                            handle = %message.handle,
                            %error,
                            "Dropping frame after retry exhaustion"
                        );
                        continue;
                    }
                    debug!(
                        endpoint = %self.endpoint,
                        handle = %message.handle,
                        %error,
                        attempt = attempts,
                        "Send failed; will retry"
                    );
                    self.shared.state.lock().outgoing.push_back(OutgoingMessage {
                        handle: message.handle,
                        frame: message.frame,
                        attempts,
                    });
                }
            }
        }
    }
}

//! Owns the endpoints of one node and the drivers that back them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use brypt_event::EventPublisher;
use brypt_types::{
    BindingAddress, EndpointIdentifierGenerator, Operation, Protocol, RemoteAddress,
};
use parking_lot::Mutex;
use tracing::info;

use crate::driver::DriverFactory;
use crate::endpoint::{Endpoint, LinkEndpoint};
use crate::mediator::PeerMediator;
use crate::tracker::ConnectionTracker;
use crate::{NetworkError, Result, CYCLE_TIMEOUT};

/// Constructs, starts, and tears down the node's endpoints.
///
/// Drivers register per protocol; spawning an endpoint for a protocol
/// with no registered driver is an error, so absent hardware surfaces at
/// startup rather than at first use.
pub struct EndpointManager {
    generator: EndpointIdentifierGenerator,
    tracker: Arc<ConnectionTracker>,
    mediator: Arc<dyn PeerMediator>,
    publisher: Arc<EventPublisher>,
    cycle: Duration,
    drivers: Mutex<HashMap<Protocol, DriverFactory>>,
    endpoints: Mutex<Vec<Arc<LinkEndpoint>>>,
}

impl EndpointManager {
    pub fn new(
        tracker: Arc<ConnectionTracker>,
        mediator: Arc<dyn PeerMediator>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            generator: EndpointIdentifierGenerator::new(),
            tracker,
            mediator,
            publisher,
            cycle: CYCLE_TIMEOUT,
            drivers: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(Vec::new()),
        }
    }

    /// Override the worker cycle timeout endpoints park with.
    pub fn with_cycle_timeout(mut self, cycle: Duration) -> Self {
        self.cycle = cycle;
        self
    }

    /// Register the driver used for every endpoint of a protocol.
    pub fn register_driver(&self, protocol: Protocol, factory: DriverFactory) {
        self.drivers.lock().insert(protocol, factory);
    }

    /// Construct an endpoint without starting its worker.
    pub fn spawn(&self, protocol: Protocol, operation: Operation) -> Result<Arc<LinkEndpoint>> {
        let driver = {
            let drivers = self.drivers.lock();
            let factory = drivers
                .get(&protocol)
                .ok_or(NetworkError::DriverUnavailable(protocol))?;
            factory()
        };

        let endpoint = LinkEndpoint::new(
            self.generator.next(),
            protocol,
            operation,
            self.cycle,
            driver,
            self.tracker.clone(),
            self.mediator.clone(),
            self.publisher.clone(),
        );
        self.endpoints.lock().push(endpoint.clone());
        Ok(endpoint)
    }

    /// Spawn and start a server endpoint bound to an address.
    pub fn launch_server(
        &self,
        protocol: Protocol,
        binding: BindingAddress,
    ) -> Result<Arc<LinkEndpoint>> {
        let endpoint = self.spawn(protocol, Operation::Server)?;
        endpoint.schedule_bind(binding);
        endpoint.startup();
        Ok(endpoint)
    }

    /// Spawn and start a client endpoint, connecting each bootstrap.
    pub fn launch_client(
        &self,
        protocol: Protocol,
        bootstraps: &[RemoteAddress],
    ) -> Result<Arc<LinkEndpoint>> {
        let endpoint = self.spawn(protocol, Operation::Client)?;
        for bootstrap in bootstraps {
            endpoint.schedule_connect(bootstrap.clone());
        }
        endpoint.startup();
        Ok(endpoint)
    }

    /// A snapshot of the endpoints currently owned.
    pub fn endpoints(&self) -> Vec<Arc<LinkEndpoint>> {
        self.endpoints.lock().clone()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    /// Stop every endpoint worker and release the endpoints.
    pub fn shutdown(&self) {
        let endpoints = std::mem::take(&mut *self.endpoints.lock());
        info!(count = endpoints.len(), "Stopping endpoints");
        for endpoint in &endpoints {
            endpoint.shutdown();
        }
    }
}

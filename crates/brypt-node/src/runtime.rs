//! Runtime wiring, the scheduler thread, and shutdown ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use brypt_await::{AwaitableTrackingService, CHECK_INTERVAL};
use brypt_bootstrap::BootstrapCache;
use brypt_event::{Event, EventKind, EventPublisher};
use brypt_identifier::NodeIdentifier;
use brypt_network::tcp::TcpDriver;
use brypt_network::{ConnectionTracker, Endpoint, EndpointManager, PeerMediator};
use brypt_peer::{MessageSink, ResolutionService};
use brypt_types::{
    BindingAddress, ConnectionHandleGenerator, DisconnectCause, Protocol, RemoteAddress,
};
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::{Result, RuntimeError};

#[derive(Default)]
struct SchedulerShared {
    terminate: Mutex<bool>,
    signal: Condvar,
}

/// The assembled core runtime of one node.
///
/// Constructed by [`NodeRuntime::setup`]; every component is injected
/// explicitly and owned here. Call [`NodeRuntime::startup`] from the
/// thread that performed setup, and [`NodeRuntime::shutdown`] for an
/// orderly stop.
pub struct NodeRuntime {
    config: NodeConfig,
    identifier: NodeIdentifier,
    publisher: Arc<EventPublisher>,
    tracker: Arc<ConnectionTracker>,
    tracking: Arc<AwaitableTrackingService>,
    resolution: Arc<ResolutionService>,
    manager: Arc<EndpointManager>,
    cache: Arc<BootstrapCache>,
    scheduler_shared: Arc<SchedulerShared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl NodeRuntime {
    /// Wire the runtime's components from a configuration object.
    ///
    /// The calling thread becomes the event publisher's subscriber
    /// thread; additional subscriptions may be added on it until
    /// [`NodeRuntime::startup`] suspends them.
    pub fn setup(config: NodeConfig, sink: Arc<dyn MessageSink>) -> Result<Arc<Self>> {
        let publisher = Arc::new(EventPublisher::new());
        for kind in [
            EventKind::PeerResolving,
            EventKind::PeerConnected,
            EventKind::PeerDisconnected,
            EventKind::EndpointStarted,
            EventKind::EndpointStopped,
            EventKind::EndpointFailed,
            EventKind::RuntimeStarted,
            EventKind::RuntimeStopped,
        ] {
            publisher.advertise(kind);
            // Every advertised kind carries at least a log listener, so
            // the startup parity check holds without special cases.
            publisher.subscribe(kind, |event| {
                info!(?event, "Runtime event");
            });
        }

        let identifier = match &config.node_identifier {
            Some(text) => NodeIdentifier::from_network_string(text)
                .map_err(|e| RuntimeError::Identifier(e.to_string()))?,
            None => NodeIdentifier::generate()
                .map_err(|e| RuntimeError::Identifier(e.to_string()))?,
        };
        info!(identifier = %identifier, "Node identity established");

        let tracker = Arc::new(ConnectionTracker::new());
        let tracking = Arc::new(AwaitableTrackingService::new(config.awaitable_timeout()));
        let resolution = ResolutionService::new(
            identifier.clone(),
            publisher.clone(),
            tracking.clone(),
            sink,
        );

        let mediator: Arc<dyn PeerMediator> = resolution.clone();
        let manager = Arc::new(
            EndpointManager::new(tracker.clone(), mediator, publisher.clone())
                .with_cycle_timeout(config.cycle_timeout()),
        );

        let handles = Arc::new(ConnectionHandleGenerator::new());
        manager.register_driver(
            Protocol::Tcp,
            Box::new(move || Box::new(TcpDriver::new(handles.clone()))),
        );

        let mut defaults = Vec::new();
        for protocol in &config.protocols {
            for bootstrap in &protocol.bootstraps {
                let target = resolve_bootstrap(bootstrap, &protocol.interface)
                    .map_err(|e| RuntimeError::Configuration(e.to_string()))?;
                defaults.push((protocol.kind, target.uri()));
            }
        }
        let cache = Arc::new(BootstrapCache::new(&config.peers_file, &defaults));
        cache.initialize();
        cache.subscribe(&publisher);

        Ok(Arc::new(Self {
            config,
            identifier,
            publisher,
            tracker,
            tracking,
            resolution,
            manager,
            cache,
            scheduler_shared: Arc::new(SchedulerShared::default()),
            scheduler: Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }

    /// Suspend subscriptions, launch endpoints, and start the scheduler.
    pub fn startup(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.publisher.suspend_subscriptions() {
            warn!("Advertised event kinds do not match the listener set");
        }

        for protocol in &self.config.protocols {
            for binding in &protocol.bindings {
                let binding = BindingAddress::new(protocol.kind, binding)
                    .map_err(|e| RuntimeError::Configuration(e.to_string()))?;
                match self.manager.launch_server(protocol.kind, binding) {
                    Ok(endpoint) => {
                        info!(endpoint = %endpoint.identifier(), protocol = %protocol.kind, "Server endpoint launched");
                    }
                    Err(error) => warn!(%error, protocol = %protocol.kind, "Server endpoint unavailable"),
                }
            }

            let mut targets = Vec::new();
            for bootstrap in protocol
                .bootstraps
                .iter()
                .cloned()
                .chain(self.cache.bootstraps(protocol.kind))
            {
                match resolve_bootstrap(&bootstrap, &protocol.interface) {
                    Ok(target) if target.protocol() == protocol.kind => {
                        if !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                    Ok(_) | Err(_) => {
                        warn!(%bootstrap, "Skipping an unusable bootstrap entry")
                    }
                }
            }
            match self.manager.launch_client(protocol.kind, &targets) {
                Ok(endpoint) => {
                    info!(endpoint = %endpoint.identifier(), protocol = %protocol.kind, "Client endpoint launched");
                }
                Err(error) => warn!(%error, protocol = %protocol.kind, "Client endpoint unavailable"),
            }
        }

        self.spawn_scheduler()?;
        self.publisher.publish(Event::RuntimeStarted);
        Ok(())
    }

    fn spawn_scheduler(&self) -> Result<()> {
        let shared = self.scheduler_shared.clone();
        let tracking = self.tracking.clone();
        let publisher = self.publisher.clone();
        let cache = self.cache.clone();

        let handle = std::thread::Builder::new()
            .name("brypt-scheduler".to_string())
            .spawn(move || loop {
                {
                    let mut terminate = shared.terminate.lock();
                    if *terminate {
                        break;
                    }
                    shared.signal.wait_for(&mut terminate, CHECK_INTERVAL);
                    if *terminate {
                        break;
                    }
                }
                tracking.check_tracked();
                publisher.dispatch();
                let _ = cache.flush();
            })
            .map_err(|e| RuntimeError::Scheduler(e.to_string()))?;

        *self.scheduler.lock() = Some(handle);
        Ok(())
    }

    /// Stop endpoints, tear down sessions, and flush state.
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(identifier = %self.identifier, "Runtime stopping");

        self.resolution
            .withdraw_all(DisconnectCause::NetworkShutdown);
        self.manager.shutdown();
        self.publisher.publish(Event::RuntimeStopped);

        {
            let mut terminate = self.scheduler_shared.terminate.lock();
            *terminate = true;
            self.scheduler_shared.signal.notify_all();
        }
        if let Some(handle) = self.scheduler.lock().take() {
            if handle.join().is_err() {
                warn!("Scheduler terminated abnormally");
            }
        }

        // Deliver teardown events and persist the cache one last time.
        self.publisher.dispatch();
        let _ = self.cache.flush();
    }

    pub fn identifier(&self) -> &NodeIdentifier {
        &self.identifier
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn tracking(&self) -> &Arc<AwaitableTrackingService> {
        &self.tracking
    }

    pub fn resolution(&self) -> &Arc<ResolutionService> {
        &self.resolution
    }

    pub fn manager(&self) -> &Arc<EndpointManager> {
        &self.manager
    }

    pub fn bootstrap_cache(&self) -> &Arc<BootstrapCache> {
        &self.cache
    }
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolve a configured bootstrap URI, rewriting a wildcard host to the
/// protocol's configured local interface before the client-side connect.
fn resolve_bootstrap(
    uri: &str,
    interface: &str,
) -> std::result::Result<RemoteAddress, brypt_types::TypeError> {
    match RemoteAddress::from_uri(uri) {
        Ok(target) => Ok(target),
        Err(error) => match BindingAddress::from_uri(uri) {
            Ok(binding) if binding.is_wildcard() => binding.to_remote(interface),
            _ => Err(error),
        },
    }
}

#[cfg(test)]
mod tests {
    use brypt_message::{MessageContext, MessageEnvelope};

    use super::*;

    struct NullSink;

    impl MessageSink for NullSink {
        fn collect(&self, _context: MessageContext, _envelope: MessageEnvelope) {}
    }

    fn config_in(dir: &tempfile::TempDir) -> NodeConfig {
        NodeConfig {
            peers_file: dir.path().join("peers.json"),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_setup_generates_identifier() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime =
            NodeRuntime::setup(config_in(&dir), Arc::new(NullSink)).expect("setup");
        assert!(runtime.identifier().is_valid());
    }

    #[test]
    fn test_setup_accepts_configured_identifier() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identifier = NodeIdentifier::generate().expect("identifier");
        let config = NodeConfig {
            node_identifier: Some(identifier.network_string().to_string()),
            ..config_in(&dir)
        };
        let runtime = NodeRuntime::setup(config, Arc::new(NullSink)).expect("setup");
        assert_eq!(runtime.identifier(), &identifier);
    }

    #[test]
    fn test_setup_rejects_malformed_identifier() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = NodeConfig {
            node_identifier: Some("bry0:not-a-real-identifier".to_string()),
            ..config_in(&dir)
        };
        assert!(matches!(
            NodeRuntime::setup(config, Arc::new(NullSink)),
            Err(RuntimeError::Identifier(_))
        ));
    }

    #[test]
    fn test_startup_and_shutdown_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime =
            NodeRuntime::setup(config_in(&dir), Arc::new(NullSink)).expect("setup");
        runtime.startup().expect("startup");
        // Startup is idempotent.
        runtime.startup().expect("second startup");
        runtime.shutdown();
        runtime.shutdown();
    }

    #[test]
    fn test_setup_rejects_malformed_bootstrap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = NodeConfig {
            protocols: vec![crate::config::ProtocolConfig {
                kind: Protocol::Tcp,
                interface: "127.0.0.1".to_string(),
                bindings: Vec::new(),
                bootstraps: vec!["tcp:/missing-slashes:1".to_string()],
            }],
            ..config_in(&dir)
        };
        assert!(matches!(
            NodeRuntime::setup(config, Arc::new(NullSink)),
            Err(RuntimeError::Configuration(_))
        ));
    }
}

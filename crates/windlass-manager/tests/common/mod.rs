//! Common test utilities for manager integration tests.

pub mod fixtures;

use std::sync::Arc;

use windlass_manager::config::{ConfiguratorConfig, PortRangeConfig};
use windlass_manager::messaging::{AgentTransport, MockTransport};
use windlass_manager::persistence::NoopSaver;
use windlass_manager::target::{
    MemoryTargetStore, MockTargetHandler, TargetHandler, TargetStore,
};
use windlass_manager::{
    ApplicationRegistry, HandlerResolver, InstanceOrchestrator, MachineConfigurator,
    MessageMediator, PortAllocator, TargetRegistry,
};

/// Complete test manager setup with all components wired together.
pub struct TestManager {
    pub applications: Arc<ApplicationRegistry>,
    pub targets: Arc<TargetRegistry>,
    pub handler: Arc<MockTargetHandler>,
    pub transport: Arc<MockTransport>,
    pub configurator: Arc<MachineConfigurator>,
    pub mediator: Arc<MessageMediator>,
    pub orchestrator: InstanceOrchestrator,
}

/// Initializes test logging once; controlled by `RUST_LOG`.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl TestManager {
    /// Creates a test manager backed by an in-memory target store.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryTargetStore::new()))
    }

    /// Creates a test manager over a specific target store.
    pub fn with_store(store: Arc<dyn TargetStore>) -> Self {
        init_tracing();
        let applications = Arc::new(ApplicationRegistry::new());
        let targets = Arc::new(TargetRegistry::new(store));

        let handler = Arc::new(MockTargetHandler::new());
        let handlers = Arc::new(HandlerResolver::new());
        handlers.register(Arc::clone(&handler) as Arc<dyn TargetHandler>);

        let configurator = Arc::new(MachineConfigurator::new(
            Arc::clone(&applications),
            &ConfiguratorConfig::default(),
            "test",
        ));
        let transport = Arc::new(MockTransport::connected());
        let mediator = Arc::new(MessageMediator::new(
            Arc::clone(&transport) as Arc<dyn AgentTransport>
        ));
        let ports = Arc::new(PortAllocator::new(&PortRangeConfig::default()));

        let orchestrator = InstanceOrchestrator::new(
            Arc::clone(&applications),
            Arc::clone(&targets),
            handlers,
            Arc::clone(&configurator),
            ports,
            Arc::clone(&mediator),
            Arc::new(NoopSaver),
            "test",
        );

        Self {
            applications,
            targets,
            handler,
            transport,
            configurator,
            mediator,
            orchestrator,
        }
    }
}

impl Default for TestManager {
    fn default() -> Self {
        Self::new()
    }
}

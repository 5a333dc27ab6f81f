#![allow(dead_code)]

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tsunagi::{
    agent_registry::AgentRegistry,
    config::TimeoutConfig,
    container::{BroadcastFn, Container, ContainerFactory, StartedContainer},
    network::NetworkRegistry,
    ticker::TickScheduler,
    ClientId, ContainerEndpoint, ContainerEvent, ContainerId, ContainerKind, RegistryResult,
    StartRequest,
};

pub const TICKS_PER_SECOND: u32 = 10;

#[derive(Default)]
pub struct EchoContainer {
    pub terminate_calls: AtomicUsize,
    pub clients: Mutex<Vec<ClientId>>,
}

#[async_trait]
impl Container for EchoContainer {
    async fn request(
        &self,
        operation: &str,
        data: Value,
        _client_id: Option<&ClientId>,
    ) -> RegistryResult<Value> {
        Ok(serde_json::json!({ "operation": operation, "data": data }))
    }

    async fn terminate(&self) -> RegistryResult<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> RegistryResult<()> {
        Ok(())
    }

    fn connect(&self, client_id: &ClientId, _broadcast: BroadcastFn) {
        self.clients.lock().unwrap().push(client_id.clone());
    }

    fn disconnect(&self, client_id: &ClientId) {
        self.clients.lock().unwrap().retain(|c| c != client_id);
    }
}

/// An agent-side registry hosting `session` containers, with its factory
/// calls and started containers exposed for assertions.
pub struct TestAgent {
    pub registry: AgentRegistry,
    pub starts: Arc<AtomicUsize>,
    pub hosted: Arc<Mutex<Vec<Arc<EchoContainer>>>>,
}

impl TestAgent {
    pub fn new(id: &str) -> Self {
        let starts = Arc::new(AtomicUsize::new(0));
        let hosted = Arc::new(Mutex::new(Vec::new()));
        let mut factories: HashMap<ContainerKind, ContainerFactory> = HashMap::new();
        factories.insert(
            "session".into(),
            session_factory(id.to_string(), starts.clone(), hosted.clone()),
        );
        Self {
            registry: AgentRegistry::new(id.into(), factories),
            starts,
            hosted,
        }
    }

    /// Same agent, stamping visits with the scheduler's clock.
    pub fn on(mut self, scheduler: &Arc<TickScheduler>) -> Self {
        self.registry = self.registry.with_scheduler(scheduler.clone());
        self
    }

    pub fn terminated(&self) -> usize {
        self.hosted
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.terminate_calls.load(Ordering::SeqCst))
            .sum()
    }
}

fn session_factory(
    agent: String,
    starts: Arc<AtomicUsize>,
    hosted: Arc<Mutex<Vec<Arc<EchoContainer>>>>,
) -> ContainerFactory {
    Arc::new(move |container_id: ContainerId, _request: StartRequest| {
        starts.fetch_add(1, Ordering::SeqCst);
        let container = Arc::new(EchoContainer::default());
        hosted.lock().unwrap().push(container.clone());
        let endpoint = ContainerEndpoint::new(format!("{}/{}", agent, container_id));
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(StartedContainer {
                container_id,
                container: container as Arc<dyn Container>,
                endpoint,
            })
        }
        .boxed()
    })
}

pub fn timeouts(alive_ms: u64, unused_ms: u64) -> TimeoutConfig {
    TimeoutConfig {
        alive_timeout: Duration::from_millis(alive_ms),
        unused_container_timeout: Duration::from_millis(unused_ms),
        ping_interval: Duration::from_millis(alive_ms / 3),
    }
}

pub fn setup(timeouts: TimeoutConfig) -> (Arc<TickScheduler>, NetworkRegistry) {
    let scheduler = Arc::new(TickScheduler::manual(TICKS_PER_SECOND));
    let network = NetworkRegistry::new(scheduler.clone(), timeouts);
    (scheduler, network)
}

pub async fn run_ticks(scheduler: &TickScheduler, ticks: u64) {
    for _ in 0..ticks {
        scheduler.tick().await;
    }
}

/// Everything already delivered to a subscription.
pub async fn drain<S>(events: &mut S) -> Vec<ContainerEvent>
where
    S: futures::Stream<Item = ContainerEvent> + Unpin,
{
    use futures::StreamExt;
    let mut received = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(20), events.next()).await
    {
        received.push(event);
    }
    received
}

pub fn session() -> StartRequest {
    StartRequest::new("session")
}

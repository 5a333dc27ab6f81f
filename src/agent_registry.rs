//! # Agent-Side Registry
//!
//! Runs inside every agent process. It owns the containers physically hosted
//! here, starts new ones through the per-kind factories, and speaks the
//! registration protocol to the network.
//!
//! Starts are deduplicated per container id: while a start is in flight, every
//! further `get` for the same id awaits that same operation, so a factory is
//! never invoked twice concurrently for one id.

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::api::{Network, NetworkAgent};
use crate::container::{BroadcastFn, Container, ContainerFactory};
use crate::ticker::{system_now, TickScheduler};
use crate::types::{
    AgentEndpoint, AgentId, AgentRecord, ClientId, ContainerEndpoint, ContainerId, ContainerKind,
    ContainerRecord, PeerId, StartRequest, Timestamp,
};
use crate::{RegistryError, RegistryResult};

type PendingStart = Shared<BoxFuture<'static, RegistryResult<ContainerEndpoint>>>;

struct HostedContainer {
    record: ContainerRecord,
    container: Arc<dyn Container>,
}

pub struct AgentRegistry {
    agent_id: AgentId,
    endpoint: Option<AgentEndpoint>,
    scheduler: Option<Arc<TickScheduler>>,
    factories: Arc<HashMap<ContainerKind, ContainerFactory>>,
    containers: Arc<DashMap<ContainerId, HostedContainer>>,
    endpoints: Arc<DashMap<ContainerEndpoint, ContainerId>>,
    starting: Arc<DashMap<ContainerId, PendingStart>>,
}

impl Clone for AgentRegistry {
    fn clone(&self) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            endpoint: self.endpoint.clone(),
            scheduler: self.scheduler.clone(),
            factories: self.factories.clone(),
            containers: self.containers.clone(),
            endpoints: self.endpoints.clone(),
            starting: self.starting.clone(),
        }
    }
}

impl AgentRegistry {
    pub fn new(agent_id: AgentId, factories: HashMap<ContainerKind, ContainerFactory>) -> Self {
        Self {
            agent_id,
            endpoint: None,
            scheduler: None,
            factories: Arc::new(factories),
            containers: Arc::new(DashMap::new()),
            endpoints: Arc::new(DashMap::new()),
            starting: Arc::new(DashMap::new()),
        }
    }

    pub fn with_endpoint(mut self, endpoint: AgentEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Stamps container visits with the scheduler's clock instead of the
    /// system clock.
    pub fn with_scheduler(mut self, scheduler: Arc<TickScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    fn now(&self) -> Timestamp {
        self.scheduler
            .as_ref()
            .map_or_else(system_now, |scheduler| scheduler.now())
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn kinds(&self) -> Vec<ContainerKind> {
        let mut kinds: Vec<ContainerKind> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// The record this agent reports on registration.
    pub fn record(&self) -> AgentRecord {
        let mut record = AgentRecord::new(self.agent_id.clone(), self.kinds())
            .with_containers(self.list(None));
        record.endpoint = self.endpoint.clone();
        record
    }

    /// Reports this agent to the network and stops whatever it tells us to.
    pub async fn register(&self, network: &dyn Network) -> RegistryResult<()> {
        let record = self.record();
        info!(
            "Registering agent {} with {} containers",
            self.agent_id,
            record.containers.len()
        );
        let to_shutdown = network
            .register(record, Arc::new(self.clone()) as Arc<dyn NetworkAgent>)
            .await?;
        for endpoint in to_shutdown {
            if let Err(e) = self.terminate(&endpoint).await {
                warn!("Failed to stop superseded container {}: {}", endpoint, e);
            }
        }
        Ok(())
    }

    /// Heartbeat: tells the network we are alive and pings every hosted container.
    pub async fn heartbeat(&self, network: &dyn Network) {
        network.ping(&PeerId::from(&self.agent_id)).await;
        self.ping().await;
    }

    pub async fn ping(&self) {
        for (container_id, container) in self.snapshot() {
            match container.ping().await {
                Ok(()) => {
                    if let Some(mut hosted) = self.containers.get_mut(&container_id) {
                        hosted.record.last_visit = self.now();
                    }
                }
                Err(e) => warn!("Container {} did not answer ping: {}", container_id, e),
            }
        }
    }

    /// Returns the endpoint of the container, starting it if needed.
    #[instrument(skip(self, request), fields(agent = %self.agent_id))]
    pub async fn get(
        &self,
        container_id: &ContainerId,
        request: &StartRequest,
    ) -> RegistryResult<ContainerEndpoint> {
        if let Some(hosted) = self.containers.get(container_id) {
            return Ok(hosted.record.endpoint.clone());
        }

        let pending = match self.starting.entry(container_id.clone()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight start of {}", container_id);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // the start may have completed between the lookup above and here
                if let Some(hosted) = self.containers.get(container_id) {
                    return Ok(hosted.record.endpoint.clone());
                }
                let start = self
                    .clone()
                    .start(container_id.clone(), request.clone())
                    .boxed()
                    .shared();
                entry.insert(start.clone());
                start
            }
        };
        pending.await
    }

    async fn start(
        self,
        container_id: ContainerId,
        request: StartRequest,
    ) -> RegistryResult<ContainerEndpoint> {
        let result = self.start_container(&container_id, request).await;
        self.starting.remove(&container_id);
        result
    }

    async fn start_container(
        &self,
        container_id: &ContainerId,
        request: StartRequest,
    ) -> RegistryResult<ContainerEndpoint> {
        let factory = self.factories.get(&request.kind).cloned().ok_or_else(|| {
            RegistryError::UnknownKind {
                kind: request.kind.clone(),
            }
        })?;

        debug!("Starting {} container {}", request.kind, container_id);
        let started = factory(container_id.clone(), request.clone())
            .await
            .inspect_err(|e| warn!("Factory failed for {}: {}", container_id, e))?;

        if started.container_id != *container_id {
            if let Err(e) = started.container.terminate().await {
                warn!("Failed to stop mismatched container: {}", e);
            }
            return Err(RegistryError::ContainerIdMismatch {
                requested: container_id.clone(),
                returned: started.container_id,
            });
        }

        let record = ContainerRecord {
            agent_id: self.agent_id.clone(),
            container_id: container_id.clone(),
            kind: request.kind,
            endpoint: started.endpoint.clone(),
            last_visit: self.now(),
            extra: request.extra,
            labels: request.labels,
        };

        let containers = self.containers.clone();
        let endpoints = self.endpoints.clone();
        let id = container_id.clone();
        let endpoint = started.endpoint.clone();
        started.container.on_terminated(Box::new(move || {
            containers.remove_if(&id, |_, hosted| hosted.record.endpoint == endpoint);
            endpoints.remove_if(&endpoint, |_, owner| *owner == id);
        }));

        self.endpoints
            .insert(started.endpoint.clone(), container_id.clone());
        self.containers.insert(
            container_id.clone(),
            HostedContainer {
                record,
                container: started.container,
            },
        );
        info!("Container {} started at {}", container_id, started.endpoint);
        Ok(started.endpoint)
    }

    /// Stops the container served at `endpoint`. Unknown endpoints are ignored.
    pub async fn terminate(&self, endpoint: &ContainerEndpoint) -> RegistryResult<()> {
        let Some((_, container_id)) = self.endpoints.remove(endpoint) else {
            debug!("No container at {}, nothing to terminate", endpoint);
            return Ok(());
        };
        let Some((_, hosted)) = self
            .containers
            .remove_if(&container_id, |_, hosted| hosted.record.endpoint == *endpoint)
        else {
            return Ok(());
        };
        info!("Terminating container {} at {}", container_id, endpoint);
        hosted.container.terminate().await
    }

    pub async fn request(
        &self,
        container_id: &ContainerId,
        operation: &str,
        data: Value,
    ) -> RegistryResult<Value> {
        let container = {
            let mut hosted = self.containers.get_mut(container_id).ok_or_else(|| {
                RegistryError::ContainerNotFound {
                    container_id: container_id.clone(),
                }
            })?;
            hosted.record.last_visit = self.now();
            hosted.container.clone()
        };
        container.request(operation, data, None).await
    }

    pub fn connect(
        &self,
        container_id: &ContainerId,
        client_id: &ClientId,
        broadcast: BroadcastFn,
    ) -> RegistryResult<()> {
        let container = self.container(container_id)?;
        container.connect(client_id, broadcast);
        Ok(())
    }

    pub fn disconnect(&self, container_id: &ContainerId, client_id: &ClientId) -> RegistryResult<()> {
        let container = self.container(container_id)?;
        container.disconnect(client_id);
        Ok(())
    }

    /// Snapshot of fully started containers, sorted by id.
    pub fn list(&self, kind: Option<&ContainerKind>) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> = self
            .containers
            .iter()
            .filter(|entry| kind.map_or(true, |k| entry.record.kind == *k))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        records
    }

    pub fn is_starting(&self, container_id: &ContainerId) -> bool {
        self.starting.contains_key(container_id)
    }

    fn container(&self, container_id: &ContainerId) -> RegistryResult<Arc<dyn Container>> {
        self.containers
            .get(container_id)
            .map(|hosted| hosted.container.clone())
            .ok_or_else(|| RegistryError::ContainerNotFound {
                container_id: container_id.clone(),
            })
    }

    fn snapshot(&self) -> Vec<(ContainerId, Arc<dyn Container>)> {
        self.containers
            .iter()
            .map(|entry| (entry.key().clone(), entry.container.clone()))
            .collect()
    }
}

#[async_trait::async_trait]
impl NetworkAgent for AgentRegistry {
    fn agent_id(&self) -> AgentId {
        self.agent_id.clone()
    }

    fn kinds(&self) -> Vec<ContainerKind> {
        AgentRegistry::kinds(self)
    }

    fn endpoint(&self) -> Option<AgentEndpoint> {
        self.endpoint.clone()
    }

    async fn get(
        &self,
        container_id: &ContainerId,
        request: &StartRequest,
    ) -> RegistryResult<ContainerEndpoint> {
        AgentRegistry::get(self, container_id, request).await
    }

    async fn terminate(&self, endpoint: &ContainerEndpoint) -> RegistryResult<()> {
        AgentRegistry::terminate(self, endpoint).await
    }

    async fn request(
        &self,
        container_id: &ContainerId,
        operation: &str,
        data: Value,
    ) -> RegistryResult<Value> {
        AgentRegistry::request(self, container_id, operation, data).await
    }

    async fn list(&self, kind: Option<ContainerKind>) -> Vec<ContainerRecord> {
        AgentRegistry::list(self, kind.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{StartedContainer, TerminatedCallback};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockContainer {
        requests: Mutex<Vec<(String, Value)>>,
        terminate_calls: AtomicUsize,
        ping_calls: AtomicUsize,
        clients: Mutex<Vec<ClientId>>,
        on_terminated: Mutex<Option<TerminatedCallback>>,
    }

    impl MockContainer {
        fn stop_by_itself(&self) {
            if let Some(callback) = self.on_terminated.lock().unwrap().as_ref() {
                callback();
            }
        }
    }

    #[async_trait]
    impl Container for MockContainer {
        async fn request(
            &self,
            operation: &str,
            data: Value,
            _client_id: Option<&ClientId>,
        ) -> RegistryResult<Value> {
            self.requests
                .lock()
                .unwrap()
                .push((operation.to_string(), data));
            Ok(Value::String(format!("response-{}", operation)))
        }

        async fn terminate(&self) -> RegistryResult<()> {
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn ping(&self) -> RegistryResult<()> {
            self.ping_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn connect(&self, client_id: &ClientId, _broadcast: BroadcastFn) {
            self.clients.lock().unwrap().push(client_id.clone());
        }

        fn disconnect(&self, client_id: &ClientId) {
            self.clients.lock().unwrap().retain(|c| c != client_id);
        }

        fn on_terminated(&self, callback: TerminatedCallback) {
            *self.on_terminated.lock().unwrap() = Some(callback);
        }
    }

    fn factory(
        container: Arc<MockContainer>,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    ) -> ContainerFactory {
        Arc::new(move |container_id: ContainerId, _request: StartRequest| {
            let container = container.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(StartedContainer {
                    endpoint: ContainerEndpoint::new(format!("agent-1/{}", container_id)),
                    container_id,
                    container: container as Arc<dyn Container>,
                })
            }
            .boxed()
        })
    }

    fn setup(delay: Duration) -> (AgentRegistry, Arc<MockContainer>, Arc<AtomicUsize>) {
        let container = Arc::new(MockContainer::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut factories = HashMap::new();
        factories.insert(
            ContainerKind::from("session"),
            factory(container.clone(), calls.clone(), delay),
        );
        (
            AgentRegistry::new("agent-1".into(), factories),
            container,
            calls,
        )
    }

    #[tokio::test]
    async fn test_get_starts_container_once() {
        let (agent, _, calls) = setup(Duration::ZERO);
        let id = ContainerId::from("s1");

        let first = agent.get(&id, &StartRequest::new("session")).await.unwrap();
        let second = agent.get(&id, &StartRequest::new("session")).await.unwrap();

        assert_eq!(first, ContainerEndpoint::from("agent-1/s1"));
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(agent.list(None).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_invokes_factory_once() {
        let (agent, _, calls) = setup(Duration::from_millis(50));
        let id = ContainerId::from("fixed");
        let request = StartRequest::new("session");

        let (a, b, c) = tokio::join!(
            agent.get(&id, &request),
            agent.get(&id, &request),
            agent.get(&id, &request)
        );

        assert_eq!(a.unwrap(), ContainerEndpoint::from("agent-1/fixed"));
        assert_eq!(b.unwrap(), ContainerEndpoint::from("agent-1/fixed"));
        assert_eq!(c.unwrap(), ContainerEndpoint::from("agent-1/fixed"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!agent.is_starting(&id));
    }

    #[tokio::test]
    async fn test_get_unknown_kind_fails_closed() {
        let (agent, _, calls) = setup(Duration::ZERO);
        let result = agent
            .get(&ContainerId::from("db1"), &StartRequest::new("database"))
            .await;
        assert_eq!(
            result,
            Err(RegistryError::UnknownKind {
                kind: "database".into()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!agent.is_starting(&ContainerId::from("db1")));
    }

    #[tokio::test]
    async fn test_factory_error_is_propagated_and_retryable() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let failing: ContainerFactory = Arc::new(move |_id, _request| {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::internal("Factory failed"))
            }
            .boxed()
        });
        let mut factories = HashMap::new();
        factories.insert(ContainerKind::from("session"), failing);
        let agent = AgentRegistry::new("agent-1".into(), factories);
        let id = ContainerId::from("s1");

        let err = agent
            .get(&id, &StartRequest::new("session"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Factory failed"));

        let _ = agent.get(&id, &StartRequest::new("session")).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(agent.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_container_id_is_rejected() {
        let container = Arc::new(MockContainer::default());
        let container_clone = container.clone();
        let wrong: ContainerFactory = Arc::new(move |_id, _request| {
            let container = container_clone.clone();
            async move {
                Ok(StartedContainer {
                    container_id: "other".into(),
                    container: container as Arc<dyn Container>,
                    endpoint: "agent-1/other".into(),
                })
            }
            .boxed()
        });
        let mut factories = HashMap::new();
        factories.insert(ContainerKind::from("session"), wrong);
        let agent = AgentRegistry::new("agent-1".into(), factories);

        let result = agent
            .get(&ContainerId::from("s1"), &StartRequest::new("session"))
            .await;

        assert!(matches!(
            result,
            Err(RegistryError::ContainerIdMismatch { .. })
        ));
        assert_eq!(container.terminate_calls.load(Ordering::SeqCst), 1);
        assert!(agent.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_terminate_removes_container() {
        let (agent, container, _) = setup(Duration::ZERO);
        let endpoint = agent
            .get(&ContainerId::from("s1"), &StartRequest::new("session"))
            .await
            .unwrap();

        agent.terminate(&endpoint).await.unwrap();

        assert_eq!(container.terminate_calls.load(Ordering::SeqCst), 1);
        assert!(agent.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_terminate_unknown_endpoint_is_ignored() {
        let (agent, container, _) = setup(Duration::ZERO);
        agent
            .terminate(&ContainerEndpoint::from("nowhere"))
            .await
            .unwrap();
        assert_eq!(container.terminate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_forwards_to_container() {
        let (agent, container, _) = setup(Duration::ZERO);
        let id = ContainerId::from("s1");
        agent.get(&id, &StartRequest::new("session")).await.unwrap();

        let response = agent
            .request(&id, "testOp", serde_json::json!({"data": "test"}))
            .await
            .unwrap();

        assert_eq!(response, Value::String("response-testOp".to_string()));
        assert_eq!(
            container.requests.lock().unwrap().clone(),
            vec![("testOp".to_string(), serde_json::json!({"data": "test"}))]
        );
    }

    #[tokio::test]
    async fn test_request_unknown_container() {
        let (agent, _, _) = setup(Duration::ZERO);
        let result = agent
            .request(&ContainerId::from("missing"), "op", Value::Null)
            .await;
        assert_eq!(
            result,
            Err(RegistryError::ContainerNotFound {
                container_id: "missing".into()
            })
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_kind() {
        let mut factories = HashMap::new();
        let session = Arc::new(MockContainer::default());
        let database = Arc::new(MockContainer::default());
        factories.insert(
            ContainerKind::from("session"),
            factory(session, Arc::new(AtomicUsize::new(0)), Duration::ZERO),
        );
        factories.insert(
            ContainerKind::from("database"),
            factory(database, Arc::new(AtomicUsize::new(0)), Duration::ZERO),
        );
        let agent = AgentRegistry::new("agent-1".into(), factories);

        agent
            .get(&"s1".into(), &StartRequest::new("session"))
            .await
            .unwrap();
        agent
            .get(&"d1".into(), &StartRequest::new("database"))
            .await
            .unwrap();

        assert_eq!(agent.list(None).len(), 2);
        let sessions = agent.list(Some(&"session".into()));
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].container_id, ContainerId::from("s1"));
        assert_eq!(
            agent.kinds(),
            vec![ContainerKind::from("database"), ContainerKind::from("session")]
        );
    }

    #[tokio::test]
    async fn test_self_terminated_container_is_dropped() {
        let (agent, container, _) = setup(Duration::ZERO);
        agent
            .get(&"s1".into(), &StartRequest::new("session"))
            .await
            .unwrap();

        container.stop_by_itself();

        assert!(agent.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_connect_and_ping() {
        let (agent, container, _) = setup(Duration::ZERO);
        let id = ContainerId::from("s1");
        agent.get(&id, &StartRequest::new("session")).await.unwrap();

        let broadcast: BroadcastFn = Arc::new(|_| async { Ok(()) }.boxed());
        agent
            .connect(&id, &"client-1".into(), broadcast)
            .unwrap();
        assert_eq!(container.clients.lock().unwrap().len(), 1);
        agent.disconnect(&id, &"client-1".into()).unwrap();
        assert!(container.clients.lock().unwrap().is_empty());

        agent.ping().await;
        assert_eq!(container.ping_calls.load(Ordering::SeqCst), 1);

        let missing = agent.disconnect(&"missing".into(), &"client-1".into());
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_visits_follow_scheduler_clock() {
        let (agent, _, _) = setup(Duration::ZERO);
        let scheduler = Arc::new(TickScheduler::manual(10));
        let agent = agent.with_scheduler(scheduler.clone());
        let id = ContainerId::from("s1");

        scheduler.set_time(5000);
        agent.get(&id, &StartRequest::new("session")).await.unwrap();
        assert_eq!(agent.list(None)[0].last_visit, 5000);

        scheduler.set_time(7000);
        agent.request(&id, "op", Value::Null).await.unwrap();
        assert_eq!(agent.list(None)[0].last_visit, 7000);

        scheduler.set_time(9000);
        agent.ping().await;
        assert_eq!(agent.list(None)[0].last_visit, 9000);
    }
}

//! # Network Registry
//!
//! The authoritative placement, liveness and notification service.
//!
//! All state lives behind one lock and is only mutated inside a public call or
//! a tick handler. Starting a container is the only operation that suspends:
//! while it runs, the ownership index already holds a pending placement
//! entry, so every concurrent `get` for the same id awaits the same start
//! instead of placing the container a second time.
//!
//! Two tick handlers drive the periodic work, registered in this order so a
//! liveness pass always precedes the broadcast of the same tick:
//!
//! - `check_alive` (every `alive_timeout`): evicts silent agents and clients,
//!   then terminates orphans whose grace period has passed.
//! - `send_events` (every tick): merges the queued batches and pushes the
//!   result to every client callback.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use futures::{
    future::{join_all, BoxFuture, Shared},
    FutureExt,
};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::{
    api::{Network, NetworkAgent},
    config::TimeoutConfig,
    event::{AgentEvent, AgentEventKind, ContainerEvent, EventQueue},
    ticker::{TickHandler, TickRegistration, TickScheduler},
    types::{
        AgentId, AgentInfo, AgentRecord, ClientId, ContainerEndpoint, ContainerId, ContainerKind,
        ContainerRecord, PeerId, StartRequest, Timestamp,
    },
    RegistryError, RegistryResult,
};

/// Receives every merged broadcast batch for one client.
pub type EventCallback =
    Arc<dyn Fn(ContainerEvent) -> BoxFuture<'static, RegistryResult<()>> + Send + Sync>;

type PendingEndpoint = Shared<BoxFuture<'static, RegistryResult<ContainerEndpoint>>>;

/// Ownership index entry.
enum Placement {
    /// Start in flight on `agent_id`; every waiter shares `endpoint`.
    Pending {
        agent_id: AgentId,
        endpoint: PendingEndpoint,
    },
    /// Started; the record lives in the owning agent's table.
    Resolved { agent_id: AgentId },
}

struct AgentEntry {
    record: AgentRecord,
    handle: Arc<dyn NetworkAgent>,
}

struct ClientRecord {
    last_seen: Timestamp,
    containers: HashSet<ContainerId>,
    mapped_agents: HashSet<AgentId>,
    on_event: Option<EventCallback>,
}

impl ClientRecord {
    fn new(now: Timestamp) -> Self {
        Self {
            last_seen: now,
            containers: HashSet::new(),
            mapped_agents: HashSet::new(),
            on_event: None,
        }
    }
}

struct Orphan {
    record: ContainerRecord,
    since: Timestamp,
}

struct Expired {
    record: ContainerRecord,
    since: Timestamp,
    handle: Arc<dyn NetworkAgent>,
}

#[derive(Default)]
struct NetworkState {
    agents: BTreeMap<AgentId, AgentEntry>,
    ownership: HashMap<ContainerId, Placement>,
    by_endpoint: HashMap<ContainerEndpoint, ContainerId>,
    leases: HashMap<ContainerId, HashSet<ClientId>>,
    clients: HashMap<ClientId, ClientRecord>,
    orphans: HashMap<ContainerEndpoint, Orphan>,
    events: EventQueue,
    round_robin: usize,
}

impl NetworkState {
    /// The record of a started container, if its owner still holds it.
    fn resolved(&self, container_id: &ContainerId) -> Option<&ContainerRecord> {
        match self.ownership.get(container_id)? {
            Placement::Resolved { agent_id } => self
                .agents
                .get(agent_id)?
                .record
                .containers
                .get(container_id),
            Placement::Pending { .. } => None,
        }
    }

    fn client_mut(&mut self, client_id: &ClientId, now: Timestamp) -> &mut ClientRecord {
        self.clients
            .entry(client_id.clone())
            .or_insert_with(|| ClientRecord::new(now))
    }

    fn lease(&mut self, client_id: &ClientId, container_id: &ContainerId, now: Timestamp) {
        self.client_mut(client_id, now)
            .containers
            .insert(container_id.clone());
        self.leases
            .entry(container_id.clone())
            .or_default()
            .insert(client_id.clone());
    }

    /// Drops one lease. A started container left without clients becomes an orphan.
    fn release(&mut self, client_id: &ClientId, container_id: &ContainerId, now: Timestamp) {
        if let Some(client) = self.clients.get_mut(client_id) {
            client.containers.remove(container_id);
        }
        let unused = match self.leases.get_mut(container_id) {
            Some(clients) => {
                clients.remove(client_id);
                clients.is_empty()
            }
            None => true,
        };
        if !unused {
            return;
        }
        self.leases.remove(container_id);
        if let Some(record) = self.resolved(container_id).cloned() {
            debug!("Container {} has no clients left", container_id);
            self.orphans
                .entry(record.endpoint.clone())
                .or_insert(Orphan { record, since: now });
        }
    }

    /// Forgets every lease on a container that no longer exists.
    fn forget_leases(&mut self, container_id: &ContainerId) {
        for client_id in self.leases.remove(container_id).unwrap_or_default() {
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.containers.remove(container_id);
            }
        }
    }

    /// Removes a started container owned by `agent_id` from every index.
    fn drop_container(
        &mut self,
        agent_id: &AgentId,
        container_id: &ContainerId,
    ) -> Option<ContainerRecord> {
        let owned = matches!(
            self.ownership.get(container_id),
            Some(Placement::Resolved { agent_id: owner }) if owner == agent_id
        );
        if !owned {
            return None;
        }
        self.ownership.remove(container_id);
        let record = self
            .agents
            .get_mut(agent_id)?
            .record
            .containers
            .remove(container_id)?;
        self.by_endpoint.remove(&record.endpoint);
        self.orphans.remove(&record.endpoint);
        self.forget_leases(container_id);
        Some(record)
    }

    /// Drops an agent with everything it hosts. Its pending placements fail
    /// once their starts return.
    fn remove_agent(&mut self, agent_id: &AgentId) {
        let Some(entry) = self.agents.remove(agent_id) else {
            return;
        };
        info!(
            "Removing agent {} and its {} containers",
            agent_id,
            entry.record.containers.len()
        );

        let mut deleted: Vec<ContainerRecord> = Vec::new();
        for (container_id, record) in entry.record.containers {
            if matches!(
                self.ownership.get(&container_id),
                Some(Placement::Resolved { agent_id: owner }) if owner == agent_id
            ) {
                self.ownership.remove(&container_id);
            }
            self.by_endpoint.remove(&record.endpoint);
            self.orphans.remove(&record.endpoint);
            self.forget_leases(&container_id);
            deleted.push(record);
        }
        self.ownership.retain(|_, placement| {
            !matches!(placement, Placement::Pending { agent_id: owner, .. } if owner == agent_id)
        });

        self.events.push(ContainerEvent {
            agents: vec![AgentEvent {
                agent_id: agent_id.clone(),
                kinds: entry.record.kinds.into_iter().collect(),
                kind: AgentEventKind::Removed,
            }],
            deleted,
            ..Default::default()
        });
    }

    /// Releases everything the client leases and forgets it.
    fn remove_client(&mut self, client_id: &ClientId, now: Timestamp) {
        let Some(client) = self.clients.get(client_id) else {
            return;
        };
        let leased: Vec<ContainerId> = client.containers.iter().cloned().collect();
        for container_id in &leased {
            self.release(client_id, container_id, now);
        }
        self.clients.remove(client_id);
        info!("Client {} removed, {} leases released", client_id, leased.len());
    }

    /// Evicts every agent and client silent for longer than `alive_timeout`.
    fn evict_silent(&mut self, now: Timestamp, alive_timeout: Timestamp) {
        let dead_agents: Vec<(AgentId, Timestamp)> = self
            .agents
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.record.last_seen) > alive_timeout)
            .map(|(id, entry)| (id.clone(), entry.record.last_seen))
            .collect();
        for (agent_id, last_seen) in dead_agents {
            warn!(
                "Agent {} has been inactive for {}ms, marking as dead",
                agent_id,
                now.saturating_sub(last_seen)
            );
            self.remove_agent(&agent_id);
        }

        let dead_clients: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| now.saturating_sub(client.last_seen) > alive_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in dead_clients {
            warn!("Client {} has been inactive, removing", client_id);
            self.remove_client(&client_id, now);
        }
    }

    /// Takes orphans past their grace period out of every index, so a `get`
    /// arriving while they terminate places a fresh copy.
    fn take_expired_orphans(&mut self, now: Timestamp, grace: Timestamp) -> Vec<Expired> {
        let endpoints: Vec<ContainerEndpoint> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| now.saturating_sub(orphan.since) >= grace)
            .map(|(endpoint, _)| endpoint.clone())
            .collect();

        let mut expired = Vec::new();
        for endpoint in endpoints {
            let Some(orphan) = self.orphans.remove(&endpoint) else {
                continue;
            };
            let agent_id = orphan.record.agent_id.clone();
            let Some(handle) = self.agents.get(&agent_id).map(|entry| entry.handle.clone()) else {
                continue;
            };
            if let Some(record) = self.drop_container(&agent_id, &orphan.record.container_id) {
                expired.push(Expired {
                    record,
                    since: orphan.since,
                    handle,
                });
            }
        }
        expired
    }

    /// Puts back an orphan whose termination failed. Gives up when the id was
    /// placed again or its agent is gone.
    fn restore_orphan(&mut self, record: ContainerRecord, since: Timestamp) {
        let container_id = record.container_id.clone();
        if self.ownership.contains_key(&container_id) {
            warn!(
                "Container {} was placed again while {} was terminating",
                container_id, record.endpoint
            );
            return;
        }
        let Some(agent) = self.agents.get_mut(&record.agent_id) else {
            return;
        };
        agent
            .record
            .containers
            .insert(container_id.clone(), record.clone());
        self.ownership.insert(
            container_id.clone(),
            Placement::Resolved {
                agent_id: record.agent_id.clone(),
            },
        );
        self.by_endpoint
            .insert(record.endpoint.clone(), container_id);
        self.orphans
            .insert(record.endpoint.clone(), Orphan { record, since });
    }

    fn pick_agent(&mut self, kind: &ContainerKind) -> RegistryResult<(AgentId, Arc<dyn NetworkAgent>)> {
        let suitable: Vec<&AgentEntry> = self
            .agents
            .values()
            .filter(|entry| entry.record.kinds.contains(kind))
            .collect();
        if suitable.is_empty() {
            return Err(RegistryError::NoSuitableAgent { kind: kind.clone() });
        }
        let entry = suitable[self.round_robin % suitable.len()];
        let picked = (entry.record.agent_id.clone(), entry.handle.clone());
        self.round_robin = self.round_robin.wrapping_add(1);
        Ok(picked)
    }
}

struct NetworkInner {
    scheduler: Arc<TickScheduler>,
    timeouts: TimeoutConfig,
    state: RwLock<NetworkState>,
    registrations: Mutex<Vec<TickRegistration>>,
}

impl Drop for NetworkInner {
    fn drop(&mut self) {
        for registration in self.registrations.get_mut().drain(..) {
            registration.cancel();
        }
    }
}

#[derive(Clone)]
pub struct NetworkRegistry {
    inner: Arc<NetworkInner>,
}

impl NetworkRegistry {
    /// Creates a registry and hooks its periodic work into `scheduler`.
    pub fn new(scheduler: Arc<TickScheduler>, timeouts: TimeoutConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<NetworkInner>| {
            let check_alive = scheduler.register(
                "check_alive",
                tick_handler(weak.clone(), |network| {
                    async move { network.check_alive().await }.boxed()
                }),
                timeouts.alive_timeout,
            );
            let send_events = scheduler.register(
                "send_events",
                tick_handler(weak.clone(), |network| {
                    async move { network.send_events().await }.boxed()
                }),
                std::time::Duration::ZERO,
            );
            NetworkInner {
                scheduler: scheduler.clone(),
                timeouts,
                state: RwLock::new(NetworkState::default()),
                registrations: Mutex::new(vec![check_alive, send_events]),
            }
        });
        Self { inner }
    }

    fn now(&self) -> Timestamp {
        self.inner.scheduler.now()
    }

    /// Stores the agent's report and returns the endpoints it took over from
    /// other agents. Those endpoints are also sent to their previous owners.
    pub async fn register(
        &self,
        record: AgentRecord,
        handle: Arc<dyn NetworkAgent>,
    ) -> RegistryResult<Vec<ContainerEndpoint>> {
        let now = self.now();
        let mut record = record;
        record.last_seen = now;
        let agent_id = record.agent_id.clone();
        for container in record.containers.values_mut() {
            container.agent_id = agent_id.clone();
        }

        let mut to_shutdown = Vec::new();
        let mut superseded: Vec<(Arc<dyn NetworkAgent>, ContainerEndpoint)> = Vec::new();
        {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;

            let previous = state.agents.remove(&agent_id);
            let agent_kind = if previous.is_some() {
                AgentEventKind::Updated
            } else {
                AgentEventKind::Added
            };
            let old_containers = previous
                .map(|entry| entry.record.containers)
                .unwrap_or_default();
            let mut event = ContainerEvent::default();

            for (container_id, old) in &old_containers {
                if record.containers.contains_key(container_id) {
                    continue;
                }
                if matches!(
                    state.ownership.get(container_id),
                    Some(Placement::Resolved { agent_id: owner }) if *owner == agent_id
                ) {
                    state.ownership.remove(container_id);
                }
                state.by_endpoint.remove(&old.endpoint);
                state.orphans.remove(&old.endpoint);
                state.forget_leases(container_id);
                event.deleted.push(old.clone());
            }

            for (container_id, container) in &record.containers {
                if let Some(old) = old_containers.get(container_id) {
                    if old.endpoint != container.endpoint {
                        state.by_endpoint.remove(&old.endpoint);
                        if let Some(orphan) = state.orphans.remove(&old.endpoint) {
                            state.orphans.insert(
                                container.endpoint.clone(),
                                Orphan {
                                    record: container.clone(),
                                    since: orphan.since,
                                },
                            );
                        }
                        event.updated.push(container.clone());
                    }
                } else {
                    match state.ownership.get(container_id) {
                        Some(Placement::Resolved { agent_id: owner }) if *owner != agent_id => {
                            let owner = owner.clone();
                            if let Some(loser) = state.agents.get_mut(&owner) {
                                if let Some(lost) = loser.record.containers.remove(container_id) {
                                    state.by_endpoint.remove(&lost.endpoint);
                                    state.orphans.remove(&lost.endpoint);
                                    to_shutdown.push(lost.endpoint.clone());
                                    superseded.push((loser.handle.clone(), lost.endpoint));
                                }
                            }
                            info!(
                                "Container {} moved from agent {} to {}",
                                container_id, owner, agent_id
                            );
                            event.updated.push(container.clone());
                        }
                        _ => event.added.push(container.clone()),
                    }
                    state.ownership.insert(
                        container_id.clone(),
                        Placement::Resolved {
                            agent_id: agent_id.clone(),
                        },
                    );
                }
                state
                    .by_endpoint
                    .insert(container.endpoint.clone(), container_id.clone());
            }

            info!(
                "Agent {} registered ({}) with {} containers",
                agent_id,
                agent_kind,
                record.containers.len()
            );
            event.agents.push(AgentEvent {
                agent_id: agent_id.clone(),
                kinds: record.kinds.iter().cloned().collect(),
                kind: agent_kind,
            });
            state.events.push(event);
            state
                .agents
                .insert(agent_id.clone(), AgentEntry { record, handle });
        }

        for (loser, endpoint) in superseded {
            if let Err(e) = loser.terminate(&endpoint).await {
                warn!(
                    "Agent {} failed to stop superseded container {}: {}",
                    loser.agent_id(),
                    endpoint,
                    e
                );
            }
        }
        Ok(to_shutdown)
    }

    /// Drops the agent as if it had stopped answering pings.
    pub async fn unregister(&self, agent_id: &AgentId) -> RegistryResult<()> {
        self.inner.state.write().await.remove_agent(agent_id);
        Ok(())
    }

    /// Returns the endpoint of `container_id`, placing it on a suitable agent
    /// when nobody hosts it yet. The client leases the container either way.
    #[instrument(skip(self, request))]
    pub async fn get(
        &self,
        client_id: &ClientId,
        container_id: &ContainerId,
        request: &StartRequest,
    ) -> RegistryResult<ContainerEndpoint> {
        let now = self.now();
        let pending = {
            let mut state = self.inner.state.write().await;
            state.lease(client_id, container_id, now);

            if let Some(record) = state.resolved(container_id) {
                let endpoint = record.endpoint.clone();
                if state.orphans.remove(&endpoint).is_some() {
                    debug!("Container {} revived", container_id);
                }
                return Ok(endpoint);
            }

            match state.ownership.get(container_id) {
                Some(Placement::Pending { endpoint, .. }) => {
                    debug!("Joining pending placement of {}", container_id);
                    endpoint.clone()
                }
                _ => match state.pick_agent(&request.kind) {
                    Ok((agent_id, handle)) => {
                        info!("Placing {} container {} on {}", request.kind, container_id, agent_id);
                        let endpoint = resolve_placement(
                            Arc::downgrade(&self.inner),
                            agent_id.clone(),
                            handle,
                            container_id.clone(),
                            request.clone(),
                        )
                        .boxed()
                        .shared();
                        state.ownership.insert(
                            container_id.clone(),
                            Placement::Pending {
                                agent_id,
                                endpoint: endpoint.clone(),
                            },
                        );
                        // the start keeps running even if this caller goes away
                        tokio::spawn(endpoint.clone().map(|_| ()));
                        endpoint
                    }
                    Err(e) => {
                        state.release(client_id, container_id, now);
                        warn!("Placement of {} failed: {}", container_id, e);
                        return Err(e);
                    }
                },
            }
        };
        pending.await
    }

    /// Ends the client's lease. A container left without clients is orphaned and
    /// reclaimed by a later liveness pass.
    pub async fn release(&self, client_id: &ClientId, container_id: &ContainerId) -> RegistryResult<()> {
        let now = self.now();
        self.inner
            .state
            .write()
            .await
            .release(client_id, container_id, now);
        Ok(())
    }

    /// Heartbeat from an agent, a client, or both. Unknown ids are ignored.
    pub async fn ping(&self, id: &PeerId) {
        let now = self.now();
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;

        if let Some(agent) = state.agents.get_mut(&AgentId::new(id.as_str())) {
            agent.record.last_seen = now;
        }
        if let Some(client) = state.clients.get_mut(&ClientId::new(id.as_str())) {
            client.last_seen = now;
            for agent_id in &client.mapped_agents {
                if let Some(agent) = state.agents.get_mut(agent_id) {
                    agent.record.last_seen = now;
                }
            }
        }
    }

    /// Registers or updates a client and its event callback.
    pub async fn add_client(&self, client_id: &ClientId, on_event: Option<EventCallback>) {
        let now = self.now();
        let mut state = self.inner.state.write().await;
        state.client_mut(client_id, now).on_event = on_event;
        debug!("Client {} added", client_id);
    }

    /// Releases everything the client leases and forgets it.
    pub async fn remove_client(&self, client_id: &ClientId) {
        let now = self.now();
        self.inner
            .state
            .write()
            .await
            .remove_client(client_id, now);
    }

    /// Lets the client's pings keep `agent_id` alive.
    pub async fn map_agent(&self, client_id: &ClientId, agent_id: &AgentId) {
        if let Some(client) = self.inner.state.write().await.clients.get_mut(client_id) {
            client.mapped_agents.insert(agent_id.clone());
        }
    }

    pub async fn unmap_agent(&self, client_id: &ClientId, agent_id: &AgentId) {
        if let Some(client) = self.inner.state.write().await.clients.get_mut(client_id) {
            client.mapped_agents.remove(agent_id);
        }
    }

    /// Registers the client with a callback feeding the returned stream.
    pub async fn subscribe(&self, client_id: &ClientId) -> UnboundedReceiverStream<ContainerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: EventCallback = Arc::new(move |event| {
            let result = tx
                .send(event)
                .map_err(|_| RegistryError::internal("Event subscriber is gone"));
            async move { result }.boxed()
        });
        self.add_client(client_id, Some(callback)).await;
        UnboundedReceiverStream::new(rx)
    }

    /// Liveness pass: evicts silent agents and clients, then reclaims orphans.
    pub async fn check_alive(&self) -> RegistryResult<()> {
        let now = self.now();
        let alive_timeout = self.inner.timeouts.alive_timeout.as_millis() as Timestamp;
        let grace = self.inner.timeouts.unused_container_timeout.as_millis() as Timestamp;
        let expired = {
            let mut state = self.inner.state.write().await;
            state.evict_silent(now, alive_timeout);
            state.take_expired_orphans(now, grace)
        };
        self.terminate_orphans(expired).await;
        Ok(())
    }

    async fn terminate_orphans(&self, expired: Vec<Expired>) {
        for Expired {
            record,
            since,
            handle,
        } in expired
        {
            info!(
                "Terminating unused container {} at {}",
                record.container_id, record.endpoint
            );
            match handle.terminate(&record.endpoint).await {
                Ok(()) => {
                    let mut state = self.inner.state.write().await;
                    state.events.push(ContainerEvent::deleted(vec![record]));
                }
                Err(e) => {
                    warn!(
                        "Failed to terminate orphaned container {}: {}",
                        record.container_id, e
                    );
                    self.inner.state.write().await.restore_orphan(record, since);
                }
            }
        }
    }

    /// Broadcast pass: merges queued batches and delivers them to every client.
    pub async fn send_events(&self) -> RegistryResult<()> {
        let (event, callbacks) = {
            let mut state = self.inner.state.write().await;
            let Some(event) = state.events.drain() else {
                return Ok(());
            };
            let callbacks: Vec<(ClientId, EventCallback)> = state
                .clients
                .iter()
                .filter_map(|(id, client)| client.on_event.clone().map(|cb| (id.clone(), cb)))
                .collect();
            (event, callbacks)
        };

        debug!(
            "Broadcasting {} added, {} updated, {} deleted to {} clients",
            event.added.len(),
            event.updated.len(),
            event.deleted.len(),
            callbacks.len()
        );
        join_all(callbacks.into_iter().map(|(client_id, callback)| {
            let event = event.clone();
            async move {
                if let Err(e) = callback(event).await {
                    warn!("Event callback of client {} failed: {}", client_id, e);
                }
            }
        }))
        .await;
        Ok(())
    }

    /// Summary of every live agent, sorted by id.
    pub async fn agents(&self) -> Vec<AgentInfo> {
        let state = self.inner.state.read().await;
        state
            .agents
            .values()
            .map(|entry| AgentInfo {
                agent_id: entry.record.agent_id.clone(),
                endpoint: entry.record.endpoint.clone(),
                kinds: entry.record.kinds.iter().cloned().collect(),
                containers: entry.record.containers.len(),
            })
            .collect()
    }

    pub async fn kinds(&self) -> Vec<ContainerKind> {
        let state = self.inner.state.read().await;
        let kinds: BTreeSet<ContainerKind> = state
            .agents
            .values()
            .flat_map(|entry| entry.record.kinds.iter().cloned())
            .collect();
        kinds.into_iter().collect()
    }

    /// Started containers, optionally of one kind, sorted by id.
    pub async fn list(&self, kind: Option<&ContainerKind>) -> Vec<ContainerRecord> {
        let state = self.inner.state.read().await;
        let mut records: Vec<ContainerRecord> = state
            .agents
            .values()
            .flat_map(|entry| entry.record.containers.values())
            .filter(|record| kind.map_or(true, |k| record.kind == *k))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        records
    }

    /// Forwards a request to the agent hosting the container.
    pub async fn request(
        &self,
        container_id: &ContainerId,
        operation: &str,
        data: Value,
    ) -> RegistryResult<Value> {
        let handle = {
            let state = self.inner.state.read().await;
            let agent_id = match state.ownership.get(container_id) {
                Some(Placement::Resolved { agent_id }) => agent_id,
                _ => {
                    return Err(RegistryError::ContainerNotFound {
                        container_id: container_id.clone(),
                    })
                }
            };
            state
                .agents
                .get(agent_id)
                .map(|entry| entry.handle.clone())
                .ok_or_else(|| RegistryError::AgentNotFound {
                    agent_id: agent_id.clone(),
                })?
        };
        handle.request(container_id, operation, data).await
    }

    /// The agent owning a started container.
    pub async fn owner(&self, container_id: &ContainerId) -> Option<AgentId> {
        let state = self.inner.state.read().await;
        state.resolved(container_id).map(|record| record.agent_id.clone())
    }

    /// Containers currently waiting for reclamation, sorted by id.
    pub async fn orphans(&self) -> Vec<ContainerRecord> {
        let state = self.inner.state.read().await;
        let mut records: Vec<ContainerRecord> =
            state.orphans.values().map(|o| o.record.clone()).collect();
        records.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        records
    }

    /// Detaches the registry from the tick scheduler.
    pub async fn close(&self) {
        for registration in self.inner.registrations.lock().await.drain(..) {
            registration.cancel();
        }
        info!("Network registry closed");
    }
}

fn tick_handler<F>(inner: Weak<NetworkInner>, run: F) -> TickHandler
where
    F: Fn(NetworkRegistry) -> BoxFuture<'static, RegistryResult<()>> + Send + Sync + 'static,
{
    Arc::new(move || match inner.upgrade() {
        Some(inner) => run(NetworkRegistry { inner }),
        None => async { Ok(()) }.boxed(),
    })
}

/// Runs one placement on the chosen agent and settles the ownership index.
async fn resolve_placement(
    inner: Weak<NetworkInner>,
    agent_id: AgentId,
    handle: Arc<dyn NetworkAgent>,
    container_id: ContainerId,
    request: StartRequest,
) -> RegistryResult<ContainerEndpoint> {
    let started = handle.get(&container_id, &request).await;
    let Some(inner) = inner.upgrade() else {
        return started;
    };

    let now = inner.scheduler.now();
    let mut guard = inner.state.write().await;
    let state = &mut *guard;
    let still_pending = matches!(
        state.ownership.get(&container_id),
        Some(Placement::Pending { agent_id: owner, .. }) if *owner == agent_id
    );

    let endpoint = match started {
        Err(e) => {
            warn!("Agent {} failed to start {}: {}", agent_id, container_id, e);
            if still_pending {
                state.ownership.remove(&container_id);
            }
            if !state.ownership.contains_key(&container_id) {
                state.forget_leases(&container_id);
            }
            return Err(e);
        }
        Ok(endpoint) => endpoint,
    };

    if !still_pending {
        // the agent died or another agent reported the id while this start ran
        let current = state.resolved(&container_id).map(|r| r.endpoint.clone());
        if !state.ownership.contains_key(&container_id) {
            state.forget_leases(&container_id);
        }
        drop(guard);
        if current.as_ref() != Some(&endpoint) {
            debug!("Discarding superseded start of {} at {}", container_id, endpoint);
            if let Err(e) = handle.terminate(&endpoint).await {
                warn!("Failed to stop superseded container {}: {}", endpoint, e);
            }
        }
        return current.ok_or(RegistryError::AgentUnavailable { agent_id });
    }

    let record = ContainerRecord {
        agent_id: agent_id.clone(),
        container_id: container_id.clone(),
        kind: request.kind,
        endpoint: endpoint.clone(),
        last_visit: now,
        extra: request.extra,
        labels: request.labels,
    };
    let Some(agent) = state.agents.get_mut(&agent_id) else {
        state.ownership.remove(&container_id);
        state.forget_leases(&container_id);
        return Err(RegistryError::AgentUnavailable { agent_id });
    };
    agent
        .record
        .containers
        .insert(container_id.clone(), record.clone());
    state.ownership.insert(
        container_id.clone(),
        Placement::Resolved {
            agent_id: agent_id.clone(),
        },
    );
    state
        .by_endpoint
        .insert(endpoint.clone(), container_id.clone());
    state.events.push(ContainerEvent::added(record.clone()));
    if state.leases.get(&container_id).map_or(true, |l| l.is_empty()) {
        // every client released while the start was running
        state.orphans.insert(
            endpoint.clone(),
            Orphan {
                record,
                since: now,
            },
        );
    }
    info!("Container {} placed on {} at {}", container_id, agent_id, endpoint);
    Ok(endpoint)
}

#[async_trait]
impl Network for NetworkRegistry {
    async fn register(
        &self,
        record: AgentRecord,
        agent: Arc<dyn NetworkAgent>,
    ) -> RegistryResult<Vec<ContainerEndpoint>> {
        NetworkRegistry::register(self, record, agent).await
    }

    async fn unregister(&self, agent_id: &AgentId) -> RegistryResult<()> {
        NetworkRegistry::unregister(self, agent_id).await
    }

    async fn ping(&self, id: &PeerId) {
        NetworkRegistry::ping(self, id).await
    }

    async fn get(
        &self,
        client_id: &ClientId,
        container_id: &ContainerId,
        request: &StartRequest,
    ) -> RegistryResult<ContainerEndpoint> {
        NetworkRegistry::get(self, client_id, container_id, request).await
    }

    async fn release(&self, client_id: &ClientId, container_id: &ContainerId) -> RegistryResult<()> {
        NetworkRegistry::release(self, client_id, container_id).await
    }

    async fn list(&self, kind: Option<&ContainerKind>) -> Vec<ContainerRecord> {
        NetworkRegistry::list(self, kind).await
    }

    async fn request(
        &self,
        container_id: &ContainerId,
        operation: &str,
        data: Value,
    ) -> RegistryResult<Value> {
        NetworkRegistry::request(self, container_id, operation, data).await
    }

    async fn agents(&self) -> Vec<AgentInfo> {
        NetworkRegistry::agents(self).await
    }

    async fn kinds(&self) -> Vec<ContainerKind> {
        NetworkRegistry::kinds(self).await
    }
}

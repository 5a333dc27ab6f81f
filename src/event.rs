//! # Container Lifecycle Events
//!
//! Structural changes are queued as [`ContainerEvent`] batches and flushed once
//! per tick. Flushing merges every queued batch into one, so subscribers see a
//! single coalesced view of the broadcast window.
//!
//! ## Coalescing rules
//!
//! - A container listed under `deleted` anywhere in the window is reported only
//!   as deleted, whatever order the batches arrived in.
//! - A container both added and updated is reported once under `added`, carrying
//!   its latest record.
//! - Repeated entries for the same container collapse to the latest record.
//! - For agents, `Removed` is final for the window and `Added` absorbs a later
//!   `Updated`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{AgentId, ContainerId, ContainerKind, ContainerRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum AgentEventKind {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub agent_id: AgentId,
    pub kinds: Vec<ContainerKind>,
    pub kind: AgentEventKind,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerEvent {
    #[serde(default)]
    pub agents: Vec<AgentEvent>,
    #[serde(default)]
    pub added: Vec<ContainerRecord>,
    #[serde(default)]
    pub updated: Vec<ContainerRecord>,
    #[serde(default)]
    pub deleted: Vec<ContainerRecord>,
}

impl ContainerEvent {
    pub fn added(record: ContainerRecord) -> Self {
        Self {
            added: vec![record],
            ..Default::default()
        }
    }

    pub fn deleted(records: Vec<ContainerRecord>) -> Self {
        Self {
            deleted: records,
            ..Default::default()
        }
    }

    /// True when the batch carries no container changes.
    pub fn has_no_container_changes(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.has_no_container_changes()
    }

    pub fn merge<I>(batches: I) -> ContainerEvent
    where
        I: IntoIterator<Item = ContainerEvent>,
    {
        let mut agents: Vec<AgentEvent> = Vec::new();
        let mut agent_pos: HashMap<AgentId, usize> = HashMap::new();

        let mut added: BTreeMap<ContainerId, ContainerRecord> = BTreeMap::new();
        let mut updated: BTreeMap<ContainerId, ContainerRecord> = BTreeMap::new();
        let mut deleted: BTreeMap<ContainerId, ContainerRecord> = BTreeMap::new();

        for batch in batches {
            for agent in batch.agents {
                match agent_pos.get(&agent.agent_id) {
                    None => {
                        agent_pos.insert(agent.agent_id.clone(), agents.len());
                        agents.push(agent);
                    }
                    Some(&pos) => {
                        let current = &mut agents[pos];
                        match (current.kind, agent.kind) {
                            (AgentEventKind::Removed, _) => {}
                            (AgentEventKind::Added, AgentEventKind::Updated) => {
                                current.kinds = agent.kinds;
                            }
                            _ => *current = agent,
                        }
                    }
                }
            }
            for record in batch.added {
                added.insert(record.container_id.clone(), record);
            }
            for record in batch.updated {
                if let Some(existing) = added.get_mut(&record.container_id) {
                    *existing = record;
                } else {
                    updated.insert(record.container_id.clone(), record);
                }
            }
            for record in batch.deleted {
                deleted.insert(record.container_id.clone(), record);
            }
        }

        // An update queued before the add in the same window folds into the add.
        updated.retain(|id, _| !added.contains_key(id));
        added.retain(|id, _| !deleted.contains_key(id));
        updated.retain(|id, _| !deleted.contains_key(id));

        ContainerEvent {
            agents,
            added: added.into_values().collect(),
            updated: updated.into_values().collect(),
            deleted: deleted.into_values().collect(),
        }
    }
}

/// Pending batches awaiting the next broadcast.
#[derive(Debug, Default)]
pub struct EventQueue {
    batches: Vec<ContainerEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: ContainerEvent) {
        if !event.is_empty() {
            self.batches.push(event);
        }
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Empties the queue and returns the merged batch, if anything was queued.
    pub fn drain(&mut self) -> Option<ContainerEvent> {
        if self.batches.is_empty() {
            return None;
        }
        Some(ContainerEvent::merge(std::mem::take(&mut self.batches)))
    }
}

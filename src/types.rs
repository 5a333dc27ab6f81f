use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Milliseconds as reported by [`crate::ticker::TickScheduler::now`].
pub type Timestamp = u64;

// Identifiers share a representation but are distinct types, so an agent id can
// never be passed where a container id is expected.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// A process able to host containers.
    AgentId
);
string_id!(
    /// A logical work unit, unique across the whole network.
    ContainerId
);
string_id!(
    /// A consumer leasing containers and receiving broadcasts.
    ClientId
);
string_id!(
    /// The category of container a factory knows how to start.
    ContainerKind
);
string_id!(
    /// Address of a running container. Unique across agents.
    ContainerEndpoint
);
string_id!(AgentEndpoint);
string_id!(
    /// Any heartbeat sender: an agent, a client, or a process acting as both.
    PeerId
);

impl From<&AgentId> for PeerId {
    fn from(value: &AgentId) -> Self {
        Self(value.0.clone())
    }
}

impl From<&ClientId> for PeerId {
    fn from(value: &ClientId) -> Self {
        Self(value.0.clone())
    }
}

impl ContainerId {
    /// A fresh random id for callers that do not care about naming.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// One hosted container as known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub agent_id: AgentId,
    pub container_id: ContainerId,
    pub kind: ContainerKind,
    pub endpoint: ContainerEndpoint,
    pub last_visit: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

/// What an agent reports about itself on registration.
///
/// The network replaces its stored copy wholesale on every registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub endpoint: Option<AgentEndpoint>,
    pub kinds: BTreeSet<ContainerKind>,
    pub containers: HashMap<ContainerId, ContainerRecord>,
    pub last_seen: Timestamp,
}

impl AgentRecord {
    pub fn new(agent_id: AgentId, kinds: impl IntoIterator<Item = ContainerKind>) -> Self {
        Self {
            agent_id,
            endpoint: None,
            kinds: kinds.into_iter().collect(),
            containers: HashMap::new(),
            last_seen: 0,
        }
    }

    pub fn with_containers(mut self, containers: impl IntoIterator<Item = ContainerRecord>) -> Self {
        self.containers = containers
            .into_iter()
            .map(|c| (c.container_id.clone(), c))
            .collect();
        self
    }

    pub fn with_endpoint(mut self, endpoint: AgentEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }
}

/// Summary row returned by `agents()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub endpoint: Option<AgentEndpoint>,
    pub kinds: Vec<ContainerKind>,
    pub containers: usize,
}

/// Parameters for starting (or reusing) a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub kind: ContainerKind,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
}

impl StartRequest {
    pub fn new(kind: impl Into<ContainerKind>) -> Self {
        Self {
            kind: kind.into(),
            labels: None,
            extra: None,
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

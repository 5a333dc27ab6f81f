//! # Registration Protocol
//!
//! The two directions of the agent/network conversation, expressed as traits so
//! the concrete transport stays outside this crate.
//!
//! ```text
//! ┌───────────────┐  register/ping/get/release  ┌─────────────────┐
//! │ AgentRegistry │ ──────────────────────────▶ │ NetworkRegistry │
//! │ (NetworkAgent)│ ◀────────────────────────── │    (Network)    │
//! └───────────────┘   get/terminate/request     └─────────────────┘
//! ```
//!
//! In-process deployments wire an [`crate::agent_registry::AgentRegistry`]
//! straight into a [`crate::network::NetworkRegistry`]; remote ones put an RPC
//! proxy implementing the same trait in between.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    types::{
        AgentEndpoint, AgentId, AgentInfo, AgentRecord, ClientId, ContainerEndpoint, ContainerId,
        ContainerKind, ContainerRecord, PeerId, StartRequest,
    },
    RegistryResult,
};

/// The handle a network keeps for every registered agent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkAgent: Send + Sync {
    fn agent_id(&self) -> AgentId;

    fn kinds(&self) -> Vec<ContainerKind>;

    fn endpoint(&self) -> Option<AgentEndpoint>;

    /// Starts the container, or returns the endpoint of the one already hosted.
    async fn get(
        &self,
        container_id: &ContainerId,
        request: &StartRequest,
    ) -> RegistryResult<ContainerEndpoint>;

    async fn terminate(&self, endpoint: &ContainerEndpoint) -> RegistryResult<()>;

    async fn request(
        &self,
        container_id: &ContainerId,
        operation: &str,
        data: Value,
    ) -> RegistryResult<Value>;

    async fn list(&self, kind: Option<ContainerKind>) -> Vec<ContainerRecord>;
}

/// The surface agents and clients talk to.
#[async_trait]
pub trait Network: Send + Sync {
    /// Returns endpoints whose ownership moved away and must stop serving.
    async fn register(
        &self,
        record: AgentRecord,
        agent: Arc<dyn NetworkAgent>,
    ) -> RegistryResult<Vec<ContainerEndpoint>>;

    async fn unregister(&self, agent_id: &AgentId) -> RegistryResult<()>;

    async fn ping(&self, id: &PeerId);

    async fn get(
        &self,
        client_id: &ClientId,
        container_id: &ContainerId,
        request: &StartRequest,
    ) -> RegistryResult<ContainerEndpoint>;

    async fn release(&self, client_id: &ClientId, container_id: &ContainerId)
        -> RegistryResult<()>;

    async fn list(&self, kind: Option<&ContainerKind>) -> Vec<ContainerRecord>;

    async fn request(
        &self,
        container_id: &ContainerId,
        operation: &str,
        data: Value,
    ) -> RegistryResult<Value>;

    async fn agents(&self) -> Vec<AgentInfo>;

    async fn kinds(&self) -> Vec<ContainerKind>;
}

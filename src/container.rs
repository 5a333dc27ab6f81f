//! The contract a hosted work unit fulfils. The registry never looks past it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::{
    types::{ClientId, ContainerEndpoint, ContainerId, StartRequest},
    RegistryResult,
};

/// Pushes a payload to one connected client.
pub type BroadcastFn = Arc<dyn Fn(Value) -> BoxFuture<'static, RegistryResult<()>> + Send + Sync>;

/// Invoked by a container that stopped on its own.
pub type TerminatedCallback = Box<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait Container: Send + Sync {
    async fn request(
        &self,
        operation: &str,
        data: Value,
        client_id: Option<&ClientId>,
    ) -> RegistryResult<Value>;

    async fn terminate(&self) -> RegistryResult<()>;

    async fn ping(&self) -> RegistryResult<()>;

    fn connect(&self, client_id: &ClientId, broadcast: BroadcastFn);

    fn disconnect(&self, client_id: &ClientId);

    /// Containers able to stop on their own call the callback when they do.
    fn on_terminated(&self, _callback: TerminatedCallback) {}
}

/// What a factory hands back for a started container.
pub struct StartedContainer {
    pub container_id: ContainerId,
    pub container: Arc<dyn Container>,
    pub endpoint: ContainerEndpoint,
}

/// Starts a container of one kind under the requested id.
pub type ContainerFactory = Arc<
    dyn Fn(ContainerId, StartRequest) -> BoxFuture<'static, RegistryResult<StartedContainer>>
        + Send
        + Sync,
>;

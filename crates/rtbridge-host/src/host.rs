//! Hosted runtime interfaces
//!
//! A [`HostedRuntime`] is one sandboxed runtime instance (or an aggregate of
//! them). It calls back into the host through the [`Handler`] installed in
//! its [`RuntimeHostConfig`], and the host pushes into it with
//! [`HostedRuntime::call`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rtbridge_core::{
    BridgeResult, HostEvent, HostRequest, HostResponse, Namespace, RequestEnvelope,
    RuntimeInfo, RuntimeRequest, RuntimeResponse, Version,
};

use crate::Subscription;

/// Answers requests initiated by the hosted runtime
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: HostRequest) -> BridgeResult<HostResponse>;

    /// Handle a boundary-shaped request carrying exactly one request field.
    async fn handle_envelope(&self, envelope: RequestEnvelope) -> BridgeResult<HostResponse> {
        self.handle(envelope.into_request()?).await
    }
}

#[async_trait]
pub trait HostedRuntime: Send + Sync {
    fn id(&self) -> Namespace;

    /// Push a request into the runtime.
    async fn call(&self, request: RuntimeRequest) -> BridgeResult<RuntimeResponse>;

    async fn get_info(&self) -> BridgeResult<RuntimeInfo>;

    /// Lifecycle events emitted after subscribing.
    fn watch_events(&self) -> Subscription<HostEvent>;

    async fn start(&self) -> BridgeResult<()>;

    async fn stop(&self);
}

/// Pushes state changes into a hosted runtime
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Start notifying. A second call is a no-op.
    async fn start(&self) -> BridgeResult<()>;

    /// Stop notifying and wait for the watch loops to exit. Safe to repeat.
    async fn stop(&self);
}

/// Configuration for provisioning one runtime version
#[derive(Clone)]
pub struct RuntimeHostConfig {
    pub runtime_id: Namespace,
    pub version: Version,
    /// Bundle or image the provisioner should launch
    pub bundle: String,
    pub message_handler: Option<Arc<dyn Handler>>,
}

impl RuntimeHostConfig {
    pub fn new(runtime_id: Namespace, version: Version, bundle: impl Into<String>) -> Self {
        RuntimeHostConfig {
            runtime_id,
            version,
            bundle: bundle.into(),
            message_handler: None,
        }
    }
}

impl fmt::Debug for RuntimeHostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHostConfig")
            .field("runtime_id", &self.runtime_id)
            .field("version", &self.version)
            .field("bundle", &self.bundle)
            .field("message_handler", &self.message_handler.is_some())
            .finish()
    }
}

/// Launches runtime instances
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn new_runtime(&self, config: RuntimeHostConfig) -> BridgeResult<Arc<dyn HostedRuntime>>;
}

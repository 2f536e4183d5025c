//! Convenience wrapper over a hosted runtime

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rtbridge_core::{
    BridgeError, BridgeResult, Height, HostEvent, Namespace, QuotePolicy, RuntimeInfo,
    RuntimeRequest, RuntimeResponse, SignedPolicySgx,
};

use crate::{HostedRuntime, Subscription};

/// Hosted runtime with typed push helpers
pub struct RichRuntime {
    inner: Arc<dyn HostedRuntime>,
}

impl RichRuntime {
    pub fn new(inner: Arc<dyn HostedRuntime>) -> Self {
        RichRuntime { inner }
    }

    /// Call into the runtime, giving up after `timeout`.
    pub async fn call_with_timeout(
        &self,
        request: RuntimeRequest,
        timeout: Duration,
    ) -> BridgeResult<RuntimeResponse> {
        tokio::time::timeout(timeout, self.inner.call(request))
            .await
            .map_err(|_| BridgeError::Timeout(timeout))?
    }

    /// Tell the runtime a consensus block at `height` is available.
    pub async fn consensus_sync(&self, height: Height, timeout: Duration) -> BridgeResult<()> {
        match self
            .call_with_timeout(RuntimeRequest::ConsensusSync { height }, timeout)
            .await?
        {
            RuntimeResponse::ConsensusSync => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_key_manager_policy(
        &self,
        policy: &SignedPolicySgx,
        timeout: Duration,
    ) -> BridgeResult<()> {
        let raw = serde_json::to_vec(policy)
            .map_err(|e| BridgeError::Backend(format!("failed to encode policy: {e}")))?;
        let request = RuntimeRequest::KeyManagerPolicyUpdate {
            signed_policy_raw: raw.into(),
        };
        match self.call_with_timeout(request, timeout).await? {
            RuntimeResponse::KeyManagerPolicyUpdate => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_key_manager_quote_policy(
        &self,
        policy: &QuotePolicy,
        timeout: Duration,
    ) -> BridgeResult<()> {
        let request = RuntimeRequest::KeyManagerQuotePolicyUpdate {
            policy: policy.clone(),
        };
        match self.call_with_timeout(request, timeout).await? {
            RuntimeResponse::KeyManagerQuotePolicyUpdate => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: RuntimeResponse) -> BridgeError {
    BridgeError::Backend(format!("unexpected runtime response: {response:?}"))
}

#[async_trait]
impl HostedRuntime for RichRuntime {
    fn id(&self) -> Namespace {
        self.inner.id()
    }

    async fn call(&self, request: RuntimeRequest) -> BridgeResult<RuntimeResponse> {
        self.inner.call(request).await
    }

    async fn get_info(&self) -> BridgeResult<RuntimeInfo> {
        self.inner.get_info().await
    }

    fn watch_events(&self) -> Subscription<HostEvent> {
        self.inner.watch_events()
    }

    async fn start(&self) -> BridgeResult<()> {
        self.inner.start().await
    }

    async fn stop(&self) {
        self.inner.stop().await
    }
}

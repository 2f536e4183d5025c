//! Full node harness
//!
//! Wires the in-memory collaborators into a [`RuntimeHostNode`] through the
//! default handler factory, the way a supervising node process would.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rtbridge_core::{BridgeResult, Namespace, Version};
use rtbridge_host::{
    DefaultHandlerFactory, HostConfig, HostedRuntime, Notifier, RichRuntime, RuntimeHostNode,
    Subscription,
};
use tokio_util::sync::CancellationToken;

use crate::{
    FakeConsensus, FakeEnvironment, FakeHostedRuntime, FakeProvisioner, FakeRegistryRuntime,
    FakeTxPool,
};

/// Runtime id used by the harness.
pub const RUNTIME_ID: u64 = 0x1000;

/// How long harness helpers wait for asynchronous effects.
pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub ctx: CancellationToken,
    pub consensus: Arc<FakeConsensus>,
    pub registry: Arc<FakeRegistryRuntime>,
    pub provisioner: Arc<FakeProvisioner>,
    pub env: Arc<FakeEnvironment>,
    pub node: Arc<RuntimeHostNode>,
}

impl Harness {
    pub fn new(versions: &[Version]) -> Self {
        Self::build(versions, HostConfig::default(), FakeTxPool::default(), |rt| rt)
    }

    /// Harness with `count` transactions in the pool.
    pub fn with_pool(versions: &[Version], count: usize) -> Self {
        Self::build(
            versions,
            HostConfig::default(),
            FakeTxPool::with_transactions(count),
            |rt| rt,
        )
    }

    pub fn with_config(versions: &[Version], config: HostConfig) -> Self {
        Self::build(versions, config, FakeTxPool::default(), |rt| rt)
    }

    pub fn build(
        versions: &[Version],
        config: HostConfig,
        pool: FakeTxPool,
        customize: impl FnOnce(FakeRegistryRuntime) -> FakeRegistryRuntime,
    ) -> Self {
        let consensus = Arc::new(FakeConsensus::new());
        let provisioner = Arc::new(FakeProvisioner::new());
        let registry = Arc::new(customize(FakeRegistryRuntime::new(
            Namespace::from_u64(RUNTIME_ID),
            versions,
            Arc::clone(&provisioner),
        )));
        let env = Arc::new(FakeEnvironment::new(pool));

        let factory = DefaultHandlerFactory::new(
            env.clone(),
            registry.clone(),
            consensus.clone(),
            config.clone(),
        );
        let node = Arc::new(RuntimeHostNode::new(Arc::new(factory), &config));

        Harness {
            ctx: CancellationToken::new(),
            consensus,
            registry,
            provisioner,
            env,
            node,
        }
    }

    pub async fn provision(&self) -> BridgeResult<(Arc<RichRuntime>, Arc<dyn Notifier>)> {
        self.node.provision_hosted_runtime(&self.ctx).await
    }

    /// Provision, start the runtime and start the notifier.
    pub async fn start(&self) -> BridgeResult<(Arc<RichRuntime>, Arc<dyn Notifier>)> {
        let (runtime, notifier) = self.provision().await?;
        runtime.start().await?;
        notifier.start().await?;
        wait_until(|| self.registry.descriptors.subscriber_count() == 1).await;
        wait_until(|| self.consensus.blocks.subscriber_count() == 1).await;
        Ok((runtime, notifier))
    }

    /// Provisioned instance for `version`.
    pub fn hosted(&self, version: Version) -> Arc<FakeHostedRuntime> {
        match self.provisioner.runtime(version) {
            Some(runtime) => runtime,
            None => panic!("version {version} not provisioned"),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

/// Poll `cond` until it holds, panicking after [`WAIT`].
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {WAIT:?}");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Next item of `sub`, panicking after [`WAIT`].
pub async fn next<T>(sub: &mut Subscription<T>) -> T {
    within(sub.recv())
        .await
        .unwrap_or_else(|| panic!("subscription closed"))
}

/// Await `fut`, panicking after [`WAIT`].
pub async fn within<F: Future>(fut: F) -> F::Output {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(out) => out,
        Err(_) => panic!("timed out after {WAIT:?}"),
    }
}

/// Give spawned tasks a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

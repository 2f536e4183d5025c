//! Runtime host node
//!
//! Top-level owner of a hosted runtime: provisions one instance per
//! configured version, bundles them into an [`Aggregate`], installs the
//! request handler and hands out the notifier. Late callers can wait for
//! provisioning through [`RuntimeHostNode::wait_hosted_runtime`].

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rtbridge_core::{BridgeError, BridgeResult, ResultExt, Version};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    Aggregate, ConsensusBackend, Handler, HandlerEnvironment, HostConfig, HostNotifier,
    HostedRuntime, Latch, Notifier, RichRuntime, Runtime, RuntimeHostHandler,
};

/// Creates the handler and notifier for a provisioned runtime
pub trait HostHandlerFactory: Send + Sync {
    /// Registered runtime the handlers serve.
    fn runtime(&self) -> Arc<dyn Runtime>;

    fn new_handler(&self) -> Arc<dyn Handler>;

    fn new_notifier(&self, ctx: &CancellationToken, host: Arc<dyn HostedRuntime>)
        -> Arc<dyn Notifier>;
}

/// Factory wiring [`RuntimeHostHandler`] and [`HostNotifier`]
pub struct DefaultHandlerFactory {
    env: Arc<dyn HandlerEnvironment>,
    runtime: Arc<dyn Runtime>,
    consensus: Arc<dyn ConsensusBackend>,
    config: HostConfig,
}

impl DefaultHandlerFactory {
    pub fn new(
        env: Arc<dyn HandlerEnvironment>,
        runtime: Arc<dyn Runtime>,
        consensus: Arc<dyn ConsensusBackend>,
        config: HostConfig,
    ) -> Self {
        DefaultHandlerFactory {
            env,
            runtime,
            consensus,
            config,
        }
    }
}

impl HostHandlerFactory for DefaultHandlerFactory {
    fn runtime(&self) -> Arc<dyn Runtime> {
        Arc::clone(&self.runtime)
    }

    fn new_handler(&self) -> Arc<dyn Handler> {
        Arc::new(RuntimeHostHandler::new(
            Arc::clone(&self.env),
            Arc::clone(&self.runtime),
            Arc::clone(&self.consensus),
        ))
    }

    fn new_notifier(
        &self,
        ctx: &CancellationToken,
        host: Arc<dyn HostedRuntime>,
    ) -> Arc<dyn Notifier> {
        Arc::new(HostNotifier::new(
            ctx,
            Arc::clone(&self.runtime),
            host,
            Arc::clone(&self.consensus),
            &self.config,
        ))
    }
}

#[derive(Default)]
struct NodeState {
    provisioning: bool,
    aggregate: Option<Arc<Aggregate>>,
    runtime: Option<Arc<RichRuntime>>,
    notifier: Option<Arc<dyn Notifier>>,
}

/// Owner of a provisioned hosted runtime
pub struct RuntimeHostNode {
    factory: Arc<dyn HostHandlerFactory>,
    default_version: Option<Version>,
    state: Mutex<NodeState>,
    provisioned: Latch,
}

impl RuntimeHostNode {
    pub fn new(factory: Arc<dyn HostHandlerFactory>, config: &HostConfig) -> Self {
        RuntimeHostNode {
            factory,
            default_version: config.default_version,
            state: Mutex::new(NodeState::default()),
            provisioned: Latch::new(),
        }
    }

    /// Provision every configured runtime version and the notifier.
    ///
    /// The notifier is returned unstarted. Fails with
    /// [`BridgeError::AlreadyProvisioned`] on a second call.
    pub async fn provision_hosted_runtime(
        &self,
        ctx: &CancellationToken,
    ) -> BridgeResult<(Arc<RichRuntime>, Arc<dyn Notifier>)> {
        {
            let mut state = self.state.lock();
            if state.provisioning || state.aggregate.is_some() {
                return Err(BridgeError::AlreadyProvisioned);
            }
            state.provisioning = true;
        }

        let result = self.provision(ctx).await;
        match result {
            Ok((aggregate, runtime, notifier)) => {
                {
                    let mut state = self.state.lock();
                    state.provisioning = false;
                    state.aggregate = Some(aggregate);
                    state.runtime = Some(Arc::clone(&runtime));
                    state.notifier = Some(Arc::clone(&notifier));
                }
                self.provisioned.close();
                Ok((runtime, notifier))
            }
            Err(err) => {
                self.state.lock().provisioning = false;
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        ctx: &CancellationToken,
    ) -> BridgeResult<(Arc<Aggregate>, Arc<RichRuntime>, Arc<dyn Notifier>)> {
        let runtime = self.factory.runtime();
        let (configs, provisioner) = runtime.host().await.context("failed to get runtime host")?;

        let handler = self.factory.new_handler();

        let mut instances: BTreeMap<Version, Arc<dyn HostedRuntime>> = BTreeMap::new();
        for (version, mut config) in configs {
            config.message_handler = Some(Arc::clone(&handler));

            let instance = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(BridgeError::Cancelled),
                instance = provisioner.new_runtime(config) => instance,
            };
            match instance {
                Ok(instance) => {
                    instances.insert(version, instance);
                }
                Err(err) => {
                    error!(err = %err, version = %version, "failed to provision runtime version");
                    return Err(BridgeError::collaborator("failed to provision runtime version", err));
                }
            }
        }

        let aggregate = Arc::new(Aggregate::new(runtime.id(), instances, self.default_version)?);
        info!(
            runtime_id = %runtime.id(),
            versions = ?aggregate.versions(),
            active = %aggregate.active_version(),
            "hosted runtime provisioned"
        );

        let host: Arc<dyn HostedRuntime> = aggregate.clone();
        let notifier = self.factory.new_notifier(ctx, Arc::clone(&host));
        let rich = Arc::new(RichRuntime::new(host));

        Ok((aggregate, rich, notifier))
    }

    /// Provisioned runtime, if any.
    pub fn get_hosted_runtime(&self) -> Option<Arc<RichRuntime>> {
        self.state.lock().runtime.clone()
    }

    pub fn hosted_runtime_notifier(&self) -> Option<Arc<dyn Notifier>> {
        self.state.lock().notifier.clone()
    }

    /// Wait until provisioning finishes.
    ///
    /// Returns [`BridgeError::Cancelled`] without waiting when `ctx` is
    /// already cancelled.
    pub async fn wait_hosted_runtime(
        &self,
        ctx: &CancellationToken,
    ) -> BridgeResult<Arc<RichRuntime>> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(BridgeError::Cancelled),
            _ = self.provisioned.wait() => {}
        }
        self.get_hosted_runtime().ok_or(BridgeError::RuntimeNotAvailable)
    }

    /// Switch the active runtime version.
    pub async fn set_hosted_runtime_version(&self, version: Version) -> BridgeResult<()> {
        let aggregate = self.state.lock().aggregate.clone();
        match aggregate {
            Some(aggregate) => aggregate.set_version(version).await,
            None => Err(BridgeError::RuntimeNotAvailable),
        }
    }

    /// Active runtime version, once provisioned.
    pub fn hosted_runtime_version(&self) -> Option<Version> {
        self.state
            .lock()
            .aggregate
            .as_ref()
            .map(|aggregate| aggregate.active_version())
    }
}

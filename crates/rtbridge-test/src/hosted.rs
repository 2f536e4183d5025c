//! Scriptable hosted runtime and provisioner

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rtbridge_core::{
    BridgeError, BridgeResult, Features, HostEvent, Namespace, RuntimeInfo, RuntimeRequest,
    RuntimeResponse, Version,
};
use rtbridge_host::{Handler, HostedRuntime, Provisioner, RuntimeHostConfig, Subscription, Topic};
use tokio::sync::watch;
use tracing::debug;

/// Hosted runtime that records every push it receives
pub struct FakeHostedRuntime {
    config: RuntimeHostConfig,
    features: Mutex<Features>,
    running: AtomicBool,
    fail_calls: AtomicBool,
    /// Calls wait while the gate is closed
    gate: watch::Sender<bool>,
    calls: Mutex<Vec<RuntimeRequest>>,
    call_log: Topic<RuntimeRequest>,
    events: Topic<HostEvent>,
}

impl FakeHostedRuntime {
    pub fn new(config: RuntimeHostConfig) -> Self {
        let (gate, _) = watch::channel(true);
        FakeHostedRuntime {
            config,
            features: Mutex::new(Features::default()),
            running: AtomicBool::new(false),
            fail_calls: AtomicBool::new(false),
            gate,
            calls: Mutex::new(Vec::new()),
            call_log: Topic::new(),
            events: Topic::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.config.version
    }

    /// Handler installed by the host at provisioning.
    pub fn handler(&self) -> Option<Arc<dyn Handler>> {
        self.config.message_handler.clone()
    }

    pub fn set_features(&self, features: Features) {
        *self.features.lock() = features;
    }

    pub fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    /// Block calls until [`FakeHostedRuntime::release`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Every call received, in arrival order.
    pub fn calls(&self) -> Vec<RuntimeRequest> {
        self.calls.lock().clone()
    }

    /// Calls received from now on, as they arrive.
    pub fn watch_calls(&self) -> Subscription<RuntimeRequest> {
        self.call_log.subscribe()
    }

    /// Heights of the consensus sync calls received.
    pub fn synced_heights(&self) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                RuntimeRequest::ConsensusSync { height } => Some(*height),
                _ => None,
            })
            .collect()
    }

    /// Emit a lifecycle event as if the sandbox had restarted.
    pub fn restart(&self) {
        self.events.publish(HostEvent::Started {
            version: self.config.version,
        });
    }
}

#[async_trait]
impl HostedRuntime for FakeHostedRuntime {
    fn id(&self) -> Namespace {
        self.config.runtime_id
    }

    async fn call(&self, request: RuntimeRequest) -> BridgeResult<RuntimeResponse> {
        self.calls.lock().push(request.clone());
        self.call_log.publish(request.clone());

        let mut gate = self.gate.subscribe();
        while !*gate.borrow_and_update() {
            gate.changed()
                .await
                .map_err(|_| BridgeError::Backend("runtime gone".into()))?;
        }

        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(BridgeError::Backend("runtime rejected call".into()));
        }

        Ok(match request {
            RuntimeRequest::ConsensusSync { .. } => RuntimeResponse::ConsensusSync,
            RuntimeRequest::KeyManagerPolicyUpdate { .. } => RuntimeResponse::KeyManagerPolicyUpdate,
            RuntimeRequest::KeyManagerQuotePolicyUpdate { .. } => {
                RuntimeResponse::KeyManagerQuotePolicyUpdate
            }
        })
    }

    async fn get_info(&self) -> BridgeResult<RuntimeInfo> {
        Ok(RuntimeInfo {
            protocol_version: Version::new(5, 0, 0),
            runtime_version: self.config.version,
            features: self.features.lock().clone(),
        })
    }

    fn watch_events(&self) -> Subscription<HostEvent> {
        self.events.subscribe()
    }

    async fn start(&self) -> BridgeResult<()> {
        self.running.store(true, Ordering::SeqCst);
        debug!(version = %self.config.version, "fake runtime started");
        self.events.publish(HostEvent::Started {
            version: self.config.version,
        });
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.events.publish(HostEvent::Stopped);
    }
}

/// Provisioner creating [`FakeHostedRuntime`]s and remembering them by version
#[derive(Default)]
pub struct FakeProvisioner {
    runtimes: Mutex<BTreeMap<Version, Arc<FakeHostedRuntime>>>,
    features: Mutex<Features>,
    fail_version: Mutex<Option<Version>>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Features advertised by runtimes provisioned from now on.
    pub fn set_features(&self, features: Features) {
        *self.features.lock() = features;
    }

    /// Refuse to provision `version`.
    pub fn fail_version(&self, version: Option<Version>) {
        *self.fail_version.lock() = version;
    }

    pub fn runtime(&self, version: Version) -> Option<Arc<FakeHostedRuntime>> {
        self.runtimes.lock().get(&version).cloned()
    }

    pub fn provisioned(&self) -> Vec<Version> {
        self.runtimes.lock().keys().copied().collect()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn new_runtime(&self, config: RuntimeHostConfig) -> BridgeResult<Arc<dyn HostedRuntime>> {
        if *self.fail_version.lock() == Some(config.version) {
            return Err(BridgeError::Backend(format!(
                "bundle {} failed to load",
                config.bundle
            )));
        }

        let version = config.version;
        let runtime = Arc::new(FakeHostedRuntime::new(config));
        runtime.set_features(self.features.lock().clone());
        self.runtimes.lock().insert(version, Arc::clone(&runtime));
        Ok(runtime)
    }
}

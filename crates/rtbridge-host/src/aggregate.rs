//! Versioned runtime aggregate
//!
//! Holds one provisioned runtime per protocol version and routes everything
//! to the active one. The active version only changes through
//! [`Aggregate::set_version`]; readers always get a matching
//! (version, instance) pair. Start, stop and version switches run one at a
//! time.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rtbridge_core::{
    BridgeError, BridgeResult, HostEvent, Namespace, RuntimeInfo, RuntimeRequest,
    RuntimeResponse, Version,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{HostedRuntime, Subscription, Topic};

struct AggregateState {
    active: Version,
    running: bool,
    /// Stops forwarding events of the running instance
    forwarder: Option<CancellationToken>,
}

pub struct Aggregate {
    id: Namespace,
    runtimes: BTreeMap<Version, Arc<dyn HostedRuntime>>,
    state: Mutex<AggregateState>,
    /// Held across start, stop and version switches
    lifecycle: tokio::sync::Mutex<()>,
    events: Topic<HostEvent>,
}

impl Aggregate {
    /// Build an aggregate over `runtimes`.
    ///
    /// The active version is `active` when given, otherwise the highest
    /// provisioned version.
    pub fn new(
        id: Namespace,
        runtimes: BTreeMap<Version, Arc<dyn HostedRuntime>>,
        active: Option<Version>,
    ) -> BridgeResult<Self> {
        let active = match active {
            Some(version) if runtimes.contains_key(&version) => version,
            Some(version) => return Err(BridgeError::UnknownVersion(version)),
            None => *runtimes.keys().next_back().ok_or(BridgeError::NoVersions)?,
        };

        Ok(Aggregate {
            id,
            runtimes,
            state: Mutex::new(AggregateState {
                active,
                running: false,
                forwarder: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            events: Topic::new(),
        })
    }

    pub fn active_version(&self) -> Version {
        self.state.lock().active
    }

    pub fn versions(&self) -> Vec<Version> {
        self.runtimes.keys().copied().collect()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Active version together with its instance.
    pub fn active(&self) -> (Version, Arc<dyn HostedRuntime>) {
        let version = self.state.lock().active;
        (version, Arc::clone(&self.runtimes[&version]))
    }

    /// Switch the active version.
    ///
    /// When the aggregate is running the old instance is stopped and the
    /// new one started.
    pub async fn set_version(&self, version: Version) -> BridgeResult<()> {
        let target = self
            .runtimes
            .get(&version)
            .cloned()
            .ok_or(BridgeError::UnknownVersion(version))?;

        let _lifecycle = self.lifecycle.lock().await;
        let (previous, running, forwarder) = {
            let mut state = self.state.lock();
            if state.active == version {
                return Ok(());
            }
            let previous = std::mem::replace(&mut state.active, version);
            (previous, state.running, state.forwarder.take())
        };

        info!(runtime_id = %self.id, from = %previous, to = %version, "switching active runtime version");

        if running {
            if let Some(forwarder) = forwarder {
                forwarder.cancel();
            }
            self.runtimes[&previous].stop().await;

            if let Err(err) = target.start().await {
                warn!(err = %err, version = %version, "failed to start runtime version");
                self.state.lock().running = false;
                self.events.publish(HostEvent::FailedToStart {
                    reason: err.to_string(),
                });
                return Err(err);
            }
            // Subscribed after start: the switch is reported as one Updated event.
            let forwarder = self.forward_events(target.as_ref());
            self.state.lock().forwarder = Some(forwarder);
        }

        self.events.publish(HostEvent::Updated { version });
        Ok(())
    }

    fn forward_events(&self, runtime: &dyn HostedRuntime) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let mut events = runtime.watch_events();
        let topic = self.events.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    ev = events.recv() => match ev {
                        Some(ev) => {
                            topic.publish(ev);
                        }
                        None => break,
                    },
                }
            }
        });

        token
    }
}

#[async_trait]
impl HostedRuntime for Aggregate {
    fn id(&self) -> Namespace {
        self.id
    }

    async fn call(&self, request: RuntimeRequest) -> BridgeResult<RuntimeResponse> {
        let (_, runtime) = self.active();
        runtime.call(request).await
    }

    async fn get_info(&self) -> BridgeResult<RuntimeInfo> {
        let (_, runtime) = self.active();
        runtime.get_info().await
    }

    fn watch_events(&self) -> Subscription<HostEvent> {
        self.events.subscribe()
    }

    async fn start(&self) -> BridgeResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let (version, runtime) = {
            let mut state = self.state.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
            (state.active, Arc::clone(&self.runtimes[&state.active]))
        };

        // Subscribed before start so the instance's own Started event is forwarded.
        let forwarder = self.forward_events(runtime.as_ref());
        if let Err(err) = runtime.start().await {
            forwarder.cancel();
            self.state.lock().running = false;
            self.events.publish(HostEvent::FailedToStart {
                reason: err.to_string(),
            });
            return Err(err);
        }
        self.state.lock().forwarder = Some(forwarder);

        debug!(runtime_id = %self.id, version = %version, "runtime aggregate started");
        Ok(())
    }

    async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let (version, forwarder) = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            (state.active, state.forwarder.take())
        };

        if let Some(forwarder) = forwarder {
            forwarder.cancel();
        }
        self.runtimes[&version].stop().await;
        self.events.publish(HostEvent::Stopped);

        debug!(runtime_id = %self.id, version = %version, "runtime aggregate stopped");
    }
}

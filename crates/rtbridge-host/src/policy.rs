//! Key manager policy watch loop
//!
//! Follows the hosted compute runtime's registry descriptor. While a key
//! manager is assigned the loop tracks it: status updates carry the access
//! policy, epoch transitions may activate a new key manager deployment with
//! a new quote policy, and runtime restarts wipe whatever the runtime held
//! in memory. The latest known policy and quote policy are pushed on each of
//! those events.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use rtbridge_core::{
    EpochTime, Features, HostEvent, KeyManagerStatus, Namespace, QuotePolicy, RuntimeDescriptor,
    RuntimeKind, SgxConstraints, SignedPolicySgx, TeeHardware, VersionInfo, HEIGHT_LATEST,
};
use tracing::{debug, error, warn};

use crate::notifier::Shutdown;
use crate::{ConsensusBackend, HostedRuntime, RichRuntime, Runtime, Subscription};

/// Last policy material seen for the tracked key manager
#[derive(Default)]
struct PolicyState {
    status: Option<KeyManagerStatus>,
    constraints: Option<SgxConstraints>,
    version: Option<VersionInfo>,
}

/// Inner streams of one tracking period
struct InnerStreams {
    statuses: Option<Subscription<KeyManagerStatus>>,
    epochs: Option<Subscription<EpochTime>>,
    events: Option<Subscription<HostEvent>>,
    features: Features,
}

enum InnerEvent {
    Status(KeyManagerStatus),
    Epoch(EpochTime),
    Host(HostEvent),
}

impl InnerStreams {
    async fn next(&mut self) -> InnerEvent {
        tokio::select! {
            status = recv(&mut self.statuses) => InnerEvent::Status(status),
            epoch = recv(&mut self.epochs) => InnerEvent::Epoch(epoch),
            event = recv(&mut self.events) => InnerEvent::Host(event),
        }
    }

    fn close(mut self) {
        if let Some(sub) = self.statuses.take() {
            sub.close();
        }
        if let Some(sub) = self.epochs.take() {
            sub.close();
        }
        if let Some(sub) = self.events.take() {
            sub.close();
        }
    }
}

/// Next item of an optional stream. A finished stream is dropped and never
/// yields again.
async fn recv<T>(sub: &mut Option<Subscription<T>>) -> T {
    let Some(stream) = sub.as_mut() else {
        return pending().await;
    };
    if let Some(item) = stream.recv().await {
        return item;
    }
    *sub = None;
    pending().await
}

struct Tracking {
    key_manager: Namespace,
    /// `None` when the inner watch could not be set up
    streams: Option<InnerStreams>,
    policy: PolicyState,
}

enum WatchState {
    Idle,
    Tracking(Tracking),
}

impl WatchState {
    fn key_manager(&self) -> Option<Namespace> {
        match self {
            WatchState::Idle => None,
            WatchState::Tracking(t) => Some(t.key_manager),
        }
    }

    async fn next(&mut self) -> InnerEvent {
        match self {
            WatchState::Tracking(Tracking {
                streams: Some(streams),
                ..
            }) => streams.next().await,
            _ => pending().await,
        }
    }

    /// Close every inner subscription of the current tracking period.
    fn close(self) {
        if let WatchState::Tracking(Tracking {
            streams: Some(streams),
            ..
        }) = self
        {
            streams.close();
        }
    }
}

enum Step {
    Descriptor(Option<RuntimeDescriptor>),
    Inner(InnerEvent),
}

/// Bounded pushes into the hosted runtime
struct PolicyPusher {
    host: Arc<RichRuntime>,
    timeout: Duration,
    shutdown: Shutdown,
}

impl PolicyPusher {
    async fn push_policy(&self, policy: &SignedPolicySgx) {
        debug!(serial = policy.policy.serial, "got key manager policy update");

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            result = self.host.update_key_manager_policy(policy, self.timeout) => result,
        };
        match result {
            Ok(()) => debug!("key manager policy update dispatched"),
            Err(err) => error!(
                err = %err,
                "failed dispatching key manager policy update to runtime"
            ),
        }
    }

    async fn push_quote_policy(&self, policy: &QuotePolicy) {
        debug!(?policy, "got key manager quote policy update");

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            result = self.host.update_key_manager_quote_policy(policy, self.timeout) => result,
        };
        match result {
            Ok(()) => debug!("key manager quote policy update dispatched"),
            Err(err) => error!(
                err = %err,
                "failed dispatching key manager quote policy update to runtime"
            ),
        }
    }
}

pub(crate) struct PolicyWatcher {
    runtime: Arc<dyn Runtime>,
    consensus: Arc<dyn ConsensusBackend>,
    pusher: PolicyPusher,
    shutdown: Shutdown,
}

impl PolicyWatcher {
    pub(crate) fn new(
        runtime: Arc<dyn Runtime>,
        consensus: Arc<dyn ConsensusBackend>,
        host: Arc<RichRuntime>,
        timeout: Duration,
        shutdown: Shutdown,
    ) -> Self {
        PolicyWatcher {
            runtime,
            consensus,
            pusher: PolicyPusher {
                host,
                timeout,
                shutdown: shutdown.clone(),
            },
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        let mut descriptors = match self.runtime.watch_registry_descriptor() {
            Ok(descriptors) => descriptors,
            Err(err) => {
                error!(err = %err, "failed to subscribe to registry descriptor updates");
                return;
            }
        };

        let mut state = WatchState::Idle;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(reason = self.shutdown.reason(), "policy watcher stopping");
                    break;
                }
                descriptor = descriptors.recv() => Step::Descriptor(descriptor),
                event = state.next() => Step::Inner(event),
            };

            let descriptor = match step {
                Step::Descriptor(descriptor) => descriptor,
                Step::Inner(event) => {
                    let WatchState::Tracking(tracking) = &mut state else {
                        continue;
                    };
                    match self.handle_inner(tracking, event, &mut descriptors).await {
                        Some(descriptor) => descriptor,
                        None => continue,
                    }
                }
            };

            if !self.on_descriptor(&mut state, descriptor).await {
                break;
            }
        }

        state.close();
        descriptors.close();
    }

    /// Handle an inner event while watching for a descriptor that replaces
    /// the tracked key manager. Such a descriptor abandons the in-flight
    /// push and is returned to the caller.
    async fn handle_inner(
        &self,
        tracking: &mut Tracking,
        event: InnerEvent,
        descriptors: &mut Subscription<RuntimeDescriptor>,
    ) -> Option<Option<RuntimeDescriptor>> {
        let key_manager = tracking.key_manager;
        let handled = self.on_event(tracking, event);
        tokio::pin!(handled);

        loop {
            tokio::select! {
                biased;
                _ = &mut handled => return None,
                descriptor = descriptors.recv() => {
                    if let Some(dsc) = &descriptor {
                        if dsc.kind == RuntimeKind::Compute && dsc.key_manager == Some(key_manager) {
                            debug!(runtime_id = %dsc.id, "got registry descriptor update");
                            continue;
                        }
                    }
                    debug!(key_manager = %key_manager, "abandoning policy push for replaced key manager");
                    return Some(descriptor);
                }
            }
        }
    }

    /// Apply a registry descriptor update. Returns `false` when the loop
    /// should exit.
    async fn on_descriptor(
        &self,
        state: &mut WatchState,
        descriptor: Option<RuntimeDescriptor>,
    ) -> bool {
        let Some(descriptor) = descriptor else {
            debug!("registry descriptor stream closed");
            return false;
        };
        debug!(runtime_id = %descriptor.id, "got registry descriptor update");

        if descriptor.kind != RuntimeKind::Compute {
            debug!(kind = ?descriptor.kind, "not a compute runtime, no policies to watch");
            return false;
        }
        if state.key_manager() == descriptor.key_manager {
            return true;
        }
        let old = std::mem::replace(state, WatchState::Idle);
        *state = self.transition(old, descriptor.key_manager).await;
        true
    }

    /// Tear down the current tracking period, then start the next one.
    async fn transition(&self, old: WatchState, key_manager: Option<Namespace>) -> WatchState {
        let previous = old.key_manager();
        old.close();

        match key_manager {
            None => {
                warn!(
                    previous = ?previous,
                    "key manager unassigned from runtime, no longer watching policies"
                );
                WatchState::Idle
            }
            Some(key_manager) => WatchState::Tracking(Tracking {
                key_manager,
                streams: self.open_streams(key_manager).await,
                policy: PolicyState::default(),
            }),
        }
    }

    async fn open_streams(&self, key_manager: Namespace) -> Option<InnerStreams> {
        debug!(key_manager = %key_manager, "watching key manager policy updates");

        let statuses = self.consensus.watch_key_manager_statuses();

        let epochs = match self.consensus.watch_epochs() {
            Ok(epochs) => epochs,
            Err(err) => {
                error!(err = %err, "failed to watch epochs");
                statuses.close();
                return None;
            }
        };

        let events = self.pusher.host.watch_events();

        let info = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            info = tokio::time::timeout(self.pusher.timeout, self.pusher.host.get_info()) => Some(info),
        };
        let features = match info {
            Some(Ok(Ok(info))) => info.features,
            Some(Ok(Err(err))) => {
                error!(err = %err, "failed to fetch runtime info");
                return None;
            }
            Some(Err(_)) => {
                error!(timeout = ?self.pusher.timeout, "timed out fetching runtime info");
                return None;
            }
            None => return None,
        };

        Some(InnerStreams {
            statuses: Some(statuses),
            epochs: Some(epochs),
            events: Some(events),
            features,
        })
    }

    async fn on_event(&self, tracking: &mut Tracking, event: InnerEvent) {
        match event {
            InnerEvent::Status(status) => {
                if status.id != tracking.key_manager {
                    return;
                }
                let policy = status.policy.clone();
                tracking.policy.status = Some(status);

                match policy {
                    Some(policy) => self.pusher.push_policy(&policy).await,
                    None => debug!("key manager status carries no policy"),
                }
            }
            InnerEvent::Epoch(epoch) => self.on_epoch(tracking, epoch).await,
            InnerEvent::Host(event) => {
                if !event.is_restart() {
                    return;
                }
                debug!(?event, "hosted runtime restarted, replaying key manager policies");

                if let Some(policy) = tracking
                    .policy
                    .status
                    .as_ref()
                    .and_then(|status| status.policy.as_ref())
                {
                    self.pusher.push_policy(policy).await;
                }
                if let Some(constraints) = &tracking.policy.constraints {
                    self.pusher.push_quote_policy(&constraints.policy).await;
                }
            }
        }
    }

    async fn on_epoch(&self, tracking: &mut Tracking, epoch: EpochTime) {
        let supported = tracking
            .streams
            .as_ref()
            .is_some_and(|s| s.features.key_manager_quote_policy_updates);
        if !supported {
            return;
        }

        let descriptor = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            descriptor = self.consensus.get_runtime(tracking.key_manager, HEIGHT_LATEST) => descriptor,
        };
        let descriptor = match descriptor {
            Ok(descriptor) => descriptor,
            Err(err) => {
                error!(err = %err, "failed to query key manager runtime descriptor");
                return;
            }
        };

        if descriptor.tee_hardware != TeeHardware::IntelSgx {
            return;
        }

        let Some(deployment) = descriptor.active_deployment(epoch) else {
            debug!(epoch, "key manager has no active deployment");
            return;
        };
        if tracking.policy.version.as_ref() == Some(deployment) {
            return;
        }
        tracking.policy.version = Some(deployment.clone());

        let constraints = match deployment.decode_tee::<SgxConstraints>() {
            Ok(constraints) => constraints,
            Err(err) => {
                error!(err = %err, version = %deployment.version, "malformed SGX constraints");
                return;
            }
        };
        self.pusher.push_quote_policy(&constraints.policy).await;
        tracking.policy.constraints = Some(constraints);
    }
}

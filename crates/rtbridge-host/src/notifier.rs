//! Host notifier
//!
//! Owns the two watch loops that push state into the hosted runtime: key
//! manager policy updates and consensus block notifications. Both loops run
//! as tokio tasks and exit on the outer context or on [`Notifier::stop`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rtbridge_core::{BridgeResult, Namespace};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blocks::BlockWatcher;
use crate::policy::PolicyWatcher;
use crate::{ConsensusBackend, HostConfig, HostedRuntime, Notifier, RichRuntime, Runtime};

/// Shutdown signal shared by the watch loops
///
/// Fires on either outer context cancellation or an explicit stop.
#[derive(Clone)]
pub(crate) struct Shutdown {
    ctx: CancellationToken,
    stop: CancellationToken,
}

impl Shutdown {
    pub(crate) fn new(ctx: &CancellationToken) -> Self {
        Shutdown {
            ctx: ctx.clone(),
            stop: ctx.child_token(),
        }
    }

    pub(crate) async fn cancelled(&self) {
        self.stop.cancelled().await
    }

    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }

    /// Token cancelled together with this signal.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.stop.child_token()
    }

    /// Why the loops are shutting down, for logging.
    pub(crate) fn reason(&self) -> &'static str {
        if self.ctx.is_cancelled() {
            "context canceled"
        } else {
            "termination requested"
        }
    }
}

/// Wait for `task` to finish. Returns `false` if it panicked or was aborted.
pub(crate) async fn join_task(name: &'static str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(err) => {
            debug!(task = name, err = %err, "task ended abnormally");
            false
        }
    }
}

#[derive(Default)]
struct NotifierState {
    started: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// Notifier pushing key manager policies and consensus blocks into a runtime
pub struct HostNotifier {
    runtime: Arc<dyn Runtime>,
    host: Arc<RichRuntime>,
    consensus: Arc<dyn ConsensusBackend>,
    notify_timeout: Duration,
    shutdown: Shutdown,
    state: Mutex<NotifierState>,
}

impl HostNotifier {
    pub fn new(
        ctx: &CancellationToken,
        runtime: Arc<dyn Runtime>,
        host: Arc<dyn HostedRuntime>,
        consensus: Arc<dyn ConsensusBackend>,
        config: &HostConfig,
    ) -> Self {
        HostNotifier {
            runtime,
            host: Arc::new(RichRuntime::new(host)),
            consensus,
            notify_timeout: config.notify_timeout,
            shutdown: Shutdown::new(ctx),
            state: Mutex::new(NotifierState::default()),
        }
    }

    pub fn runtime_id(&self) -> Namespace {
        self.runtime.id()
    }
}

#[async_trait]
impl Notifier for HostNotifier {
    async fn start(&self) -> BridgeResult<()> {
        let mut state = self.state.lock();
        if state.started {
            return Ok(());
        }
        state.started = true;

        let policy = PolicyWatcher::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.consensus),
            Arc::clone(&self.host),
            self.notify_timeout,
            self.shutdown.clone(),
        );
        let blocks = BlockWatcher::new(
            Arc::clone(&self.consensus),
            Arc::clone(&self.host),
            self.notify_timeout,
            self.shutdown.clone(),
        );
        state.tasks.push(tokio::spawn(policy.run()));
        state.tasks.push(tokio::spawn(blocks.run()));

        debug!(runtime_id = %self.runtime.id(), "runtime host notifier started");
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.stop();

        let tasks = std::mem::take(&mut self.state.lock().tasks);
        for task in tasks {
            join_task("notifier watch loop", task).await;
        }
    }
}

impl Drop for HostNotifier {
    fn drop(&mut self) {
        self.shutdown.stop();
    }
}

//! Consensus block watch loop
//!
//! Blocks arrive faster than a busy runtime may consume them. A forwarder
//! task drains the block stream into a [`LatestCell`] so the source never
//! waits on the runtime, and the loop only ever pushes the newest height.

use std::sync::Arc;
use std::time::Duration;

use rtbridge_core::Block;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::notifier::{join_task, Shutdown};
use crate::{ConsensusBackend, LatestCell, RichRuntime, Subscription};

pub(crate) struct BlockWatcher {
    consensus: Arc<dyn ConsensusBackend>,
    host: Arc<RichRuntime>,
    timeout: Duration,
    shutdown: Shutdown,
}

impl BlockWatcher {
    pub(crate) fn new(
        consensus: Arc<dyn ConsensusBackend>,
        host: Arc<RichRuntime>,
        timeout: Duration,
        shutdown: Shutdown,
    ) -> Self {
        BlockWatcher {
            consensus,
            host,
            timeout,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        let blocks = match self.consensus.watch_blocks() {
            Ok(blocks) => blocks,
            Err(err) => {
                error!(err = %err, "failed to subscribe to consensus block updates");
                return;
            }
        };

        let latest = Arc::new(LatestCell::new());
        let forwarder_stop = self.shutdown.child_token();
        let forwarder = tokio::spawn(forward_blocks(
            blocks,
            Arc::clone(&latest),
            forwarder_stop.clone(),
        ));

        debug!("watching consensus layer blocks");

        loop {
            let block = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(reason = self.shutdown.reason(), "consensus block watcher stopping");
                    break;
                }
                block = latest.take() => match block {
                    Some(block) => block,
                    None => {
                        debug!("consensus block stream closed");
                        break;
                    }
                },
            };

            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(reason = self.shutdown.reason(), "consensus block watcher stopping");
                    break;
                }
                result = self.host.consensus_sync(block.height, self.timeout) => result,
            };

            match result {
                Ok(()) => debug!(height = block.height, "runtime notified of new consensus layer block"),
                Err(err) => error!(
                    err = %err,
                    height = block.height,
                    "failed to notify runtime of a new consensus layer block"
                ),
            }
        }

        forwarder_stop.cancel();
        join_task("consensus block forwarder", forwarder).await;
    }
}

/// Move blocks from the source into the cell until either side goes away.
async fn forward_blocks(
    mut blocks: Subscription<Block>,
    latest: Arc<LatestCell<Block>>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            block = blocks.recv() => match block {
                Some(block) => {
                    latest.put(block);
                }
                None => break,
            },
        }
    }
    latest.close();
    blocks.close();
}

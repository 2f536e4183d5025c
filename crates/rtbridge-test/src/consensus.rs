//! In-memory consensus backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rtbridge_core::{
    Block, BridgeError, BridgeResult, ConsensusEvent, EpochTime, GenesisDocument,
    GetPrefixesRequest, GetRequest, GovernanceEvent, Height, IterateRequest, KeyManagerStatus,
    Namespace, Proof, ProofResponse, RegistryEvent, RootHashEvent, RuntimeDescriptor, Signature,
    SignedTransaction, StakingEvent, Transaction, TxProof, HEIGHT_LATEST,
};
use rtbridge_host::{ConsensusBackend, ReadSyncer, Signer, Subscription, Topic};

use crate::tx_hash;

/// Signature context for consensus transactions.
pub const TX_SIGNATURE_CONTEXT: &[u8] = b"rtbridge/consensus: tx";

/// Read syncer answering every request with a proof over the requested keys
#[derive(Default)]
pub struct MemorySyncer {
    requests: Mutex<Vec<&'static str>>,
}

impl MemorySyncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the sync operations served so far.
    pub fn requests(&self) -> Vec<&'static str> {
        self.requests.lock().clone()
    }

    fn proof(&self, op: &'static str, entries: Vec<Bytes>) -> ProofResponse {
        self.requests.lock().push(op);
        ProofResponse {
            proof: Proof {
                untrusted_root: Default::default(),
                entries,
            },
        }
    }
}

#[async_trait]
impl ReadSyncer for MemorySyncer {
    async fn sync_get(&self, request: GetRequest) -> BridgeResult<ProofResponse> {
        Ok(self.proof("get", vec![request.key]))
    }

    async fn sync_get_prefixes(&self, request: GetPrefixesRequest) -> BridgeResult<ProofResponse> {
        Ok(self.proof("get_prefixes", request.prefixes))
    }

    async fn sync_iterate(&self, request: IterateRequest) -> BridgeResult<ProofResponse> {
        Ok(self.proof("iterate", vec![request.key]))
    }
}

/// Open/close ledger of the watch streams handed out
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOpened {
    pub stream: &'static str,
    /// Open subscriptions on the same stream at the time of opening
    pub already_open: usize,
}

/// Consensus backend driven by the test
pub struct FakeConsensus {
    pub blocks: Topic<Block>,
    pub epochs: Topic<EpochTime>,
    pub statuses: Topic<KeyManagerStatus>,
    state: Arc<MemorySyncer>,
    genesis: GenesisDocument,
    events: Mutex<Vec<(Height, ConsensusEvent)>>,
    runtimes: Mutex<HashMap<Namespace, RuntimeDescriptor>>,
    submitted: Mutex<Vec<Transaction>>,
    opened: Mutex<Vec<StreamOpened>>,
    fail_events: AtomicBool,
    fail_epoch_watch: AtomicBool,
}

impl FakeConsensus {
    pub fn new() -> Self {
        FakeConsensus {
            blocks: Topic::new(),
            epochs: Topic::new(),
            statuses: Topic::new(),
            state: Arc::new(MemorySyncer::new()),
            genesis: GenesisDocument {
                height: 42,
                chain_id: "rtbridge-testnet".to_string(),
            },
            events: Mutex::new(Vec::new()),
            runtimes: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
            fail_events: AtomicBool::new(false),
            fail_epoch_watch: AtomicBool::new(false),
        }
    }

    pub fn state_syncer(&self) -> Arc<MemorySyncer> {
        Arc::clone(&self.state)
    }

    pub fn push_event(&self, height: Height, event: ConsensusEvent) {
        self.events.lock().push((height, event));
    }

    /// Make every event query fail.
    pub fn fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    /// Make epoch subscriptions fail.
    pub fn fail_epoch_watch(&self, fail: bool) {
        self.fail_epoch_watch.store(fail, Ordering::SeqCst);
    }

    pub fn set_runtime(&self, descriptor: RuntimeDescriptor) {
        self.runtimes.lock().insert(descriptor.id, descriptor);
    }

    pub fn submitted(&self) -> Vec<Transaction> {
        self.submitted.lock().clone()
    }

    pub fn opened(&self) -> Vec<StreamOpened> {
        self.opened.lock().clone()
    }

    pub fn publish_block(&self, height: Height) -> usize {
        self.blocks.publish(Block {
            height,
            hash: tx_hash(&height.to_be_bytes()),
            time: height * 6,
        })
    }

    fn record_open(&self, stream: &'static str, already_open: usize) {
        self.opened.lock().push(StreamOpened {
            stream,
            already_open,
        });
    }

    fn events_at<T>(
        &self,
        height: Height,
        select: impl Fn(&ConsensusEvent) -> Option<T>,
    ) -> BridgeResult<Vec<T>> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(BridgeError::Backend("event index unavailable".into()));
        }
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|(h, _)| *h == height)
            .filter_map(|(_, ev)| select(ev))
            .collect())
    }

    fn latest_height(&self) -> Height {
        self.events
            .lock()
            .iter()
            .map(|(h, _)| *h)
            .max()
            .unwrap_or(self.genesis.height)
    }
}

impl Default for FakeConsensus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsensusBackend for FakeConsensus {
    fn state(&self) -> Arc<dyn ReadSyncer> {
        self.state.clone()
    }

    async fn genesis_document(&self) -> BridgeResult<GenesisDocument> {
        Ok(self.genesis.clone())
    }

    async fn staking_events(&self, height: Height) -> BridgeResult<Vec<StakingEvent>> {
        self.events_at(height, |ev| match ev {
            ConsensusEvent::Staking(ev) => Some(ev.clone()),
            _ => None,
        })
    }

    async fn registry_events(&self, height: Height) -> BridgeResult<Vec<RegistryEvent>> {
        self.events_at(height, |ev| match ev {
            ConsensusEvent::Registry(ev) => Some(ev.clone()),
            _ => None,
        })
    }

    async fn root_hash_events(&self, height: Height) -> BridgeResult<Vec<RootHashEvent>> {
        self.events_at(height, |ev| match ev {
            ConsensusEvent::RootHash(ev) => Some(ev.clone()),
            _ => None,
        })
    }

    async fn governance_events(&self, height: Height) -> BridgeResult<Vec<GovernanceEvent>> {
        self.events_at(height, |ev| match ev {
            ConsensusEvent::Governance(ev) => Some(ev.clone()),
            _ => None,
        })
    }

    async fn get_runtime(
        &self,
        id: Namespace,
        _height: Height,
    ) -> BridgeResult<RuntimeDescriptor> {
        self.runtimes
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| BridgeError::Backend(format!("runtime {id} not registered")))
    }

    async fn sign_and_submit_tx_with_proof(
        &self,
        signer: Arc<dyn Signer>,
        tx: Transaction,
    ) -> BridgeResult<(SignedTransaction, TxProof)> {
        let blob: Bytes = serde_json::to_vec(&tx)
            .map_err(|e| BridgeError::Backend(e.to_string()))?
            .into();
        let signature = signer.sign(TX_SIGNATURE_CONTEXT, &blob)?;
        let height = self.latest_height().max(HEIGHT_LATEST + 1);
        self.submitted.lock().push(tx);

        let proof = TxProof {
            height,
            raw_proof: Bytes::copy_from_slice(&tx_hash(&blob).0),
        };
        let signed = SignedTransaction {
            blob,
            signature: Signature {
                public_key: signer.public(),
                signature,
            },
        };
        Ok((signed, proof))
    }

    fn watch_blocks(&self) -> BridgeResult<Subscription<Block>> {
        self.record_open("blocks", self.blocks.subscriber_count());
        Ok(self.blocks.subscribe())
    }

    fn watch_epochs(&self) -> BridgeResult<Subscription<EpochTime>> {
        if self.fail_epoch_watch.load(Ordering::SeqCst) {
            return Err(BridgeError::SubscriptionFailed("beacon not ready".into()));
        }
        self.record_open("epochs", self.epochs.subscriber_count());
        Ok(self.epochs.subscribe())
    }

    fn watch_key_manager_statuses(&self) -> Subscription<KeyManagerStatus> {
        self.record_open("statuses", self.statuses.subscriber_count());
        self.statuses.subscribe()
    }
}

//! Collaborator interfaces
//!
//! Everything the bridge needs from the rest of the node: consensus
//! backends, the registry view of the hosted runtime, the transaction pool,
//! the key manager client, the light client and the node identity.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rtbridge_core::{
    Block, BridgeResult, EpochTime, GenesisDocument, GetPrefixesRequest, GetRequest,
    GovernanceEvent, Height, IterateRequest, KeyManagerStatus, LightBlock, Namespace,
    PeerFeedback, ProofResponse, PublicKey, RegistryEvent, RootHashEvent, RpcKind,
    RuntimeDescriptor, SignedTransaction, StakingEvent, Transaction, TxProof, Version,
};

use crate::{Provisioner, RuntimeHostConfig, Subscription};

/// Client for the key manager's enclave RPC endpoint
#[async_trait]
pub trait KeyManagerClient: Send + Sync {
    async fn call_enclave(
        &self,
        request: Bytes,
        kind: RpcKind,
        peer_feedback: Option<PeerFeedback>,
    ) -> BridgeResult<Bytes>;
}

/// Read access to a verifiable state tree
#[async_trait]
pub trait ReadSyncer: Send + Sync {
    async fn sync_get(&self, request: GetRequest) -> BridgeResult<ProofResponse>;
    async fn sync_get_prefixes(&self, request: GetPrefixesRequest) -> BridgeResult<ProofResponse>;
    async fn sync_iterate(&self, request: IterateRequest) -> BridgeResult<ProofResponse>;
}

/// Runtime-private key/value store
pub trait LocalStorage: Send + Sync {
    /// Value under `key`; empty when the key is absent.
    fn get(&self, key: &[u8]) -> BridgeResult<Bytes>;
    fn set(&self, key: &[u8], value: Bytes) -> BridgeResult<()>;
}

#[async_trait]
pub trait LightClient: Send + Sync {
    async fn get_light_block(&self, height: Height) -> BridgeResult<LightBlock>;
}

/// Transaction waiting in the pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTransaction {
    raw: Bytes,
}

impl PendingTransaction {
    pub fn new(raw: Bytes) -> Self {
        PendingTransaction { raw }
    }

    pub fn raw(&self) -> Bytes {
        self.raw.clone()
    }
}

pub trait TransactionPool: Send + Sync {
    /// Up to `limit` scheduled transactions starting at pool position `offset`.
    fn get_scheduling_extra(&self, offset: u64, limit: u32) -> Vec<Arc<PendingTransaction>>;
}

/// Node signing key; signing itself happens outside the bridge
pub trait Signer: Send + Sync {
    fn public(&self) -> PublicKey;
    fn sign(&self, context: &[u8], message: &[u8]) -> BridgeResult<Bytes>;
}

/// Identity of the node hosting the runtime
#[derive(Clone)]
pub struct NodeIdentity {
    pub node_signer: Arc<dyn Signer>,
}

/// Consensus layer backends as seen by the host
#[async_trait]
pub trait ConsensusBackend: Send + Sync {
    /// Consensus state storage.
    fn state(&self) -> Arc<dyn ReadSyncer>;

    async fn genesis_document(&self) -> BridgeResult<GenesisDocument>;

    async fn staking_events(&self, height: Height) -> BridgeResult<Vec<StakingEvent>>;
    async fn registry_events(&self, height: Height) -> BridgeResult<Vec<RegistryEvent>>;
    async fn root_hash_events(&self, height: Height) -> BridgeResult<Vec<RootHashEvent>>;
    async fn governance_events(&self, height: Height) -> BridgeResult<Vec<GovernanceEvent>>;

    /// Registry descriptor of runtime `id` at `height`.
    async fn get_runtime(&self, id: Namespace, height: Height) -> BridgeResult<RuntimeDescriptor>;

    /// Sign `tx` with `signer`, submit it and wait for its inclusion proof.
    async fn sign_and_submit_tx_with_proof(
        &self,
        signer: Arc<dyn Signer>,
        tx: Transaction,
    ) -> BridgeResult<(SignedTransaction, TxProof)>;

    fn watch_blocks(&self) -> BridgeResult<Subscription<Block>>;
    fn watch_epochs(&self) -> BridgeResult<Subscription<EpochTime>>;
    fn watch_key_manager_statuses(&self) -> Subscription<KeyManagerStatus>;
}

/// Registry view of the runtime being hosted
#[async_trait]
pub trait Runtime: Send + Sync {
    fn id(&self) -> Namespace;

    /// Runtime state storage; `None` for unmanaged runtimes such as key managers.
    fn storage(&self) -> Option<Arc<dyn ReadSyncer>>;

    fn local_storage(&self) -> Arc<dyn LocalStorage>;

    fn watch_registry_descriptor(&self) -> BridgeResult<Subscription<RuntimeDescriptor>>;

    /// Per-version host configurations and the provisioner to run them with.
    async fn host(
        &self,
    ) -> BridgeResult<(BTreeMap<Version, RuntimeHostConfig>, Arc<dyn Provisioner>)>;
}

/// Node services the request handler draws on
#[async_trait]
pub trait HandlerEnvironment: Send + Sync {
    async fn key_manager_client(&self) -> BridgeResult<Arc<dyn KeyManagerClient>>;
    async fn tx_pool(&self) -> BridgeResult<Arc<dyn TransactionPool>>;
    async fn node_identity(&self) -> BridgeResult<NodeIdentity>;
    fn light_client(&self) -> BridgeResult<Arc<dyn LightClient>>;
}

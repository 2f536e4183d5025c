//! Host protocol messages
//!
//! Two directions cross the sandbox boundary:
//! - runtime -> host: [`HostRequest`] answered by a [`HostResponse`]
//! - host -> runtime: [`RuntimeRequest`] pushes answered by a [`RuntimeResponse`]
//!
//! [`RequestEnvelope`] is the boundary-shaped form of a host request, with one
//! optional field per request kind. It converts into [`HostRequest`] only when
//! exactly one field is populated.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    BridgeError, BridgeResult, ConsensusEvent, EventKind, Hash, Height, LightBlock, Namespace,
    PublicKey, QuotePolicy, SignedTransaction, TxProof, Version,
};

/// Name of the key manager enclave RPC endpoint.
pub const ENCLAVE_RPC_ENDPOINT: &str = "key-manager";

/// Enclave RPC call kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RpcKind {
    #[default]
    NoiseSession,
    InsecureQuery,
    LocalQuery,
}

/// Feedback about the peer that served the previous RPC call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerFeedback {
    Success,
    Failure,
    BadPeer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCallRequest {
    pub endpoint: String,
    pub request: Bytes,
    pub kind: RpcKind,
    pub peer_feedback: Option<PeerFeedback>,
}

/// Storage endpoint selector
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageEndpoint(pub u8);

impl StorageEndpoint {
    /// Runtime-local state storage.
    pub const RUNTIME: StorageEndpoint = StorageEndpoint(0);
    /// Consensus state storage.
    pub const CONSENSUS: StorageEndpoint = StorageEndpoint(1);
}

impl fmt::Debug for StorageEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StorageEndpoint::RUNTIME => write!(f, "StorageEndpoint(runtime)"),
            StorageEndpoint::CONSENSUS => write!(f, "StorageEndpoint(consensus)"),
            StorageEndpoint(other) => write!(f, "StorageEndpoint({other})"),
        }
    }
}

/// Storage tree root
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Root {
    pub namespace: Namespace,
    pub version: u64,
    pub hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub tree: Root,
    pub key: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPrefixesRequest {
    pub tree: Root,
    pub prefixes: Vec<Bytes>,
    pub limit: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterateRequest {
    pub tree: Root,
    pub key: Bytes,
    pub prefetch: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Proof {
    pub untrusted_root: Hash,
    pub entries: Vec<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProofResponse {
    pub proof: Proof,
}

/// Storage sync request; exactly one of the sync fields is expected
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSyncRequest {
    pub endpoint: StorageEndpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_get: Option<GetRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_get_prefixes: Option<GetPrefixesRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_iterate: Option<IterateRequest>,
}

/// Read-syncer operation selected by a storage sync request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOp {
    Get(GetRequest),
    GetPrefixes(GetPrefixesRequest),
    Iterate(IterateRequest),
}

impl StorageSyncRequest {
    pub fn get(endpoint: StorageEndpoint, rq: GetRequest) -> Self {
        StorageSyncRequest {
            endpoint,
            sync_get: Some(rq),
            sync_get_prefixes: None,
            sync_iterate: None,
        }
    }

    pub fn get_prefixes(endpoint: StorageEndpoint, rq: GetPrefixesRequest) -> Self {
        StorageSyncRequest {
            endpoint,
            sync_get: None,
            sync_get_prefixes: Some(rq),
            sync_iterate: None,
        }
    }

    pub fn iterate(endpoint: StorageEndpoint, rq: IterateRequest) -> Self {
        StorageSyncRequest {
            endpoint,
            sync_get: None,
            sync_get_prefixes: None,
            sync_iterate: Some(rq),
        }
    }

    /// The single requested sync operation.
    pub fn op(self) -> BridgeResult<SyncOp> {
        match (self.sync_get, self.sync_get_prefixes, self.sync_iterate) {
            (Some(rq), None, None) => Ok(SyncOp::Get(rq)),
            (None, Some(rq), None) => Ok(SyncOp::GetPrefixes(rq)),
            (None, None, Some(rq)) => Ok(SyncOp::Iterate(rq)),
            _ => Err(BridgeError::MethodNotSupported),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorageGetRequest {
    pub key: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorageSetRequest {
    pub key: Bytes,
    pub value: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConsensusBlockRequest {
    pub height: Height,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConsensusEventsRequest {
    pub height: Height,
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchGenesisHeightRequest {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTxBatchRequest {
    pub offset: u64,
    pub limit: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProveFreshnessRequest {
    pub blob: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityRequest {}

/// Request initiated by the hosted runtime
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostRequest {
    RpcCall(RpcCallRequest),
    StorageSync(StorageSyncRequest),
    LocalStorageGet(LocalStorageGetRequest),
    LocalStorageSet(LocalStorageSetRequest),
    FetchConsensusBlock(FetchConsensusBlockRequest),
    FetchConsensusEvents(FetchConsensusEventsRequest),
    FetchGenesisHeight(FetchGenesisHeightRequest),
    FetchTxBatch(FetchTxBatchRequest),
    ProveFreshness(ProveFreshnessRequest),
    Identity(IdentityRequest),
}

impl HostRequest {
    /// Method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            HostRequest::RpcCall(_) => "HostRPCCall",
            HostRequest::StorageSync(_) => "HostStorageSync",
            HostRequest::LocalStorageGet(_) => "HostLocalStorageGet",
            HostRequest::LocalStorageSet(_) => "HostLocalStorageSet",
            HostRequest::FetchConsensusBlock(_) => "HostFetchConsensusBlock",
            HostRequest::FetchConsensusEvents(_) => "HostFetchConsensusEvents",
            HostRequest::FetchGenesisHeight(_) => "HostFetchGenesisHeight",
            HostRequest::FetchTxBatch(_) => "HostFetchTxBatch",
            HostRequest::ProveFreshness(_) => "HostProveFreshness",
            HostRequest::Identity(_) => "HostIdentity",
        }
    }
}

/// Reply to a [`HostRequest`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostResponse {
    RpcCall {
        response: Bytes,
    },
    StorageSync(ProofResponse),
    LocalStorageGet {
        value: Bytes,
    },
    LocalStorageSet,
    FetchConsensusBlock(LightBlock),
    FetchConsensusEvents(Vec<ConsensusEvent>),
    FetchGenesisHeight {
        height: Height,
    },
    FetchTxBatch {
        batch: Vec<Bytes>,
    },
    ProveFreshness {
        signed_tx: SignedTransaction,
        proof: TxProof,
    },
    Identity {
        node_id: PublicKey,
    },
}

/// Boundary-shaped host request with one optional field per request kind
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_rpc_call: Option<RpcCallRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_storage_sync: Option<StorageSyncRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_local_storage_get: Option<LocalStorageGetRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_local_storage_set: Option<LocalStorageSetRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_fetch_consensus_block: Option<FetchConsensusBlockRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_fetch_consensus_events: Option<FetchConsensusEventsRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_fetch_genesis_height: Option<FetchGenesisHeightRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_fetch_tx_batch: Option<FetchTxBatchRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_prove_freshness: Option<ProveFreshnessRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_identity: Option<IdentityRequest>,
}

impl RequestEnvelope {
    /// Extract the single populated request.
    ///
    /// Zero or several populated fields is not a request the host supports.
    pub fn into_request(self) -> BridgeResult<HostRequest> {
        let populated = [
            self.host_rpc_call.map(HostRequest::RpcCall),
            self.host_storage_sync.map(HostRequest::StorageSync),
            self.host_local_storage_get.map(HostRequest::LocalStorageGet),
            self.host_local_storage_set.map(HostRequest::LocalStorageSet),
            self.host_fetch_consensus_block
                .map(HostRequest::FetchConsensusBlock),
            self.host_fetch_consensus_events
                .map(HostRequest::FetchConsensusEvents),
            self.host_fetch_genesis_height
                .map(HostRequest::FetchGenesisHeight),
            self.host_fetch_tx_batch.map(HostRequest::FetchTxBatch),
            self.host_prove_freshness.map(HostRequest::ProveFreshness),
            self.host_identity.map(HostRequest::Identity),
        ];

        let mut requests = populated.into_iter().flatten();
        match (requests.next(), requests.next()) {
            (Some(rq), None) => Ok(rq),
            _ => Err(BridgeError::MethodNotSupported),
        }
    }
}

impl From<HostRequest> for RequestEnvelope {
    fn from(rq: HostRequest) -> Self {
        let mut env = RequestEnvelope::default();
        match rq {
            HostRequest::RpcCall(rq) => env.host_rpc_call = Some(rq),
            HostRequest::StorageSync(rq) => env.host_storage_sync = Some(rq),
            HostRequest::LocalStorageGet(rq) => env.host_local_storage_get = Some(rq),
            HostRequest::LocalStorageSet(rq) => env.host_local_storage_set = Some(rq),
            HostRequest::FetchConsensusBlock(rq) => env.host_fetch_consensus_block = Some(rq),
            HostRequest::FetchConsensusEvents(rq) => env.host_fetch_consensus_events = Some(rq),
            HostRequest::FetchGenesisHeight(rq) => env.host_fetch_genesis_height = Some(rq),
            HostRequest::FetchTxBatch(rq) => env.host_fetch_tx_batch = Some(rq),
            HostRequest::ProveFreshness(rq) => env.host_prove_freshness = Some(rq),
            HostRequest::Identity(rq) => env.host_identity = Some(rq),
        }
        env
    }
}

/// Push from the host into the hosted runtime
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeRequest {
    /// A new consensus block is available.
    ConsensusSync { height: Height },
    KeyManagerPolicyUpdate { signed_policy_raw: Bytes },
    KeyManagerQuotePolicyUpdate { policy: QuotePolicy },
}

impl RuntimeRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RuntimeRequest::ConsensusSync { .. } => "RuntimeConsensusSync",
            RuntimeRequest::KeyManagerPolicyUpdate { .. } => "RuntimeKeyManagerPolicyUpdate",
            RuntimeRequest::KeyManagerQuotePolicyUpdate { .. } => {
                "RuntimeKeyManagerQuotePolicyUpdate"
            }
        }
    }
}

/// Acknowledgement of a [`RuntimeRequest`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeResponse {
    ConsensusSync,
    KeyManagerPolicyUpdate,
    KeyManagerQuotePolicyUpdate,
}

/// Optional features a runtime advertises
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Features {
    /// Runtime accepts key manager quote policy updates.
    pub key_manager_quote_policy_updates: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub protocol_version: Version,
    pub runtime_version: Version,
    pub features: Features,
}

/// Hosted runtime lifecycle event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostEvent {
    Started { version: Version },
    Updated { version: Version },
    FailedToStart { reason: String },
    Stopped,
}

impl HostEvent {
    /// Whether the runtime came (back) up and lost its in-memory state.
    pub fn is_restart(&self) -> bool {
        matches!(self, HostEvent::Started { .. } | HostEvent::Updated { .. })
    }
}

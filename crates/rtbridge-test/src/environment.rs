//! Node services available to the request handler

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rtbridge_core::{BridgeError, BridgeResult, Height, LightBlock, PeerFeedback, RpcKind};
use rtbridge_host::{
    HandlerEnvironment, KeyManagerClient, LightClient, NodeIdentity, PendingTransaction, Signer,
    TransactionPool,
};

use crate::Ed25519Signer;

/// Key manager client echoing requests back with a fixed prefix
#[derive(Default)]
pub struct FakeKeyManagerClient {
    calls: Mutex<Vec<(RpcKind, Option<PeerFeedback>)>>,
}

impl FakeKeyManagerClient {
    pub const RESPONSE_PREFIX: &'static [u8] = b"km:";

    pub fn calls(&self) -> Vec<(RpcKind, Option<PeerFeedback>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl KeyManagerClient for FakeKeyManagerClient {
    async fn call_enclave(
        &self,
        request: Bytes,
        kind: RpcKind,
        peer_feedback: Option<PeerFeedback>,
    ) -> BridgeResult<Bytes> {
        self.calls.lock().push((kind, peer_feedback));

        let mut response = BytesMut::with_capacity(Self::RESPONSE_PREFIX.len() + request.len());
        response.put_slice(Self::RESPONSE_PREFIX);
        response.put_slice(&request);
        Ok(response.freeze())
    }
}

/// Transaction pool holding transactions in scheduling order
#[derive(Default)]
pub struct FakeTxPool {
    txs: Mutex<Vec<Arc<PendingTransaction>>>,
}

impl FakeTxPool {
    /// Pool with `count` transactions `tx-0`, `tx-1`, ...
    pub fn with_transactions(count: usize) -> Self {
        let pool = FakeTxPool::default();
        for i in 0..count {
            pool.push(Bytes::from(format!("tx-{i}")));
        }
        pool
    }

    pub fn push(&self, raw: Bytes) {
        self.txs.lock().push(Arc::new(PendingTransaction::new(raw)));
    }
}

impl TransactionPool for FakeTxPool {
    fn get_scheduling_extra(&self, offset: u64, limit: u32) -> Vec<Arc<PendingTransaction>> {
        self.txs
            .lock()
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect()
    }
}

/// Light client serving pre-loaded blocks
#[derive(Default)]
pub struct FakeLightClient {
    blocks: Mutex<HashMap<Height, LightBlock>>,
}

impl FakeLightClient {
    pub fn insert(&self, height: Height, meta: Bytes) {
        self.blocks.lock().insert(height, LightBlock { height, meta });
    }
}

#[async_trait]
impl LightClient for FakeLightClient {
    async fn get_light_block(&self, height: Height) -> BridgeResult<LightBlock> {
        self.blocks
            .lock()
            .get(&height)
            .cloned()
            .ok_or_else(|| BridgeError::Backend(format!("no light block at height {height}")))
    }
}

/// Handler environment backed by the in-memory services above
pub struct FakeEnvironment {
    pub key_manager: Arc<FakeKeyManagerClient>,
    pub tx_pool: Arc<FakeTxPool>,
    pub light_client: Arc<FakeLightClient>,
    pub signer: Arc<Ed25519Signer>,
    /// When set, the key manager client is reported as unavailable
    pub key_manager_down: AtomicBool,
}

impl FakeEnvironment {
    pub fn new(tx_pool: FakeTxPool) -> Self {
        FakeEnvironment {
            key_manager: Arc::new(FakeKeyManagerClient::default()),
            tx_pool: Arc::new(tx_pool),
            light_client: Arc::new(FakeLightClient::default()),
            signer: Arc::new(Ed25519Signer::generate()),
            key_manager_down: AtomicBool::new(false),
        }
    }
}

impl Default for FakeEnvironment {
    fn default() -> Self {
        Self::new(FakeTxPool::default())
    }
}

#[async_trait]
impl HandlerEnvironment for FakeEnvironment {
    async fn key_manager_client(&self) -> BridgeResult<Arc<dyn KeyManagerClient>> {
        if self.key_manager_down.load(Ordering::SeqCst) {
            return Err(BridgeError::Backend("key manager not available".into()));
        }
        Ok(self.key_manager.clone())
    }

    async fn tx_pool(&self) -> BridgeResult<Arc<dyn TransactionPool>> {
        Ok(self.tx_pool.clone())
    }

    async fn node_identity(&self) -> BridgeResult<NodeIdentity> {
        let node_signer: Arc<dyn Signer> = self.signer.clone();
        Ok(NodeIdentity { node_signer })
    }

    fn light_client(&self) -> BridgeResult<Arc<dyn LightClient>> {
        Ok(self.light_client.clone())
    }
}

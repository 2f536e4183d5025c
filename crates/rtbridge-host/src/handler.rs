//! Host side request handler
//!
//! Answers the requests a hosted runtime initiates by delegating to the
//! node's collaborators. Collaborator errors are returned unchanged apart
//! from the name of the failed operation.

use std::sync::Arc;

use async_trait::async_trait;
use rtbridge_core::{
    BridgeError, BridgeResult, ConsensusEvent, EventKind, FetchConsensusEventsRequest,
    HostRequest, HostResponse, ProofResponse, ResultExt, RpcCallRequest, StorageEndpoint,
    StorageSyncRequest, SyncOp, Transaction, ENCLAVE_RPC_ENDPOINT,
};
use tracing::debug;

use crate::{ConsensusBackend, Handler, HandlerEnvironment, Runtime};

/// Request handler for one hosted runtime
pub struct RuntimeHostHandler {
    env: Arc<dyn HandlerEnvironment>,
    runtime: Arc<dyn Runtime>,
    consensus: Arc<dyn ConsensusBackend>,
}

impl RuntimeHostHandler {
    pub fn new(
        env: Arc<dyn HandlerEnvironment>,
        runtime: Arc<dyn Runtime>,
        consensus: Arc<dyn ConsensusBackend>,
    ) -> Self {
        RuntimeHostHandler {
            env,
            runtime,
            consensus,
        }
    }

    async fn rpc_call(&self, rq: RpcCallRequest) -> BridgeResult<HostResponse> {
        if rq.endpoint != ENCLAVE_RPC_ENDPOINT {
            return Err(BridgeError::EndpointNotSupported);
        }

        let client = self.env.key_manager_client().await.context("key manager client")?;
        let response = client
            .call_enclave(rq.request, rq.kind, rq.peer_feedback)
            .await
            .context("key manager enclave call")?;
        Ok(HostResponse::RpcCall { response })
    }

    async fn storage_sync(&self, rq: StorageSyncRequest) -> BridgeResult<HostResponse> {
        let syncer = match rq.endpoint {
            StorageEndpoint::RUNTIME => self
                .runtime
                .storage()
                .ok_or(BridgeError::EndpointNotSupported)?,
            StorageEndpoint::CONSENSUS => self.consensus.state(),
            _ => return Err(BridgeError::EndpointNotSupported),
        };

        let proof: ProofResponse = match rq.op()? {
            SyncOp::Get(rq) => syncer.sync_get(rq).await,
            SyncOp::GetPrefixes(rq) => syncer.sync_get_prefixes(rq).await,
            SyncOp::Iterate(rq) => syncer.sync_iterate(rq).await,
        }
        .context("storage sync")?;
        Ok(HostResponse::StorageSync(proof))
    }

    async fn consensus_events(&self, rq: FetchConsensusEventsRequest) -> BridgeResult<HostResponse> {
        let events: Vec<ConsensusEvent> = match rq.kind {
            EventKind::STAKING => self
                .consensus
                .staking_events(rq.height)
                .await
                .context("staking events")?
                .into_iter()
                .map(ConsensusEvent::Staking)
                .collect(),
            EventKind::REGISTRY => self
                .consensus
                .registry_events(rq.height)
                .await
                .context("registry events")?
                .into_iter()
                .map(ConsensusEvent::Registry)
                .collect(),
            EventKind::ROOT_HASH => self
                .consensus
                .root_hash_events(rq.height)
                .await
                .context("roothash events")?
                .into_iter()
                .map(ConsensusEvent::RootHash)
                .collect(),
            EventKind::GOVERNANCE => self
                .consensus
                .governance_events(rq.height)
                .await
                .context("governance events")?
                .into_iter()
                .map(ConsensusEvent::Governance)
                .collect(),
            _ => return Err(BridgeError::MethodNotSupported),
        };
        Ok(HostResponse::FetchConsensusEvents(events))
    }

    async fn dispatch(&self, request: HostRequest) -> BridgeResult<HostResponse> {
        match request {
            HostRequest::RpcCall(rq) => self.rpc_call(rq).await,
            HostRequest::StorageSync(rq) => self.storage_sync(rq).await,
            HostRequest::LocalStorageGet(rq) => {
                let value = self
                    .runtime
                    .local_storage()
                    .get(&rq.key)
                    .context("local storage get")?;
                Ok(HostResponse::LocalStorageGet { value })
            }
            HostRequest::LocalStorageSet(rq) => {
                self.runtime
                    .local_storage()
                    .set(&rq.key, rq.value)
                    .context("local storage set")?;
                Ok(HostResponse::LocalStorageSet)
            }
            HostRequest::FetchConsensusBlock(rq) => {
                let client = self.env.light_client().context("light client")?;
                let block = client
                    .get_light_block(rq.height)
                    .await
                    .map_err(|e| BridgeError::LightBlockFetch(Box::new(e)))?;
                Ok(HostResponse::FetchConsensusBlock(block))
            }
            HostRequest::FetchConsensusEvents(rq) => self.consensus_events(rq).await,
            HostRequest::FetchGenesisHeight(_) => {
                let doc = self
                    .consensus
                    .genesis_document()
                    .await
                    .context("genesis document")?;
                Ok(HostResponse::FetchGenesisHeight { height: doc.height })
            }
            HostRequest::FetchTxBatch(rq) => {
                let pool = self.env.tx_pool().await.context("transaction pool")?;
                let batch = pool
                    .get_scheduling_extra(rq.offset, rq.limit)
                    .iter()
                    .map(|tx| tx.raw())
                    .collect();
                Ok(HostResponse::FetchTxBatch { batch })
            }
            HostRequest::ProveFreshness(rq) => {
                let identity = self.env.node_identity().await.context("node identity")?;
                let tx = Transaction::prove_freshness(0, None, rq.blob);
                let (signed_tx, proof) = self
                    .consensus
                    .sign_and_submit_tx_with_proof(identity.node_signer, tx)
                    .await
                    .context("prove freshness")?;
                Ok(HostResponse::ProveFreshness { signed_tx, proof })
            }
            HostRequest::Identity(_) => {
                let identity = self.env.node_identity().await.context("node identity")?;
                Ok(HostResponse::Identity {
                    node_id: identity.node_signer.public(),
                })
            }
        }
    }
}

#[async_trait]
impl Handler for RuntimeHostHandler {
    async fn handle(&self, request: HostRequest) -> BridgeResult<HostResponse> {
        let method = request.method();
        let result = self.dispatch(request).await;
        if let Err(err) = &result {
            debug!(runtime_id = %self.runtime.id(), method, err = %err, "host request failed");
        }
        result
    }
}

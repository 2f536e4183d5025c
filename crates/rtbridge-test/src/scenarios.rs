//! End-to-end scenarios over a harnessed node

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use rtbridge_core::*;
use rtbridge_host::{
    Handler, HostConfig, HostedRuntime, Notifier, RuntimeHostHandler, Signer,
};
use tokio_util::sync::CancellationToken;

use crate::*;

// ============================================================================
// HELPERS
// ============================================================================

fn v(major: u16) -> Version {
    Version::new(major, 0, 0)
}

fn km(id: u64) -> Namespace {
    Namespace::from_u64(0x4b4d_0000 + id)
}

fn status(key_manager: Namespace, serial: u32) -> KeyManagerStatus {
    KeyManagerStatus {
        id: key_manager,
        is_initialized: true,
        is_secure: true,
        policy: Some(SignedPolicySgx {
            policy: PolicySgx {
                serial,
                id: key_manager,
                ..Default::default()
            },
            signatures: Vec::new(),
        }),
        ..Default::default()
    }
}

fn sgx_deployment(version: Version, valid_from: EpochTime, tcb_validity_period: u16) -> VersionInfo {
    let constraints = SgxConstraints {
        policy: QuotePolicy {
            ias: None,
            pcs: Some(PcsQuotePolicy {
                tcb_validity_period,
                min_tcb_evaluation_data_number: 12,
            }),
        },
        ..Default::default()
    };
    VersionInfo {
        version,
        valid_from,
        tee: serde_json::to_vec(&constraints).unwrap().into(),
    }
}

fn km_descriptor(id: Namespace, deployments: Vec<VersionInfo>) -> RuntimeDescriptor {
    RuntimeDescriptor {
        id,
        kind: RuntimeKind::KeyManager,
        tee_hardware: TeeHardware::IntelSgx,
        key_manager: None,
        deployments,
    }
}

fn quote_features() -> Features {
    Features {
        key_manager_quote_policy_updates: true,
    }
}

fn policy_serial(call: &RuntimeRequest) -> Option<u32> {
    match call {
        RuntimeRequest::KeyManagerPolicyUpdate { signed_policy_raw } => {
            let policy: SignedPolicySgx = serde_json::from_slice(signed_policy_raw).unwrap();
            Some(policy.policy.serial)
        }
        _ => None,
    }
}

fn quote_tcb(call: &RuntimeRequest) -> Option<u16> {
    match call {
        RuntimeRequest::KeyManagerQuotePolicyUpdate { policy } => {
            policy.pcs.as_ref().map(|pcs| pcs.tcb_validity_period)
        }
        _ => None,
    }
}

fn quote_calls(runtime: &FakeHostedRuntime) -> usize {
    runtime
        .calls()
        .iter()
        .filter(|call| quote_tcb(call).is_some())
        .count()
}

async fn handler(h: &Harness) -> Arc<dyn Handler> {
    h.provision().await.unwrap();
    h.hosted(v(1)).handler().unwrap()
}

async fn track(h: &Harness, key_manager: Namespace) {
    h.registry
        .publish_descriptor(h.registry.compute_descriptor(Some(key_manager)));
    wait_until(|| h.consensus.epochs.subscriber_count() == 1).await;
}

// ============================================================================
// REQUEST HANDLER
// ============================================================================

#[tokio::test]
async fn test_unsupported_envelopes() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;

    let err = handler
        .handle_envelope(RequestEnvelope::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::MethodNotSupported));

    let mut two = RequestEnvelope::from(HostRequest::Identity(IdentityRequest {}));
    two.host_fetch_genesis_height = Some(FetchGenesisHeightRequest {});
    let err = handler.handle_envelope(two).await.unwrap_err();
    assert!(matches!(err, BridgeError::MethodNotSupported));
}

#[tokio::test]
async fn test_rpc_call_relays_to_key_manager() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;

    let rq = RpcCallRequest {
        endpoint: ENCLAVE_RPC_ENDPOINT.to_string(),
        request: Bytes::from_static(b"ping"),
        kind: RpcKind::InsecureQuery,
        peer_feedback: Some(PeerFeedback::Success),
    };
    let resp = handler.handle(HostRequest::RpcCall(rq.clone())).await.unwrap();
    assert_eq!(
        resp,
        HostResponse::RpcCall {
            response: Bytes::from_static(b"km:ping")
        }
    );
    assert_eq!(
        h.env.key_manager.calls(),
        vec![(RpcKind::InsecureQuery, Some(PeerFeedback::Success))]
    );

    let other = RpcCallRequest {
        endpoint: "discrepancy".to_string(),
        ..rq
    };
    let err = handler.handle(HostRequest::RpcCall(other)).await.unwrap_err();
    assert!(matches!(err, BridgeError::EndpointNotSupported));
    assert_eq!(h.env.key_manager.calls().len(), 1);
}

#[tokio::test]
async fn test_rpc_call_key_manager_unavailable() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;
    h.env
        .key_manager_down
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let rq = RpcCallRequest {
        endpoint: ENCLAVE_RPC_ENDPOINT.to_string(),
        request: Bytes::new(),
        kind: RpcKind::NoiseSession,
        peer_feedback: None,
    };
    let err = handler.handle(HostRequest::RpcCall(rq)).await.unwrap_err();
    assert!(matches!(err, BridgeError::Collaborator { .. }));
    assert!(matches!(err.root(), BridgeError::Backend(_)));
}

#[tokio::test]
async fn test_storage_sync_routes_by_endpoint() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;
    let tree = Root::default();

    let get = StorageSyncRequest::get(
        StorageEndpoint::RUNTIME,
        GetRequest {
            tree: tree.clone(),
            key: Bytes::from_static(b"balance"),
        },
    );
    let resp = handler.handle(HostRequest::StorageSync(get)).await.unwrap();
    let HostResponse::StorageSync(proof) = &resp else {
        panic!("unexpected response: {resp:?}");
    };
    assert_eq!(proof.proof.entries, vec![Bytes::from_static(b"balance")]);

    let iterate = StorageSyncRequest::iterate(
        StorageEndpoint::CONSENSUS,
        IterateRequest {
            tree: tree.clone(),
            key: Bytes::from_static(b"a"),
            prefetch: 10,
        },
    );
    handler.handle(HostRequest::StorageSync(iterate)).await.unwrap();

    assert_eq!(h.registry.runtime_storage().unwrap().requests(), vec!["get"]);
    assert_eq!(h.consensus.state_syncer().requests(), vec!["iterate"]);

    let unknown = StorageSyncRequest::get_prefixes(
        StorageEndpoint(9),
        GetPrefixesRequest {
            tree: tree.clone(),
            prefixes: vec![],
            limit: 1,
        },
    );
    let err = handler.handle(HostRequest::StorageSync(unknown)).await.unwrap_err();
    assert!(matches!(err, BridgeError::EndpointNotSupported));

    let mut both = StorageSyncRequest::get(
        StorageEndpoint::CONSENSUS,
        GetRequest {
            tree: tree.clone(),
            key: Bytes::new(),
        },
    );
    both.sync_iterate = Some(IterateRequest {
        tree,
        key: Bytes::new(),
        prefetch: 1,
    });
    let err = handler.handle(HostRequest::StorageSync(both)).await.unwrap_err();
    assert!(matches!(err, BridgeError::MethodNotSupported));
}

#[tokio::test]
async fn test_storage_sync_without_runtime_storage() {
    let h = Harness::build(
        &[v(1)],
        HostConfig::default(),
        FakeTxPool::default(),
        FakeRegistryRuntime::without_storage,
    );
    let handler = handler(&h).await;

    let get = StorageSyncRequest::get(
        StorageEndpoint::RUNTIME,
        GetRequest {
            tree: Root::default(),
            key: Bytes::from_static(b"k"),
        },
    );
    let err = handler.handle(HostRequest::StorageSync(get)).await.unwrap_err();
    assert!(matches!(err, BridgeError::EndpointNotSupported));
}

#[tokio::test]
async fn test_local_storage_roundtrip() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;

    let resp = handler
        .handle(HostRequest::LocalStorageGet(LocalStorageGetRequest {
            key: Bytes::from_static(b"epoch"),
        }))
        .await
        .unwrap();
    assert_eq!(resp, HostResponse::LocalStorageGet { value: Bytes::new() });

    let resp = handler
        .handle(HostRequest::LocalStorageSet(LocalStorageSetRequest {
            key: Bytes::from_static(b"epoch"),
            value: Bytes::from_static(b"17"),
        }))
        .await
        .unwrap();
    assert_eq!(resp, HostResponse::LocalStorageSet);
    assert_eq!(h.registry.local().len(), 1);

    let resp = handler
        .handle(HostRequest::LocalStorageGet(LocalStorageGetRequest {
            key: Bytes::from_static(b"epoch"),
        }))
        .await
        .unwrap();
    assert_eq!(
        resp,
        HostResponse::LocalStorageGet {
            value: Bytes::from_static(b"17")
        }
    );
}

#[tokio::test]
async fn test_consensus_events_tagged_in_order() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;
    let rt = Namespace::from_u64(RUNTIME_ID);

    let staking = vec![
        ConsensusEvent::Staking(StakingEvent::Burn {
            owner: Address([1; 21]),
            amount: 5,
        }),
        ConsensusEvent::Staking(StakingEvent::Transfer {
            from: Address([1; 21]),
            to: Address([2; 21]),
            amount: 9,
        }),
    ];
    let registry = vec![
        ConsensusEvent::Registry(RegistryEvent::RuntimeSuspended(rt)),
        ConsensusEvent::Registry(RegistryEvent::RuntimeStarted(rt)),
    ];
    let root_hash = vec![
        ConsensusEvent::RootHash(RootHashEvent::Finalized { runtime: rt, round: 3 }),
        ConsensusEvent::RootHash(RootHashEvent::ExecutorCommitted { runtime: rt, round: 4 }),
    ];
    let governance = vec![
        ConsensusEvent::Governance(GovernanceEvent::ProposalFinalized { id: 2, passed: true }),
        ConsensusEvent::Governance(GovernanceEvent::ProposalSubmitted { id: 1 }),
    ];

    // Interleave the kinds so each sequence is picked out of a mixed stream.
    for i in 0..2 {
        for events in [&staking, &registry, &root_hash, &governance] {
            h.consensus.push_event(10, events[i].clone());
        }
    }
    h.consensus.push_event(11, staking[0].clone());
    h.consensus.push_event(11, governance[1].clone());

    let fetch = |kind| {
        HostRequest::FetchConsensusEvents(FetchConsensusEventsRequest { height: 10, kind })
    };

    let expected = [staking, registry, root_hash, governance];
    for (kind, expected) in EventKind::ALL.into_iter().zip(expected) {
        assert!(expected.iter().all(|ev| ev.kind() == kind));
        let resp = handler.handle(fetch(kind)).await.unwrap();
        assert_eq!(resp, HostResponse::FetchConsensusEvents(expected), "{kind}");
    }

    let err = handler.handle(fetch(EventKind(9))).await.unwrap_err();
    assert!(matches!(err, BridgeError::MethodNotSupported));
}

#[tokio::test]
async fn test_consensus_events_failure_names_operation() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;
    h.consensus.fail_events(true);

    let err = handler
        .handle(HostRequest::FetchConsensusEvents(FetchConsensusEventsRequest {
            height: 1,
            kind: EventKind::GOVERNANCE,
        }))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("governance events: "), "{err}");
    assert!(matches!(err.root(), BridgeError::Backend(_)));
}

#[tokio::test]
async fn test_fetch_light_block() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;
    h.env.light_client.insert(7, Bytes::from_static(b"header-7"));

    let resp = handler
        .handle(HostRequest::FetchConsensusBlock(FetchConsensusBlockRequest { height: 7 }))
        .await
        .unwrap();
    assert_eq!(
        resp,
        HostResponse::FetchConsensusBlock(LightBlock {
            height: 7,
            meta: Bytes::from_static(b"header-7"),
        })
    );

    let err = handler
        .handle(HostRequest::FetchConsensusBlock(FetchConsensusBlockRequest { height: 8 }))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::LightBlockFetch(_)));
    assert!(err.to_string().starts_with("light block fetch failure"));
}

#[tokio::test]
async fn test_fetch_genesis_height() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;

    let resp = handler
        .handle(HostRequest::FetchGenesisHeight(FetchGenesisHeightRequest {}))
        .await
        .unwrap();
    assert_eq!(resp, HostResponse::FetchGenesisHeight { height: 42 });
}

#[tokio::test]
async fn test_fetch_tx_batch_window() {
    let h = Harness::with_pool(&[v(1)], 10);
    let handler = handler(&h).await;

    let resp = handler
        .handle(HostRequest::FetchTxBatch(FetchTxBatchRequest { offset: 5, limit: 3 }))
        .await
        .unwrap();
    assert_eq!(
        resp,
        HostResponse::FetchTxBatch {
            batch: vec![
                Bytes::from_static(b"tx-5"),
                Bytes::from_static(b"tx-6"),
                Bytes::from_static(b"tx-7"),
            ]
        }
    );
}

#[tokio::test]
async fn test_prove_freshness_signs_with_node_key() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;
    let blob = [0xab; 32];

    let resp = handler
        .handle(HostRequest::ProveFreshness(ProveFreshnessRequest { blob }))
        .await
        .unwrap();
    let HostResponse::ProveFreshness { signed_tx, proof } = &resp else {
        panic!("unexpected response: {resp:?}");
    };

    let node_key = h.env.signer.public();
    assert_eq!(signed_tx.signature.public_key, node_key);
    assert!(verify_signature(
        &node_key,
        TX_SIGNATURE_CONTEXT,
        &signed_tx.blob,
        &signed_tx.signature.signature,
    ));
    assert_eq!(proof.raw_proof.as_ref(), &tx_hash(&signed_tx.blob).0[..]);

    let submitted = h.consensus.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].method, METHOD_PROVE_FRESHNESS);
    assert_eq!(submitted[0].body.as_ref(), &blob[..]);
}

#[tokio::test]
async fn test_identity_is_node_signer() {
    let h = Harness::new(&[v(1)]);
    let handler = handler(&h).await;

    let resp = handler
        .handle(HostRequest::Identity(IdentityRequest {}))
        .await
        .unwrap();
    assert_eq!(
        resp,
        HostResponse::Identity {
            node_id: h.env.signer.public(),
        }
    );
}

proptest! {
    #[test]
    fn prop_tx_batch_is_pool_window(size in 0usize..40, offset in 0u64..50, limit in 0u32..50) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let env = Arc::new(FakeEnvironment::new(FakeTxPool::with_transactions(size)));
        let provisioner = Arc::new(FakeProvisioner::new());
        let registry = Arc::new(FakeRegistryRuntime::new(Namespace::from_u64(1), &[v(1)], provisioner));
        let handler = RuntimeHostHandler::new(env, registry, Arc::new(FakeConsensus::new()));

        let resp = rt
            .block_on(handler.handle(HostRequest::FetchTxBatch(FetchTxBatchRequest { offset, limit })))
            .unwrap();
        let expected: Vec<Bytes> = (0..size)
            .skip(offset as usize)
            .take(limit as usize)
            .map(|i| Bytes::from(format!("tx-{i}")))
            .collect();
        prop_assert_eq!(resp, HostResponse::FetchTxBatch { batch: expected });
    }
}

// ============================================================================
// CONSENSUS BLOCK WATCH LOOP
// ============================================================================

#[tokio::test]
async fn test_only_latest_block_reaches_slow_runtime() {
    let h = Harness::new(&[v(1)]);
    h.start().await.unwrap();
    let hosted = h.hosted(v(1));
    let mut calls = hosted.watch_calls();

    hosted.hold();
    h.consensus.publish_block(1);
    assert_eq!(next(&mut calls).await, RuntimeRequest::ConsensusSync { height: 1 });

    h.consensus.publish_block(100);
    h.consensus.publish_block(101);
    h.consensus.publish_block(102);
    settle().await;
    hosted.release();

    assert_eq!(next(&mut calls).await, RuntimeRequest::ConsensusSync { height: 102 });
    settle().await;
    assert_eq!(hosted.synced_heights(), vec![1, 102]);
}

#[tokio::test]
async fn test_block_push_failure_is_not_fatal() {
    let h = Harness::new(&[v(1)]);
    h.start().await.unwrap();
    let hosted = h.hosted(v(1));
    let mut calls = hosted.watch_calls();

    hosted.fail_calls(true);
    h.consensus.publish_block(5);
    assert_eq!(next(&mut calls).await, RuntimeRequest::ConsensusSync { height: 5 });

    hosted.fail_calls(false);
    h.consensus.publish_block(6);
    assert_eq!(next(&mut calls).await, RuntimeRequest::ConsensusSync { height: 6 });
}

#[tokio::test]
async fn test_block_push_bounded_by_notify_timeout() {
    let config = HostConfig::default().with_notify_timeout(Duration::from_millis(100));
    let h = Harness::with_config(&[v(1)], config);
    h.start().await.unwrap();
    let hosted = h.hosted(v(1));
    let mut calls = hosted.watch_calls();

    hosted.hold();
    h.consensus.publish_block(1);
    assert_eq!(next(&mut calls).await, RuntimeRequest::ConsensusSync { height: 1 });

    // The held call times out and the loop moves on to the next block.
    h.consensus.publish_block(2);
    assert_eq!(next(&mut calls).await, RuntimeRequest::ConsensusSync { height: 2 });
}

// ============================================================================
// POLICY WATCH LOOP
// ============================================================================

#[tokio::test]
async fn test_policy_pushed_for_tracked_key_manager_only() {
    let h = Harness::new(&[v(1)]);
    h.start().await.unwrap();
    let mut calls = h.hosted(v(1)).watch_calls();
    track(&h, km(1)).await;

    h.consensus.statuses.publish(status(km(2), 99));
    h.consensus.statuses.publish(status(km(1), 1));

    let call = next(&mut calls).await;
    assert_eq!(policy_serial(&call), Some(1));
}

#[tokio::test]
async fn test_status_without_policy_is_not_pushed() {
    let h = Harness::new(&[v(1)]);
    h.start().await.unwrap();
    let mut calls = h.hosted(v(1)).watch_calls();
    track(&h, km(1)).await;

    let mut empty = status(km(1), 0);
    empty.policy = None;
    h.consensus.statuses.publish(empty);
    h.consensus.statuses.publish(status(km(1), 4));

    assert_eq!(policy_serial(&next(&mut calls).await), Some(4));
}

#[tokio::test]
async fn test_key_manager_change_replaces_streams() {
    let h = Harness::new(&[v(1)]);
    h.start().await.unwrap();
    let mut calls = h.hosted(v(1)).watch_calls();

    track(&h, km(1)).await;
    assert_eq!(h.consensus.statuses.total_subscriptions(), 1);

    // Same key manager again: nothing is re-opened.
    h.registry
        .publish_descriptor(h.registry.compute_descriptor(Some(km(1))));
    settle().await;
    assert_eq!(h.consensus.statuses.total_subscriptions(), 1);

    h.registry
        .publish_descriptor(h.registry.compute_descriptor(Some(km(2))));
    wait_until(|| h.consensus.statuses.total_subscriptions() == 2).await;
    wait_until(|| h.consensus.epochs.total_subscriptions() == 2).await;
    assert_eq!(h.consensus.statuses.subscriber_count(), 1);
    assert_eq!(h.consensus.epochs.subscriber_count(), 1);

    let opened = h.consensus.opened();
    let inner: Vec<_> = opened.iter().filter(|o| o.stream != "blocks").collect();
    assert_eq!(inner.len(), 4);
    assert!(inner.iter().all(|o| o.already_open == 0), "{opened:?}");

    h.consensus.statuses.publish(status(km(1), 1));
    h.consensus.statuses.publish(status(km(2), 2));
    assert_eq!(policy_serial(&next(&mut calls).await), Some(2));
}

#[tokio::test]
async fn test_key_manager_change_abandons_inflight_push() {
    let h = Harness::new(&[v(1)]);
    h.start().await.unwrap();
    let hosted = h.hosted(v(1));
    let mut calls = hosted.watch_calls();
    track(&h, km(1)).await;

    // The runtime sits on the push for the whole notify timeout.
    hosted.hold();
    h.consensus.statuses.publish(status(km(1), 1));
    assert_eq!(policy_serial(&next(&mut calls).await), Some(1));

    h.registry
        .publish_descriptor(h.registry.compute_descriptor(Some(km(2))));
    tokio::time::timeout(
        Duration::from_secs(1),
        wait_until(|| h.consensus.epochs.total_subscriptions() == 2),
    )
    .await
    .unwrap();

    hosted.release();
    h.consensus.statuses.publish(status(km(2), 2));
    assert_eq!(policy_serial(&next(&mut calls).await), Some(2));
}

#[tokio::test]
async fn test_quote_policy_follows_key_manager_deployments() {
    let h = Harness::new(&[v(1)]);
    h.provisioner.set_features(quote_features());
    h.consensus.set_runtime(km_descriptor(
        km(1),
        vec![sgx_deployment(v(1), 0, 10), sgx_deployment(v(2), 5, 20)],
    ));
    h.start().await.unwrap();
    let hosted = h.hosted(v(1));
    let mut calls = hosted.watch_calls();
    track(&h, km(1)).await;

    h.consensus.epochs.publish(1);
    assert_eq!(quote_tcb(&next(&mut calls).await), Some(10));

    // Same deployment still active.
    h.consensus.epochs.publish(2);
    h.consensus.epochs.publish(5);
    assert_eq!(quote_tcb(&next(&mut calls).await), Some(20));
    assert_eq!(quote_calls(&hosted), 2);
}

#[tokio::test]
async fn test_quote_policy_requires_runtime_feature() {
    let h = Harness::new(&[v(1)]);
    h.consensus
        .set_runtime(km_descriptor(km(1), vec![sgx_deployment(v(1), 0, 10)]));
    h.start().await.unwrap();
    track(&h, km(1)).await;

    h.consensus.epochs.publish(1);
    settle().await;
    assert!(h.hosted(v(1)).calls().is_empty());
}

#[tokio::test]
async fn test_quote_policy_requires_sgx() {
    let h = Harness::new(&[v(1)]);
    h.provisioner.set_features(quote_features());
    let mut descriptor = km_descriptor(km(1), vec![sgx_deployment(v(1), 0, 10)]);
    descriptor.tee_hardware = TeeHardware::Invalid;
    h.consensus.set_runtime(descriptor);
    h.start().await.unwrap();
    track(&h, km(1)).await;

    h.consensus.epochs.publish(1);
    settle().await;
    assert_eq!(quote_calls(&h.hosted(v(1))), 0);
}

#[tokio::test]
async fn test_malformed_constraints_are_skipped() {
    let h = Harness::new(&[v(1)]);
    h.provisioner.set_features(quote_features());
    let broken = VersionInfo {
        version: v(1),
        valid_from: 0,
        tee: Bytes::from_static(b"not constraints"),
    };
    h.consensus.set_runtime(km_descriptor(
        km(1),
        vec![broken, sgx_deployment(v(2), 3, 30)],
    ));
    h.start().await.unwrap();
    let hosted = h.hosted(v(1));
    let mut calls = hosted.watch_calls();
    track(&h, km(1)).await;

    h.consensus.epochs.publish(1);
    h.consensus.epochs.publish(2);
    h.consensus.epochs.publish(3);

    assert_eq!(quote_tcb(&next(&mut calls).await), Some(30));
    assert_eq!(quote_calls(&hosted), 1);
}

#[tokio::test]
async fn test_restart_replays_known_policies() {
    let h = Harness::new(&[v(1)]);
    h.provisioner.set_features(quote_features());
    h.consensus
        .set_runtime(km_descriptor(km(1), vec![sgx_deployment(v(1), 0, 10)]));
    h.start().await.unwrap();
    let hosted = h.hosted(v(1));
    let mut calls = hosted.watch_calls();
    track(&h, km(1)).await;

    h.consensus.statuses.publish(status(km(1), 7));
    assert_eq!(policy_serial(&next(&mut calls).await), Some(7));
    h.consensus.epochs.publish(1);
    assert_eq!(quote_tcb(&next(&mut calls).await), Some(10));

    hosted.restart();
    assert_eq!(policy_serial(&next(&mut calls).await), Some(7));
    assert_eq!(quote_tcb(&next(&mut calls).await), Some(10));
}

#[tokio::test]
async fn test_restart_without_policies_pushes_nothing() {
    let h = Harness::new(&[v(1)]);
    h.start().await.unwrap();
    let hosted = h.hosted(v(1));
    track(&h, km(1)).await;

    hosted.restart();
    settle().await;
    assert!(hosted.calls().is_empty());
}

#[tokio::test]
async fn test_failed_inner_watch_is_inert_until_key_manager_changes() {
    let h = Harness::new(&[v(1)]);
    h.start().await.unwrap();
    let mut calls = h.hosted(v(1)).watch_calls();

    h.consensus.fail_epoch_watch(true);
    h.registry
        .publish_descriptor(h.registry.compute_descriptor(Some(km(1))));
    wait_until(|| h.consensus.statuses.total_subscriptions() == 1).await;
    settle().await;
    assert_eq!(h.consensus.statuses.subscriber_count(), 0);

    h.consensus.fail_epoch_watch(false);
    track(&h, km(2)).await;
    h.consensus.statuses.publish(status(km(2), 3));
    assert_eq!(policy_serial(&next(&mut calls).await), Some(3));
}

#[tokio::test]
async fn test_non_compute_descriptor_ends_policy_loop() {
    let h = Harness::new(&[v(1)]);
    h.start().await.unwrap();

    let mut descriptor = h.registry.compute_descriptor(None);
    descriptor.kind = RuntimeKind::KeyManager;
    h.registry.publish_descriptor(descriptor);

    wait_until(|| h.registry.descriptors.subscriber_count() == 0).await;
    assert_eq!(h.consensus.blocks.subscriber_count(), 1);
}

// ============================================================================
// NOTIFIER LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_stop_is_final_and_idempotent() {
    let h = Harness::new(&[v(1)]);
    let (_, notifier) = h.start().await.unwrap();
    track(&h, km(1)).await;

    notifier.stop().await;
    notifier.stop().await;

    assert_eq!(h.registry.descriptors.subscriber_count(), 0);
    assert_eq!(h.consensus.blocks.subscriber_count(), 0);
    assert_eq!(h.consensus.statuses.subscriber_count(), 0);
    assert_eq!(h.consensus.epochs.subscriber_count(), 0);

    h.consensus.publish_block(3);
    h.consensus.statuses.publish(status(km(1), 1));
    h.consensus.epochs.publish(1);
    settle().await;
    assert!(h.hosted(v(1)).calls().is_empty());
}

#[tokio::test]
async fn test_start_twice_spawns_loops_once() {
    let h = Harness::new(&[v(1)]);
    let (_, notifier) = h.start().await.unwrap();

    notifier.start().await.unwrap();
    settle().await;
    assert_eq!(h.registry.descriptors.total_subscriptions(), 1);
    assert_eq!(h.consensus.blocks.total_subscriptions(), 1);
}

#[tokio::test]
async fn test_context_cancel_stops_loops() {
    let h = Harness::new(&[v(1)]);
    h.start().await.unwrap();
    track(&h, km(1)).await;

    h.ctx.cancel();
    wait_until(|| {
        h.registry.descriptors.subscriber_count() == 0
            && h.consensus.blocks.subscriber_count() == 0
            && h.consensus.statuses.subscriber_count() == 0
            && h.consensus.epochs.subscriber_count() == 0
    })
    .await;
}

// ============================================================================
// RUNTIME HOST NODE
// ============================================================================

#[tokio::test]
async fn test_wait_blocks_until_provisioned() {
    let h = Harness::new(&[v(1)]);
    let node = Arc::clone(&h.node);
    let ctx = CancellationToken::new();
    let waiter = tokio::spawn(async move { node.wait_hosted_runtime(&ctx).await });

    settle().await;
    assert!(!waiter.is_finished());
    assert!(h.node.get_hosted_runtime().is_none());

    let (runtime, _) = h.provision().await.unwrap();
    let waited = within(waiter).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&runtime, &waited));
}

#[tokio::test]
async fn test_wait_with_cancelled_context() {
    let h = Harness::new(&[v(1)]);
    let ctx = CancellationToken::new();
    ctx.cancel();

    let err = within(h.node.wait_hosted_runtime(&ctx)).await.err().unwrap();
    assert!(matches!(err, BridgeError::Cancelled));

    h.provision().await.unwrap();
    let err = h.node.wait_hosted_runtime(&ctx).await.err().unwrap();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_provision_installs_one_handler_everywhere() {
    let h = Harness::new(&[v(1), v(2)]);
    h.provision().await.unwrap();

    assert_eq!(h.provisioner.provisioned(), vec![v(1), v(2)]);
    let first = h.hosted(v(1)).handler().unwrap();
    let second = h.hosted(v(2)).handler().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.node.hosted_runtime_version(), Some(v(2)));
    assert!(h.node.hosted_runtime_notifier().is_some());
}

#[tokio::test]
async fn test_provision_twice_fails() {
    let h = Harness::new(&[v(1)]);
    h.provision().await.unwrap();

    let err = h.provision().await.err().unwrap();
    assert!(matches!(err, BridgeError::AlreadyProvisioned));
}

#[tokio::test]
async fn test_provision_failure_allows_retry() {
    let h = Harness::new(&[v(1), v(2)]);
    h.provisioner.fail_version(Some(v(2)));

    let err = h.provision().await.err().unwrap();
    assert!(matches!(err.root(), BridgeError::Backend(_)));
    assert!(h.node.get_hosted_runtime().is_none());

    h.provisioner.fail_version(None);
    h.provision().await.unwrap();
    assert!(h.node.get_hosted_runtime().is_some());
}

#[tokio::test]
async fn test_set_version_before_provisioning() {
    let h = Harness::new(&[v(1)]);
    let err = h.node.set_hosted_runtime_version(v(1)).await.unwrap_err();
    assert!(matches!(err, BridgeError::RuntimeNotAvailable));
}

#[tokio::test]
async fn test_version_switch_routes_pushes() {
    let config = HostConfig::default().with_default_version(v(1));
    let h = Harness::with_config(&[v(1), v(2)], config);
    let (runtime, _) = h.start().await.unwrap();
    assert_eq!(h.node.hosted_runtime_version(), Some(v(1)));
    assert!(h.hosted(v(1)).is_running());

    let mut events = runtime.watch_events();
    h.node.set_hosted_runtime_version(v(2)).await.unwrap();
    assert!(!h.hosted(v(1)).is_running());
    assert!(h.hosted(v(2)).is_running());
    assert_eq!(next(&mut events).await, HostEvent::Updated { version: v(2) });

    let mut calls = h.hosted(v(2)).watch_calls();
    h.consensus.publish_block(9);
    assert_eq!(next(&mut calls).await, RuntimeRequest::ConsensusSync { height: 9 });
    assert!(h.hosted(v(1)).synced_heights().is_empty());

    let err = h.node.set_hosted_runtime_version(v(7)).await.unwrap_err();
    assert!(matches!(err, BridgeError::UnknownVersion(_)));
}

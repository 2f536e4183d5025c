//! Consensus layer data types
//!
//! These are the values the bridge relays between consensus backends and the
//! hosted runtime. The bridge never interprets block or event contents.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Hash, Height, Namespace, PublicKey};

/// Consensus block reference
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: Height,
    pub hash: Hash,
    /// Block time, seconds since the Unix epoch
    pub time: u64,
}

/// Light client block: header plus validator metadata, opaque to the bridge
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightBlock {
    pub height: Height,
    pub meta: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisDocument {
    pub height: Height,
    pub chain_id: String,
}

/// Staking account address
#[derive(Clone, Copy, Debug, PartialEq, Eq, std::hash::Hash, Default, Serialize, Deserialize)]
pub struct Address(pub [u8; 21]);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StakingEvent {
    Transfer {
        from: Address,
        to: Address,
        amount: u64,
    },
    Burn {
        owner: Address,
        amount: u64,
    },
    Escrow {
        owner: Address,
        escrow: Address,
        amount: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    RuntimeStarted(Namespace),
    RuntimeSuspended(Namespace),
    NodeUpdated(PublicKey),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootHashEvent {
    ExecutorCommitted { runtime: Namespace, round: u64 },
    Finalized { runtime: Namespace, round: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GovernanceEvent {
    ProposalSubmitted { id: u64 },
    ProposalFinalized { id: u64, passed: bool },
    Vote { id: u64, voter: Address },
}

/// Consensus event kind selector, as sent by the runtime
#[derive(Clone, Copy, PartialEq, Eq, std::hash::Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKind(pub u8);

impl EventKind {
    pub const STAKING: EventKind = EventKind(1);
    pub const REGISTRY: EventKind = EventKind(2);
    pub const ROOT_HASH: EventKind = EventKind(3);
    pub const GOVERNANCE: EventKind = EventKind(4);

    /// All kinds the host knows how to serve.
    pub const ALL: [EventKind; 4] = [
        EventKind::STAKING,
        EventKind::REGISTRY,
        EventKind::ROOT_HASH,
        EventKind::GOVERNANCE,
    ];
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventKind({self})")
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EventKind::STAKING => write!(f, "staking"),
            EventKind::REGISTRY => write!(f, "registry"),
            EventKind::ROOT_HASH => write!(f, "roothash"),
            EventKind::GOVERNANCE => write!(f, "governance"),
            EventKind(other) => write!(f, "unknown({other})"),
        }
    }
}

/// Consensus event tagged with the backend that produced it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusEvent {
    Staking(StakingEvent),
    Registry(RegistryEvent),
    RootHash(RootHashEvent),
    Governance(GovernanceEvent),
}

impl ConsensusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConsensusEvent::Staking(_) => EventKind::STAKING,
            ConsensusEvent::Registry(_) => EventKind::REGISTRY,
            ConsensusEvent::RootHash(_) => EventKind::ROOT_HASH,
            ConsensusEvent::Governance(_) => EventKind::GOVERNANCE,
        }
    }
}

/// Registry method name for proof of freshness transactions.
pub const METHOD_PROVE_FRESHNESS: &str = "registry.ProveFreshness";

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fee {
    pub amount: u64,
    pub gas: u64,
}

/// Unsigned consensus transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub fee: Option<Fee>,
    pub method: String,
    pub body: Bytes,
}

impl Transaction {
    /// Proof of freshness transaction carrying the runtime-supplied blob.
    pub fn prove_freshness(nonce: u64, fee: Option<Fee>, blob: [u8; 32]) -> Self {
        Transaction {
            nonce,
            fee,
            method: METHOD_PROVE_FRESHNESS.to_string(),
            body: Bytes::copy_from_slice(&blob),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub public_key: PublicKey,
    pub signature: Bytes,
}

/// Serialized transaction plus the signer's signature over it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub blob: Bytes,
    pub signature: Signature,
}

/// Proof that a transaction was included in a block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxProof {
    pub height: Height,
    pub raw_proof: Bytes,
}

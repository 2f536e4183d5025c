//! Key manager status and policy documents
//!
//! The bridge only stores and forwards these; verification happens inside
//! the hosted runtime.

use serde::{Deserialize, Serialize};

use crate::{Hash, Namespace, PublicKey, Signature};

/// Enclave identity: MRENCLAVE and MRSIGNER measurements
#[derive(Clone, Debug, PartialEq, Eq, std::hash::Hash, Default, Serialize, Deserialize)]
pub struct EnclaveIdentity {
    pub mr_enclave: Hash,
    pub mr_signer: Hash,
}

/// Key manager access policy
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicySgx {
    pub serial: u32,
    pub id: Namespace,
    pub enclaves: Vec<EnclaveIdentity>,
    pub master_secret_rotation_interval: u64,
}

/// Policy plus the signatures of the policy signers
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignedPolicySgx {
    pub policy: PolicySgx,
    pub signatures: Vec<Signature>,
}

/// Key manager status as published by the consensus layer
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyManagerStatus {
    pub id: Namespace,
    pub is_initialized: bool,
    pub is_secure: bool,
    pub checksum: Vec<u8>,
    pub nodes: Vec<PublicKey>,
    pub policy: Option<SignedPolicySgx>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IasQuotePolicy {
    pub disabled: bool,
    pub allowed_quote_statuses: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PcsQuotePolicy {
    pub tcb_validity_period: u16,
    pub min_tcb_evaluation_data_number: u32,
}

/// Hardware attestation acceptance policy
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuotePolicy {
    pub ias: Option<IasQuotePolicy>,
    pub pcs: Option<PcsQuotePolicy>,
}

/// SGX deployment constraints carried in a key manager's version info
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SgxConstraints {
    pub enclaves: Vec<EnclaveIdentity>,
    #[serde(default)]
    pub policy: QuotePolicy,
    #[serde(default)]
    pub max_attestation_age: u64,
}

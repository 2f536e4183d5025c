//! Registry descriptors
//!
//! A runtime descriptor lists the runtime's deployments. Each deployment
//! becomes active at its `valid_from` epoch and stays active until a later
//! deployment takes over.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{BridgeError, BridgeResult, EpochTime, Namespace, Version};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RuntimeKind {
    #[default]
    Compute,
    KeyManager,
}

/// Trusted execution environment hardware
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TeeHardware {
    #[default]
    Invalid,
    IntelSgx,
}

/// One runtime deployment
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: Version,
    pub valid_from: EpochTime,
    /// Encoded TEE constraints, hardware specific
    pub tee: Bytes,
}

impl VersionInfo {
    /// Decode the TEE constraints blob.
    pub fn decode_tee<T: DeserializeOwned>(&self) -> BridgeResult<T> {
        serde_json::from_slice(&self.tee)
            .map_err(|e| BridgeError::MalformedTeeConstraints(e.to_string()))
    }
}

/// Registry record describing a runtime
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub id: Namespace,
    pub kind: RuntimeKind,
    pub tee_hardware: TeeHardware,
    /// Key manager assigned to a compute runtime
    pub key_manager: Option<Namespace>,
    pub deployments: Vec<VersionInfo>,
}

impl RuntimeDescriptor {
    /// Deployment active at the given epoch.
    pub fn active_deployment(&self, epoch: EpochTime) -> Option<&VersionInfo> {
        self.deployments
            .iter()
            .filter(|d| d.valid_from <= epoch)
            .max_by_key(|d| d.valid_from)
    }

    pub fn deployment_for_version(&self, version: Version) -> Option<&VersionInfo> {
        self.deployments.iter().find(|d| d.version == version)
    }
}

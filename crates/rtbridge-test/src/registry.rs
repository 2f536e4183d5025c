//! In-memory registry runtime and local storage

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rtbridge_core::{BridgeResult, Namespace, RuntimeDescriptor, RuntimeKind, Version};
use rtbridge_host::{
    LocalStorage, Provisioner, ReadSyncer, Runtime, RuntimeHostConfig, Subscription, Topic,
};

use crate::{FakeProvisioner, MemorySyncer};

#[derive(Default)]
pub struct MemoryLocalStorage {
    entries: Mutex<HashMap<Vec<u8>, Bytes>>,
}

impl MemoryLocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl LocalStorage for MemoryLocalStorage {
    fn get(&self, key: &[u8]) -> BridgeResult<Bytes> {
        Ok(self.entries.lock().get(key).cloned().unwrap_or_default())
    }

    fn set(&self, key: &[u8], value: Bytes) -> BridgeResult<()> {
        self.entries.lock().insert(key.to_vec(), value);
        Ok(())
    }
}

/// Registry view of the hosted runtime
pub struct FakeRegistryRuntime {
    id: Namespace,
    versions: Vec<Version>,
    pub descriptors: Topic<RuntimeDescriptor>,
    storage: Option<Arc<MemorySyncer>>,
    local: Arc<MemoryLocalStorage>,
    provisioner: Arc<FakeProvisioner>,
}

impl FakeRegistryRuntime {
    pub fn new(id: Namespace, versions: &[Version], provisioner: Arc<FakeProvisioner>) -> Self {
        FakeRegistryRuntime {
            id,
            versions: versions.to_vec(),
            descriptors: Topic::new(),
            storage: Some(Arc::new(MemorySyncer::new())),
            local: Arc::new(MemoryLocalStorage::new()),
            provisioner,
        }
    }

    /// Runtime without its own state storage, like a key manager.
    pub fn without_storage(mut self) -> Self {
        self.storage = None;
        self
    }

    pub fn runtime_storage(&self) -> Option<Arc<MemorySyncer>> {
        self.storage.clone()
    }

    pub fn local(&self) -> Arc<MemoryLocalStorage> {
        Arc::clone(&self.local)
    }

    /// Compute runtime descriptor assigning `key_manager`.
    pub fn compute_descriptor(&self, key_manager: Option<Namespace>) -> RuntimeDescriptor {
        RuntimeDescriptor {
            id: self.id,
            kind: RuntimeKind::Compute,
            key_manager,
            ..Default::default()
        }
    }

    pub fn publish_descriptor(&self, descriptor: RuntimeDescriptor) -> usize {
        self.descriptors.publish(descriptor)
    }
}

#[async_trait]
impl Runtime for FakeRegistryRuntime {
    fn id(&self) -> Namespace {
        self.id
    }

    fn storage(&self) -> Option<Arc<dyn ReadSyncer>> {
        self.storage
            .as_ref()
            .map(|storage| Arc::clone(storage) as Arc<dyn ReadSyncer>)
    }

    fn local_storage(&self) -> Arc<dyn LocalStorage> {
        self.local.clone()
    }

    fn watch_registry_descriptor(&self) -> BridgeResult<Subscription<RuntimeDescriptor>> {
        Ok(self.descriptors.subscribe())
    }

    async fn host(
        &self,
    ) -> BridgeResult<(BTreeMap<Version, RuntimeHostConfig>, Arc<dyn Provisioner>)> {
        let configs = self
            .versions
            .iter()
            .map(|&version| {
                let bundle = format!("runtime-{version}.orc");
                (version, RuntimeHostConfig::new(self.id, version, bundle))
            })
            .collect();
        let provisioner: Arc<dyn Provisioner> = self.provisioner.clone();
        Ok((configs, provisioner))
    }
}

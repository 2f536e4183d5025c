//! Runtime host bridge test harness
//!
//! This crate provides:
//! - In-memory consensus, registry and key manager collaborators
//! - A scriptable hosted runtime and provisioner
//! - An ed25519 node signer
//! - A harness wiring a complete [`rtbridge_host::RuntimeHostNode`]
//! - End-to-end scenarios over the handler and notifier

pub mod consensus;
pub mod environment;
pub mod harness;
pub mod hosted;
pub mod registry;
pub mod signer;

#[cfg(test)]
mod scenarios;

pub use consensus::*;
pub use environment::*;
pub use harness::*;
pub use hosted::*;
pub use registry::*;
pub use signer::*;

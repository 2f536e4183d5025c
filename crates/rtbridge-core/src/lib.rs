//! Runtime host bridge - core types and primitives
//!
//! This crate defines the types shared by both halves of the host bridge:
//! - Identifiers (Namespace, Version, PublicKey, Hash)
//! - Consensus, registry and key manager data types
//! - Host protocol envelopes (runtime -> host requests, host -> runtime pushes)
//! - The bridge error taxonomy

pub mod id;
pub mod error;
pub mod consensus;
pub mod registry;
pub mod keymanager;
pub mod protocol;

pub use id::*;
pub use error::*;
pub use consensus::*;
pub use registry::*;
pub use keymanager::*;
pub use protocol::*;

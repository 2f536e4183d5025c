//! Runtime host bridge - host side of the runtime host protocol
//!
//! The hosted runtime (an enclave or isolated worker) cannot reach the
//! network, the consensus layer or local disk. This crate provides the two
//! halves it talks to:
//! 1. [`RuntimeHostHandler`] answers requests the runtime initiates
//! 2. [`HostNotifier`] pushes key manager policy, quote policy and consensus
//!    block updates into the runtime
//!
//! [`RuntimeHostNode`] provisions the versioned runtime [`Aggregate`],
//! installs the handler and hands out the notifier.

pub mod aggregate;
pub mod backend;
mod blocks;
pub mod config;
pub mod handler;
pub mod host;
pub mod latch;
pub mod latest;
pub mod node;
pub mod notifier;
mod policy;
pub mod rich;
pub mod subscription;
pub mod telemetry;

pub use aggregate::Aggregate;
pub use backend::*;
pub use config::{HostConfig, DEFAULT_NOTIFY_TIMEOUT};
pub use handler::RuntimeHostHandler;
pub use host::*;
pub use latch::Latch;
pub use latest::LatestCell;
pub use node::{DefaultHandlerFactory, HostHandlerFactory, RuntimeHostNode};
pub use notifier::HostNotifier;
pub use rich::RichRuntime;
pub use subscription::{Subscription, Topic};
pub use telemetry::{init_logging, LogConfig};

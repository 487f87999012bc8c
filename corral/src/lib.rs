//! Storage engine, locking model, and software networking stack for the
//! `corral` micro-VM manager.
//!
//! This crate carries no CLI surface and installs no logging subscriber —
//! it only emits [`tracing`] events. The home directory is an explicit
//! value ([`HomeDir`]) threaded into every constructor rather than an
//! ambient global, so callers (including tests) can point multiple
//! independent instances at different roots in the same process.

pub mod applestream;
pub mod binarycache;
pub mod chunker;
mod error;
pub mod homedir;
pub mod lock;
pub mod name;
#[cfg(target_os = "linux")]
pub mod net;
pub mod sparseio;
pub mod storage;
pub mod subnetfinder;
mod sys;
pub mod vmconfig;
pub mod vmdirectory;

pub use error::{AlreadyLockedKind, Error, Result};
pub use homedir::HomeDir;
pub use name::{LocalName, Name, RemoteName};
pub use vmconfig::VmConfig;
pub use vmdirectory::VmDirectory;

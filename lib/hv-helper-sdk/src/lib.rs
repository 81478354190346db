//! Host-side hypervisor helper SDK
//!
//! Thin async wrappers around the external collaborators a migration
//! session talks to: the page-level save/restore helper process, the
//! device-model RPC endpoint, the host's configuration store, and the
//! hypervisor control surface itself. None of these are implemented here
//! — they are modeled as traits so the engine crate can be driven against
//! fakes in tests, with one real, process/socket-backed implementation of
//! each.
pub mod config_store;
pub mod converter;
pub mod device_model;
mod error;
pub mod hypervisor;
pub mod process;

pub use error::Error;

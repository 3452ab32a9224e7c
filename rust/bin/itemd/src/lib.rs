//! `itemd`: a persistent key-value store served over HTTP.
//!
//! - [`api`]: HTTP routes mapped onto a [`itemd_kv::KVStore`].
//! - [`server`]: startup and ordered shutdown of the listener and the store.

pub mod api;
pub mod server;

pub use server::{LifecycleError, Phase, Server, ShutdownReport};

//! Berth: provisioning, lifecycle and configuration sync for per-user agent
//! instances.

pub mod compiler;
pub mod config;
pub mod control_plane;
pub mod db;
pub mod deploy;
pub mod desired;
pub mod error;
pub mod instances;
pub mod memory;
pub mod secrets;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};

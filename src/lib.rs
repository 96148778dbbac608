//! Imports externally generated RSA keys into a TPM 2.0 and persists them
//! under the owner hierarchy.

pub mod blob;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod import;
pub mod keys;
pub mod persist;
pub mod provision;
pub mod session;
pub mod sign;

pub use error::{Error, Result, Step};

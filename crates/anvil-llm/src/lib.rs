//! Provider SDK for the anvil agent runtime.
//!
//! Defines the chat wire types shared between the execution core and
//! provider adapters, the `Provider` completion contract, and the error
//! taxonomy that drives the core's retry policy.

pub mod errors;
pub mod provider;
pub mod types;

pub use errors::*;
pub use provider::*;
pub use types::*;

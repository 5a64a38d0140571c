//! Execution core for the anvil reactive agent runtime.
//!
//! Drives multi-turn conversations between a `Provider` and a set of
//! executable tools, persisting each conversation as an isolated session.
//! The crate is organized around the per-session reactive loop (`agent`),
//! the lane scheduler (`lanes`), the steering/follow-up interrupt protocol
//! (`steering`), the context compactor (`context`), the structured
//! lifecycle event stream (`events`), and the subagent registry
//! (`subagents`).

pub mod agent;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod lanes;
pub mod prompt;
pub mod steering;
pub mod store;
pub mod subagents;
pub mod tools;

pub use agent::*;
pub use config::*;
pub use context::*;
pub use errors::*;
pub use events::*;
pub use lanes::*;
pub use prompt::*;
pub use steering::*;
pub use store::*;
pub use subagents::*;
pub use tools::*;

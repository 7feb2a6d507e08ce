//! chainplugin-runtime: drives plugin chains from a notification source.
//!
//! # Architecture
//!
//! ```text
//! ManagerBuilder → PluginManager
//!                      ├── run(registration)   one PluginRun per plugin
//!                      │     ├── backfill      replay_range(start+1 ..= head)
//!                      │     └── live          subscribe(), LiveDeduplicator
//!                      ├── run_all(...)        concurrent runs, first error wins
//!                      └── finished_height()   min checkpoint across plugins
//! ```

pub mod builder;
pub mod config;
pub mod dedup;
pub mod manager;
pub mod memory;
pub mod registration;
mod run_loop;

pub use builder::ManagerBuilder;
pub use config::{ManagerConfig, PluginPhase};
pub use dedup::LiveDeduplicator;
pub use manager::{PluginCheckpoint, PluginManager};
pub use memory::{MemoryBlock, MemoryChain, MemoryChainTypes, MemoryReceipt};
pub use registration::PluginRegistration;

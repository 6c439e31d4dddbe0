// Engine orchestration: cache tiers, in-flight dedup and session loading.

pub mod cache;
pub mod ledger;
pub mod loader;
pub mod orchestrator;
pub mod stats;
pub mod store;

pub mod adapter;
pub mod batch;
pub mod checkpoint;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod error;
pub mod io;
pub mod ledger;
pub mod orchestrator;
pub mod paths;
pub mod rate_limit;
pub mod status;
pub mod store;
pub mod types;

pub use error::{EnforceError, Result};
pub use orchestrator::Orchestrator;
pub use store::EnforcementDb;

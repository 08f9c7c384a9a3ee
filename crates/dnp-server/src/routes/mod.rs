pub mod batches;
pub mod ledger;
pub mod providers;

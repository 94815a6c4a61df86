// Settlement reconciliation & retry engine
pub mod invoker;
pub mod models;
pub mod reaper;
pub mod recovery;
pub mod store;
pub mod sweep;
pub mod worker;

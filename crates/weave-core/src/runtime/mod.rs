//! Run-time machinery: the output store, the node executor, the DAG
//! scheduler, and the loop sub-scheduler.

pub mod executor;
mod looper;
pub mod scheduler;
pub mod store;

pub use executor::{execute_node, RetryPolicy};
pub use scheduler::{RunOutcome, Scheduler};
pub use store::{OutputStore, StoreError};

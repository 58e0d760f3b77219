pub mod executor;
pub mod filters;
pub mod janitor;
pub mod orphan;
pub mod pollers;
pub mod registry;
pub mod server;
pub mod worker_pool;

pub use executor::JobExecutor;
pub use filters::{ApplyStateFilter, ElectStateFilter, JobFilterChain, RetryFilter};
pub use server::{BackgroundJobServer, BackgroundJobServerBuilder};
pub use worker_pool::WorkerPool;

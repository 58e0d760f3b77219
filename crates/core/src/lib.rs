pub mod config;
pub mod context;
pub mod cron;
pub mod models;
pub mod traits;

pub use config::BackgroundJobServerConfig;
pub use context::JobContext;
pub use cron::{Cron, CronExpression};
pub use jobflow_errors::{JobflowError, JobflowResult};
pub use models::*;
pub use traits::*;

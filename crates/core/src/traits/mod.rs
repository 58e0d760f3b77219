pub mod activator;
pub mod storage;

pub use activator::{BackgroundJobHandler, JobActivator, SimpleJobActivator};
pub use storage::{JobStorage, RecurringJobStorage, ServerStorage, StorageProvider};

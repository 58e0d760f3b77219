pub mod enqueued;
pub mod recurring;
pub mod scheduled;

pub use enqueued::EnqueuedJobsPoller;
pub use recurring::RecurringJobsPoller;
pub use scheduled::ScheduledJobsPoller;

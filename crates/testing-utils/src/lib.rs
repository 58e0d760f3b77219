//! Test data builders and async assertion helpers shared by the
//! workspace test suites.

pub mod builders;
pub mod helpers;

pub use builders::JobBuilder;
pub use helpers::{assert_holds_during, await_until};

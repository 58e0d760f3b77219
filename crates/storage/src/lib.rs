pub mod memory;
pub mod sql;

pub use memory::InMemoryStorageProvider;
pub use sql::provider::SqliteStorageProvider;

pub mod dialect;
pub mod provider;
pub mod statement;

pub use dialect::{Dialect, OracleDialect, SqliteDialect};
pub use statement::{PreparedSql, Sql, SqlValue};

pub mod statement;

pub use statement::{StatementKind, is_read_only_query, is_write_statement, written_table};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryExecutionStore;
pub use sqlite::SqliteExecutionStore;

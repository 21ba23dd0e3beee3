pub mod diesel;
pub mod memory;

pub use self::diesel::{DbService, PgBackend, TransactionExecutor};
pub use self::memory::MemoryBackend;

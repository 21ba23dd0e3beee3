pub mod repository;

pub use repository::{EventRepository, StorageBackend, TransferRepository};

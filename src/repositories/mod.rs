pub mod base;
pub mod event_repository;
pub mod memory_repository;
pub mod registry;
pub mod traits;
pub mod transfer_repository;

pub use registry::StoreRegistry;
pub use traits::{EventRepository, StorageBackend, TransferRepository};

pub mod event;
pub mod transfer;

pub use event::{Event, Standard, SyncState};
pub use transfer::{Transfer, TransferStatus, combine_addresses};

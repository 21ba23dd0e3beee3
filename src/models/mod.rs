pub mod db;
pub mod domain;

pub use domain::{Event, Standard, SyncState, Transfer, TransferStatus};

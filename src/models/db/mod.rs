pub mod event_db;
pub mod schema;
pub mod transfer_db;

pub use event_db::EventRow;
pub use transfer_db::{ExistsRow, TransferRow};

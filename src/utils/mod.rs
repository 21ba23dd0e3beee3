pub mod convert;
pub mod logger;

pub use convert::*;

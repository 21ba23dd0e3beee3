pub mod bundler_client;

pub use bundler_client::{BundlerClient, RelayClient, ResolvedOperation, UserOperationResult};

//! Built-in modules registered by the [`Runtime`](crate::Runtime)

pub mod cluster_sync;
pub mod leader;

/// The version reported by the built-in modules
const VERSION: &str = env!("CARGO_PKG_VERSION");

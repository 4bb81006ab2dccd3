//! # Request Batching
//!
//! Individually submitted items are grouped by size and time triggers and
//! processed together. Each submitter awaits only its own item's result.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_resilience::batch::{batch_fn, BatchConfig, BatchManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let lookup = batch_fn(|ids: Vec<u64>| async move {
//!     Ok(ids.into_iter().map(|id| format!("user-{id}")).collect::<Vec<_>>())
//! });
//! let manager = BatchManager::new("user_lookup", BatchConfig::default(), lookup)?;
//!
//! let name = manager.add(7).await?;
//! assert_eq!(name, "user-7");
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod manager;
pub mod processor;
pub mod registry;
pub mod stats;

pub use config::{BatchConfig, ErrorHandlingStrategy};
pub use manager::{BatchManager, BatchTicket, ItemOptions};
pub use processor::{batch_fn, BatchProcessor, FnBatchProcessor};
pub use registry::BatchRegistry;
pub use stats::{BatchItemError, BatchStats};

//! # Cancellable Timeouts
//!
//! Deadline-bounded operations tracked by an injectable [`TimeoutManager`],
//! with context-scoped bulk cancellation and leak-detection statistics.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tasker_resilience::timeout::{TimeoutManager, TimeoutOptions};
//!
//! # async fn example() {
//! let manager = TimeoutManager::default();
//! let context = manager.create_context("importer");
//!
//! let result = manager
//!     .wrap_with_timeout(
//!         async { "fetched" },
//!         Duration::from_secs(2),
//!         TimeoutOptions::named("fetch_page").in_context(&context),
//!     )
//!     .await;
//!
//! match result {
//!     Ok(page) => println!("{page}"),
//!     Err(err) if err.is_timeout() => println!("gave up"),
//!     Err(err) => println!("failed: {err}"),
//! }
//!
//! manager.release_context(context);
//! # }
//! ```

pub mod context;
pub mod manager;
pub mod operation;
pub mod stats;

pub use context::{ContextId, TimeoutContext};
pub use manager::{TimeoutManager, TimeoutManagerConfig};
pub use operation::{
    OperationId, OperationInfo, OperationOutcome, TimeoutController, TimeoutFuture, TimeoutHandle,
    TimeoutOptions,
};
pub use stats::{MemoryFootprint, TimeoutStats};

//! # Adaptive Stream Processing
//!
//! Bounded-concurrency processing of item sequences with per-item and
//! stream-wide deadlines and memory-driven backpressure.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use futures::{stream, StreamExt};
//! use tasker_resilience::stream::{StreamConfig, StreamProcessor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let processor = StreamProcessor::new(StreamConfig::default())?;
//!
//! let mut results = processor.process(stream::iter(1..=100u64), |n, _index, _signal| async move {
//!     Ok(n * n)
//! });
//!
//! // Completion order, not submission order
//! while let Some(result) = results.next().await {
//!     println!("{}", result?);
//! }
//! println!("{:?}", processor.stats());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod memory;
pub mod processor;
pub mod signal;
pub mod stats;

pub use config::StreamConfig;
pub use memory::{ManualMemoryProbe, MemoryProbe, SystemMemoryProbe};
pub use processor::{ResultStream, StreamProcessor};
pub use signal::CancellationSignal;
pub use stats::StreamStats;

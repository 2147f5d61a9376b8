//! Greenwave Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Child processes
//! - The async runtime
//! - Configuration loading
//!
//! All types here are request-scoped: they live for one batch and are never
//! persisted by the core.

pub mod detection;
pub mod error;
pub mod lane;
pub mod optimizer;
pub mod response;

// Re-export commonly used types
pub use detection::{DetectionOutcome, DetectionTask, LaneError};
pub use error::{DetectionError, OptimizerError, OptimizerErrorKind, RecordError, RecommendationError};
pub use lane::{Lane, LANE_COUNT};
pub use optimizer::{IterationKind, LogEvent, OptimizerInvocation, OptimizerResult, StdoutPayload};
pub use response::{AggregateResponse, BatchStage, OptimizerFailure, RecommendationOutcome};

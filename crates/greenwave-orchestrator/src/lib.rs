//! Greenwave Orchestrator
//!
//! Composes the detection worker pool, the optimizer invoker and the
//! recommendation collaborator into one batch pipeline, with an optional
//! run history recorder.

pub mod config;
pub mod recommender;
pub mod recorder;
pub mod service;

pub use config::{Config, ConfigError};
pub use recommender::{CommandRecommender, Recommender, DEFAULT_RECOMMENDER_TIMEOUT};
pub use recorder::{JsonLinesRecorder, RunRecord, RunRecorder};
pub use service::OrchestrationService;

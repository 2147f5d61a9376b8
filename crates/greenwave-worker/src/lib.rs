//! Greenwave Detection Workers
//!
//! Vehicle detection runs native inference code that leaks memory and can
//! crash. Every lane therefore runs in its own short-lived child process,
//! supervised by the pool in this crate.

pub mod launcher;
pub mod pool;
pub mod report;

pub use launcher::{CommandLauncher, NoDetector, WorkerLauncher, DEFAULT_ENV_PASSTHROUGH};
pub use pool::{
    DetectionWorkerPool, PoolConfig, TimeoutPolicy, DEFAULT_BATCH_TIMEOUT, DEFAULT_GRACE_PERIOD,
    DEFAULT_MAX_WORKERS, DEFAULT_TASK_TIMEOUT,
};
pub use report::parse_report;

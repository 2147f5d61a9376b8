//! Optimizer integration for Greenwave
//!
//! This crate runs the external genetic-algorithm optimizer as a child
//! process and turns its output into an `OptimizerResult`: stdout is parsed as
//! JSON, stderr is classified line by line into `LogEvent`s.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use greenwave_core::OptimizerInvocation;
//! use greenwave_optimizer::OptimizerInvoker;
//!
//! async fn optimize() -> Result<(), Box<dyn std::error::Error>> {
//!     let invoker = OptimizerInvoker::new("./Algo1");
//!     let invocation = OptimizerInvocation::new([5, 12, 3, 9], Duration::from_secs(30), true);
//!
//!     let result = invoker.invoke(&invocation).await?;
//!     println!("greens: {:?}, events: {}", result.greens(), result.events.len());
//!     Ok(())
//! }
//! ```

mod invoker;
pub mod log_parser;

// Re-export main types
pub use invoker::{Optimizer, OptimizerInvoker, MAX_LOG_LINES};
pub use log_parser::{classify, parse_lines, Classified, LogEventParser, ParsedLog};

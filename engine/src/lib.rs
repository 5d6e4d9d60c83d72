//! # MediaFetch Engine - Controllable Media Transfer Library
//!
//! A headless engine that streams a remote resource into a local file while
//! a controller pauses, resumes, cancels and watches progress.
//! Designed as the foundation for multiple front ends (CLI, automation).
//!
//! ## Overview
//!
//! Each transfer runs on its own producer thread. The producer:
//! - Resolves the locator into a source and checks it against the limiter
//! - Streams chunks into a temp artifact, resuming a previous partial when possible
//! - Stops at a checkpoint between chunks when paused or cancelled
//! - Renames the temp artifact to its final name on success
//!
//! Controllers see an ordered stream of events ending in exactly one
//! terminal event (`Completed`, `Cancelled` or `Failed`).
//!
//! ## Basic Usage
//!
//! ```no_run
//! use fetch_engine::{EngineConfig, TransferEngine, TransferEvent};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = TransferEngine::http(EngineConfig::default())?;
//! let request = engine.request("https://example.com/clip.mp4", "downloads");
//!
//! let handle = engine.start(request)?;
//! for event in handle.events() {
//!     if let TransferEvent::Progress(progress) = event {
//!         println!("{}%", progress.percent);
//!     }
//! }
//!
//! let report = handle.wait();
//! println!("{:?}", report.outcome);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (SourceInfo, TransferRequest, TransferState)
//! - **error**: Error types and the failure taxonomy
//! - **config**: Engine configuration
//! - **limiter**: Duration and size policy
//! - **progress**: Percentage computation
//! - **gate**: Pause/cancel coordination
//! - **events**: Events and reports sent to controllers
//! - **source**: Source traits and an in-memory source
//! - **http**: HTTP(S) resolver and source
//! - **naming**: File naming rules
//! - **fs_ops**: Low-level filesystem operations
//! - **checksums**: Checksum computation and verification
//! - **transfer**: Transfer orchestration

pub mod model;
pub mod error;
pub mod config;
pub mod limiter;
pub mod progress;
pub mod gate;
pub mod events;
pub mod source;
pub mod http;
pub mod naming;
pub mod fs_ops;
pub mod checksums;
pub mod transfer;

// Re-export main types and functions
pub use model::{
    ChecksumRequest, OutputKind, PartialPolicy, SourceInfo, TransferPhase, TransferRequest,
    TransferState,
};
pub use error::{EngineError, FailureKind};
pub use config::EngineConfig;
pub use limiter::{LimitDecision, Refusal, TransferLimiter};
pub use progress::{percent, ProgressTracker};
pub use events::{ProgressEvent, TerminalEvent, TransferEvent, TransferReport};
pub use source::{MediaSource, MemorySource, OpenedStream, SourceResolver};
pub use http::{HttpResolver, HttpSource};
pub use checksums::{verify_file, ChecksumAlgorithm, ChecksumValue};
pub use transfer::{TransferControl, TransferEngine, TransferHandle};

//! # clipforge
//!
//! Acquisition and export orchestration core for a personal audio clipping
//! utility.
//!
//! The crate drives two external tools and nothing else:
//! - a media downloader (`yt-dlp` compatible) to acquire audio from a URL
//! - a transcoder (`ffmpeg` compatible) to normalize imports and render exports
//!
//! Every operation runs in its own task, writes an append-only JSON-lines
//! session log under `<data_root>/logs/`, and can be cancelled at any time;
//! a cancelled operation always terminates its child process and never
//! publishes a result.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clipforge::{
//!     AcquisitionManager, AudioContainer, Config, EditDescriptor, ExportPipeline, ExportProfile,
//!     Outcome, PathResolver, SourceReference, Toolchain,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::with_root("/tmp/clipforge");
//!     PathResolver::new(&config.data_root).repair_layout()?;
//!     let tools = Toolchain::locate(&config)?;
//!
//!     let downloads = AcquisitionManager::new(config.clone(), tools.clone())?;
//!     let handle = downloads.start(SourceReference::parse("https://example.com/video123")?)?;
//!     let Outcome::Completed(acquired) = handle.wait().await? else {
//!         return Ok(());
//!     };
//!
//!     let edits = EditDescriptor::build(2.0, 10.0, 1.5, 1.0, 1.0, None)?;
//!     let exports = ExportPipeline::new(config.clone(), tools)?;
//!     let handle = exports.export(
//!         &acquired.file_path,
//!         edits,
//!         ExportProfile::Audio(AudioContainer::M4a),
//!         &config.data_root,
//!     )?;
//!     if let Outcome::Completed(file) = handle.wait().await? {
//!         println!("exported {}", file.file_path.display());
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Acquisition manager (download and local import)
pub mod acquisition;
/// Typed external tool command lines
pub mod command;
/// Configuration types
pub mod config;
/// Edit descriptor and its bounds
pub mod edit;
/// Error types
pub mod error;
/// Export pipeline
pub mod export;
/// Operation handles and outcomes
pub mod operation;
/// Destination paths and data-root layout
pub mod paths;
/// Supervised child processes
pub mod process;
/// Per-operation JSON-lines session logs
pub mod session_log;
/// External tool discovery
pub mod tools;
/// Core types
pub mod types;

// Re-export commonly used types
pub use acquisition::{AcquiredFile, AcquisitionManager, DownloadHandle, DownloadOutcome};
pub use command::ToolCommand;
pub use config::{Config, DownloadConfig, ExportConfig, ProcessConfig, ToolsConfig};
pub use edit::{EditDescriptor, EditParams};
pub use error::{Error, ErrorReport, Result, ValidationError};
pub use export::{ExportHandle, ExportOutcome, ExportPipeline, ExportedFile};
pub use operation::{OperationHandle, OperationState, Outcome};
pub use paths::{PathResolver, ResolvedPath};
pub use process::{ExitResult, LogTap, ProcessRunner};
pub use session_log::{LogEvent, SessionLog, read_events};
pub use tools::{ToolVersions, Toolchain};
pub use types::{
    AcquisitionState, AudioContainer, Event, ExportProfile, ExportState, Operation,
    OperationKind, OutputStream, SessionId, SourceReference, Stage, Status,
};

//! Mirrorbox workspace engine.
//!
//! Keeps an in-memory mirror (flat map plus persistent tree) of a sandboxed
//! workspace consistent while assistant-proposed actions are applied to it,
//! and streams the output of the one command allowed to run at a time.

pub mod bridge;
pub mod config;
pub mod error;
pub mod executor;
pub mod process;
pub mod sandbox;
pub mod summary;
pub mod tree;
pub mod workspace;

pub use bridge::RuntimeBridge;
pub use config::EngineConfig;
pub use error::{BootError, EngineError, EngineResult};
pub use executor::{ActionExecutor, ActionObserver, BatchReport, NoopObserver, Snapshot};
pub use process::{ProcessOutcome, ProcessStream};
pub use summary::WorkspaceSummaryBuilder;
pub use tree::{DirectoryNode, FileNode, TreeError, TreeNode, VirtualTree};
pub use workspace::WorkspaceMap;

pub use mirrorbox_protocol as protocol;

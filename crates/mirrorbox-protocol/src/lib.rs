//! Wire types for the mirrorbox workspace engine.
//!
//! These types cross the boundary between the engine and the layers around
//! it: the assistant that proposes actions, and the UI that renders action
//! status, terminal output and runtime events.

pub mod actions;
pub mod events;
pub mod summary;

pub use actions::{
    Action, ActionRecord, ActionStatus, ActionValidationError, AssistantResponse, parse_actions,
};
pub use events::{SandboxEvent, WorkspaceStatus};
pub use summary::{FileSummary, ProjectSummary};

//! Assistant action types.
//!
//! An assistant turn produces an ordered list of actions. The list arrives as
//! untrusted JSON, so every entry is validated on its own: a malformed entry
//! is rejected without affecting its neighbours.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ============================================================================
// Actions
// ============================================================================

/// One assistant-proposed mutation of the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    /// Write `content` to `path`, creating parent directories as needed.
    CreateOrUpdateFile { path: String, content: String },

    /// Recursively delete `path`.
    DeletePath { path: String },

    /// Run `command` through the sandbox shell.
    RunCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
}

impl Action {
    pub const CREATE_OR_UPDATE_FILE: &'static str = "createOrUpdateFile";
    pub const DELETE_PATH: &'static str = "deletePath";
    pub const RUN_COMMAND: &'static str = "runCommand";

    /// Convenience constructor for a file write.
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::CreateOrUpdateFile {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Convenience constructor for a delete.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::DeletePath { path: path.into() }
    }

    /// Convenience constructor for a command without a working directory.
    pub fn run(command: impl Into<String>) -> Self {
        Self::RunCommand {
            command: command.into(),
            cwd: None,
        }
    }

    /// The wire name of this action's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::CreateOrUpdateFile { .. } => Self::CREATE_OR_UPDATE_FILE,
            Action::DeletePath { .. } => Self::DELETE_PATH,
            Action::RunCommand { .. } => Self::RUN_COMMAND,
        }
    }

    /// The path or command this action targets, for display.
    pub fn target(&self) -> &str {
        match self {
            Action::CreateOrUpdateFile { path, .. } | Action::DeletePath { path } => path,
            Action::RunCommand { command, .. } => command,
        }
    }

    /// Parse and validate a single untrusted JSON entry.
    pub fn from_value(value: &Value) -> Result<Self, ActionValidationError> {
        let obj = value.as_object().ok_or(ActionValidationError::NotAnObject)?;
        let kind = match obj.get("type") {
            None | Some(Value::Null) => return Err(ActionValidationError::MissingType),
            Some(Value::String(kind)) => kind.as_str(),
            Some(_) => {
                return Err(ActionValidationError::WrongFieldType {
                    kind: "action".to_string(),
                    field: "type",
                })
            }
        };

        let action = match kind {
            Self::CREATE_OR_UPDATE_FILE => Action::CreateOrUpdateFile {
                path: required_str(obj, kind, "path")?,
                content: required_str(obj, kind, "content")?,
            },
            Self::DELETE_PATH => Action::DeletePath {
                path: required_str(obj, kind, "path")?,
            },
            Self::RUN_COMMAND => Action::RunCommand {
                command: required_str(obj, kind, "command")?,
                cwd: optional_str(obj, kind, "cwd")?,
            },
            other => return Err(ActionValidationError::UnknownType(other.to_string())),
        };

        action.validate()?;
        Ok(action)
    }

    /// Check the fields that must be non-empty.
    ///
    /// File content may be empty; paths and commands may not.
    pub fn validate(&self) -> Result<(), ActionValidationError> {
        let (field, value) = match self {
            Action::CreateOrUpdateFile { path, .. } | Action::DeletePath { path } => ("path", path),
            Action::RunCommand { command, .. } => ("command", command),
        };
        if value.trim().is_empty() {
            return Err(ActionValidationError::EmptyField {
                kind: self.kind().to_string(),
                field,
            });
        }
        Ok(())
    }
}

fn required_str(
    obj: &Map<String, Value>,
    kind: &str,
    field: &'static str,
) -> Result<String, ActionValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ActionValidationError::MissingField {
            kind: kind.to_string(),
            field,
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ActionValidationError::WrongFieldType {
            kind: kind.to_string(),
            field,
        }),
    }
}

fn optional_str(
    obj: &Map<String, Value>,
    kind: &str,
    field: &'static str,
) -> Result<Option<String>, ActionValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ActionValidationError::WrongFieldType {
            kind: kind.to_string(),
            field,
        }),
    }
}

/// Parse every entry of an untrusted action list independently.
pub fn parse_actions(values: &[Value]) -> Vec<Result<Action, ActionValidationError>> {
    values.iter().map(Action::from_value).collect()
}

/// Structural problems with a submitted action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionValidationError {
    #[error("action must be a JSON object")]
    NotAnObject,

    #[error("action is missing its \"type\" field")]
    MissingType,

    #[error("unknown action type \"{0}\"")]
    UnknownType(String),

    #[error("{kind} action is missing required field \"{field}\"")]
    MissingField { kind: String, field: &'static str },

    #[error("{kind} action field \"{field}\" must be a string")]
    WrongFieldType { kind: String, field: &'static str },

    #[error("{kind} action field \"{field}\" must not be empty")]
    EmptyField { kind: String, field: &'static str },
}

// ============================================================================
// Execution records
// ============================================================================

/// Execution status of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Success,
    Error,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ActionStatus::Pending)
    }

    pub fn label(self) -> &'static str {
        match self {
            ActionStatus::Pending => "Pending",
            ActionStatus::Success => "Success",
            ActionStatus::Error => "Error",
        }
    }
}

/// An action together with the state the executor attached to it.
///
/// `action` is `None` when the submitted entry failed validation and never
/// became a typed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    /// Position in the submitted batch.
    pub index: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    pub status: ActionStatus,

    /// Human-readable outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Captured terminal output, for commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ActionRecord {
    /// A fresh record in the `pending` state.
    pub fn pending(index: usize, action: Action) -> Self {
        Self {
            index,
            action: Some(action),
            status: ActionStatus::Pending,
            message: None,
            output: None,
            exit_code: None,
        }
    }

    /// A `pending` record for an entry that never became a typed action.
    pub fn unparsed(index: usize) -> Self {
        Self {
            index,
            action: None,
            status: ActionStatus::Pending,
            message: None,
            output: None,
            exit_code: None,
        }
    }

    /// A terminal record for an entry that failed validation.
    pub fn rejected(index: usize, err: &ActionValidationError) -> Self {
        Self::unparsed(index).fail(format!("invalid action: {err}"))
    }

    pub fn succeed(mut self, message: impl Into<String>) -> Self {
        self.status = ActionStatus::Success;
        self.message = Some(message.into());
        self
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.status = ActionStatus::Error;
        self.message = Some(message.into());
        self
    }

    /// Kind label for display (`invalid` for rejected entries).
    pub fn kind(&self) -> &'static str {
        self.action.as_ref().map(Action::kind).unwrap_or("invalid")
    }

    /// Target label for display.
    pub fn target(&self) -> &str {
        self.action.as_ref().map(Action::target).unwrap_or("")
    }
}

// ============================================================================
// Assistant response envelope
// ============================================================================

/// The structured reply produced by one assistant turn.
///
/// Actions are kept as raw JSON so each entry can be validated on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantResponse {
    #[serde(default)]
    pub reply: String,

    #[serde(default)]
    pub actions: Vec<Value>,
}

impl AssistantResponse {
    /// Accept either a bare action array or a `{reply, actions}` object.
    pub fn from_value(value: Value) -> Result<Self, ActionValidationError> {
        match value {
            Value::Array(actions) => Ok(Self {
                reply: String::new(),
                actions,
            }),
            Value::Object(_) => {
                serde_json::from_value(value).map_err(|_| ActionValidationError::NotAnObject)
            }
            _ => Err(ActionValidationError::NotAnObject),
        }
    }
}

//! Listener declarations and filter matching.
//!
//! A listener is declared once per drive and persisted inside the drive's
//! local-scope state; the in-memory cursors of the sync subsystem are rebuilt
//! from these declarations on startup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::types::{DocumentId, DriveId, ListenerId, Scope};

/// The wildcard entry accepted in every filter field.
pub const FILTER_WILDCARD: &str = "*";

/// Closed set of delivery strategies a listener can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransmitterType {
    /// In-process callback delivery.
    Internal,
    /// Remote mutation call per update batch.
    Push,
    /// Request/acknowledge surface polled by a remote client.
    PullResponder,
}

impl TransmitterType {
    /// The canonical tag string.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransmitterType::Internal => "Internal",
            TransmitterType::Push => "Push",
            TransmitterType::PullResponder => "PullResponder",
        }
    }
}

impl fmt::Display for TransmitterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransmitterType {
    type Err = CoreError;

    /// Unknown tags are a configuration error, never a silent no-transmitter.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Internal" => Ok(TransmitterType::Internal),
            "Push" => Ok(TransmitterType::Push),
            "PullResponder" => Ok(TransmitterType::PullResponder),
            other => Err(CoreError::Validation(format!(
                "unknown transmitter type: {other}"
            ))),
        }
    }
}

/// How to reach the transmitter bound to a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInfo {
    /// Which transmitter to instantiate.
    pub transmitter_type: TransmitterType,
    /// Human-readable name of the target.
    pub name: String,
    /// Target address (endpoint URL for push, opaque otherwise).
    pub data: String,
}

impl CallInfo {
    /// Call info for an in-process listener.
    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            transmitter_type: TransmitterType::Internal,
            name: name.into(),
            data: String::new(),
        }
    }

    /// Call info for a remote push target.
    pub fn push(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            transmitter_type: TransmitterType::Push,
            name: name.into(),
            data: address.into(),
        }
    }

    /// Call info for a pull responder.
    pub fn pull_responder(name: impl Into<String>) -> Self {
        Self {
            transmitter_type: TransmitterType::PullResponder,
            name: name.into(),
            data: String::new(),
        }
    }
}

/// Which synchronization units a listener is interested in.
///
/// Each field is a list of accepted values: an empty list matches anything,
/// and so does a list containing `"*"`. Non-empty fields combine with
/// logical AND; values within a field with logical OR.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListenerFilter {
    pub branch: Vec<String>,
    pub document_id: Vec<String>,
    pub document_type: Vec<String>,
    pub scope: Vec<String>,
}

impl ListenerFilter {
    /// A filter matching every unit.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given scopes.
    pub fn with_scopes<I: IntoIterator<Item = Scope>>(mut self, scopes: I) -> Self {
        self.scope = scopes.into_iter().map(|s| s.as_str().to_string()).collect();
        self
    }

    /// Restrict to the given document ids (`"*"` allowed).
    pub fn with_document_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_id = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the given document types.
    pub fn with_document_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_type = types.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the given branches.
    pub fn with_branches<I, S>(mut self, branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branch = branches.into_iter().map(Into::into).collect();
        self
    }

    /// Evaluate the filter against one unit's coordinates.
    pub fn matches(
        &self,
        document_id: &DocumentId,
        document_type: &str,
        scope: Scope,
        branch: &str,
    ) -> bool {
        field_matches(&self.branch, branch)
            && field_matches(&self.document_id, document_id.as_str())
            && field_matches(&self.document_type, document_type)
            && field_matches(&self.scope, scope.as_str())
    }
}

/// Tri-state per field: unset (matches all), wildcard, or explicit set.
fn field_matches(values: &[String], value: &str) -> bool {
    values.is_empty() || values.iter().any(|v| v == FILTER_WILDCARD || v == value)
}

/// A registered consumer of synchronization units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    /// Unique listener identifier.
    pub id: ListenerId,

    /// The drive this listener is registered on.
    pub drive_id: DriveId,

    /// Human-readable label.
    pub label: String,

    /// Whether the listener was installed by the system rather than a user.
    pub system: bool,

    /// Blocking listeners are triggered synchronously on the write path,
    /// before the write returns; non-blocking ones are served by the loop.
    pub block: bool,

    /// Unit selection.
    pub filter: ListenerFilter,

    /// Transmitter binding.
    pub call_info: CallInfo,
}

//! The drive document model.
//!
//! A drive is itself a document: its global scope holds the listing of child
//! document nodes, its local scope holds registered listener declarations.
//! Drive mutations flow through the same append engine as any other
//! document, interpreted by the built-in [`DriveReducer`].

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::listener::Listener;
use crate::operation::Operation;
use crate::reducer::{Reducer, ReducerError, Signal};
use crate::types::{DocumentId, DriveId, ListenerId, Scope};

/// The fixed document type of drives.
pub const DRIVE_DOCUMENT_TYPE: &str = "driveline/drive";

/// One entry in a drive's listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    /// A child document reference. One synchronization unit exists per scope
    /// of every file node.
    File {
        id: DocumentId,
        name: String,
        document_type: String,
        parent: Option<String>,
    },
    /// Pure structure; folders carry no operation logs of their own.
    Folder {
        id: String,
        name: String,
        parent: Option<String>,
    },
}

impl Node {
    /// The node's identifier, file or folder.
    pub fn id(&self) -> &str {
        match self {
            Node::File { id, .. } => id.as_str(),
            Node::Folder { id, .. } => id,
        }
    }

    /// The parent folder id, if any.
    pub fn parent(&self) -> Option<&str> {
        match self {
            Node::File { parent, .. } | Node::Folder { parent, .. } => parent.as_deref(),
        }
    }
}

/// Global-scope state of a drive: the node listing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriveState {
    pub name: String,
    pub icon: Option<String>,
    pub nodes: Vec<Node>,
}

impl DriveState {
    /// File nodes only, in listing order.
    pub fn file_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| matches!(n, Node::File { .. }))
    }
}

/// Local-scope state of a drive: persisted listener declarations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriveLocalState {
    pub listeners: Vec<Listener>,
}

/// Create an empty drive document.
pub fn new_drive(id: &DriveId, name: impl Into<String>, now: i64) -> Document {
    let mut document = Document::new(
        DocumentId::new(id.as_str()),
        DRIVE_DOCUMENT_TYPE,
        serde_json::Value::Null,
        now,
    );
    let global = serde_json::to_value(DriveState {
        name: name.into(),
        icon: None,
        nodes: Vec::new(),
    })
    .expect("drive state serializes");
    let local =
        serde_json::to_value(DriveLocalState::default()).expect("drive local state serializes");
    for (scope, value) in [(Scope::Global, global), (Scope::Local, local)] {
        document.initial_state.insert(scope, value.clone());
        document.state.insert(scope, value);
    }
    document
}

/// Parse a drive document's node listing.
pub fn drive_state(document: &Document) -> Result<DriveState, ReducerError> {
    serde_json::from_value(document.state(Scope::Global).clone())
        .map_err(|e| ReducerError::new(format!("malformed drive state: {e}")))
}

/// Parse a drive document's persisted listener declarations.
pub fn drive_listeners(document: &Document) -> Result<Vec<Listener>, ReducerError> {
    let local: DriveLocalState = serde_json::from_value(document.state(Scope::Local).clone())
        .map_err(|e| ReducerError::new(format!("malformed drive local state: {e}")))?;
    Ok(local.listeners)
}

// ─────────────────────────────────────────────────────────────────────────
// Drive operations
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddFileInput {
    id: DocumentId,
    name: String,
    document_type: String,
    parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddFolderInput {
    id: String,
    name: String,
    parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeleteNodeInput {
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CopyFileInput {
    source_id: DocumentId,
    target_id: DocumentId,
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddListenerInput {
    listener: Listener,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoveListenerInput {
    listener_id: ListenerId,
}

/// Builders for drive operations.
///
/// Indices must still be assigned against the drive's current revision by
/// the caller; these only fill kind, input and scope.
pub mod ops {
    use super::*;
    use serde_json::json;

    fn op(index: u64, kind: &str, input: serde_json::Value, scope: Scope, now: i64) -> Operation {
        Operation::new(index, kind, input, scope, now)
    }

    pub fn add_file(
        index: u64,
        id: &DocumentId,
        name: &str,
        document_type: &str,
        parent: Option<&str>,
        now: i64,
    ) -> Operation {
        op(
            index,
            "ADD_FILE",
            json!({
                "id": id,
                "name": name,
                "document_type": document_type,
                "parent": parent,
            }),
            Scope::Global,
            now,
        )
    }

    pub fn add_folder(index: u64, id: &str, name: &str, parent: Option<&str>, now: i64) -> Operation {
        op(
            index,
            "ADD_FOLDER",
            json!({ "id": id, "name": name, "parent": parent }),
            Scope::Global,
            now,
        )
    }

    pub fn delete_node(index: u64, id: &str, now: i64) -> Operation {
        op(index, "DELETE_NODE", json!({ "id": id }), Scope::Global, now)
    }

    pub fn copy_file(
        index: u64,
        source_id: &DocumentId,
        target_id: &DocumentId,
        name: &str,
        now: i64,
    ) -> Operation {
        op(
            index,
            "COPY_FILE",
            json!({ "source_id": source_id, "target_id": target_id, "name": name }),
            Scope::Global,
            now,
        )
    }

    pub fn add_listener(index: u64, listener: &Listener, now: i64) -> Operation {
        op(
            index,
            "ADD_LISTENER",
            json!({ "listener": listener }),
            Scope::Local,
            now,
        )
    }

    pub fn remove_listener(index: u64, listener_id: &ListenerId, now: i64) -> Operation {
        op(
            index,
            "REMOVE_LISTENER",
            json!({ "listener_id": listener_id }),
            Scope::Local,
            now,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Reducer
// ─────────────────────────────────────────────────────────────────────────

/// Built-in reducer for drive documents.
pub struct DriveReducer;

impl Reducer for DriveReducer {
    fn apply(
        &self,
        state: &serde_json::Value,
        operation: &Operation,
    ) -> Result<(serde_json::Value, Vec<Signal>), ReducerError> {
        match operation.scope {
            Scope::Global => apply_global(state, operation),
            Scope::Local => apply_local(state, operation),
        }
    }
}

fn parse_input<T: serde::de::DeserializeOwned>(operation: &Operation) -> Result<T, ReducerError> {
    serde_json::from_value(operation.input.clone())
        .map_err(|e| ReducerError::new(format!("malformed {} input: {e}", operation.kind)))
}

fn apply_global(
    state: &serde_json::Value,
    operation: &Operation,
) -> Result<(serde_json::Value, Vec<Signal>), ReducerError> {
    let mut drive: DriveState = serde_json::from_value(state.clone())
        .map_err(|e| ReducerError::new(format!("malformed drive state: {e}")))?;
    let mut signals = Vec::new();

    match operation.kind.as_str() {
        "ADD_FILE" => {
            let input: AddFileInput = parse_input(operation)?;
            if drive.nodes.iter().any(|n| n.id() == input.id.as_str()) {
                return Err(ReducerError::new(format!(
                    "node already exists: {}",
                    input.id
                )));
            }
            signals.push(Signal::CreateChildDocument {
                id: input.id.clone(),
                document_type: input.document_type.clone(),
                document: None,
            });
            drive.nodes.push(Node::File {
                id: input.id,
                name: input.name,
                document_type: input.document_type,
                parent: input.parent,
            });
        }
        "ADD_FOLDER" => {
            let input: AddFolderInput = parse_input(operation)?;
            if drive.nodes.iter().any(|n| n.id() == input.id) {
                return Err(ReducerError::new(format!(
                    "node already exists: {}",
                    input.id
                )));
            }
            drive.nodes.push(Node::Folder {
                id: input.id,
                name: input.name,
                parent: input.parent,
            });
        }
        "DELETE_NODE" => {
            let input: DeleteNodeInput = parse_input(operation)?;
            if !drive.nodes.iter().any(|n| n.id() == input.id) {
                return Err(ReducerError::new(format!("node not found: {}", input.id)));
            }
            for node in remove_subtree(&mut drive.nodes, &input.id) {
                if let Node::File { id, .. } = node {
                    signals.push(Signal::DeleteChildDocument { id });
                }
            }
        }
        "COPY_FILE" => {
            let input: CopyFileInput = parse_input(operation)?;
            let source = drive
                .nodes
                .iter()
                .find_map(|n| match n {
                    Node::File {
                        id, document_type, ..
                    } if id == &input.source_id => Some(document_type.clone()),
                    _ => None,
                })
                .ok_or_else(|| {
                    ReducerError::new(format!("source file not found: {}", input.source_id))
                })?;
            if drive.nodes.iter().any(|n| n.id() == input.target_id.as_str()) {
                return Err(ReducerError::new(format!(
                    "node already exists: {}",
                    input.target_id
                )));
            }
            signals.push(Signal::CopyChildDocument {
                source_id: input.source_id,
                target_id: input.target_id.clone(),
            });
            drive.nodes.push(Node::File {
                id: input.target_id,
                name: input.name,
                document_type: source,
                parent: None,
            });
        }
        other => {
            return Err(ReducerError::new(format!(
                "unknown drive operation: {other}"
            )))
        }
    }

    let next = serde_json::to_value(drive)
        .map_err(|e| ReducerError::new(format!("drive state serialization: {e}")))?;
    Ok((next, signals))
}

/// Remove a node and all its descendants, returning the removed nodes.
fn remove_subtree(nodes: &mut Vec<Node>, root: &str) -> Vec<Node> {
    let mut doomed: Vec<String> = vec![root.to_string()];
    let mut i = 0;
    while i < doomed.len() {
        let parent = doomed[i].clone();
        for node in nodes.iter() {
            if node.parent() == Some(parent.as_str()) {
                doomed.push(node.id().to_string());
            }
        }
        i += 1;
    }

    let mut removed = Vec::new();
    nodes.retain(|node| {
        if doomed.iter().any(|id| id == node.id()) {
            removed.push(node.clone());
            false
        } else {
            true
        }
    });
    removed
}

fn apply_local(
    state: &serde_json::Value,
    operation: &Operation,
) -> Result<(serde_json::Value, Vec<Signal>), ReducerError> {
    let mut local: DriveLocalState = serde_json::from_value(state.clone())
        .map_err(|e| ReducerError::new(format!("malformed drive local state: {e}")))?;

    match operation.kind.as_str() {
        "ADD_LISTENER" => {
            let input: AddListenerInput = parse_input(operation)?;
            if local.listeners.iter().any(|l| l.id == input.listener.id) {
                return Err(ReducerError::new(format!(
                    "listener already registered: {}",
                    input.listener.id
                )));
            }
            local.listeners.push(input.listener);
        }
        "REMOVE_LISTENER" => {
            let input: RemoveListenerInput = parse_input(operation)?;
            local.listeners.retain(|l| l.id != input.listener_id);
        }
        other => {
            return Err(ReducerError::new(format!(
                "unknown drive operation: {other}"
            )))
        }
    }

    let next = serde_json::to_value(local)
        .map_err(|e| ReducerError::new(format!("drive local state serialization: {e}")))?;
    Ok((next, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::{apply_operations, AppendStatus};
    use crate::listener::{CallInfo, ListenerFilter};

    fn drive() -> Document {
        new_drive(&DriveId::new("drive-1"), "Test Drive", 1000)
    }

    #[test]
    fn test_add_file_emits_create_signal() {
        let mut document = drive();
        let op = ops::add_file(0, &"doc-1".into(), "Doc 1", "test/counter", None, 1000);

        let outcome = apply_operations(&mut document, &DriveReducer, &[op]).unwrap();
        assert_eq!(outcome.status, AppendStatus::Success);
        assert_eq!(outcome.signals.len(), 1);
        assert!(matches!(
            &outcome.signals[0],
            Signal::CreateChildDocument { id, .. } if id.as_str() == "doc-1"
        ));

        let state = drive_state(&document).unwrap();
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.file_nodes().count(), 1);
    }

    #[test]
    fn test_delete_folder_cascades_to_files() {
        let mut document = drive();
        let batch = vec![
            ops::add_folder(0, "f1", "Folder", None, 1000),
            ops::add_file(1, &"doc-1".into(), "Doc 1", "test/counter", Some("f1"), 1000),
            ops::add_file(2, &"doc-2".into(), "Doc 2", "test/counter", None, 1000),
            ops::delete_node(3, "f1", 1000),
        ];

        let outcome = apply_operations(&mut document, &DriveReducer, &batch).unwrap();
        assert_eq!(outcome.status, AppendStatus::Success);

        let deletes: Vec<_> = outcome
            .signals
            .iter()
            .filter(|s| matches!(s, Signal::DeleteChildDocument { .. }))
            .collect();
        assert_eq!(deletes.len(), 1);

        let state = drive_state(&document).unwrap();
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.nodes[0].id(), "doc-2");
    }

    #[test]
    fn test_copy_file_signal_and_node() {
        let mut document = drive();
        let batch = vec![
            ops::add_file(0, &"src".into(), "Src", "test/counter", None, 1000),
            ops::copy_file(1, &"src".into(), &"dst".into(), "Copy", 1000),
        ];

        let outcome = apply_operations(&mut document, &DriveReducer, &batch).unwrap();
        assert_eq!(outcome.status, AppendStatus::Success);
        assert!(matches!(
            outcome.signals.last().unwrap(),
            Signal::CopyChildDocument { target_id, .. } if target_id.as_str() == "dst"
        ));
        assert_eq!(drive_state(&document).unwrap().nodes.len(), 2);
    }

    #[test]
    fn test_listener_persistence_roundtrip() {
        let mut document = drive();
        let listener = Listener {
            id: "listener-1".into(),
            drive_id: "drive-1".into(),
            label: "test".into(),
            system: false,
            block: false,
            filter: ListenerFilter::all(),
            call_info: CallInfo::internal("test"),
        };

        let add = ops::add_listener(0, &listener, 1000);
        apply_operations(&mut document, &DriveReducer, &[add]).unwrap();
        assert_eq!(drive_listeners(&document).unwrap(), vec![listener.clone()]);

        let remove = ops::remove_listener(1, &listener.id, 1001);
        apply_operations(&mut document, &DriveReducer, &[remove]).unwrap();
        assert!(drive_listeners(&document).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_node_is_reducer_error() {
        let mut document = drive();
        let batch = vec![
            ops::add_file(0, &"doc-1".into(), "A", "t", None, 1000),
            ops::add_file(1, &"doc-1".into(), "B", "t", None, 1000),
        ];

        let outcome = apply_operations(&mut document, &DriveReducer, &batch).unwrap();
        assert_eq!(outcome.status, AppendStatus::Error);
        assert_eq!(outcome.operations.len(), 1);
    }
}

//! Document data model
//!
//! Documents are value types: every change produces a new value, and the
//! collection holding them is swapped as a whole. Field names follow the
//! repository wire format (camelCase).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

/// Meta block type that carries deliverable links
pub const ASSIGNMENT_BLOCK_TYPE: &str = "core/assignment";

/// Link relation naming a child document owned by an assignment
pub const DELIVERABLE_REL: &str = "deliverable";

/// Updater subject used when the server omits metadata
pub const UNKNOWN_UPDATER: &str = "??";

/// A structured block nested inside a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Block {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub block_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rel: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub contenttype: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Block>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Block>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Block>,
}

/// A repository document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    pub uuid: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub language: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Block>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Block>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Block>,
}

impl Document {
    /// Uuids of every deliverable linked from this document's assignments.
    pub fn deliverable_uuids(&self) -> impl Iterator<Item = &str> {
        self.meta
            .iter()
            .filter(|block| block.block_type == ASSIGNMENT_BLOCK_TYPE)
            .flat_map(|block| block.links.iter())
            .filter(|link| link.rel == DELIVERABLE_REL)
            .map(|link| link.uuid.as_str())
    }

    /// Whether this document owns `uuid` through a deliverable link.
    pub fn has_deliverable(&self, uuid: &str) -> bool {
        self.deliverable_uuids().any(|candidate| candidate == uuid)
    }
}

/// Version metadata attached to a document state by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StateMeta {
    pub updater_uri: String,
    pub modified: String,
}

/// One versioned snapshot of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    pub document: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<StateMeta>,
}

/// A child document attached to a parent via a deliverable link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludedDocument {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DocumentState>,
}

/// Provenance stamp shown next to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Updater {
    pub sub: String,
    pub time: String,
}

impl Updater {
    /// Derive the stamp from server metadata, filling gaps with `"??"` and now.
    pub fn from_meta(meta: Option<&StateMeta>) -> Self {
        let sub = meta
            .map(|m| m.updater_uri.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_UPDATER)
            .to_string();
        let time = meta
            .map(|m| m.modified.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
        Self { sub, time }
    }
}

/// A document state plus the client-side data attached to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoratedDocument {
    pub document: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<StateMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_documents: Vec<IncludedDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decorator_data: Option<serde_json::Value>,
    #[serde(rename = "__updater", default, skip_serializing_if = "Option::is_none")]
    pub updater: Option<Updater>,
}

impl DecoratedDocument {
    /// Wrap a server state, computing its updater stamp.
    pub fn from_state(state: DocumentState) -> Self {
        let updater = Updater::from_meta(state.meta.as_ref());
        Self {
            document: state.document,
            meta: state.meta,
            included_documents: Vec::new(),
            decorator_data: None,
            updater: Some(updater),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.document.uuid
    }

    /// Find an attached child by uuid.
    pub fn included(&self, uuid: &str) -> Option<&IncludedDocument> {
        self.included_documents.iter().find(|inc| inc.uuid == uuid)
    }
}

/// An immutable, shared collection of documents.
///
/// Cloning is a reference count bump. Reducers return the very same
/// collection when nothing changed, so `ptr_eq` tells consumers they can
/// skip work.
#[derive(Debug, Clone, Default)]
pub struct DocumentCollection(Arc<Vec<Arc<DecoratedDocument>>>);

impl DocumentCollection {
    pub fn new(entries: Vec<Arc<DecoratedDocument>>) -> Self {
        Self(Arc::new(entries))
    }

    /// Whether both handles point at the same collection value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Index of the document with `uuid`.
    pub fn position(&self, uuid: &str) -> Option<usize> {
        self.0.iter().position(|doc| doc.uuid() == uuid)
    }

    pub fn find(&self, uuid: &str) -> Option<&Arc<DecoratedDocument>> {
        self.0.iter().find(|doc| doc.uuid() == uuid)
    }

    /// Copy of the entry handles, for building a modified collection.
    pub fn to_entries(&self) -> Vec<Arc<DecoratedDocument>> {
        self.0.as_ref().clone()
    }

    /// New collection with entry `index` replaced.
    pub fn with_replaced(&self, index: usize, entry: DecoratedDocument) -> Self {
        let mut entries = self.to_entries();
        entries[index] = Arc::new(entry);
        Self::new(entries)
    }

    /// New collection with `entry` appended.
    pub fn with_appended(&self, entry: DecoratedDocument) -> Self {
        let mut entries = self.to_entries();
        entries.push(Arc::new(entry));
        Self::new(entries)
    }
}

impl Deref for DocumentCollection {
    type Target = [Arc<DecoratedDocument>];

    fn deref(&self) -> &Self::Target {
        self.0.as_slice()
    }
}

impl FromIterator<DecoratedDocument> for DocumentCollection {
    fn from_iter<I: IntoIterator<Item = DecoratedDocument>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Arc::new).collect())
    }
}

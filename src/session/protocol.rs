//! Repository Socket Wire Protocol
//!
//! Single responsibility: Encode requests and decode response frames.
//!
//! # Wire Format
//!
//! Every frame is one MessagePack map with camelCase keys.
//!
//! ## Request
//! ```text
//! {
//!     "callId": <uuid string>,
//!     "authenticate" | "getDocuments" | "closeDocumentSet": { ... },
//! }
//! ```
//!
//! ## Response
//! ```text
//! {
//!     "callId": <uuid string>,
//!     "handled": <bool>,
//!     // at most one of:
//!     "error":          { "errorCode", "errorMessage" },
//!     "documentBatch":  { "setName", "documents": [DocumentState], "finalBatch" },
//!     "documentUpdate": { "setName", "document"?, "included", "meta"? },
//!     "removed":        { "setName", "documentUuid" },
//!     "inclusionBatch": { "setName", "documents": [{ "uuid", "state" }] },
//! }
//! ```
//!
//! The server discriminates responses by field presence only. `Frame::body`
//! turns that into a sum type once, at the edge.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{Document, DocumentState, IncludedDocument, StateMeta};
use crate::error::{Result, SyncError};

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDocumentsRequest {
    pub set_name: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseDocumentSetRequest {
    pub set_name: String,
}

/// A logical request, before it is tagged with a call id.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Authenticate(AuthenticateRequest),
    GetDocuments(GetDocumentsRequest),
    CloseDocumentSet(CloseDocumentSetRequest),
}

impl Request {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Authenticate(_) => "authenticate",
            Request::GetDocuments(_) => "getDocuments",
            Request::CloseDocumentSet(_) => "closeDocumentSet",
        }
    }
}

/// A request as it travels on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticate: Option<AuthenticateRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_documents: Option<GetDocumentsRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_document_set: Option<CloseDocumentSetRequest>,
}

impl RequestFrame {
    pub fn new(call_id: Uuid, request: Request) -> Self {
        let mut frame = RequestFrame {
            call_id: call_id.to_string(),
            ..Default::default()
        };
        match request {
            Request::Authenticate(r) => frame.authenticate = Some(r),
            Request::GetDocuments(r) => frame.get_documents = Some(r),
            Request::CloseDocumentSet(r) => frame.close_document_set = Some(r),
        }
        frame
    }

    /// The request carried by this frame, if any.
    pub fn request(&self) -> Option<Request> {
        if let Some(r) = &self.authenticate {
            return Some(Request::Authenticate(r.clone()));
        }
        if let Some(r) = &self.get_documents {
            return Some(Request::GetDocuments(r.clone()));
        }
        self.close_document_set
            .as_ref()
            .map(|r| Request::CloseDocumentSet(r.clone()))
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error_code: String,
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentBatch {
    pub set_name: String,
    pub documents: Vec<DocumentState>,
    pub final_batch: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentUpdate {
    pub set_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    pub included: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<StateMeta>,
}

impl DocumentUpdate {
    /// An update for a child document, addressed through its parent.
    pub fn is_inclusion(&self) -> bool {
        self.included
    }

    /// Uuid of the updated document, if the update carries a usable one.
    pub fn document_uuid(&self) -> Option<&str> {
        self.document
            .as_ref()
            .map(|doc| doc.uuid.as_str())
            .filter(|uuid| !uuid.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentRemoved {
    pub set_name: String,
    pub document_uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InclusionBatch {
    pub set_name: String,
    pub documents: Vec<IncludedDocument>,
}

/// A response frame exactly as the server sends it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub handled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_batch: Option<DocumentBatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_update: Option<DocumentUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<DocumentRemoved>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inclusion_batch: Option<InclusionBatch>,
}

/// What a response frame carries.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Error(ErrorPayload),
    DocumentBatch(DocumentBatch),
    Push(PushEvent),
    /// Only the `handled` flag
    Ack,
}

/// A live change pushed for an open document set.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Removed(DocumentRemoved),
    InclusionBatch(InclusionBatch),
    DocumentUpdate(DocumentUpdate),
}

impl PushEvent {
    pub fn set_name(&self) -> &str {
        match self {
            PushEvent::Removed(r) => &r.set_name,
            PushEvent::InclusionBatch(b) => &b.set_name,
            PushEvent::DocumentUpdate(u) => &u.set_name,
        }
    }
}

impl Frame {
    /// The call id, if present and well formed.
    pub fn call_uuid(&self) -> Option<Uuid> {
        self.call_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    /// Classify the frame. Precedence: error, batch, removal, inclusion
    /// batch, update.
    pub fn into_body(self) -> FrameBody {
        if let Some(error) = self.error {
            return FrameBody::Error(error);
        }
        if let Some(batch) = self.document_batch {
            return FrameBody::DocumentBatch(batch);
        }
        if let Some(removed) = self.removed {
            return FrameBody::Push(PushEvent::Removed(removed));
        }
        if let Some(batch) = self.inclusion_batch {
            return FrameBody::Push(PushEvent::InclusionBatch(batch));
        }
        if let Some(update) = self.document_update {
            return FrameBody::Push(PushEvent::DocumentUpdate(update));
        }
        FrameBody::Ack
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Encode any frame into its binary wire form.
pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(frame)?)
}

/// Decode a binary frame.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(SyncError::from)
}

/// Encode a request tagged with `call_id`.
pub fn encode_request(call_id: Uuid, request: Request) -> Result<Vec<u8>> {
    encode(&RequestFrame::new(call_id, request))
}

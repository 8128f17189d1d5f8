//! Repository socket session
//!
//! One persistent binary socket carries every logical call and every live
//! document-set subscription.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          SyncSession                          │
//! │  connect / authenticate / get_documents / close_document_set  │
//! │  - connect gate, generation per socket, reconnect loop        │
//! └───────────────────────────────────────────────────────────────┘
//!                 │                               │
//!        ┌────────▼────────┐             ┌────────▼────────┐
//!        │   Correlator    │             │    Transport    │
//!        │ callId → call   │◄── frames ──│  (Connector)    │
//!        │ callId → subs   │             │  WsConnector    │
//!        └─────────────────┘             └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | `protocol` | MessagePack frame types and codec |
//! | `transport` | WebSocket connect and frame pump |
//! | `backoff` | Reconnect delay policy |
//! | `repository` | One-time socket token source |
//! | `correlator` | Pending calls and subscriptions by call id |
//! | `client` | The session itself |

pub mod backoff;
pub mod client;
pub mod correlator;
pub mod protocol;
pub mod repository;
pub mod transport;

pub use backoff::{Backoff, BackoffPolicy};
pub use client::{
    ConnectionState, DocumentSet, GetDocumentsParams, SessionConfig, Subscription, SyncSession,
};
pub use correlator::{Correlator, UpdateCallback};
pub use protocol::{DocumentRemoved, DocumentUpdate, Frame, InclusionBatch, PushEvent, Request};
pub use repository::{HttpTokenSource, SocketTokenSource};
pub use transport::{Connector, Outgoing, Transport, TransportEvent, TransportPeer, WsConnector};

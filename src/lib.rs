//! Editorial Sync - Realtime document synchronization client
//!
//! Keeps a live working set of repository documents in sync over one
//! persistent binary socket.
//!
//! ## Architecture
//!
//! - **Session**: Owns the socket, authenticates it, reconnects it
//! - **Correlator**: Multiplexes calls and subscriptions by call id
//! - **Reducer**: Pure functions folding push events into a collection
//! - **Decorators**: Debounced background enrichment of updated documents
//!
//! ## Data Flow
//!
//! ```text
//! repository ──frames──► SyncSession ──► Correlator ──► on_update
//!                                                          │
//!                               reducer::apply_push_event ◄┘
//!                                          │
//!                          SharedCollection ◄── DecoratorScheduler
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use editorial_sync::{GetDocumentsParams, HttpTokenSource, LiveDocuments, LiveOptions};
//! use editorial_sync::{SyncConfig, SyncSession, WsConnector};
//!
//! # async fn run() -> editorial_sync::Result<()> {
//! let config = SyncConfig::default();
//! let tokens = HttpTokenSource::new(
//!     &config.session.repository_url,
//!     &config.session.token_path,
//!     config.connect_timeout(),
//! )?;
//! let session = SyncSession::new(
//!     config.to_session_config(),
//!     Arc::new(tokens),
//!     Arc::new(WsConnector::new(config.connect_timeout())),
//! );
//!
//! session.connect("access-token").await?;
//! session.authenticate().await?;
//!
//! let live = LiveDocuments::open(
//!     &session,
//!     GetDocumentsParams::new("planning", "core/planning-item"),
//!     LiveOptions::default(),
//! )
//! .await?;
//! println!("{} documents", live.documents().len());
//! live.close().await?;
//! session.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decorator;
pub mod document;
pub mod error;
pub mod live;
pub mod reducer;
pub mod session;
pub mod store;

// Re-exports
pub use config::SyncConfig;
pub use decorator::{Decorator, DecoratorRunner, DecoratorScheduler, UpdateDecorators};
pub use document::{
    Block, DecoratedDocument, Document, DocumentCollection, DocumentState, IncludedDocument,
    StateMeta, Updater,
};
pub use error::{Result, SyncError};
pub use live::{LiveDocuments, LiveOptions};
pub use reducer::{ParentResolver, UpdateScheduler};
pub use session::{
    ConnectionState, Connector, DocumentSet, GetDocumentsParams, HttpTokenSource, PushEvent,
    SessionConfig, SocketTokenSource, Subscription, SyncSession, WsConnector,
};
pub use store::{DocumentStore, SharedCollection};

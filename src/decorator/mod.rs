//! Document decorators
//!
//! Decorators enrich a document with client-side data (word counts, status
//! summaries, lookups against other services). Results land in the entry's
//! `decoratorData`, keyed by decorator name.
//!
//! | Type | Role |
//! |------|------|
//! | [`Decorator`] | One enrichment plugin |
//! | [`UpdateDecorators`] | Runs the plugins for one updated entry |
//! | [`DecoratorRunner`] | Default runner, all plugins concurrently |
//! | [`DecoratorScheduler`] | Debounces updates and discards stale results |

mod runner;
mod scheduler;

pub use runner::DecoratorRunner;
pub use scheduler::{DecoratorScheduler, DEFAULT_DEBOUNCE};

use async_trait::async_trait;
use std::sync::Arc;

use crate::document::{DecoratedDocument, Document};
use crate::error::Result;
use crate::session::protocol::DocumentUpdate;

/// One enrichment plugin.
#[async_trait]
pub trait Decorator: Send + Sync {
    /// Key under which this decorator's output is stored
    fn name(&self) -> &str;

    async fn decorate(
        &self,
        document: &Document,
        access_token: Option<&str>,
    ) -> Result<serde_json::Value>;
}

/// Produces the enriched version of an updated entry.
#[async_trait]
pub trait UpdateDecorators: Send + Sync {
    async fn run(
        &self,
        parent: Arc<DecoratedDocument>,
        update: DocumentUpdate,
        decorators: Vec<Arc<dyn Decorator>>,
        access_token: Option<String>,
    ) -> Result<DecoratedDocument>;
}

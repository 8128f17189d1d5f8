use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Decorator, UpdateDecorators};
use crate::document::DecoratedDocument;
use crate::error::{Result, SyncError};
use crate::session::protocol::DocumentUpdate;

/// Runs every decorator concurrently on the updated document.
///
/// A failing decorator is logged and its previous output kept. The run as a
/// whole fails only when every decorator failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoratorRunner;

#[async_trait]
impl UpdateDecorators for DecoratorRunner {
    async fn run(
        &self,
        parent: Arc<DecoratedDocument>,
        _update: DocumentUpdate,
        decorators: Vec<Arc<dyn Decorator>>,
        access_token: Option<String>,
    ) -> Result<DecoratedDocument> {
        let mut next = (*parent).clone();
        if decorators.is_empty() {
            return Ok(next);
        }

        let document = &parent.document;
        let token = access_token.as_deref();
        let outputs = join_all(decorators.iter().map(|decorator| async move {
            (decorator.name().to_string(), decorator.decorate(document, token).await)
        }))
        .await;

        let mut data = match next.decorator_data.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let mut failures = 0;
        for (name, output) in outputs {
            match output {
                Ok(value) => {
                    data.insert(name, value);
                }
                Err(e) => {
                    failures += 1;
                    warn!(decorator = %name, uuid = %parent.uuid(), error = %e, "Decorator failed");
                }
            }
        }

        if failures == decorators.len() {
            return Err(SyncError::Decorator(format!(
                "All {} decorators failed for {}",
                failures,
                parent.uuid()
            )));
        }

        debug!(uuid = %parent.uuid(), keys = data.len(), "Document decorated");
        next.decorator_data = Some(Value::Object(data));
        Ok(next)
    }
}

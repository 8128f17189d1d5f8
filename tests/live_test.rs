//! Live document set tests: push events folded into the shared store,
//! decorators applied in the background.

mod common;

use async_trait::async_trait;
use common::*;
use editorial_sync::{
    Decorator, DecoratorRunner, Document, GetDocumentsParams, LiveDocuments, LiveOptions, Result,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts the words of the title.
#[derive(Default)]
struct TitleWords {
    runs: AtomicUsize,
}

#[async_trait]
impl Decorator for TitleWords {
    fn name(&self) -> &str {
        "titleWords"
    }

    async fn decorate(&self, document: &Document, access_token: Option<&str>) -> Result<Value> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        assert_eq!(access_token, Some(ACCESS_TOKEN));
        Ok(json!(document.title.split_whitespace().count()))
    }
}

async fn open_live(
    h: &Harness,
    server: &mut Server,
    decorator: Arc<TitleWords>,
) -> (LiveDocuments, String) {
    let session = h.session.clone();
    let options = LiveOptions {
        decorators: vec![decorator as Arc<dyn Decorator>],
        runner: Arc::new(DecoratorRunner),
        debounce: Duration::from_millis(20),
    };
    let open = tokio::spawn(async move {
        LiveDocuments::open(
            &session,
            GetDocumentsParams::new("planning", "core/planning-item"),
            options,
        )
        .await
    });

    let request = server.next_request().await;
    server.send(batch(
        &request.call_id,
        "planning",
        vec![state("a", "First draft"), state("b", "Second")],
        true,
    ));
    (within(open).await.unwrap().unwrap(), request.call_id)
}

#[tokio::test]
async fn test_push_events_update_store() {
    let mut h = harness();
    let mut server = h.authenticated().await;
    let (live, call_id) = open_live(&h, &mut server, Arc::new(TitleWords::default())).await;

    assert_eq!(live.documents().len(), 2);
    let mut changes = live.subscribe();

    server.send(removed(&call_id, "planning", "b"));
    within(changes.changed()).await.unwrap();
    let docs = changes.borrow_and_update().clone();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].uuid(), "a");

    server.send(updated(&call_id, "planning", state("c", "Brand new")));
    within(changes.changed()).await.unwrap();
    assert_eq!(live.documents().len(), 2);
    assert_eq!(live.documents()[1].uuid(), "c");
}

#[tokio::test]
async fn test_updates_are_decorated_after_debounce() {
    let mut h = harness();
    let mut server = h.authenticated().await;
    let decorator = Arc::new(TitleWords::default());
    let (live, call_id) = open_live(&h, &mut server, Arc::clone(&decorator)).await;

    server.send(updated(&call_id, "planning", state("a", "one")));
    server.send(updated(&call_id, "planning", state("a", "one two")));
    server.send(updated(&call_id, "planning", state("a", "one two three")));

    within(async {
        loop {
            let docs = live.documents();
            if docs[0].decorator_data.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    let docs = live.documents();
    assert_eq!(docs[0].document.title, "one two three");
    assert_eq!(docs[0].decorator_data.as_ref().unwrap()["titleWords"], 3);
    assert_eq!(decorator.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_stops_updates() {
    let mut h = harness();
    let mut server = h.authenticated().await;
    let (live, call_id) = open_live(&h, &mut server, Arc::new(TitleWords::default())).await;
    let store = live.store().clone();

    let close = tokio::spawn(live.close());
    let request = server.next_request().await;
    assert_eq!(request.close_document_set.unwrap().set_name, "planning");
    server.send(handled(&request.call_id));
    within(close).await.unwrap().unwrap();

    let before = store.snapshot();
    server.send(removed(&call_id, "planning", "a"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.snapshot().ptr_eq(&before));
}

//! Document collection reducer
//!
//! Pure functions folding push events into a [`DocumentCollection`]. They
//! never reorder entries and never mutate in place: every change yields a
//! new collection, and "nothing changed" yields the input collection itself
//! so consumers can skip work by identity.

use std::sync::Arc;

use crate::document::{
    DecoratedDocument, DocumentCollection, DocumentState, IncludedDocument, Updater,
};
use crate::session::protocol::{DocumentRemoved, DocumentUpdate, InclusionBatch, PushEvent};

/// Locates the parent entry for a child uuid.
pub type ParentResolver =
    Arc<dyn Fn(&[Arc<DecoratedDocument>], Option<&str>) -> Option<usize> + Send + Sync>;

/// Receives main-document updates for background enrichment.
pub trait UpdateScheduler {
    /// Queue enrichment of `parent`, the entry that `update` just produced.
    fn execute(&self, update: &DocumentUpdate, parent: Option<&Arc<DecoratedDocument>>);
}

/// No enrichment.
impl UpdateScheduler for () {
    fn execute(&self, _update: &DocumentUpdate, _parent: Option<&Arc<DecoratedDocument>>) {}
}

/// Index of the first document whose assignment lists `target` as a
/// deliverable. `None` when there is no target or no such document.
pub fn find_deliverable_parent_index(
    documents: &[Arc<DecoratedDocument>],
    target: Option<&str>,
) -> Option<usize> {
    let target = target?;
    documents
        .iter()
        .position(|doc| doc.document.has_deliverable(target))
}

/// Attach or refresh a child on its parent.
///
/// An existing child with the same uuid gets the new state; otherwise the
/// child is appended. The parent's updater stamp always follows the child's
/// metadata.
pub fn upsert_included_document(
    parent: &DecoratedDocument,
    included: &IncludedDocument,
) -> DecoratedDocument {
    let mut next = parent.clone();

    match next
        .included_documents
        .iter_mut()
        .find(|existing| existing.uuid == included.uuid)
    {
        Some(existing) => existing.state = included.state.clone(),
        None => next.included_documents.push(included.clone()),
    }

    let meta = included.state.as_ref().and_then(|s| s.meta.as_ref());
    next.updater = Some(Updater::from_meta(meta));
    next
}

/// Build the initial collection from fetched states.
pub fn collection_from_states(states: Vec<DocumentState>) -> DocumentCollection {
    states.into_iter().map(DecoratedDocument::from_state).collect()
}

/// Drop the removed document.
pub fn handle_removed(prev: &DocumentCollection, removed: &DocumentRemoved) -> DocumentCollection {
    if prev.position(&removed.document_uuid).is_none() {
        return prev.clone();
    }

    DocumentCollection::new(
        prev.iter()
            .filter(|doc| doc.uuid() != removed.document_uuid)
            .cloned()
            .collect(),
    )
}

/// Attach each child in `batch` to its deliverable parent.
pub fn handle_inclusion_batch(
    prev: &DocumentCollection,
    batch: &InclusionBatch,
) -> DocumentCollection {
    handle_inclusion_batch_with(prev, batch, &find_deliverable_parent_index)
}

/// [`handle_inclusion_batch`] with a caller-supplied parent lookup.
pub fn handle_inclusion_batch_with<F>(
    prev: &DocumentCollection,
    batch: &InclusionBatch,
    resolve_parent: &F,
) -> DocumentCollection
where
    F: Fn(&[Arc<DecoratedDocument>], Option<&str>) -> Option<usize> + ?Sized,
{
    let mut entries: Option<Vec<Arc<DecoratedDocument>>> = None;

    for included in &batch.documents {
        let current = entries.as_deref().unwrap_or(&prev[..]);
        let Some(index) = resolve_parent(current, Some(included.uuid.as_str())) else {
            continue;
        };
        let Some(parent) = current.get(index) else {
            continue;
        };

        let updated = Arc::new(upsert_included_document(parent, included));
        entries.get_or_insert_with(|| prev.to_entries())[index] = updated;
    }

    match entries {
        Some(entries) => DocumentCollection::new(entries),
        None => prev.clone(),
    }
}

/// Fold a single-document update into the collection.
///
/// Inclusion updates attach to their deliverable parent and are dropped when
/// no parent is loaded. Main-document updates replace the existing entry
/// (keeping its children and decorations) and are handed to `scheduler` for
/// enrichment, or are appended when new and carrying metadata.
pub fn handle_document_update<S>(
    prev: &DocumentCollection,
    update: &DocumentUpdate,
    scheduler: &S,
) -> DocumentCollection
where
    S: UpdateScheduler + ?Sized,
{
    let Some(document) = update.document.as_ref() else {
        return prev.clone();
    };

    if update.is_inclusion() {
        let Some(index) = find_deliverable_parent_index(prev, Some(document.uuid.as_str())) else {
            return prev.clone();
        };

        let included = IncludedDocument {
            uuid: document.uuid.clone(),
            state: Some(DocumentState {
                document: document.clone(),
                meta: update.meta.clone(),
            }),
        };
        return prev.with_replaced(index, upsert_included_document(&prev[index], &included));
    }

    match prev.position(&document.uuid) {
        Some(index) => {
            let existing = &prev[index];
            let entry = DecoratedDocument {
                document: document.clone(),
                meta: update.meta.clone(),
                included_documents: existing.included_documents.clone(),
                decorator_data: existing.decorator_data.clone(),
                updater: Some(Updater::from_meta(update.meta.as_ref())),
            };

            let next = prev.with_replaced(index, entry);
            scheduler.execute(update, Some(&next[index]));
            next
        }
        None if update.meta.is_some() => {
            prev.with_appended(DecoratedDocument::from_state(DocumentState {
                document: document.clone(),
                meta: update.meta.clone(),
            }))
        }
        None => prev.clone(),
    }
}

/// Fold any push event into the collection.
pub fn apply_push_event<S>(
    prev: &DocumentCollection,
    event: &PushEvent,
    scheduler: &S,
) -> DocumentCollection
where
    S: UpdateScheduler + ?Sized,
{
    match event {
        PushEvent::Removed(removed) => handle_removed(prev, removed),
        PushEvent::InclusionBatch(batch) => handle_inclusion_batch(prev, batch),
        PushEvent::DocumentUpdate(update) => handle_document_update(prev, update, scheduler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, Document, StateMeta, ASSIGNMENT_BLOCK_TYPE, DELIVERABLE_REL};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingScheduler {
        calls: Mutex<Vec<(String, Option<String>)>>,
    }

    impl UpdateScheduler for RecordingScheduler {
        fn execute(&self, update: &DocumentUpdate, parent: Option<&Arc<DecoratedDocument>>) {
            self.calls.lock().unwrap().push((
                update.document_uuid().unwrap_or_default().to_string(),
                parent.map(|p| p.document.title.clone()),
            ));
        }
    }

    fn doc(uuid: &str) -> Document {
        Document {
            uuid: uuid.into(),
            doc_type: "core/article".into(),
            ..Default::default()
        }
    }

    fn planning(uuid: &str, deliverables: &[&str]) -> Document {
        Document {
            uuid: uuid.into(),
            doc_type: "core/planning-item".into(),
            meta: vec![Block {
                block_type: ASSIGNMENT_BLOCK_TYPE.into(),
                links: deliverables
                    .iter()
                    .map(|d| Block {
                        rel: DELIVERABLE_REL.into(),
                        uuid: (*d).into(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn meta(updater: &str) -> StateMeta {
        StateMeta {
            updater_uri: updater.into(),
            modified: "2024-05-01T10:00:00Z".into(),
        }
    }

    fn collection(docs: Vec<Document>) -> DocumentCollection {
        collection_from_states(
            docs.into_iter()
                .map(|document| DocumentState { document, meta: None })
                .collect(),
        )
    }

    fn included(uuid: &str, updater: &str) -> IncludedDocument {
        IncludedDocument {
            uuid: uuid.into(),
            state: Some(DocumentState {
                document: doc(uuid),
                meta: Some(meta(updater)),
            }),
        }
    }

    // =========================================================================
    // find_deliverable_parent_index
    // =========================================================================

    #[test]
    fn test_find_parent_with_link() {
        let data = collection(vec![planning("p1", &["X"])]);
        assert_eq!(find_deliverable_parent_index(&data, Some("X")), Some(0));
    }

    #[test]
    fn test_find_parent_missing_target_or_link() {
        let data = collection(vec![planning("p1", &["X"])]);
        assert_eq!(find_deliverable_parent_index(&data, None), None);
        assert_eq!(find_deliverable_parent_index(&data, Some("Y")), None);
    }

    #[test]
    fn test_find_parent_returns_first_match() {
        let data = collection(vec![doc("a"), planning("p1", &["X"]), planning("p2", &["X"])]);
        assert_eq!(find_deliverable_parent_index(&data, Some("X")), Some(1));
    }

    // =========================================================================
    // upsert_included_document
    // =========================================================================

    #[test]
    fn test_upsert_appends_then_replaces() {
        let parent = DecoratedDocument::from_state(DocumentState {
            document: planning("p1", &["a1"]),
            meta: None,
        });

        let first = upsert_included_document(&parent, &included("a1", "core://user/1"));
        assert_eq!(first.included_documents.len(), 1);
        assert_eq!(first.updater.as_ref().unwrap().sub, "core://user/1");

        let second = upsert_included_document(&first, &included("a1", "core://user/2"));
        assert_eq!(second.included_documents.len(), 1);
        let state = second.included("a1").unwrap().state.as_ref().unwrap();
        assert_eq!(state.meta.as_ref().unwrap().updater_uri, "core://user/2");
        assert_eq!(second.updater.as_ref().unwrap().sub, "core://user/2");

        // Input untouched
        assert!(parent.included_documents.is_empty());
    }

    #[test]
    fn test_upsert_without_meta_uses_fallback_updater() {
        let parent = DecoratedDocument::default();
        let child = IncludedDocument {
            uuid: "a1".into(),
            state: None,
        };
        let next = upsert_included_document(&parent, &child);
        assert_eq!(next.updater.unwrap().sub, "??");
    }

    // =========================================================================
    // handle_removed
    // =========================================================================

    #[test]
    fn test_removed_missing_returns_same_collection() {
        let data = collection(vec![doc("a"), doc("b")]);
        let removed = DocumentRemoved {
            set_name: "s".into(),
            document_uuid: "missing".into(),
        };
        assert!(handle_removed(&data, &removed).ptr_eq(&data));
    }

    #[test]
    fn test_removed_filters_match() {
        let data = collection(vec![doc("a"), doc("b"), doc("c")]);
        let removed = DocumentRemoved {
            set_name: "s".into(),
            document_uuid: "b".into(),
        };
        let next = handle_removed(&data, &removed);
        let uuids: Vec<&str> = next.iter().map(|d| d.uuid()).collect();
        assert_eq!(uuids, vec!["a", "c"]);
        assert_eq!(data.len(), 3);
    }

    // =========================================================================
    // handle_inclusion_batch
    // =========================================================================

    #[test]
    fn test_inclusion_batch_attaches_to_parents() {
        let data = collection(vec![planning("p1", &["a1"]), planning("p2", &["a2", "a3"])]);
        let batch = InclusionBatch {
            set_name: "s".into(),
            documents: vec![included("a2", "u"), included("a1", "u"), included("a3", "u")],
        };

        let next = handle_inclusion_batch(&data, &batch);
        assert!(!next.ptr_eq(&data));
        assert_eq!(next[0].included_documents.len(), 1);
        let p2: Vec<&str> = next[1].included_documents.iter().map(|i| i.uuid.as_str()).collect();
        assert_eq!(p2, vec!["a2", "a3"]);
    }

    #[test]
    fn test_inclusion_batch_without_parents_is_identity() {
        let data = collection(vec![planning("p1", &["a1"])]);
        let orphan = InclusionBatch {
            set_name: "s".into(),
            documents: vec![included("zz", "u")],
        };
        assert!(handle_inclusion_batch(&data, &orphan).ptr_eq(&data));

        let empty = InclusionBatch::default();
        assert!(handle_inclusion_batch(&data, &empty).ptr_eq(&data));
    }

    #[test]
    fn test_inclusion_batch_with_custom_resolver() {
        let data = collection(vec![doc("a"), doc("b")]);
        let batch = InclusionBatch {
            set_name: "s".into(),
            documents: vec![included("child", "u")],
        };
        let always_last =
            |docs: &[Arc<DecoratedDocument>], _: Option<&str>| docs.len().checked_sub(1);

        let next = handle_inclusion_batch_with(&data, &batch, &always_last);
        assert!(next[0].included_documents.is_empty());
        assert_eq!(next[1].included_documents[0].uuid, "child");
    }

    // =========================================================================
    // handle_document_update
    // =========================================================================

    #[test]
    fn test_inclusion_update_attaches_to_parent() {
        let data = collection(vec![doc("x"), planning("p1", &["a1"])]);
        let scheduler = RecordingScheduler::default();
        let update = DocumentUpdate {
            set_name: "s".into(),
            document: Some(doc("a1")),
            included: true,
            meta: Some(meta("core://user/7")),
        };

        let next = handle_document_update(&data, &update, &scheduler);
        assert!(Arc::ptr_eq(&next[0], &data[0]));
        assert_eq!(next[1].included("a1").unwrap().uuid, "a1");
        assert_eq!(next[1].updater.as_ref().unwrap().sub, "core://user/7");
        assert!(scheduler.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_inclusion_update_without_parent_is_dropped() {
        let data = collection(vec![doc("x")]);
        let update = DocumentUpdate {
            document: Some(doc("a1")),
            included: true,
            ..Default::default()
        };
        assert!(handle_document_update(&data, &update, &()).ptr_eq(&data));
    }

    #[test]
    fn test_main_update_replaces_and_schedules() {
        let data = collection(vec![planning("p1", &["a1"]), doc("b")]);
        let data = handle_inclusion_batch(
            &data,
            &InclusionBatch {
                set_name: "s".into(),
                documents: vec![included("a1", "u")],
            },
        );

        let mut changed = planning("p1", &["a1"]);
        changed.title = "New title".into();
        let update = DocumentUpdate {
            set_name: "s".into(),
            document: Some(changed),
            included: false,
            meta: Some(meta("core://user/9")),
        };
        let scheduler = RecordingScheduler::default();

        let next = handle_document_update(&data, &update, &scheduler);
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].document.title, "New title");
        assert_eq!(next[0].included_documents.len(), 1);
        assert_eq!(next[0].updater.as_ref().unwrap().sub, "core://user/9");
        assert!(Arc::ptr_eq(&next[1], &data[1]));

        let calls = scheduler.calls.lock().unwrap();
        assert_eq!(*calls, vec![("p1".to_string(), Some("New title".to_string()))]);
    }

    #[test]
    fn test_main_update_keeps_previous_decorations() {
        let mut entry = DecoratedDocument::from_state(DocumentState {
            document: doc("a"),
            meta: None,
        });
        entry.decorator_data = Some(serde_json::json!({ "wordCount": 12 }));
        let data: DocumentCollection = vec![entry].into_iter().collect();

        let update = DocumentUpdate {
            document: Some(doc("a")),
            meta: Some(meta("u")),
            ..Default::default()
        };
        let next = handle_document_update(&data, &update, &());
        assert_eq!(next[0].decorator_data, Some(serde_json::json!({ "wordCount": 12 })));
    }

    #[test]
    fn test_new_document_with_meta_is_appended() {
        let data = collection(vec![doc("a")]);
        let update = DocumentUpdate {
            document: Some(doc("b")),
            meta: Some(meta("core://user/1")),
            ..Default::default()
        };
        let scheduler = RecordingScheduler::default();

        let next = handle_document_update(&data, &update, &scheduler);
        assert_eq!(next.len(), 2);
        assert_eq!(next[1].uuid(), "b");
        assert_eq!(next[1].updater.as_ref().unwrap().sub, "core://user/1");
        assert!(scheduler.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_new_document_without_meta_is_ignored() {
        let data = collection(vec![doc("a")]);
        let update = DocumentUpdate {
            document: Some(doc("b")),
            ..Default::default()
        };
        assert!(handle_document_update(&data, &update, &()).ptr_eq(&data));
    }

    #[test]
    fn test_update_without_document_is_ignored() {
        let data = collection(vec![doc("a")]);
        assert!(handle_document_update(&data, &DocumentUpdate::default(), &()).ptr_eq(&data));
    }

    #[test]
    fn test_apply_push_event_dispatch() {
        let data = collection(vec![doc("a")]);
        let event = PushEvent::Removed(DocumentRemoved {
            set_name: "s".into(),
            document_uuid: "a".into(),
        });
        assert!(apply_push_event(&data, &event, &()).is_empty());
    }
}

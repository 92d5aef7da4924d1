//! In-memory executor used by the integration tests.
//!
//! Applies requests to a `Vec<Document>` with just enough server semantics for
//! the bulk pipeline: unique `_id`, top-level equality filters, `$set` and
//! `$inc` updates, replacements and upserts.

#![allow(dead_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use docket_mongodb::{
    BatchDescriptor, BulkOutcome, BulkWriteUpsert, OperationExecutor, RawBulkSummary,
    RawWriteError, Result, UpdateType, WriteRequest,
};

#[derive(Default)]
pub struct InMemoryExecutor {
    documents: Mutex<Vec<Document>>,
    batches: Mutex<usize>,
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(documents: Vec<Document>) -> Self {
        Self {
            documents: Mutex::new(documents),
            batches: Mutex::new(0),
        }
    }

    pub fn documents(&self) -> Vec<Document> {
        self.documents.lock().unwrap().clone()
    }

    pub fn batches_executed(&self) -> usize {
        *self.batches.lock().unwrap()
    }
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, expected)| document.get(key) == Some(expected))
}

fn apply_update(document: &mut Document, update: &Document) {
    if let Ok(set) = update.get_document("$set") {
        for (key, value) in set {
            document.insert(key.clone(), value.clone());
        }
    }
    if let Ok(inc) = update.get_document("$inc") {
        for (key, delta) in inc {
            let current = document.get(key).and_then(Bson::as_i32).unwrap_or(0);
            let delta = delta.as_i32().unwrap_or(0);
            document.insert(key.clone(), current + delta);
        }
    }
}

fn duplicate_key(index: usize, id: &Bson) -> RawWriteError {
    RawWriteError {
        index,
        code: 11000,
        message: format!("E11000 duplicate key error dup key: {{ _id: {} }}", id),
        details: None,
    }
}

#[async_trait]
impl OperationExecutor for InMemoryExecutor {
    async fn execute(&self, batch: &BatchDescriptor) -> Result<BulkOutcome> {
        *self.batches.lock().unwrap() += 1;
        let mut store = self.documents.lock().unwrap();
        let mut summary = RawBulkSummary {
            request_count: batch.len(),
            ..Default::default()
        };
        let mut write_errors: Vec<RawWriteError> = Vec::new();

        for (position, request) in batch.requests.iter().enumerate() {
            if batch.is_ordered() && !write_errors.is_empty() {
                summary
                    .unprocessed
                    .extend(batch.requests[position..].iter().map(WriteRequest::correlation_id));
                break;
            }

            let id = request.correlation_id();
            match request {
                WriteRequest::Insert { document, .. } => {
                    let key = document.get("_id").cloned().unwrap_or(Bson::Null);
                    if store.iter().any(|existing| existing.get("_id") == Some(&key)) {
                        write_errors.push(duplicate_key(id, &key));
                        continue;
                    }
                    store.push(document.clone());
                    summary.inserted_count += 1;
                }
                WriteRequest::Delete { filter, limit, .. } => {
                    let before = store.len();
                    if *limit == 1 {
                        if let Some(found) = store.iter().position(|d| matches(d, filter)) {
                            store.remove(found);
                        }
                    } else {
                        store.retain(|d| !matches(d, filter));
                    }
                    summary.deleted_count += (before - store.len()) as u64;
                }
                WriteRequest::Update {
                    filter,
                    update,
                    update_type,
                    is_multi,
                    is_upsert,
                    ..
                } => {
                    let Bson::Document(update) = update else {
                        continue;
                    };
                    let mut matched = 0;
                    for document in store.iter_mut().filter(|d| matches(d, filter)) {
                        matched += 1;
                        let before = document.clone();
                        match update_type {
                            UpdateType::Replacement => {
                                let keep_id = document.get("_id").cloned();
                                *document = update.clone();
                                if let Some(keep_id) = keep_id {
                                    document.insert("_id", keep_id);
                                }
                            }
                            _ => apply_update(document, update),
                        }
                        if *document != before {
                            summary.modified_count += 1;
                        }
                        if !*is_multi {
                            break;
                        }
                    }
                    summary.matched_count += matched;

                    if matched == 0 && *is_upsert {
                        let mut inserted = filter.clone();
                        match update_type {
                            UpdateType::Replacement => {
                                for (key, value) in update {
                                    inserted.insert(key.clone(), value.clone());
                                }
                            }
                            _ => apply_update(&mut inserted, update),
                        }
                        let upserted_id = inserted
                            .get("_id")
                            .cloned()
                            .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
                        inserted.insert("_id", upserted_id.clone());
                        store.push(inserted);
                        summary.upserts.push(BulkWriteUpsert {
                            index: id,
                            id: upserted_id,
                        });
                    }
                }
            }
            summary.processed.push(id);
        }

        if write_errors.is_empty() {
            Ok(BulkOutcome::Completed(summary))
        } else {
            Ok(BulkOutcome::PartialFailure {
                summary,
                write_errors,
                write_concern_error: None,
                command_error: None,
            })
        }
    }
}

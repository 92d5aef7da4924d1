//! Collection facade tying schema, settings and executor together.
//!
//! ```rust,ignore
//! let connection = Connection::new("mongodb://localhost:27017/app").await?;
//! let people = Collection::new(
//!     connection.namespace("people")?,
//!     Arc::new(person_schema()),
//!     connection.executor(),
//! );
//! let result = people
//!     .bulk_write(vec![WriteModel::insert_one(doc! { "n": "Jack" })], BulkWriteOptions::default())
//!     .await?;
//! ```

use std::fmt;
use std::sync::Arc;

use bson::{Bson, Document};
use docket_common::{DocketError, Result};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::bulk::{
    BulkBatchBuilder, BulkWriteError, BulkWriteOptions, BulkWriteResult, CollectionNamespace,
    OperationExecutor, ResultAggregator, WriteConcernError, WriteError,
};
use crate::field::FieldResolver;
use crate::filter::Filter;
use crate::settings::CollectionSettings;
use crate::update::Update;
use crate::write_model::{CompiledBatch, UpdateModification, WriteModel, WriteModelCompiler};

/// Result of a single insert
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    /// Value of the id member after assignment, `Null` when the schema has none
    pub inserted_id: Bson,
    pub document: Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    Acknowledged { deleted_count: u64 },
    Unacknowledged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateResult {
    Acknowledged {
        matched_count: u64,
        modified_count: u64,
        upserted_id: Option<Bson>,
    },
    Unacknowledged,
}

/// Failure of a single-item write
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub write_error: Option<WriteError>,
    pub write_concern_error: Option<WriteConcernError>,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.write_error, &self.write_concern_error) {
            (Some(error), _) => write!(f, "write error (code {}): {}", error.code, error.message),
            (None, Some(wce)) => {
                write!(f, "write concern error (code {}): {}", wce.code, wce.message)
            }
            (None, None) => write!(f, "write failed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum WriteOperationError {
    #[error(transparent)]
    Driver(#[from] DocketError),

    #[error("Write failed: {0}")]
    Failure(Box<WriteFailure>),
}

impl From<BulkWriteError> for WriteOperationError {
    fn from(err: BulkWriteError) -> Self {
        match err {
            BulkWriteError::Driver(e) => WriteOperationError::Driver(e),
            BulkWriteError::Failure(failure) => {
                let failure = *failure;
                if failure.write_errors.is_empty() && failure.write_concern_error.is_none() {
                    if let Some(e) = failure.command_error {
                        return WriteOperationError::Driver(e);
                    }
                }
                WriteOperationError::Failure(Box::new(WriteFailure {
                    write_error: failure.write_errors.into_iter().next(),
                    write_concern_error: failure.write_concern_error,
                }))
            }
        }
    }
}

type WriteResult<T> = std::result::Result<T, WriteOperationError>;

/// Typed handle on one collection
pub struct Collection<E: OperationExecutor> {
    namespace: CollectionNamespace,
    schema: Arc<dyn FieldResolver>,
    settings: CollectionSettings,
    executor: E,
}

impl<E: OperationExecutor> Collection<E> {
    pub fn new(
        namespace: CollectionNamespace,
        schema: Arc<dyn FieldResolver>,
        executor: E,
    ) -> Self {
        Self {
            namespace,
            schema,
            settings: CollectionSettings::default(),
            executor,
        }
    }

    pub fn with_settings(mut self, settings: CollectionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn namespace(&self) -> &CollectionNamespace {
        &self.namespace
    }

    pub fn settings(&self) -> &CollectionSettings {
        &self.settings
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn render_filter(&self, filter: &Filter) -> Result<Document> {
        filter.render(self.schema.as_ref())
    }

    pub fn render_update(&self, update: &Update) -> Result<Document> {
        update.render(self.schema.as_ref())
    }

    /// Compile intents without executing them
    pub fn compile<I>(&self, models: I) -> Result<CompiledBatch>
    where
        I: IntoIterator<Item = WriteModel>,
    {
        WriteModelCompiler::new(self.schema.as_ref(), &self.settings).compile(models)
    }

    /// Compile, execute and aggregate one bulk write.
    ///
    /// Compilation errors abort before anything is sent.
    #[instrument(
        skip(self, models, options),
        fields(namespace = %self.namespace, ordered = options.is_ordered)
    )]
    pub async fn bulk_write<I>(
        &self,
        models: I,
        options: BulkWriteOptions,
    ) -> std::result::Result<BulkWriteResult, BulkWriteError>
    where
        I: IntoIterator<Item = WriteModel>,
    {
        let CompiledBatch { requests, intents } = self.compile(models)?;
        let batch =
            BulkBatchBuilder::new(self.namespace.clone(), self.settings.write_concern.clone())
                .max_batch_count(self.settings.max_batch_count)
                .build(requests, options);
        let acknowledged = batch.is_acknowledged();
        debug!(requests = batch.len(), acknowledged, "executing bulk write");

        let outcome = self.executor.execute(&batch).await?;
        ResultAggregator::new(intents, acknowledged).aggregate(outcome)
    }

    async fn write_one(&self, model: WriteModel) -> WriteResult<BulkWriteResult> {
        Ok(self.bulk_write(vec![model], BulkWriteOptions::default()).await?)
    }

    pub async fn insert_one(&self, document: Document) -> WriteResult<InsertOneResult> {
        let result = self.write_one(WriteModel::insert_one(document)).await?;
        let document = result
            .processed_requests()
            .first()
            .and_then(WriteModel::inserted_document)
            .cloned()
            .ok_or_else(|| {
                DocketError::Internal("insert was not reported as processed".to_string())
            })?;
        let inserted_id = self
            .schema
            .id_member()
            .and_then(|id| document.get(id.element_name()).cloned())
            .unwrap_or(Bson::Null);
        Ok(InsertOneResult {
            inserted_id,
            document,
        })
    }

    pub async fn delete_one(&self, filter: impl Into<Filter>) -> WriteResult<DeleteResult> {
        let result = self.write_one(WriteModel::delete_one(filter)).await?;
        Ok(delete_result(&result))
    }

    pub async fn delete_many(&self, filter: impl Into<Filter>) -> WriteResult<DeleteResult> {
        let result = self.write_one(WriteModel::delete_many(filter)).await?;
        Ok(delete_result(&result))
    }

    pub async fn replace_one(
        &self,
        filter: impl Into<Filter>,
        replacement: Document,
        is_upsert: bool,
    ) -> WriteResult<UpdateResult> {
        let model = WriteModel::replace_one(filter, replacement).with_upsert(is_upsert);
        let result = self.write_one(model).await?;
        Ok(update_result(&result))
    }

    pub async fn update_one(
        &self,
        filter: impl Into<Filter>,
        update: impl Into<UpdateModification>,
        is_upsert: bool,
    ) -> WriteResult<UpdateResult> {
        let model = WriteModel::update_one(filter, update).with_upsert(is_upsert);
        let result = self.write_one(model).await?;
        Ok(update_result(&result))
    }

    pub async fn update_many(
        &self,
        filter: impl Into<Filter>,
        update: impl Into<UpdateModification>,
        is_upsert: bool,
    ) -> WriteResult<UpdateResult> {
        let model = WriteModel::update_many(filter, update).with_upsert(is_upsert);
        let result = self.write_one(model).await?;
        Ok(update_result(&result))
    }
}

fn delete_result(result: &BulkWriteResult) -> DeleteResult {
    match result.deleted_count() {
        Some(deleted_count) => DeleteResult::Acknowledged { deleted_count },
        None => DeleteResult::Unacknowledged,
    }
}

fn update_result(result: &BulkWriteResult) -> UpdateResult {
    match result {
        BulkWriteResult::Acknowledged {
            matched_count,
            modified_count,
            upserts,
            ..
        } => UpdateResult::Acknowledged {
            matched_count: *matched_count,
            modified_count: *modified_count,
            upserted_id: upserts.first().map(|upsert| upsert.id.clone()),
        },
        BulkWriteResult::Unacknowledged { .. } => UpdateResult::Unacknowledged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::{
        BatchDescriptor, BulkOutcome, BulkWriteUpsert, RawBulkSummary, RawWriteError,
        ServerErrorCategory,
    };
    use crate::schema::DocumentSchema;
    use async_trait::async_trait;
    use bson::doc;
    use std::sync::Mutex;

    /// Replies with a fixed outcome and records every batch it sees
    struct ScriptedExecutor {
        outcome: BulkOutcome,
        seen: Mutex<Vec<BatchDescriptor>>,
    }

    impl ScriptedExecutor {
        fn new(outcome: BulkOutcome) -> Self {
            Self {
                outcome,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn batches(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn last_batch(&self) -> Option<BatchDescriptor> {
            self.seen.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl OperationExecutor for ScriptedExecutor {
        async fn execute(&self, batch: &BatchDescriptor) -> Result<BulkOutcome> {
            self.seen.lock().unwrap().push(batch.clone());
            Ok(self.outcome.clone())
        }
    }

    fn collection(outcome: BulkOutcome) -> Collection<ScriptedExecutor> {
        Collection::new(
            CollectionNamespace::new("db", "people").unwrap(),
            Arc::new(DocumentSchema::dynamic()),
            ScriptedExecutor::new(outcome),
        )
    }

    fn completed(summary: RawBulkSummary) -> BulkOutcome {
        BulkOutcome::Completed(summary)
    }

    #[test]
    fn test_insert_one_returns_assigned_id() {
        let people = collection(completed(RawBulkSummary {
            request_count: 1,
            inserted_count: 1,
            processed: vec![0],
            ..Default::default()
        }));
        let result = tokio_test::block_on(people.insert_one(doc! { "n": "Jack" })).unwrap();
        assert!(matches!(result.inserted_id, Bson::ObjectId(_)));
        assert_eq!(result.document.get("_id"), Some(&result.inserted_id));
    }

    #[test]
    fn test_update_one_upsert_result() {
        let people = collection(completed(RawBulkSummary {
            request_count: 1,
            upserts: vec![BulkWriteUpsert {
                index: 0,
                id: Bson::Int32(5),
            }],
            processed: vec![0],
            ..Default::default()
        }));
        let result = tokio_test::block_on(people.update_one(
            Filter::eq("n", "Jill"),
            Update::set("age", 3),
            true,
        ))
        .unwrap();
        assert_eq!(
            result,
            UpdateResult::Acknowledged {
                matched_count: 0,
                modified_count: 0,
                upserted_id: Some(Bson::Int32(5)),
            }
        );
    }

    #[test]
    fn test_delete_many_count() {
        let people = collection(completed(RawBulkSummary {
            request_count: 1,
            deleted_count: 4,
            processed: vec![0],
            ..Default::default()
        }));
        let result = tokio_test::block_on(people.delete_many(Filter::lt("age", 18))).unwrap();
        assert_eq!(result, DeleteResult::Acknowledged { deleted_count: 4 });
    }

    #[test]
    fn test_single_write_failure_converted() {
        let people = collection(BulkOutcome::PartialFailure {
            summary: RawBulkSummary {
                request_count: 1,
                ..Default::default()
            },
            write_errors: vec![RawWriteError {
                index: 0,
                code: 11000,
                message: "E11000 duplicate key".to_string(),
                details: None,
            }],
            write_concern_error: None,
            command_error: None,
        });
        let err = tokio_test::block_on(people.insert_one(doc! { "_id": 1 })).unwrap_err();
        match err {
            WriteOperationError::Failure(failure) => {
                let write_error = failure.write_error.unwrap();
                assert_eq!(write_error.category, ServerErrorCategory::DuplicateKey);
            }
            other => panic!("expected write failure, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_errors_abort_before_execution() {
        let people = collection(completed(RawBulkSummary::default()));
        let result =
            tokio_test::block_on(people.bulk_write(Vec::new(), BulkWriteOptions::default()));
        assert!(matches!(result, Err(BulkWriteError::Driver(DocketError::Configuration(_)))));
        assert_eq!(people.executor().batches(), 0);
    }

    #[test]
    fn test_unacknowledged_single_results() {
        use mongodb::options::{Acknowledgment, WriteConcern};

        let settings = CollectionSettings::default()
            .write_concern(WriteConcern::builder().w(Acknowledgment::Nodes(0)).build());
        let people = collection(completed(RawBulkSummary {
            request_count: 1,
            processed: vec![0],
            ..Default::default()
        }))
        .with_settings(settings);
        let result = tokio_test::block_on(people.delete_one(Filter::eq("n", 1))).unwrap();
        assert_eq!(result, DeleteResult::Unacknowledged);
    }

    #[test]
    fn test_batch_uses_configured_max_batch_count() {
        let people = collection(completed(RawBulkSummary {
            request_count: 1,
            deleted_count: 1,
            processed: vec![0],
            ..Default::default()
        }))
        .with_settings(CollectionSettings::default().max_batch_count(25));
        tokio_test::block_on(people.delete_one(Filter::eq("n", 1))).unwrap();
        let batch = people.executor().last_batch().unwrap();
        assert_eq!(batch.max_batch_count, 25);
    }

    #[test]
    fn test_render_helpers() {
        let people = collection(completed(RawBulkSummary::default()));
        assert_eq!(
            people.render_filter(&Filter::gt("age", 1)).unwrap(),
            doc! { "age": { "$gt": 1 } }
        );
        assert_eq!(
            people.render_update(&Update::inc("age", 1)).unwrap(),
            doc! { "$inc": { "age": 1 } }
        );
    }
}

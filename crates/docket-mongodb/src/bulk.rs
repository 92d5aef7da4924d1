//! Bulk batch building and result aggregation.
//!
//! The flow for one bulk write:
//!
//! 1. [`WriteModelCompiler`](crate::write_model::WriteModelCompiler) turns intents into requests
//! 2. [`BulkBatchBuilder`] wraps them with namespace, options and write concern
//! 3. an [`OperationExecutor`] runs the batch and reports a [`BulkOutcome`]
//! 4. [`ResultAggregator`] maps the outcome back onto the caller's intents

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bson::{Bson, Document};
use docket_common::{DocketError, Result};
use mongodb::options::WriteConcern;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::settings::{is_acknowledged, DEFAULT_MAX_BATCH_COUNT};
use crate::validation::ValidatedCollectionName;
use crate::write_model::{WriteModel, WriteRequest, WriteRequestKind};

/// Per-call bulk write options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkWriteOptions {
    /// Stop at the first failing request (default: true)
    pub is_ordered: bool,
    pub bypass_document_validation: Option<bool>,
    /// Variables available to filters and pipelines as `$$name`
    pub let_vars: Option<Document>,
    pub comment: Option<Bson>,
}

impl Default for BulkWriteOptions {
    fn default() -> Self {
        Self {
            is_ordered: true,
            bypass_document_validation: None,
            let_vars: None,
            comment: None,
        }
    }
}

impl BulkWriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ordered(mut self, is_ordered: bool) -> Self {
        self.is_ordered = is_ordered;
        self
    }

    pub fn bypass_document_validation(mut self, bypass: bool) -> Self {
        self.bypass_document_validation = Some(bypass);
        self
    }

    pub fn let_vars(mut self, vars: Document) -> Self {
        self.let_vars = Some(vars);
        self
    }

    pub fn comment(mut self, comment: impl Into<Bson>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Database and collection a batch is written to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNamespace {
    pub database: String,
    pub collection: ValidatedCollectionName,
}

impl CollectionNamespace {
    pub fn new(database: impl Into<String>, collection: &str) -> Result<Self> {
        let database = database.into();
        if database.is_empty() || database.contains(['/', '\\', '.', ' ', '"', '$', '\0']) {
            return Err(DocketError::Validation(format!(
                "Invalid database name: '{}'",
                database
            )));
        }
        Ok(Self {
            database,
            collection: ValidatedCollectionName::new(collection)?,
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for CollectionNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Everything an executor needs to run one bulk write
#[derive(Debug, Clone)]
pub struct BatchDescriptor {
    pub namespace: CollectionNamespace,
    pub requests: Vec<WriteRequest>,
    pub options: BulkWriteOptions,
    pub write_concern: WriteConcern,
    /// Largest number of statements sent in one command
    pub max_batch_count: usize,
}

/// One server command of a batch, with the correlation ids of its statements
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCommand {
    pub kind: WriteRequestKind,
    pub command: Document,
    pub correlation_ids: Vec<usize>,
}

impl BatchDescriptor {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn is_ordered(&self) -> bool {
        self.options.is_ordered
    }

    pub fn is_acknowledged(&self) -> bool {
        is_acknowledged(&self.write_concern)
    }

    /// Split the batch into `insert`/`update`/`delete` commands.
    ///
    /// Ordered batches keep request order, so every change of kind starts a
    /// new command. Unordered batches are grouped by kind in order of first
    /// appearance. Runs longer than `max_batch_count` are chunked.
    pub fn to_commands(&self, max_batch_count: usize) -> Result<Vec<WriteCommand>> {
        let max_batch_count = max_batch_count.max(1);

        let runs: Vec<(WriteRequestKind, Vec<&WriteRequest>)> = if self.options.is_ordered {
            let mut runs: Vec<(WriteRequestKind, Vec<&WriteRequest>)> = Vec::new();
            for request in &self.requests {
                match runs.last_mut() {
                    Some((kind, run)) if *kind == request.kind() => run.push(request),
                    _ => runs.push((request.kind(), vec![request])),
                }
            }
            runs
        } else {
            let mut order: Vec<WriteRequestKind> = Vec::new();
            let mut groups: HashMap<WriteRequestKind, Vec<&WriteRequest>> = HashMap::new();
            for request in &self.requests {
                let kind = request.kind();
                if !groups.contains_key(&kind) {
                    order.push(kind);
                }
                groups.entry(kind).or_default().push(request);
            }
            order
                .into_iter()
                .filter_map(|kind| groups.remove(&kind).map(|run| (kind, run)))
                .collect()
        };

        let write_concern = bson::to_document(&self.write_concern)?;
        let mut commands = Vec::new();
        for (kind, run) in runs {
            for chunk in run.chunks(max_batch_count) {
                commands.push(self.render_command(kind, chunk, &write_concern)?);
            }
        }

        debug!(
            namespace = %self.namespace,
            requests = self.requests.len(),
            commands = commands.len(),
            "rendered write commands"
        );
        Ok(commands)
    }

    fn render_command(
        &self,
        kind: WriteRequestKind,
        chunk: &[&WriteRequest],
        write_concern: &Document,
    ) -> Result<WriteCommand> {
        let (name, statements_field) = kind.command_fields();
        let statements = chunk
            .iter()
            .map(|request| request.to_statement().map(Bson::Document))
            .collect::<Result<Vec<_>>>()?;

        let mut command = Document::new();
        command.insert(name, self.namespace.collection.as_str());
        command.insert(statements_field, statements);
        command.insert("ordered", self.options.is_ordered);
        if let Some(bypass) = self.options.bypass_document_validation {
            command.insert("bypassDocumentValidation", bypass);
        }
        if kind != WriteRequestKind::Insert {
            if let Some(let_vars) = &self.options.let_vars {
                command.insert("let", let_vars.clone());
            }
        }
        if let Some(comment) = &self.options.comment {
            command.insert("comment", comment.clone());
        }
        if !write_concern.is_empty() {
            command.insert("writeConcern", write_concern.clone());
        }

        Ok(WriteCommand {
            kind,
            command,
            correlation_ids: chunk.iter().map(|request| request.correlation_id()).collect(),
        })
    }
}

/// Wraps compiled requests for one collection
#[derive(Debug, Clone)]
pub struct BulkBatchBuilder {
    namespace: CollectionNamespace,
    write_concern: WriteConcern,
    max_batch_count: usize,
}

impl BulkBatchBuilder {
    pub fn new(namespace: CollectionNamespace, write_concern: WriteConcern) -> Self {
        Self {
            namespace,
            write_concern,
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
        }
    }

    pub fn max_batch_count(mut self, count: usize) -> Self {
        self.max_batch_count = count.max(1);
        self
    }

    pub fn build(
        &self,
        requests: Vec<WriteRequest>,
        options: BulkWriteOptions,
    ) -> BatchDescriptor {
        BatchDescriptor {
            namespace: self.namespace.clone(),
            requests,
            options,
            write_concern: self.write_concern.clone(),
            max_batch_count: self.max_batch_count,
        }
    }
}

/// Upserted document reported by the server, keyed by correlation id
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteUpsert {
    pub index: usize,
    pub id: Bson,
}

/// Low-level counts reported by an executor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBulkSummary {
    pub request_count: usize,
    pub matched_count: u64,
    pub inserted_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub upserts: Vec<BulkWriteUpsert>,
    /// Correlation ids of requests that were applied
    pub processed: Vec<usize>,
    /// Correlation ids of requests with no server verdict: never sent, or
    /// part of a command that failed as a whole
    pub unprocessed: Vec<usize>,
}

/// Per-request error as reported by the server
#[derive(Debug, Clone, PartialEq)]
pub struct RawWriteError {
    /// Correlation id of the failed request
    pub index: usize,
    pub code: i32,
    pub message: String,
    pub details: Option<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteConcernError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub details: Option<Document>,
}

/// What an executor reports for one batch
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOutcome {
    Completed(RawBulkSummary),
    PartialFailure {
        summary: RawBulkSummary,
        write_errors: Vec<RawWriteError>,
        write_concern_error: Option<WriteConcernError>,
        /// Command that failed outright after earlier commands were applied
        command_error: Option<DocketError>,
    },
}

/// Runs a batch against a server
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, batch: &BatchDescriptor) -> Result<BulkOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorCategory {
    DuplicateKey,
    ExecutionTimeout,
    Uncategorized,
}

impl ServerErrorCategory {
    pub fn from_code(code: i32) -> Self {
        match code {
            11000 | 11001 | 12582 => ServerErrorCategory::DuplicateKey,
            50 => ServerErrorCategory::ExecutionTimeout,
            _ => ServerErrorCategory::Uncategorized,
        }
    }
}

/// Failed request of a bulk write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteError {
    /// Position of the failed intent in the caller's input
    pub index: usize,
    pub code: i32,
    pub category: ServerErrorCategory,
    pub message: String,
    pub details: Option<Document>,
}

impl From<RawWriteError> for WriteError {
    fn from(raw: RawWriteError) -> Self {
        Self {
            index: raw.index,
            code: raw.code,
            category: ServerErrorCategory::from_code(raw.code),
            message: raw.message,
            details: raw.details,
        }
    }
}

/// Public result of a bulk write
#[derive(Debug, Clone)]
pub enum BulkWriteResult {
    Acknowledged {
        request_count: usize,
        matched_count: u64,
        deleted_count: u64,
        inserted_count: u64,
        modified_count: u64,
        upserts: Vec<BulkWriteUpsert>,
        processed_requests: Vec<WriteModel>,
    },
    Unacknowledged {
        request_count: usize,
        processed_requests: Vec<WriteModel>,
    },
}

impl BulkWriteResult {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, BulkWriteResult::Acknowledged { .. })
    }

    pub fn request_count(&self) -> usize {
        match self {
            BulkWriteResult::Acknowledged { request_count, .. }
            | BulkWriteResult::Unacknowledged { request_count, .. } => *request_count,
        }
    }

    pub fn processed_requests(&self) -> &[WriteModel] {
        match self {
            BulkWriteResult::Acknowledged {
                processed_requests, ..
            }
            | BulkWriteResult::Unacknowledged {
                processed_requests, ..
            } => processed_requests,
        }
    }

    pub fn matched_count(&self) -> Option<u64> {
        match self {
            BulkWriteResult::Acknowledged { matched_count, .. } => Some(*matched_count),
            BulkWriteResult::Unacknowledged { .. } => None,
        }
    }

    pub fn inserted_count(&self) -> Option<u64> {
        match self {
            BulkWriteResult::Acknowledged { inserted_count, .. } => Some(*inserted_count),
            BulkWriteResult::Unacknowledged { .. } => None,
        }
    }

    pub fn modified_count(&self) -> Option<u64> {
        match self {
            BulkWriteResult::Acknowledged { modified_count, .. } => Some(*modified_count),
            BulkWriteResult::Unacknowledged { .. } => None,
        }
    }

    pub fn deleted_count(&self) -> Option<u64> {
        match self {
            BulkWriteResult::Acknowledged { deleted_count, .. } => Some(*deleted_count),
            BulkWriteResult::Unacknowledged { .. } => None,
        }
    }

    pub fn upserts(&self) -> &[BulkWriteUpsert] {
        match self {
            BulkWriteResult::Acknowledged { upserts, .. } => upserts,
            BulkWriteResult::Unacknowledged { .. } => &[],
        }
    }
}

/// Partial failure of a bulk write
#[derive(Debug, Clone)]
pub struct BulkWriteFailure {
    pub result: BulkWriteResult,
    pub write_errors: Vec<WriteError>,
    pub write_concern_error: Option<WriteConcernError>,
    /// Error that stopped the batch between commands
    pub command_error: Option<DocketError>,
    /// Intents the server gave no verdict on
    pub unprocessed_requests: Vec<WriteModel>,
}

impl fmt::Display for BulkWriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} requests failed",
            self.write_errors.len(),
            self.result.request_count()
        )?;
        if let Some(first) = self.write_errors.first() {
            write!(
                f,
                "; first error at index {} (code {}): {}",
                first.index, first.code, first.message
            )?;
        }
        if let Some(wce) = &self.write_concern_error {
            write!(f, "; write concern error (code {}): {}", wce.code, wce.message)?;
        }
        if let Some(err) = &self.command_error {
            write!(
                f,
                "; batch stopped with {} requests unprocessed: {}",
                self.unprocessed_requests.len(),
                err
            )?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum BulkWriteError {
    /// Compilation or transport failure; nothing reached the caller's result
    #[error(transparent)]
    Driver(#[from] DocketError),

    #[error("Bulk write failed: {0}")]
    Failure(Box<BulkWriteFailure>),
}

impl BulkWriteError {
    pub fn failure(&self) -> Option<&BulkWriteFailure> {
        match self {
            BulkWriteError::Failure(failure) => Some(&**failure),
            BulkWriteError::Driver(_) => None,
        }
    }
}

/// Maps executor outcomes back onto the caller's intents
pub struct ResultAggregator {
    intents: Vec<Option<WriteModel>>,
    acknowledged: bool,
}

impl ResultAggregator {
    pub fn new(intents: Vec<WriteModel>, acknowledged: bool) -> Self {
        Self {
            intents: intents.into_iter().map(Some).collect(),
            acknowledged,
        }
    }

    pub fn aggregate(
        mut self,
        outcome: BulkOutcome,
    ) -> std::result::Result<BulkWriteResult, BulkWriteError> {
        match outcome {
            BulkOutcome::Completed(summary) => {
                let result = self.result(summary)?;
                info!(
                    requests = result.request_count(),
                    processed = result.processed_requests().len(),
                    "bulk write completed"
                );
                Ok(result)
            }
            BulkOutcome::PartialFailure {
                summary,
                write_errors,
                write_concern_error,
                command_error,
            } => {
                let unprocessed_requests = self.take_all(&summary.unprocessed)?;
                let result = self.result(summary)?;
                let write_errors: Vec<WriteError> =
                    write_errors.into_iter().map(WriteError::from).collect();
                warn!(
                    errors = write_errors.len(),
                    write_concern_error = write_concern_error.is_some(),
                    command_error = command_error.is_some(),
                    processed = result.processed_requests().len(),
                    "bulk write partially failed"
                );
                Err(BulkWriteError::Failure(Box::new(BulkWriteFailure {
                    result,
                    write_errors,
                    write_concern_error,
                    command_error,
                    unprocessed_requests,
                })))
            }
        }
    }

    fn result(&mut self, summary: RawBulkSummary) -> Result<BulkWriteResult> {
        let processed_requests = self.take_all(&summary.processed)?;
        if self.acknowledged {
            Ok(BulkWriteResult::Acknowledged {
                request_count: summary.request_count,
                matched_count: summary.matched_count,
                deleted_count: summary.deleted_count,
                inserted_count: summary.inserted_count,
                modified_count: summary.modified_count,
                upserts: summary.upserts,
                processed_requests,
            })
        } else {
            Ok(BulkWriteResult::Unacknowledged {
                request_count: summary.request_count,
                processed_requests,
            })
        }
    }

    fn take_all(&mut self, correlation_ids: &[usize]) -> Result<Vec<WriteModel>> {
        correlation_ids
            .iter()
            .map(|&id| {
                self.intents
                    .get_mut(id)
                    .and_then(Option::take)
                    .ok_or_else(|| {
                        DocketError::Internal(format!(
                            "executor reported unknown or repeated correlation id {}",
                            id
                        ))
                    })
            })
            .collect()
    }
}

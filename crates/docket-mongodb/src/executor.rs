//! [`OperationExecutor`] over `mongodb::Database::run_command`

use async_trait::async_trait;
use bson::{Bson, Document};
use docket_common::{DocketError, Result};
use mongodb::Database;
use tracing::{debug, instrument, warn};

use crate::bulk::{
    BatchDescriptor, BulkOutcome, BulkWriteUpsert, OperationExecutor, RawBulkSummary,
    RawWriteError, WriteCommand, WriteConcernError,
};
use crate::write_model::WriteRequestKind;

/// Runs batches as `insert`/`update`/`delete` commands
#[derive(Debug, Clone)]
pub struct MongoCommandExecutor {
    database: Database,
}

impl MongoCommandExecutor {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl OperationExecutor for MongoCommandExecutor {
    #[instrument(
        skip(self, batch),
        fields(namespace = %batch.namespace, requests = batch.len())
    )]
    async fn execute(&self, batch: &BatchDescriptor) -> Result<BulkOutcome> {
        if batch.namespace.database != self.database.name() {
            return Err(DocketError::Configuration(format!(
                "Batch targets database '{}' but the executor is bound to '{}'",
                batch.namespace.database,
                self.database.name()
            )));
        }

        let commands = batch.to_commands(batch.max_batch_count)?;
        let mut replies = Vec::with_capacity(commands.len());
        for command in &commands {
            let parsed = match self.database.run_command(command.command.clone()).await {
                Ok(reply) => parse_reply(command, &reply),
                Err(err) => Err(DocketError::from(err)),
            };
            let parsed = match parsed {
                Ok(parsed) => parsed,
                Err(err) if replies.is_empty() => return Err(err),
                Err(err) => {
                    warn!(
                        error = %err,
                        applied_commands = replies.len(),
                        "write command failed after earlier commands were applied"
                    );
                    return Ok(merge_replies(batch, &commands, replies, Some(err)));
                }
            };
            let stop = batch.is_ordered() && !parsed.write_errors.is_empty();
            replies.push(parsed);
            if stop {
                debug!("ordered batch stopped at first write error");
                break;
            }
        }

        Ok(merge_replies(batch, &commands, replies, None))
    }
}

/// Parsed reply of one write command, indexed by correlation id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandReply {
    pub kind: Option<WriteRequestKind>,
    pub n: u64,
    pub modified: u64,
    pub upserts: Vec<BulkWriteUpsert>,
    pub write_errors: Vec<RawWriteError>,
    pub write_concern_error: Option<WriteConcernError>,
    pub processed: Vec<usize>,
    pub unprocessed: Vec<usize>,
}

fn read_count(reply: &Document, key: &str) -> u64 {
    match reply.get(key) {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Double(n)) if *n >= 0.0 => *n as u64,
        _ => 0,
    }
}

fn read_i32(document: &Document, key: &str) -> Option<i32> {
    match document.get(key) {
        Some(Bson::Int32(n)) => Some(*n),
        Some(Bson::Int64(n)) => i32::try_from(*n).ok(),
        Some(Bson::Double(n)) => Some(*n as i32),
        _ => None,
    }
}

fn statement_index(
    command: &WriteCommand,
    entry: &Document,
    what: &str,
) -> Result<(usize, usize)> {
    let position = read_i32(entry, "index")
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| {
            DocketError::MongoDB(format!("{} without a valid index: {}", what, entry))
        })?;
    let correlation_id = command.correlation_ids.get(position).copied().ok_or_else(|| {
        DocketError::MongoDB(format!(
            "{} index {} outside a command of {} statements",
            what,
            position,
            command.correlation_ids.len()
        ))
    })?;
    Ok((position, correlation_id))
}

/// Parse a write command reply.
///
/// Reply indexes are positions within the command and are mapped back to
/// correlation ids. For ordered commands the statements after the first
/// write error were never attempted.
pub fn parse_reply(command: &WriteCommand, reply: &Document) -> Result<CommandReply> {
    let ordered = command.command.get_bool("ordered").unwrap_or(true);
    let mut parsed = CommandReply {
        kind: Some(command.kind),
        n: read_count(reply, "n"),
        modified: read_count(reply, "nModified"),
        ..Default::default()
    };

    if let Ok(upserted) = reply.get_array("upserted") {
        for entry in upserted {
            let Bson::Document(entry) = entry else { continue };
            let (_, index) = statement_index(command, entry, "upserted entry")?;
            let id = entry.get("_id").cloned().unwrap_or(Bson::Null);
            parsed.upserts.push(BulkWriteUpsert { index, id });
        }
    }

    let mut failed_positions = Vec::new();
    if let Ok(errors) = reply.get_array("writeErrors") {
        for entry in errors {
            let Bson::Document(entry) = entry else { continue };
            let (position, index) = statement_index(command, entry, "write error")?;
            failed_positions.push(position);
            parsed.write_errors.push(RawWriteError {
                index,
                code: read_i32(entry, "code").unwrap_or(0),
                message: entry.get_str("errmsg").unwrap_or_default().to_string(),
                details: entry.get_document("errInfo").ok().cloned(),
            });
        }
    }

    if let Ok(wce) = reply.get_document("writeConcernError") {
        parsed.write_concern_error = Some(WriteConcernError {
            code: read_i32(wce, "code").unwrap_or(0),
            code_name: wce.get_str("codeName").unwrap_or_default().to_string(),
            message: wce.get_str("errmsg").unwrap_or_default().to_string(),
            details: wce.get_document("errInfo").ok().cloned(),
        });
    }

    let stop_at = if ordered {
        failed_positions.iter().min().copied()
    } else {
        None
    };
    for (position, &correlation_id) in command.correlation_ids.iter().enumerate() {
        match stop_at {
            Some(stop) if position > stop => parsed.unprocessed.push(correlation_id),
            _ if failed_positions.contains(&position) => {}
            _ => parsed.processed.push(correlation_id),
        }
    }

    Ok(parsed)
}

/// Fold command replies into one outcome.
///
/// Commands without a reply were never sent or failed as a whole; their
/// statements are reported unprocessed. `command_error` is the failure that
/// ended the batch early, if any.
pub fn merge_replies(
    batch: &BatchDescriptor,
    commands: &[WriteCommand],
    replies: Vec<CommandReply>,
    command_error: Option<DocketError>,
) -> BulkOutcome {
    let mut summary = RawBulkSummary {
        request_count: batch.len(),
        ..Default::default()
    };
    let mut write_errors = Vec::new();
    let mut write_concern_error = None;

    for command in commands.iter().skip(replies.len()) {
        summary.unprocessed.extend(command.correlation_ids.iter().copied());
    }

    for reply in replies {
        match reply.kind {
            Some(WriteRequestKind::Insert) => summary.inserted_count += reply.n,
            Some(WriteRequestKind::Delete) => summary.deleted_count += reply.n,
            Some(WriteRequestKind::Update) => {
                let upserted = reply.upserts.len() as u64;
                summary.matched_count += reply.n.saturating_sub(upserted);
                summary.modified_count += reply.modified;
            }
            None => {}
        }
        summary.upserts.extend(reply.upserts);
        summary.processed.extend(reply.processed);
        summary.unprocessed.extend(reply.unprocessed);
        write_errors.extend(reply.write_errors);
        if let Some(wce) = reply.write_concern_error {
            warn!(code = wce.code, message = %wce.message, "write concern error");
            write_concern_error = Some(wce);
        }
    }
    summary.processed.sort_unstable();
    summary.unprocessed.sort_unstable();
    write_errors.sort_by_key(|e| e.index);

    if write_errors.is_empty() && write_concern_error.is_none() && command_error.is_none() {
        BulkOutcome::Completed(summary)
    } else {
        BulkOutcome::PartialFailure {
            summary,
            write_errors,
            write_concern_error,
            command_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::{BulkBatchBuilder, BulkWriteOptions, CollectionNamespace};
    use crate::write_model::{UpdateType, WriteRequest};
    use bson::doc;
    use mongodb::options::WriteConcern;

    fn command(kind: WriteRequestKind, ids: Vec<usize>, ordered: bool) -> WriteCommand {
        WriteCommand {
            kind,
            command: doc! { "ordered": ordered },
            correlation_ids: ids,
        }
    }

    fn insert(id: usize) -> WriteRequest {
        WriteRequest::Insert {
            correlation_id: id,
            document: doc! { "_id": id as i64 },
        }
    }

    fn update(id: usize) -> WriteRequest {
        WriteRequest::Update {
            correlation_id: id,
            filter: doc! { "k": id as i64 },
            update: Bson::Document(doc! { "$set": { "x": 1 } }),
            update_type: UpdateType::Update,
            is_multi: false,
            is_upsert: true,
            collation: None,
            hint: None,
            array_filters: None,
        }
    }

    fn batch(requests: Vec<WriteRequest>, ordered: bool) -> BatchDescriptor {
        let namespace = CollectionNamespace::new("db", "c").unwrap();
        BulkBatchBuilder::new(namespace, WriteConcern::default())
            .build(requests, BulkWriteOptions::new().ordered(ordered))
    }

    #[test]
    fn test_parse_insert_reply() {
        let command = command(WriteRequestKind::Insert, vec![0, 1], true);
        let reply = parse_reply(&command, &doc! { "n": 2, "ok": 1.0 }).unwrap();
        assert_eq!(reply.n, 2);
        assert_eq!(reply.processed, vec![0, 1]);
        assert!(reply.write_errors.is_empty());
    }

    #[test]
    fn test_parse_ordered_write_error() {
        let command = command(WriteRequestKind::Insert, vec![4, 5, 6], true);
        let reply = doc! {
            "n": 1,
            "writeErrors": [{ "index": 1, "code": 11000, "errmsg": "E11000 duplicate key" }],
            "ok": 1.0,
        };
        let parsed = parse_reply(&command, &reply).unwrap();
        assert_eq!(parsed.processed, vec![4]);
        assert_eq!(parsed.unprocessed, vec![6]);
        assert_eq!(parsed.write_errors[0].index, 5);
        assert_eq!(parsed.write_errors[0].code, 11000);
    }

    #[test]
    fn test_parse_unordered_write_error() {
        let command = command(WriteRequestKind::Insert, vec![0, 1, 2], false);
        let reply = doc! {
            "n": 2,
            "writeErrors": [{ "index": 1, "code": 11000, "errmsg": "dup" }],
        };
        let parsed = parse_reply(&command, &reply).unwrap();
        assert_eq!(parsed.processed, vec![0, 2]);
        assert!(parsed.unprocessed.is_empty());
    }

    #[test]
    fn test_parse_upserts_and_write_concern_error() {
        let command = command(WriteRequestKind::Update, vec![3, 7], true);
        let reply = doc! {
            "n": 2,
            "nModified": 1,
            "upserted": [{ "index": 1, "_id": "new" }],
            "writeConcernError": {
                "code": 64,
                "codeName": "WriteConcernFailed",
                "errmsg": "timeout",
            },
        };
        let parsed = parse_reply(&command, &reply).unwrap();
        assert_eq!(
            parsed.upserts,
            vec![BulkWriteUpsert {
                index: 7,
                id: Bson::String("new".to_string())
            }]
        );
        let wce = parsed.write_concern_error.unwrap();
        assert_eq!(wce.code, 64);
        assert_eq!(wce.code_name, "WriteConcernFailed");
    }

    #[test]
    fn test_parse_rejects_out_of_range_index() {
        let command = command(WriteRequestKind::Insert, vec![0], true);
        let reply = doc! { "writeErrors": [{ "index": 3, "code": 1, "errmsg": "x" }] };
        assert!(parse_reply(&command, &reply).is_err());
    }

    #[test]
    fn test_merge_counts_matched_without_upserts() {
        let batch = batch(vec![update(0), update(1)], true);
        let commands = batch.to_commands(10).unwrap();
        let reply = parse_reply(
            &commands[0],
            &doc! { "n": 2, "nModified": 1, "upserted": [{ "index": 1, "_id": 9 }] },
        )
        .unwrap();
        match merge_replies(&batch, &commands, vec![reply], None) {
            BulkOutcome::Completed(summary) => {
                assert_eq!(summary.matched_count, 1);
                assert_eq!(summary.modified_count, 1);
                assert_eq!(summary.upserts.len(), 1);
                assert_eq!(summary.processed, vec![0, 1]);
            }
            other => panic!("expected completed outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_marks_unsent_commands_unprocessed() {
        let batch = batch(vec![insert(0), insert(1), update(2), insert(3)], true);
        let commands = batch.to_commands(10).unwrap();
        assert_eq!(commands.len(), 3);
        let first = parse_reply(
            &commands[0],
            &doc! { "n": 1, "writeErrors": [{ "index": 1, "code": 11000, "errmsg": "dup" }] },
        )
        .unwrap();
        match merge_replies(&batch, &commands, vec![first], None) {
            BulkOutcome::PartialFailure {
                summary,
                write_errors,
                ..
            } => {
                assert_eq!(summary.processed, vec![0]);
                assert_eq!(summary.unprocessed, vec![2, 3]);
                assert_eq!(summary.inserted_count, 1);
                assert_eq!(write_errors[0].index, 1);
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_keeps_applied_commands_after_command_error() {
        let batch = batch(vec![insert(0), update(1), insert(2)], true);
        let commands = batch.to_commands(batch.max_batch_count).unwrap();
        assert_eq!(commands.len(), 3);
        let first = parse_reply(&commands[0], &doc! { "n": 1, "ok": 1.0 }).unwrap();
        let error = DocketError::Connection("connection reset by peer".to_string());
        match merge_replies(&batch, &commands, vec![first], Some(error.clone())) {
            BulkOutcome::PartialFailure {
                summary,
                write_errors,
                command_error,
                ..
            } => {
                assert_eq!(summary.inserted_count, 1);
                assert_eq!(summary.processed, vec![0]);
                assert_eq!(summary.unprocessed, vec![1, 2]);
                assert!(write_errors.is_empty());
                assert_eq!(command_error, Some(error));
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
    }

    #[test]
    fn test_commands_follow_batch_max_batch_count() {
        let requests = (0..5).map(insert).collect();
        let namespace = CollectionNamespace::new("db", "c").unwrap();
        let batch = BulkBatchBuilder::new(namespace, WriteConcern::default())
            .max_batch_count(2)
            .build(requests, BulkWriteOptions::default());
        let commands = batch.to_commands(batch.max_batch_count).unwrap();
        assert_eq!(commands.len(), 3);
    }
}

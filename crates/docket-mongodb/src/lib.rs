//! MongoDB filter/update compiler and bulk-write pipeline for docket
//!
//! This crate turns typed, immutable filter and update expressions into
//! MongoDB wire documents, and write intents into bulk write commands whose
//! results are mapped back onto the caller's intents.
//!
//! # Features
//! - Filter algebra with `&`, `|` and `!`, merging conjunctions without `$and` where possible
//! - Unsigned 32/64-bit range comparisons on fields stored as signed integers
//! - Schema-driven field resolution (strict or dynamic) and value codecs
//! - Update builder covering the field, array and bitwise operators
//! - Bulk writes with correlation ids, ordered/unordered splitting and partial-failure results

pub mod bulk;
pub mod collection;
pub mod connection;
pub mod executor;
pub mod field;
pub mod filter;
pub mod schema;
pub mod settings;
pub mod update;
pub mod validation;
pub mod write_model;

pub use bulk::{
    BatchDescriptor, BulkBatchBuilder, BulkOutcome, BulkWriteError, BulkWriteFailure,
    BulkWriteOptions, BulkWriteResult, BulkWriteUpsert, CollectionNamespace, OperationExecutor,
    RawBulkSummary, RawWriteError, ResultAggregator, ServerErrorCategory, WriteCommand,
    WriteConcernError, WriteError,
};
pub use collection::{
    Collection, DeleteResult, InsertOneResult, UpdateResult, WriteFailure, WriteOperationError,
};
pub use connection::{Connection, ConnectionConfig};
pub use docket_common::{DocketError, Result};
pub use executor::MongoCommandExecutor;
pub use field::{
    FieldAccessor, FieldCodec, FieldPath, FieldResolver, FieldValue, ResolvedField, UnsignedWidth,
    ValueEncoder,
};
pub use filter::{Filter, RangeOperator};
pub use schema::{DocumentSchema, IdGenerator, IdMember, ObjectIdGenerator, SchemaMode};
pub use settings::CollectionSettings;
pub use update::{BitwiseUpdate, CurrentDateType, PushSort, Update};
pub use validation::{ValidatedCollectionName, ValidatedFieldName};
pub use write_model::{
    CompiledBatch, UpdateModification, UpdateType, WriteModel, WriteModelCompiler, WriteRequest,
    WriteRequestKind,
};

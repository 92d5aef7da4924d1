//! Write intents and the compiler that turns them into wire-level requests.
//!
//! Each [`WriteModel`] yields exactly one [`WriteRequest`] whose correlation
//! id is the zero-based position of the intent in the input. The intents
//! themselves are kept (with any assigned id written into insert documents)
//! so bulk results can hand them back by correlation id.

use bson::{Bson, Document};
use docket_common::{DocketError, Result};
use mongodb::options::{Collation, Hint};
use tracing::{debug, instrument};

use crate::field::FieldResolver;
use crate::filter::Filter;
use crate::settings::CollectionSettings;
use crate::update::Update;

/// Update half of an update intent
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateModification {
    /// Update operators (`$set`, `$inc`, ...)
    Fields(Update),
    /// Aggregation pipeline stages
    Pipeline(Vec<Document>),
}

impl From<Update> for UpdateModification {
    fn from(update: Update) -> Self {
        UpdateModification::Fields(update)
    }
}

impl From<Document> for UpdateModification {
    fn from(document: Document) -> Self {
        UpdateModification::Fields(Update::Raw(document))
    }
}

impl From<Vec<Document>> for UpdateModification {
    fn from(pipeline: Vec<Document>) -> Self {
        UpdateModification::Pipeline(pipeline)
    }
}

/// Caller-supplied write intent
#[derive(Debug, Clone)]
pub enum WriteModel {
    InsertOne {
        document: Document,
    },
    DeleteOne {
        filter: Filter,
        collation: Option<Collation>,
        hint: Option<Hint>,
    },
    DeleteMany {
        filter: Filter,
        collation: Option<Collation>,
        hint: Option<Hint>,
    },
    ReplaceOne {
        filter: Filter,
        replacement: Document,
        collation: Option<Collation>,
        hint: Option<Hint>,
        is_upsert: bool,
    },
    UpdateOne {
        filter: Filter,
        update: UpdateModification,
        array_filters: Option<Vec<Document>>,
        collation: Option<Collation>,
        hint: Option<Hint>,
        is_upsert: bool,
    },
    UpdateMany {
        filter: Filter,
        update: UpdateModification,
        array_filters: Option<Vec<Document>>,
        collation: Option<Collation>,
        hint: Option<Hint>,
        is_upsert: bool,
    },
}

impl WriteModel {
    pub fn insert_one(document: Document) -> Self {
        WriteModel::InsertOne { document }
    }

    pub fn delete_one(filter: impl Into<Filter>) -> Self {
        WriteModel::DeleteOne {
            filter: filter.into(),
            collation: None,
            hint: None,
        }
    }

    pub fn delete_many(filter: impl Into<Filter>) -> Self {
        WriteModel::DeleteMany {
            filter: filter.into(),
            collation: None,
            hint: None,
        }
    }

    pub fn replace_one(filter: impl Into<Filter>, replacement: Document) -> Self {
        WriteModel::ReplaceOne {
            filter: filter.into(),
            replacement,
            collation: None,
            hint: None,
            is_upsert: false,
        }
    }

    pub fn update_one(filter: impl Into<Filter>, update: impl Into<UpdateModification>) -> Self {
        WriteModel::UpdateOne {
            filter: filter.into(),
            update: update.into(),
            array_filters: None,
            collation: None,
            hint: None,
            is_upsert: false,
        }
    }

    pub fn update_many(filter: impl Into<Filter>, update: impl Into<UpdateModification>) -> Self {
        WriteModel::UpdateMany {
            filter: filter.into(),
            update: update.into(),
            array_filters: None,
            collation: None,
            hint: None,
            is_upsert: false,
        }
    }

    /// Set the collation; ignored for inserts
    pub fn with_collation(mut self, value: Collation) -> Self {
        match &mut self {
            WriteModel::InsertOne { .. } => {}
            WriteModel::DeleteOne { collation, .. }
            | WriteModel::DeleteMany { collation, .. }
            | WriteModel::ReplaceOne { collation, .. }
            | WriteModel::UpdateOne { collation, .. }
            | WriteModel::UpdateMany { collation, .. } => *collation = Some(value),
        }
        self
    }

    /// Set the index hint; ignored for inserts
    pub fn with_hint(mut self, value: Hint) -> Self {
        match &mut self {
            WriteModel::InsertOne { .. } => {}
            WriteModel::DeleteOne { hint, .. }
            | WriteModel::DeleteMany { hint, .. }
            | WriteModel::ReplaceOne { hint, .. }
            | WriteModel::UpdateOne { hint, .. }
            | WriteModel::UpdateMany { hint, .. } => *hint = Some(value),
        }
        self
    }

    /// Set upsert; ignored for inserts and deletes
    pub fn with_upsert(mut self, value: bool) -> Self {
        match &mut self {
            WriteModel::ReplaceOne { is_upsert, .. }
            | WriteModel::UpdateOne { is_upsert, .. }
            | WriteModel::UpdateMany { is_upsert, .. } => *is_upsert = value,
            _ => {}
        }
        self
    }

    /// Set array filters; ignored for everything but updates
    pub fn with_array_filters(mut self, filters: Vec<Document>) -> Self {
        match &mut self {
            WriteModel::UpdateOne { array_filters, .. }
            | WriteModel::UpdateMany { array_filters, .. } => *array_filters = Some(filters),
            _ => {}
        }
        self
    }

    pub fn kind(&self) -> WriteRequestKind {
        match self {
            WriteModel::InsertOne { .. } => WriteRequestKind::Insert,
            WriteModel::DeleteOne { .. } | WriteModel::DeleteMany { .. } => {
                WriteRequestKind::Delete
            }
            WriteModel::ReplaceOne { .. }
            | WriteModel::UpdateOne { .. }
            | WriteModel::UpdateMany { .. } => WriteRequestKind::Update,
        }
    }

    /// Document of an insert intent, including any assigned id
    pub fn inserted_document(&self) -> Option<&Document> {
        match self {
            WriteModel::InsertOne { document } => Some(document),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteRequestKind {
    Insert,
    Update,
    Delete,
}

impl WriteRequestKind {
    /// Command name and the array field holding its statements
    pub fn command_fields(self) -> (&'static str, &'static str) {
        match self {
            WriteRequestKind::Insert => ("insert", "documents"),
            WriteRequestKind::Update => ("update", "updates"),
            WriteRequestKind::Delete => ("delete", "deletes"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Update,
    Replacement,
    Pipeline,
}

/// Wire-level write request
#[derive(Debug, Clone)]
pub enum WriteRequest {
    Insert {
        correlation_id: usize,
        document: Document,
    },
    Delete {
        correlation_id: usize,
        filter: Document,
        /// 1 deletes a single document, 0 deletes all matches
        limit: i32,
        collation: Option<Collation>,
        hint: Option<Hint>,
    },
    Update {
        correlation_id: usize,
        filter: Document,
        /// Operator document, replacement document or pipeline array
        update: Bson,
        update_type: UpdateType,
        is_multi: bool,
        is_upsert: bool,
        collation: Option<Collation>,
        hint: Option<Hint>,
        array_filters: Option<Vec<Document>>,
    },
}

impl WriteRequest {
    pub fn correlation_id(&self) -> usize {
        match self {
            WriteRequest::Insert { correlation_id, .. }
            | WriteRequest::Delete { correlation_id, .. }
            | WriteRequest::Update { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn kind(&self) -> WriteRequestKind {
        match self {
            WriteRequest::Insert { .. } => WriteRequestKind::Insert,
            WriteRequest::Delete { .. } => WriteRequestKind::Delete,
            WriteRequest::Update { .. } => WriteRequestKind::Update,
        }
    }

    /// Statement as it appears in the command's `documents`/`updates`/`deletes` array
    pub fn to_statement(&self) -> Result<Document> {
        match self {
            WriteRequest::Insert { document, .. } => Ok(document.clone()),
            WriteRequest::Delete {
                filter,
                limit,
                collation,
                hint,
                ..
            } => {
                let mut statement = Document::new();
                statement.insert("q", filter.clone());
                statement.insert("limit", *limit);
                push_options(&mut statement, collation.as_ref(), hint.as_ref())?;
                Ok(statement)
            }
            WriteRequest::Update {
                filter,
                update,
                is_multi,
                is_upsert,
                collation,
                hint,
                array_filters,
                ..
            } => {
                let mut statement = Document::new();
                statement.insert("q", filter.clone());
                statement.insert("u", update.clone());
                if *is_multi {
                    statement.insert("multi", true);
                }
                if *is_upsert {
                    statement.insert("upsert", true);
                }
                push_options(&mut statement, collation.as_ref(), hint.as_ref())?;
                if let Some(array_filters) = array_filters {
                    statement.insert("arrayFilters", array_filters.clone());
                }
                Ok(statement)
            }
        }
    }
}

fn push_options(
    statement: &mut Document,
    collation: Option<&Collation>,
    hint: Option<&Hint>,
) -> Result<()> {
    if let Some(collation) = collation {
        statement.insert("collation", bson::to_document(collation)?);
    }
    match hint {
        Some(Hint::Keys(keys)) => {
            statement.insert("hint", keys.clone());
        }
        Some(Hint::Name(name)) => {
            statement.insert("hint", name.clone());
        }
        Some(_) | None => {}
    }
    Ok(())
}

/// Compiled requests plus the intents they came from, both indexed by correlation id
#[derive(Debug, Clone)]
pub struct CompiledBatch {
    pub requests: Vec<WriteRequest>,
    pub intents: Vec<WriteModel>,
}

impl CompiledBatch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Compiles write intents against one collection's schema and settings
pub struct WriteModelCompiler<'a> {
    resolver: &'a dyn FieldResolver,
    settings: &'a CollectionSettings,
}

impl<'a> WriteModelCompiler<'a> {
    pub fn new(resolver: &'a dyn FieldResolver, settings: &'a CollectionSettings) -> Self {
        Self { resolver, settings }
    }

    /// Compile every intent in a single pass over `models`.
    ///
    /// Fails without producing a partial batch when any intent is invalid.
    #[instrument(skip(self, models), fields(schema = %self.resolver.schema_name()))]
    pub fn compile<I>(&self, models: I) -> Result<CompiledBatch>
    where
        I: IntoIterator<Item = WriteModel>,
    {
        let models = models.into_iter();
        let (lower, _) = models.size_hint();
        let mut requests = Vec::with_capacity(lower);
        let mut intents = Vec::with_capacity(lower);

        for (correlation_id, mut model) in models.enumerate() {
            let request = self.compile_one(correlation_id, &mut model)?;
            requests.push(request);
            intents.push(model);
        }

        if requests.is_empty() {
            return Err(DocketError::Configuration(
                "Must contain at least 1 request.".to_string(),
            ));
        }

        debug!(count = requests.len(), "compiled write models");
        Ok(CompiledBatch { requests, intents })
    }

    fn compile_one(&self, correlation_id: usize, model: &mut WriteModel) -> Result<WriteRequest> {
        match model {
            WriteModel::InsertOne { document } => {
                if self.settings.assign_id_on_insert {
                    if let Some(id_member) = self.resolver.id_member() {
                        if let Some(id) = id_member.assign(document) {
                            debug!(correlation_id, id = %id, "assigned id to inserted document");
                        }
                    }
                }
                Ok(WriteRequest::Insert {
                    correlation_id,
                    document: document.clone(),
                })
            }
            WriteModel::DeleteOne {
                filter,
                collation,
                hint,
            } => Ok(WriteRequest::Delete {
                correlation_id,
                filter: filter.render(self.resolver)?,
                limit: 1,
                collation: collation.clone(),
                hint: hint.clone(),
            }),
            WriteModel::DeleteMany {
                filter,
                collation,
                hint,
            } => Ok(WriteRequest::Delete {
                correlation_id,
                filter: filter.render(self.resolver)?,
                limit: 0,
                collation: collation.clone(),
                hint: hint.clone(),
            }),
            WriteModel::ReplaceOne {
                filter,
                replacement,
                collation,
                hint,
                is_upsert,
            } => {
                if let Some(key) = replacement.keys().find(|key| key.starts_with('$')) {
                    return Err(DocketError::Configuration(format!(
                        "Replacement document cannot contain update operator '{}'",
                        key
                    )));
                }
                Ok(WriteRequest::Update {
                    correlation_id,
                    filter: filter.render(self.resolver)?,
                    update: Bson::Document(replacement.clone()),
                    update_type: UpdateType::Replacement,
                    is_multi: false,
                    is_upsert: *is_upsert,
                    collation: collation.clone(),
                    hint: hint.clone(),
                    array_filters: None,
                })
            }
            WriteModel::UpdateOne {
                filter,
                update,
                array_filters,
                collation,
                hint,
                is_upsert,
            } => self.compile_update(
                correlation_id,
                UpdateParts {
                    filter,
                    update,
                    array_filters,
                    collation,
                    hint,
                    is_upsert: *is_upsert,
                    is_multi: false,
                },
            ),
            WriteModel::UpdateMany {
                filter,
                update,
                array_filters,
                collation,
                hint,
                is_upsert,
            } => self.compile_update(
                correlation_id,
                UpdateParts {
                    filter,
                    update,
                    array_filters,
                    collation,
                    hint,
                    is_upsert: *is_upsert,
                    is_multi: true,
                },
            ),
        }
    }

    fn compile_update(
        &self,
        correlation_id: usize,
        parts: UpdateParts<'_>,
    ) -> Result<WriteRequest> {
        let (update, update_type) = match parts.update {
            UpdateModification::Pipeline(stages) => {
                if parts.array_filters.as_ref().is_some_and(|f| !f.is_empty()) {
                    return Err(DocketError::Configuration(
                        "An update pipeline cannot be combined with arrayFilters".to_string(),
                    ));
                }
                let stages = stages.iter().cloned().map(Bson::Document).collect();
                (Bson::Array(stages), UpdateType::Pipeline)
            }
            UpdateModification::Fields(fields) => {
                let rendered = fields.render(self.resolver)?;
                if let Some(key) = rendered.keys().find(|key| !key.starts_with('$')) {
                    return Err(DocketError::Configuration(format!(
                        "Update document must only contain update operators, found '{}'",
                        key
                    )));
                }
                (Bson::Document(rendered), UpdateType::Update)
            }
        };

        Ok(WriteRequest::Update {
            correlation_id,
            filter: parts.filter.render(self.resolver)?,
            update,
            update_type,
            is_multi: parts.is_multi,
            is_upsert: parts.is_upsert,
            collation: parts.collation.clone(),
            hint: parts.hint.clone(),
            array_filters: parts.array_filters.clone(),
        })
    }
}

struct UpdateParts<'m> {
    filter: &'m Filter,
    update: &'m UpdateModification,
    array_filters: &'m Option<Vec<Document>>,
    collation: &'m Option<Collation>,
    hint: &'m Option<Hint>,
    is_upsert: bool,
    is_multi: bool,
}

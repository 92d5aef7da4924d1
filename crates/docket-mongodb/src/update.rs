//! Update builder
//!
//! Every operation resolves its field through the [`FieldResolver`] and
//! encodes values with the field codec, so updates against a `UInt32` member
//! write the same bit pattern the filters compare against.
//!
//! ```rust,ignore
//! let update = Update::set("Name", "Jack")
//!     .and(Update::inc("Visits", 1))
//!     .and(Update::push_each("Tags", vec!["a", "b"]).slice(-10));
//! let rendered = update.render(&schema)?;
//! ```

use bson::{doc, Bson, Document};
use docket_common::{DocketError, Result};

use crate::field::{FieldPath, FieldResolver, FieldValue, ResolvedField};
use crate::filter::{compile, Filter};

/// `$currentDate` target type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentDateType {
    Date,
    Timestamp,
}

/// `$bit` operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitwiseUpdate {
    And,
    Or,
    Xor,
}

impl BitwiseUpdate {
    fn keyword(self) -> &'static str {
        match self {
            BitwiseUpdate::And => "and",
            BitwiseUpdate::Or => "or",
            BitwiseUpdate::Xor => "xor",
        }
    }
}

/// `$sort` modifier of a push-each
#[derive(Debug, Clone, PartialEq)]
pub enum PushSort {
    /// 1 ascending, -1 descending
    Direction(i32),
    /// Sort embedded documents by the given keys
    Fields(Document),
}

/// Unrendered update expression
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Set(FieldPath, FieldValue),
    SetOnInsert(FieldPath, FieldValue),
    Unset(FieldPath),
    Inc(FieldPath, FieldValue),
    Mul(FieldPath, FieldValue),
    Min(FieldPath, FieldValue),
    Max(FieldPath, FieldValue),
    /// New name is written verbatim
    Rename(FieldPath, String),
    CurrentDate(FieldPath, CurrentDateType),
    Push(FieldPath, FieldValue),
    PushEach {
        field: FieldPath,
        values: Vec<FieldValue>,
        slice: Option<i32>,
        position: Option<i32>,
        sort: Option<PushSort>,
    },
    AddToSet(FieldPath, FieldValue),
    AddToSetEach(FieldPath, Vec<FieldValue>),
    PopFirst(FieldPath),
    PopLast(FieldPath),
    Pull(FieldPath, FieldValue),
    PullAll(FieldPath, Vec<FieldValue>),
    /// `$pull` with a condition on the array elements
    PullFilter(FieldPath, Filter),
    Bitwise(FieldPath, BitwiseUpdate, FieldValue),
    Combine(Vec<Update>),
    Raw(Document),
}

fn values<I, V>(items: I) -> Vec<FieldValue>
where
    I: IntoIterator<Item = V>,
    V: Into<FieldValue>,
{
    items.into_iter().map(Into::into).collect()
}

impl Update {
    pub fn set(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::Set(field.into(), value.into())
    }

    pub fn set_on_insert(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::SetOnInsert(field.into(), value.into())
    }

    pub fn unset(field: impl Into<FieldPath>) -> Self {
        Update::Unset(field.into())
    }

    pub fn inc(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::Inc(field.into(), value.into())
    }

    pub fn mul(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::Mul(field.into(), value.into())
    }

    pub fn min(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::Min(field.into(), value.into())
    }

    pub fn max(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::Max(field.into(), value.into())
    }

    pub fn rename(field: impl Into<FieldPath>, new_name: impl Into<String>) -> Self {
        Update::Rename(field.into(), new_name.into())
    }

    pub fn current_date(field: impl Into<FieldPath>, kind: CurrentDateType) -> Self {
        Update::CurrentDate(field.into(), kind)
    }

    pub fn push(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::Push(field.into(), value.into())
    }

    /// `$push` with `$each`; chain [`slice`](Self::slice), [`position`](Self::position)
    /// and [`sort`](Self::sort) to add modifiers
    pub fn push_each<I, V>(field: impl Into<FieldPath>, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        Update::PushEach {
            field: field.into(),
            values: values(items),
            slice: None,
            position: None,
            sort: None,
        }
    }

    pub fn add_to_set(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::AddToSet(field.into(), value.into())
    }

    pub fn add_to_set_each<I, V>(field: impl Into<FieldPath>, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        Update::AddToSetEach(field.into(), values(items))
    }

    pub fn pop_first(field: impl Into<FieldPath>) -> Self {
        Update::PopFirst(field.into())
    }

    pub fn pop_last(field: impl Into<FieldPath>) -> Self {
        Update::PopLast(field.into())
    }

    pub fn pull(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::Pull(field.into(), value.into())
    }

    pub fn pull_all<I, V>(field: impl Into<FieldPath>, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        Update::PullAll(field.into(), values(items))
    }

    pub fn pull_filter(field: impl Into<FieldPath>, filter: Filter) -> Self {
        Update::PullFilter(field.into(), filter)
    }

    pub fn bitwise_and(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::Bitwise(field.into(), BitwiseUpdate::And, value.into())
    }

    pub fn bitwise_or(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::Bitwise(field.into(), BitwiseUpdate::Or, value.into())
    }

    pub fn bitwise_xor(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Update::Bitwise(field.into(), BitwiseUpdate::Xor, value.into())
    }

    pub fn combine(updates: impl IntoIterator<Item = Update>) -> Self {
        Update::Combine(updates.into_iter().collect())
    }

    pub fn raw(document: Document) -> Self {
        Update::Raw(document)
    }

    /// Append another update; later operations win on the same field
    pub fn and(self, other: Update) -> Self {
        match self {
            Update::Combine(mut updates) => {
                updates.push(other);
                Update::Combine(updates)
            }
            first => Update::Combine(vec![first, other]),
        }
    }

    /// Set `$slice` on a push-each; ignored for other operations
    pub fn slice(mut self, count: i32) -> Self {
        if let Update::PushEach { slice, .. } = &mut self {
            *slice = Some(count);
        }
        self
    }

    /// Set `$position` on a push-each; ignored for other operations
    pub fn position(mut self, index: i32) -> Self {
        if let Update::PushEach { position, .. } = &mut self {
            *position = Some(index);
        }
        self
    }

    /// Set `$sort` on a push-each; ignored for other operations
    pub fn sort(mut self, order: PushSort) -> Self {
        if let Update::PushEach { sort, .. } = &mut self {
            *sort = Some(order);
        }
        self
    }

    /// Render into an update document
    pub fn render(&self, resolver: &dyn FieldResolver) -> Result<Document> {
        let mut rendered = Document::new();
        self.render_into(resolver, &mut rendered)?;
        Ok(rendered)
    }

    fn render_into(&self, resolver: &dyn FieldResolver, out: &mut Document) -> Result<()> {
        let (operator, resolved, operand) = match self {
            Update::Combine(updates) => {
                for update in updates {
                    update.render_into(resolver, out)?;
                }
                return Ok(());
            }
            Update::Raw(document) => {
                for (operator, operand) in document {
                    merge_operator(out, operator.clone(), operand.clone());
                }
                return Ok(());
            }
            Update::Set(field, value) => scalar("$set", resolver, field, value)?,
            Update::SetOnInsert(field, value) => scalar("$setOnInsert", resolver, field, value)?,
            Update::Inc(field, value) => scalar("$inc", resolver, field, value)?,
            Update::Mul(field, value) => scalar("$mul", resolver, field, value)?,
            Update::Min(field, value) => scalar("$min", resolver, field, value)?,
            Update::Max(field, value) => scalar("$max", resolver, field, value)?,
            Update::Unset(field) => ("$unset", resolver.resolve(field)?, Bson::Int32(1)),
            Update::Rename(field, new_name) => {
                ("$rename", resolver.resolve(field)?, Bson::String(new_name.clone()))
            }
            Update::CurrentDate(field, kind) => {
                let kind = match kind {
                    CurrentDateType::Date => "date",
                    CurrentDateType::Timestamp => "timestamp",
                };
                ("$currentDate", resolver.resolve(field)?, Bson::Document(doc! { "$type": kind }))
            }
            Update::Push(field, value) => item("$push", resolver, field, value)?,
            Update::PushEach {
                field,
                values,
                slice,
                position,
                sort,
            } => {
                let resolved = resolver.resolve(field)?;
                let mut each = doc! { "$each": encode_items(&resolved, values)? };
                if let Some(slice) = slice {
                    each.insert("$slice", *slice);
                }
                if let Some(position) = position {
                    each.insert("$position", *position);
                }
                match sort {
                    Some(PushSort::Direction(direction)) => {
                        each.insert("$sort", *direction);
                    }
                    Some(PushSort::Fields(fields)) => {
                        each.insert("$sort", fields.clone());
                    }
                    None => {}
                }
                ("$push", resolved, Bson::Document(each))
            }
            Update::AddToSet(field, value) => item("$addToSet", resolver, field, value)?,
            Update::AddToSetEach(field, values) => {
                let resolved = resolver.resolve(field)?;
                let each = doc! { "$each": encode_items(&resolved, values)? };
                ("$addToSet", resolved, Bson::Document(each))
            }
            Update::PopFirst(field) => ("$pop", resolver.resolve(field)?, Bson::Int32(-1)),
            Update::PopLast(field) => ("$pop", resolver.resolve(field)?, Bson::Int32(1)),
            Update::Pull(field, value) => item("$pull", resolver, field, value)?,
            Update::PullAll(field, values) => {
                let resolved = resolver.resolve(field)?;
                let operand = Bson::Array(encode_items(&resolved, values)?);
                ("$pullAll", resolved, operand)
            }
            Update::PullFilter(field, filter) => {
                let resolved = resolver.resolve(field)?;
                let elements = resolver.element_resolver(field)?;
                let condition = compile(filter, elements.as_ref())?;
                ("$pull", resolved, Bson::Document(condition))
            }
            Update::Bitwise(field, op, value) => {
                let resolved = resolver.resolve(field)?;
                let encoded = resolved.encode(value)?;
                if !matches!(encoded, Bson::Int32(_) | Bson::Int64(_)) {
                    return Err(DocketError::Configuration(format!(
                        "$bit on '{}' requires an integer operand",
                        resolved.wire_name
                    )));
                }
                let mut operand = Document::new();
                operand.insert(op.keyword(), encoded);
                ("$bit", resolved, Bson::Document(operand))
            }
        };

        let mut fields = Document::new();
        fields.insert(resolved.wire_name, operand);
        merge_operator(out, operator.to_string(), Bson::Document(fields));
        Ok(())
    }
}

fn scalar(
    operator: &'static str,
    resolver: &dyn FieldResolver,
    field: &FieldPath,
    value: &FieldValue,
) -> Result<(&'static str, ResolvedField, Bson)> {
    let resolved = resolver.resolve(field)?;
    let encoded = resolved.encode(value)?;
    Ok((operator, resolved, encoded))
}

fn item(
    operator: &'static str,
    resolver: &dyn FieldResolver,
    field: &FieldPath,
    value: &FieldValue,
) -> Result<(&'static str, ResolvedField, Bson)> {
    let resolved = resolver.resolve(field)?;
    let encoded = resolved.encode_item(value)?;
    Ok((operator, resolved, encoded))
}

fn encode_items(resolved: &ResolvedField, values: &[FieldValue]) -> Result<Vec<Bson>> {
    values.iter().map(|value| resolved.encode_item(value)).collect()
}

/// Merge `{operator: fields}` into `out`, field by field, last write wins
fn merge_operator(out: &mut Document, operator: String, operand: Bson) {
    match (out.get_mut(&operator), operand) {
        (Some(Bson::Document(existing)), Bson::Document(incoming)) => {
            for (field, value) in incoming {
                existing.insert(field, value);
            }
        }
        (_, operand) => {
            out.insert(operator, operand);
        }
    }
}

impl From<Document> for Update {
    fn from(document: Document) -> Self {
        Update::Raw(document)
    }
}

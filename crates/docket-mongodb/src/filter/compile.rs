//! Filter compiler: folds a [`Filter`] and a [`FieldResolver`] into a query document.
//!
//! Conjunctions are merged clause by clause so `a > 1 && a < 10` renders as
//! `{a: {$gt: 1, $lt: 10}}`. Only a key clash (same field, overlapping
//! operators or non-document values) promotes the result to `{$and: [...]}`.
//! Disjunctions never merge; nested `$or` children are spliced into the parent.

use bson::{doc, Bson, Document};
use docket_common::{DocketError, Result};
use tracing::trace;

use super::ast::{ComparisonOp, Filter};
use super::negate::render_not;
use super::unsigned::split_unsigned_range;
use crate::field::{FieldPath, FieldResolver, ResolvedField};

/// Render `filter` into a query document. Never mutates the input.
pub fn compile(filter: &Filter, resolver: &dyn FieldResolver) -> Result<Document> {
    match filter {
        Filter::Empty => Ok(Document::new()),
        Filter::Raw(document) => Ok(document.clone()),
        Filter::Comparison { field, op } => render_comparison(field, op, resolver),
        Filter::And(children) => render_and(children, resolver),
        Filter::Or(children) => render_or(children, resolver),
        Filter::Not(child) => render_not(child, resolver),
        Filter::ElemMatch { field, filter } => {
            let resolved = resolver.resolve(field)?;
            let elements = resolver.element_resolver(field)?;
            let rendered = compile(filter, elements.as_ref())?;
            Ok(single(resolved.wire_name, doc! { "$elemMatch": rendered }))
        }
        Filter::Text(text) => Ok(text.render()),
        Filter::Geo(geo) => geo.render(resolver),
    }
}

fn single(name: impl Into<String>, value: impl Into<Bson>) -> Document {
    let mut document = Document::new();
    document.insert(name.into(), value);
    document
}

fn operator(resolved: &ResolvedField, name: &str, operand: impl Into<Bson>) -> Document {
    single(resolved.wire_name.clone(), single(name, operand))
}

fn flatten_and<'a>(children: &'a [Filter], out: &mut Vec<&'a Filter>) {
    for child in children {
        match child {
            Filter::And(nested) => flatten_and(nested, out),
            other => out.push(other),
        }
    }
}

fn render_and(children: &[Filter], resolver: &dyn FieldResolver) -> Result<Document> {
    let mut flattened = Vec::with_capacity(children.len());
    flatten_and(children, &mut flattened);

    let mut document = Document::new();
    for child in flattened {
        let rendered = compile(child, resolver)?;
        for (name, value) in rendered {
            add_clause(&mut document, name, value)?;
        }
    }
    Ok(document)
}

/// Merge one top-level clause into a conjunction accumulator
fn add_clause(document: &mut Document, name: String, value: Bson) -> Result<()> {
    if name == "$and" {
        let Bson::Array(items) = value else {
            return Err(DocketError::Configuration(
                "$and must be an array of documents".to_string(),
            ));
        };
        for item in items {
            let Bson::Document(conjunct) = item else {
                return Err(DocketError::Configuration(
                    "$and must be an array of documents".to_string(),
                ));
            };
            for (name, value) in conjunct {
                add_clause(document, name, value)?;
            }
        }
        return Ok(());
    }

    if document.len() == 1 {
        if let Some(Bson::Array(clauses)) = document.get_mut("$and") {
            clauses.push(Bson::Document(single(name, value)));
            return Ok(());
        }
    }

    let mergeable = match (document.get(&name), &value) {
        (None, _) => None,
        (Some(Bson::Document(existing)), Bson::Document(incoming)) => {
            Some(incoming.keys().all(|key| !existing.contains_key(key)))
        }
        (Some(_), _) => Some(false),
    };

    match mergeable {
        None => {
            document.insert(name, value);
        }
        Some(true) => {
            if let (Some(Bson::Document(existing)), Bson::Document(incoming)) =
                (document.get_mut(&name), value)
            {
                for (key, operand) in incoming {
                    existing.insert(key, operand);
                }
            }
        }
        Some(false) => {
            trace!(field = %name, "clause clash, promoting to $and");
            promote_to_and(document, name, value);
        }
    }
    Ok(())
}

fn promote_to_and(document: &mut Document, name: String, value: Bson) {
    let mut clauses: Vec<Bson> = std::mem::take(document)
        .into_iter()
        .map(|(existing_name, existing_value)| {
            Bson::Document(single(existing_name, existing_value))
        })
        .collect();
    clauses.push(Bson::Document(single(name, value)));
    document.insert("$and", clauses);
}

fn render_or(children: &[Filter], resolver: &dyn FieldResolver) -> Result<Document> {
    let mut clauses = Vec::with_capacity(children.len());
    for child in children {
        let rendered = compile(child, resolver)?;
        if rendered.len() == 1 {
            if let Some(Bson::Array(nested)) = rendered.get("$or") {
                clauses.extend(nested.iter().cloned());
                continue;
            }
        }
        clauses.push(Bson::Document(rendered));
    }
    Ok(doc! { "$or": clauses })
}

fn render_comparison(
    field: &FieldPath,
    op: &ComparisonOp,
    resolver: &dyn FieldResolver,
) -> Result<Document> {
    let resolved = resolver.resolve(field)?;

    if let Some((range, value)) = op.as_range() {
        // ranges on an array field compare against its elements
        let encoded = resolved.encode_item(value)?;
        if resolved.codec.item_codec().unsigned_width().is_some() {
            return split_unsigned_range(&resolved.wire_name, range, encoded);
        }
        return Ok(operator(&resolved, range.operator_name(), encoded));
    }

    let rendered = match op {
        ComparisonOp::Eq(value) => single(resolved.wire_name.clone(), resolved.encode(value)?),
        ComparisonOp::Ne(value) => operator(&resolved, "$ne", resolved.encode(value)?),
        ComparisonOp::In(values) => operator(&resolved, "$in", encode_items(&resolved, values)?),
        ComparisonOp::Nin(values) => operator(&resolved, "$nin", encode_items(&resolved, values)?),
        ComparisonOp::All(values) => operator(&resolved, "$all", encode_items(&resolved, values)?),
        ComparisonOp::Exists(exists) => operator(&resolved, "$exists", *exists),
        ComparisonOp::Mod { modulus, remainder } => operator(
            &resolved,
            "$mod",
            vec![Bson::Int64(*modulus), Bson::Int64(*remainder)],
        ),
        ComparisonOp::Size(size) => operator(&resolved, "$size", *size),
        ComparisonOp::SizeGt(size) => array_index_exists(&resolved, i64::from(*size), true)?,
        ComparisonOp::SizeGte(size) => array_index_exists(&resolved, i64::from(*size) - 1, true)?,
        ComparisonOp::SizeLt(size) => array_index_exists(&resolved, i64::from(*size) - 1, false)?,
        ComparisonOp::SizeLte(size) => array_index_exists(&resolved, i64::from(*size), false)?,
        ComparisonOp::Type(selector) => operator(&resolved, "$type", selector.to_bson()),
        ComparisonOp::Regex(pattern) => single(resolved.wire_name.clone(), pattern.to_bson()),
        ComparisonOp::Bits(bitwise, mask) => {
            operator(&resolved, bitwise.operator_name(), mask.to_bson())
        }
        ComparisonOp::Gt(_) | ComparisonOp::Gte(_) | ComparisonOp::Lt(_) | ComparisonOp::Lte(_) => {
            return Err(DocketError::Internal(
                "range comparison reached the scalar renderer".to_string(),
            ))
        }
    };
    Ok(rendered)
}

fn encode_items(
    resolved: &ResolvedField,
    values: &[crate::field::FieldValue],
) -> Result<Vec<Bson>> {
    values.iter().map(|value| resolved.encode_item(value)).collect()
}

/// `{"field.<index>": {$exists: exists}}`, used for array size comparisons
fn array_index_exists(resolved: &ResolvedField, index: i64, exists: bool) -> Result<Document> {
    if index < 0 {
        return Err(DocketError::Configuration(format!(
            "Array size bound for '{}' must be at least 1",
            resolved.wire_name
        )));
    }
    Ok(single(
        format!("{}.{}", resolved.wire_name, index),
        doc! { "$exists": exists },
    ))
}

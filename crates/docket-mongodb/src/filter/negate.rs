//! Negation rewrites applied to rendered filters

use bson::{doc, Bson, Document};
use docket_common::Result;

use super::ast::Filter;
use super::compile::compile;
use crate::field::FieldResolver;

/// Render `Not(child)`.
///
/// `Not(Not(x))` cancels before anything is rendered.
pub(crate) fn render_not(child: &Filter, resolver: &dyn FieldResolver) -> Result<Document> {
    if let Filter::Not(inner) = child {
        return compile(inner, resolver);
    }
    compile(child, resolver).map(negate_document)
}

fn single(name: String, value: impl Into<Bson>) -> Document {
    let mut document = Document::new();
    document.insert(name, value);
    document
}

fn nor(rendered: Document) -> Document {
    doc! { "$nor": [rendered] }
}

/// Negate an already-rendered filter document.
///
/// | rendered              | negated                      |
/// |-----------------------|------------------------------|
/// | `{f: v}`              | `{f: {$ne: v}}`              |
/// | `{f: /re/}`           | `{f: {$not: /re/}}`          |
/// | `{f: {$ne: v}}`       | `{f: v}`                     |
/// | `{f: {$not: v}}`      | `{f: v}`                     |
/// | `{f: {$exists: b}}`   | `{f: {$exists: !b}}`         |
/// | `{f: {$in: xs}}`      | `{f: {$nin: xs}}` (and back) |
/// | `{$or: xs}`           | `{$nor: xs}` (and back)      |
/// | anything else         | `{$nor: [rendered]}`         |
pub fn negate_document(rendered: Document) -> Document {
    if rendered.len() != 1 {
        return nor(rendered);
    }

    let Some((name, value)) = rendered.into_iter().next() else {
        return nor(Document::new());
    };

    if name.starts_with('$') {
        return match name.as_str() {
            "$or" => single("$nor".to_string(), value),
            "$nor" => single("$or".to_string(), value),
            _ => nor(single(name, value)),
        };
    }

    match value {
        Bson::Document(selector) if is_operator_selector(&selector) => {
            if selector.len() == 1 {
                negate_operator(name, selector)
            } else {
                nor(single(name, selector))
            }
        }
        Bson::RegularExpression(regex) => single(name, doc! { "$not": regex }),
        other => single(name, doc! { "$ne": other }),
    }
}

fn is_operator_selector(selector: &Document) -> bool {
    selector
        .keys()
        .next()
        .map(|key| key.starts_with('$') && key != "$ref")
        .unwrap_or(false)
}

fn negate_operator(field: String, selector: Document) -> Document {
    let Some((operator, operand)) = selector.into_iter().next() else {
        return nor(single(field, Document::new()));
    };

    match (operator.as_str(), operand) {
        ("$ne", operand) | ("$not", operand) => single(field, operand),
        ("$exists", Bson::Boolean(exists)) => single(field, doc! { "$exists": !exists }),
        ("$in", operand) => single(field, doc! { "$nin": operand }),
        ("$nin", operand) => single(field, doc! { "$in": operand }),
        (_, operand) => {
            let mut original = Document::new();
            original.insert(operator.clone(), operand);
            nor(single(field, original))
        }
    }
}

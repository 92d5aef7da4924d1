//! Range comparisons on unsigned fields stored as signed integers.
//!
//! A u32 (u64) field is written as the Int32 (Int64) with the same bit
//! pattern, so every value above `i32::MAX` lands in the negative signed range.
//! The server compares signed values, so a plain `$gt` would order those
//! "wrapped" values before zero. Each comparison is therefore rewritten as a
//! conjunction or disjunction with the sign test that restores unsigned order:
//!
//! | operator | boundary not wrapped                 | boundary wrapped                     |
//! |----------|--------------------------------------|--------------------------------------|
//! | gt, gte  | `$or: [{x: {op: s}}, {x: {$lt: 0}}]`  | `$and: [{x: {op: s}}, {x: {$lt: 0}}]` |
//! | lt, lte  | `$and: [{x: {$gte: 0}}, {x: {op: s}}]`| `$or: [{x: {$gte: 0}}, {x: {op: s}}]` |

use bson::{Bson, Document};
use docket_common::{DocketError, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOperator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl RangeOperator {
    pub fn operator_name(self) -> &'static str {
        match self {
            RangeOperator::Gt => "$gt",
            RangeOperator::Gte => "$gte",
            RangeOperator::Lt => "$lt",
            RangeOperator::Lte => "$lte",
        }
    }
}

fn field_clause(wire_name: &str, operator: &str, operand: Bson) -> Bson {
    let mut selector = Document::new();
    selector.insert(operator, operand);
    let mut clause = Document::new();
    clause.insert(wire_name, selector);
    Bson::Document(clause)
}

/// Render `wire_name <op> signed` so the server applies unsigned ordering.
///
/// `signed` is the already-encoded boundary (Int32 or Int64).
pub fn split_unsigned_range(wire_name: &str, op: RangeOperator, signed: Bson) -> Result<Document> {
    let wrapped = match signed {
        Bson::Int32(value) => value < 0,
        Bson::Int64(value) => value < 0,
        ref other => {
            return Err(DocketError::Internal(format!(
                "unsigned field '{}' encoded as {:?}, expected an integer",
                wire_name,
                other.element_type()
            )))
        }
    };

    let comparison = field_clause(wire_name, op.operator_name(), signed);
    let negative = field_clause(wire_name, "$lt", Bson::Int32(0));
    let non_negative = field_clause(wire_name, "$gte", Bson::Int32(0));

    let (combinator, clauses) = match (op, wrapped) {
        (RangeOperator::Gt | RangeOperator::Gte, false) => ("$or", vec![comparison, negative]),
        (RangeOperator::Gt | RangeOperator::Gte, true) => ("$and", vec![comparison, negative]),
        (RangeOperator::Lt | RangeOperator::Lte, false) => ("$and", vec![non_negative, comparison]),
        (RangeOperator::Lt | RangeOperator::Lte, true) => ("$or", vec![non_negative, comparison]),
    };

    debug!(field = wire_name, operator = op.operator_name(), wrapped, "split unsigned range");
    let mut rendered = Document::new();
    rendered.insert(combinator, clauses);
    Ok(rendered)
}

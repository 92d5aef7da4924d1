//! Filter expressions and their compilation into query documents

pub mod ast;
pub mod compile;
pub mod geo;
pub mod negate;
pub mod unsigned;

pub use ast::{Bitmask, BitwiseOp, ComparisonOp, Filter, RegexPattern, TextSearch, TypeSelector};
pub use compile::compile;
pub use geo::{GeoFilter, GeoShape, NearPoint};
pub use negate::negate_document;
pub use unsigned::{split_unsigned_range, RangeOperator};

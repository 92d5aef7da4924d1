//! Filter AST
//!
//! Filters are immutable value trees built through the associated
//! constructors on [`Filter`] (or the `&`, `|` and `!` operators) and rendered
//! later against a [`FieldResolver`](crate::field::FieldResolver).
//!
//! ```rust,ignore
//! let filter = Filter::eq("a", 1) & Filter::json(r#"{"a": 2}"#)? & Filter::raw(doc! { "c": 3 });
//! let rendered = filter.render(&DocumentSchema::dynamic())?;
//! assert_eq!(rendered, doc! { "$and": [{ "a": 1 }, { "a": 2 }, { "c": 3 }] });
//! ```

use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;

use bson::spec::ElementType;
use bson::{doc, Bson, Document};
use docket_common::{DocketError, Result};

use super::compile::compile;
use super::geo::{GeoFilter, GeoShape, NearPoint};
use super::unsigned::RangeOperator;
use crate::field::{FieldPath, FieldResolver, FieldValue};

/// Unrendered filter
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches everything; renders as `{}`
    Empty,
    /// Already-rendered document (also the result of parsing a JSON literal)
    Raw(Document),
    Comparison { field: FieldPath, op: ComparisonOp },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    ElemMatch { field: FieldPath, filter: Box<Filter> },
    Text(TextSearch),
    Geo(GeoFilter),
}

/// Operator and operand of a single-field comparison
#[derive(Debug, Clone, PartialEq)]
pub enum ComparisonOp {
    Eq(FieldValue),
    Ne(FieldValue),
    Gt(FieldValue),
    Gte(FieldValue),
    Lt(FieldValue),
    Lte(FieldValue),
    In(Vec<FieldValue>),
    Nin(Vec<FieldValue>),
    All(Vec<FieldValue>),
    Exists(bool),
    Mod { modulus: i64, remainder: i64 },
    Size(i32),
    SizeGt(i32),
    SizeGte(i32),
    SizeLt(i32),
    SizeLte(i32),
    Type(TypeSelector),
    Regex(RegexPattern),
    Bits(BitwiseOp, Bitmask),
}

impl ComparisonOp {
    /// Range operator and operand, for gt/gte/lt/lte
    pub fn as_range(&self) -> Option<(RangeOperator, &FieldValue)> {
        match self {
            ComparisonOp::Gt(v) => Some((RangeOperator::Gt, v)),
            ComparisonOp::Gte(v) => Some((RangeOperator::Gte, v)),
            ComparisonOp::Lt(v) => Some((RangeOperator::Lt, v)),
            ComparisonOp::Lte(v) => Some((RangeOperator::Lte, v)),
            _ => None,
        }
    }
}

/// `$type` operand: a BSON element type or one of the server's aliases ("number")
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSelector {
    Element(ElementType),
    Alias(String),
}

impl TypeSelector {
    pub fn to_bson(&self) -> Bson {
        match self {
            TypeSelector::Element(element_type) => Bson::Int32(*element_type as i32),
            TypeSelector::Alias(alias) => Bson::String(alias.clone()),
        }
    }
}

impl From<ElementType> for TypeSelector {
    fn from(element_type: ElementType) -> Self {
        TypeSelector::Element(element_type)
    }
}

impl From<&str> for TypeSelector {
    fn from(alias: &str) -> Self {
        TypeSelector::Alias(alias.to_string())
    }
}

/// Regular expression with its option letters kept in sorted order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexPattern {
    pub pattern: String,
    pub options: String,
}

impl RegexPattern {
    pub fn new(pattern: impl Into<String>, options: impl AsRef<str>) -> Self {
        let mut letters: Vec<char> = options.as_ref().chars().collect();
        letters.sort_unstable();
        letters.dedup();
        Self {
            pattern: pattern.into(),
            options: letters.into_iter().collect(),
        }
    }

    pub fn to_bson(&self) -> Bson {
        Bson::RegularExpression(bson::Regex {
            pattern: self.pattern.clone(),
            options: self.options.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitwiseOp {
    AllSet,
    AllClear,
    AnySet,
    AnyClear,
}

impl BitwiseOp {
    pub fn operator_name(self) -> &'static str {
        match self {
            BitwiseOp::AllSet => "$bitsAllSet",
            BitwiseOp::AllClear => "$bitsAllClear",
            BitwiseOp::AnySet => "$bitsAnySet",
            BitwiseOp::AnyClear => "$bitsAnyClear",
        }
    }
}

/// Operand of the bitwise query operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bitmask {
    Mask(i64),
    Positions(Vec<u32>),
}

impl Bitmask {
    pub fn to_bson(&self) -> Bson {
        match self {
            Bitmask::Mask(mask) => Bson::Int64(*mask),
            Bitmask::Positions(positions) => Bson::Array(
                positions
                    .iter()
                    .map(|p| Bson::Int64(i64::from(*p)))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for Bitmask {
    fn from(mask: i64) -> Self {
        Bitmask::Mask(mask)
    }
}

impl From<Vec<u32>> for Bitmask {
    fn from(positions: Vec<u32>) -> Self {
        Bitmask::Positions(positions)
    }
}

/// `$text` search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSearch {
    pub search: String,
    pub language: Option<String>,
    pub case_sensitive: Option<bool>,
    pub diacritic_sensitive: Option<bool>,
}

impl TextSearch {
    pub fn new(search: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            language: None,
            case_sensitive: None,
            diacritic_sensitive: None,
        }
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = Some(case_sensitive);
        self
    }

    pub fn diacritic_sensitive(mut self, diacritic_sensitive: bool) -> Self {
        self.diacritic_sensitive = Some(diacritic_sensitive);
        self
    }

    pub fn render(&self) -> Document {
        let mut text = doc! { "$search": self.search.clone() };
        if let Some(language) = &self.language {
            text.insert("$language", language.clone());
        }
        if let Some(case_sensitive) = self.case_sensitive {
            text.insert("$caseSensitive", case_sensitive);
        }
        if let Some(diacritic_sensitive) = self.diacritic_sensitive {
            text.insert("$diacriticSensitive", diacritic_sensitive);
        }
        doc! { "$text": text }
    }
}

impl From<&str> for TextSearch {
    fn from(search: &str) -> Self {
        TextSearch::new(search)
    }
}

fn comparison(field: impl Into<FieldPath>, op: ComparisonOp) -> Filter {
    Filter::Comparison {
        field: field.into(),
        op,
    }
}

fn values<I, V>(values: I) -> Vec<FieldValue>
where
    I: IntoIterator<Item = V>,
    V: Into<FieldValue>,
{
    values.into_iter().map(Into::into).collect()
}

impl Filter {
    pub fn empty() -> Self {
        Filter::Empty
    }

    pub fn raw(document: Document) -> Self {
        Filter::Raw(document)
    }

    /// Parse a JSON (or MongoDB Extended JSON) object literal
    pub fn json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            DocketError::Configuration(format!("Invalid JSON filter '{}': {}", json, e))
        })?;
        match Bson::try_from(value) {
            Ok(Bson::Document(document)) => Ok(Filter::Raw(document)),
            Ok(other) => Err(DocketError::Configuration(format!(
                "JSON filter must be an object, got {:?}",
                other.element_type()
            ))),
            Err(e) => Err(DocketError::Configuration(format!(
                "Invalid extended JSON filter '{}': {}",
                json, e
            ))),
        }
    }

    pub fn eq(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        comparison(field, ComparisonOp::Eq(value.into()))
    }

    pub fn ne(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        comparison(field, ComparisonOp::Ne(value.into()))
    }

    pub fn gt(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        comparison(field, ComparisonOp::Gt(value.into()))
    }

    pub fn gte(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        comparison(field, ComparisonOp::Gte(value.into()))
    }

    pub fn lt(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        comparison(field, ComparisonOp::Lt(value.into()))
    }

    pub fn lte(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        comparison(field, ComparisonOp::Lte(value.into()))
    }

    /// `$in`
    pub fn in_list<I, V>(field: impl Into<FieldPath>, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        comparison(field, ComparisonOp::In(values(items)))
    }

    pub fn nin<I, V>(field: impl Into<FieldPath>, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        comparison(field, ComparisonOp::Nin(values(items)))
    }

    pub fn all<I, V>(field: impl Into<FieldPath>, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        comparison(field, ComparisonOp::All(values(items)))
    }

    pub fn exists(field: impl Into<FieldPath>, exists: bool) -> Self {
        comparison(field, ComparisonOp::Exists(exists))
    }

    /// `$mod`; both operands are written as Int64
    pub fn modulo(field: impl Into<FieldPath>, modulus: i64, remainder: i64) -> Self {
        comparison(field, ComparisonOp::Mod { modulus, remainder })
    }

    pub fn size(field: impl Into<FieldPath>, size: i32) -> Self {
        comparison(field, ComparisonOp::Size(size))
    }

    pub fn size_gt(field: impl Into<FieldPath>, size: i32) -> Self {
        comparison(field, ComparisonOp::SizeGt(size))
    }

    pub fn size_gte(field: impl Into<FieldPath>, size: i32) -> Self {
        comparison(field, ComparisonOp::SizeGte(size))
    }

    pub fn size_lt(field: impl Into<FieldPath>, size: i32) -> Self {
        comparison(field, ComparisonOp::SizeLt(size))
    }

    pub fn size_lte(field: impl Into<FieldPath>, size: i32) -> Self {
        comparison(field, ComparisonOp::SizeLte(size))
    }

    pub fn type_of(field: impl Into<FieldPath>, selector: impl Into<TypeSelector>) -> Self {
        comparison(field, ComparisonOp::Type(selector.into()))
    }

    pub fn regex(field: impl Into<FieldPath>, pattern: impl Into<String>, options: &str) -> Self {
        comparison(field, ComparisonOp::Regex(RegexPattern::new(pattern, options)))
    }

    pub fn bits_all_set(field: impl Into<FieldPath>, mask: impl Into<Bitmask>) -> Self {
        comparison(field, ComparisonOp::Bits(BitwiseOp::AllSet, mask.into()))
    }

    pub fn bits_all_clear(field: impl Into<FieldPath>, mask: impl Into<Bitmask>) -> Self {
        comparison(field, ComparisonOp::Bits(BitwiseOp::AllClear, mask.into()))
    }

    pub fn bits_any_set(field: impl Into<FieldPath>, mask: impl Into<Bitmask>) -> Self {
        comparison(field, ComparisonOp::Bits(BitwiseOp::AnySet, mask.into()))
    }

    pub fn bits_any_clear(field: impl Into<FieldPath>, mask: impl Into<Bitmask>) -> Self {
        comparison(field, ComparisonOp::Bits(BitwiseOp::AnyClear, mask.into()))
    }

    /// `$elemMatch`; `filter` is resolved against the element schema
    pub fn elem_match(field: impl Into<FieldPath>, filter: Filter) -> Self {
        Filter::ElemMatch {
            field: field.into(),
            filter: Box::new(filter),
        }
    }

    pub fn text(search: impl Into<TextSearch>) -> Self {
        Filter::Text(search.into())
    }

    /// Legacy-coordinate `$near`
    pub fn near(
        field: impl Into<FieldPath>,
        x: f64,
        y: f64,
        max_distance: Option<f64>,
        min_distance: Option<f64>,
    ) -> Self {
        Filter::Geo(GeoFilter::Near {
            field: field.into(),
            point: NearPoint::Legacy { x, y },
            spherical: false,
            max_distance,
            min_distance,
        })
    }

    /// Legacy-coordinate `$nearSphere`
    pub fn near_sphere(
        field: impl Into<FieldPath>,
        x: f64,
        y: f64,
        max_distance: Option<f64>,
        min_distance: Option<f64>,
    ) -> Self {
        Filter::Geo(GeoFilter::Near {
            field: field.into(),
            point: NearPoint::Legacy { x, y },
            spherical: true,
            max_distance,
            min_distance,
        })
    }

    /// `$near` / `$nearSphere` with a GeoJSON point
    pub fn near_geometry(
        field: impl Into<FieldPath>,
        point: Document,
        spherical: bool,
        max_distance: Option<f64>,
        min_distance: Option<f64>,
    ) -> Self {
        Filter::Geo(GeoFilter::Near {
            field: field.into(),
            point: NearPoint::GeoJson(point),
            spherical,
            max_distance,
            min_distance,
        })
    }

    pub fn geo_within(field: impl Into<FieldPath>, geometry: Document) -> Self {
        Self::geo_within_shape(field, GeoShape::Geometry(geometry))
    }

    pub fn geo_within_box(
        field: impl Into<FieldPath>,
        lower_left: (f64, f64),
        upper_right: (f64, f64),
    ) -> Self {
        Self::geo_within_shape(field, GeoShape::Box { lower_left, upper_right })
    }

    pub fn geo_within_center(field: impl Into<FieldPath>, x: f64, y: f64, radius: f64) -> Self {
        Self::geo_within_shape(field, GeoShape::Center { x, y, radius })
    }

    pub fn geo_within_center_sphere(
        field: impl Into<FieldPath>,
        x: f64,
        y: f64,
        radius: f64,
    ) -> Self {
        Self::geo_within_shape(field, GeoShape::CenterSphere { x, y, radius })
    }

    pub fn geo_within_polygon(field: impl Into<FieldPath>, points: &[(f64, f64)]) -> Self {
        Self::geo_within_shape(field, GeoShape::Polygon(points.to_vec()))
    }

    fn geo_within_shape(field: impl Into<FieldPath>, shape: GeoShape) -> Self {
        Filter::Geo(GeoFilter::Within {
            field: field.into(),
            shape,
        })
    }

    pub fn geo_intersects(field: impl Into<FieldPath>, geometry: Document) -> Self {
        Filter::Geo(GeoFilter::Intersects {
            field: field.into(),
            geometry,
        })
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)] // `!filter` is also available
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Render into a query document
    pub fn render(&self, resolver: &dyn FieldResolver) -> Result<Document> {
        compile(self, resolver)
    }
}

impl From<Document> for Filter {
    fn from(document: Document) -> Self {
        Filter::Raw(document)
    }
}

impl FromStr for Filter {
    type Err = DocketError;

    fn from_str(json: &str) -> Result<Self> {
        Filter::json(json)
    }
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        match self {
            Filter::And(mut children) => {
                children.push(rhs);
                Filter::And(children)
            }
            lhs => Filter::And(vec![lhs, rhs]),
        }
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        match self {
            Filter::Or(mut children) => {
                children.push(rhs);
                Filter::Or(children)
            }
            lhs => Filter::Or(vec![lhs, rhs]),
        }
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_literal_parsed_once() {
        let filter = Filter::json(r#"{"a": 2}"#).unwrap();
        assert_eq!(filter, Filter::Raw(doc! { "a": 2 }));
    }

    #[test]
    fn test_json_extended_syntax() {
        let filter: Filter = r#"{"n": {"$numberLong": "5"}}"#.parse().unwrap();
        assert_eq!(filter, Filter::Raw(doc! { "n": 5i64 }));
    }

    #[test]
    fn test_json_must_be_object() {
        let err = Filter::json("[1, 2]").unwrap_err();
        assert!(matches!(err, DocketError::Configuration(_)));
    }

    #[test]
    fn test_json_malformed() {
        let err = Filter::json("{a:2").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_bitand_appends_to_existing_and() {
        let filter = Filter::eq("a", 1) & Filter::eq("b", 2) & Filter::eq("c", 3);
        match filter {
            Filter::And(children) => assert_eq!(children.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_bitor_and_not() {
        let filter = !(Filter::eq("a", 1) | Filter::eq("b", 2));
        match filter {
            Filter::Not(inner) => assert!(matches!(*inner, Filter::Or(ref c) if c.len() == 2)),
            other => panic!("expected Not, got {:?}", other),
        }
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(Filter::gt("x", 1), Filter::gt("x", 1));
        assert_ne!(Filter::gt("x", 1), Filter::gte("x", 1));
    }

    #[test]
    fn test_regex_options_sorted() {
        let pattern = RegexPattern::new("^a", "xim");
        assert_eq!(pattern.options, "imx");
    }

    #[test]
    fn test_text_search_render() {
        let text = TextSearch::new("coffee").language("en").case_sensitive(true);
        assert_eq!(
            text.render(),
            doc! { "$text": { "$search": "coffee", "$language": "en", "$caseSensitive": true } }
        );
    }

    #[test]
    fn test_type_selector() {
        assert_eq!(TypeSelector::from(ElementType::String).to_bson(), Bson::Int32(2));
        assert_eq!(TypeSelector::from("number").to_bson(), Bson::String("number".to_string()));
    }
}

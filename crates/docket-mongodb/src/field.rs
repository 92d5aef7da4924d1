//! Field paths, values and the resolver seam between schemas and the compilers.
//!
//! A [`FieldPath`] is either a free-form string (`"Address.City"`, `"Tags.$"`)
//! or a typed accessor supplied by a schema-specific enum. A [`FieldResolver`]
//! turns it into the wire name plus the [`FieldCodec`] used to encode values
//! written against that field.

use std::fmt;
use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{Bson, Document};
use docket_common::{DocketError, Result};

use crate::schema::IdMember;

/// Symbolic member of a document type.
///
/// Implemented by per-schema enums so that field references are checked by the
/// compiler instead of being spelled as strings:
///
/// ```rust,ignore
/// enum PersonField { FirstName, Age }
///
/// impl FieldAccessor for PersonField {
///     fn member_path(&self) -> &'static str {
///         match self {
///             PersonField::FirstName => "FirstName",
///             PersonField::Age => "Age",
///         }
///     }
/// }
///
/// let filter = Filter::gt(FieldPath::of(PersonField::Age), 21);
/// ```
pub trait FieldAccessor {
    /// Dotted path of logical member names
    fn member_path(&self) -> &'static str;
}

/// Logical field reference, resolved against a schema at compile time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldPath {
    /// String path; segments match member names first, then element names
    Name(String),
    /// Typed accessor; segments must match member names
    Member(&'static str),
}

impl FieldPath {
    /// Build a path from a typed accessor
    pub fn of<A: FieldAccessor>(accessor: A) -> Self {
        FieldPath::Member(accessor.member_path())
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldPath::Name(name) => name,
            FieldPath::Member(path) => path,
        }
    }

    /// Dot-separated segments of the path
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.as_str().split('.')
    }

    pub fn is_typed(&self) -> bool {
        matches!(self, FieldPath::Member(_))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for FieldPath {
    fn from(name: &str) -> Self {
        FieldPath::Name(name.to_string())
    }
}

impl From<String> for FieldPath {
    fn from(name: String) -> Self {
        FieldPath::Name(name)
    }
}

impl From<&String> for FieldPath {
    fn from(name: &String) -> Self {
        FieldPath::Name(name.clone())
    }
}

/// Value supplied by the caller before field encoding.
///
/// Unsigned integers are kept apart from BSON values because BSON has no
/// unsigned types; the field codec decides how they land on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bson(Bson),
    UInt32(u32),
    UInt64(u64),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Bson(_) => "BSON value",
            FieldValue::UInt32(_) => "u32",
            FieldValue::UInt64(_) => "u64",
            FieldValue::Array(_) => "array",
        }
    }
}

macro_rules! field_value_from_bson {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::Bson(Bson::from(value))
                }
            }
        )*
    };
}

field_value_from_bson!(i32, i64, f64, bool, &str, String, Document, ObjectId, bson::DateTime);

impl From<Bson> for FieldValue {
    fn from(value: Bson) -> Self {
        FieldValue::Bson(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::UInt32(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UInt64(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for FieldValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        FieldValue::Bson(Bson::DateTime(bson::DateTime::from_chrono(value)))
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(values: Vec<T>) -> Self {
        FieldValue::Array(values.into_iter().map(Into::into).collect())
    }
}

/// Custom value encoder plugged into a schema member
pub trait ValueEncoder: Send + Sync + fmt::Debug {
    fn encode(&self, value: &FieldValue) -> Result<Bson>;
}

/// Width of an unsigned field stored as a signed integer of the same size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsignedWidth {
    Bits32,
    Bits64,
}

/// How values are written for a field
#[derive(Debug, Clone, Default)]
pub enum FieldCodec {
    /// Values are written as given; unsigned values widen to Int64
    #[default]
    Default,
    /// u32 stored as the Int32 with the same bit pattern
    UInt32,
    /// u64 stored as the Int64 with the same bit pattern
    UInt64,
    /// Array whose items use the inner codec
    Array(Box<FieldCodec>),
    Custom(Arc<dyn ValueEncoder>),
}

impl FieldCodec {
    pub fn array_of(item: FieldCodec) -> Self {
        FieldCodec::Array(Box::new(item))
    }

    /// Codec for a single element; scalar codecs are their own item codec
    pub fn item_codec(&self) -> FieldCodec {
        match self {
            FieldCodec::Array(item) => item.as_ref().clone(),
            other => other.clone(),
        }
    }

    pub fn unsigned_width(&self) -> Option<UnsignedWidth> {
        match self {
            FieldCodec::UInt32 => Some(UnsignedWidth::Bits32),
            FieldCodec::UInt64 => Some(UnsignedWidth::Bits64),
            _ => None,
        }
    }

    pub fn encode(&self, value: &FieldValue) -> Result<Bson> {
        match self {
            FieldCodec::Default => encode_default(value),
            FieldCodec::UInt32 => Ok(Bson::Int32(unsigned_32(value)? as i32)),
            FieldCodec::UInt64 => Ok(Bson::Int64(unsigned_64(value)? as i64)),
            FieldCodec::Array(item) => match value {
                FieldValue::Array(items) => items
                    .iter()
                    .map(|v| item.encode(v))
                    .collect::<Result<Vec<_>>>()
                    .map(Bson::Array),
                FieldValue::Bson(Bson::Array(items)) => items
                    .iter()
                    .map(|v| item.encode(&FieldValue::Bson(v.clone())))
                    .collect::<Result<Vec<_>>>()
                    .map(Bson::Array),
                single => item.encode(single),
            },
            FieldCodec::Custom(encoder) => encoder.encode(value),
        }
    }
}

fn encode_default(value: &FieldValue) -> Result<Bson> {
    match value {
        FieldValue::Bson(bson) => Ok(bson.clone()),
        FieldValue::UInt32(u) => Ok(Bson::Int64(i64::from(*u))),
        FieldValue::UInt64(u) => i64::try_from(*u).map(Bson::Int64).map_err(|_| {
            DocketError::Codec(format!(
                "{} does not fit in a signed 64-bit integer; declare the field as UInt64",
                u
            ))
        }),
        FieldValue::Array(items) => items
            .iter()
            .map(encode_default)
            .collect::<Result<Vec<_>>>()
            .map(Bson::Array),
    }
}

fn unsigned_32(value: &FieldValue) -> Result<u32> {
    let converted = match value {
        FieldValue::UInt32(u) => Some(*u),
        FieldValue::UInt64(u) => u32::try_from(*u).ok(),
        FieldValue::Bson(Bson::Int32(i)) => u32::try_from(*i).ok(),
        FieldValue::Bson(Bson::Int64(i)) => u32::try_from(*i).ok(),
        _ => None,
    };
    converted.ok_or_else(|| out_of_range(value, "an unsigned 32-bit integer"))
}

fn unsigned_64(value: &FieldValue) -> Result<u64> {
    let converted = match value {
        FieldValue::UInt32(u) => Some(u64::from(*u)),
        FieldValue::UInt64(u) => Some(*u),
        FieldValue::Bson(Bson::Int32(i)) => u64::try_from(*i).ok(),
        FieldValue::Bson(Bson::Int64(i)) => u64::try_from(*i).ok(),
        _ => None,
    };
    converted.ok_or_else(|| out_of_range(value, "an unsigned 64-bit integer"))
}

fn out_of_range(value: &FieldValue, target: &str) -> DocketError {
    match value {
        FieldValue::Bson(bson) => {
            DocketError::Codec(format!("cannot encode {} as {}", bson, target))
        }
        other => DocketError::Codec(format!("cannot encode {} as {}", other.kind(), target)),
    }
}

/// Wire name and codec for a logical field path
#[derive(Debug, Clone)]
pub struct ResolvedField {
    pub wire_name: String,
    pub codec: FieldCodec,
}

impl ResolvedField {
    pub fn new(wire_name: impl Into<String>, codec: FieldCodec) -> Self {
        Self {
            wire_name: wire_name.into(),
            codec,
        }
    }

    pub fn encode(&self, value: &FieldValue) -> Result<Bson> {
        self.codec.encode(value)
    }

    /// Encode one element of the field (used by `$in`, `$all`, `$push`, ...)
    pub fn encode_item(&self, value: &FieldValue) -> Result<Bson> {
        self.codec.item_codec().encode(value)
    }
}

/// Maps logical field paths of one document type to wire names and codecs
pub trait FieldResolver: Send + Sync {
    /// Name used in error messages
    fn schema_name(&self) -> &str;

    /// Resolve a path; unknown paths are a configuration error
    fn resolve(&self, path: &FieldPath) -> Result<ResolvedField>;

    /// Resolver for the elements of an array-of-documents field
    fn element_resolver(&self, path: &FieldPath) -> Result<Arc<dyn FieldResolver>>;

    /// Identity member used for id assignment on insert
    fn id_member(&self) -> Option<&IdMember> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum PersonField {
        Age,
    }

    impl FieldAccessor for PersonField {
        fn member_path(&self) -> &'static str {
            match self {
                PersonField::Age => "Age",
            }
        }
    }

    #[test]
    fn test_field_path_from_accessor() {
        let path = FieldPath::of(PersonField::Age);
        assert!(path.is_typed());
        assert_eq!(path.as_str(), "Age");
    }

    #[test]
    fn test_field_path_segments() {
        let path = FieldPath::from("Address.City");
        assert!(!path.is_typed());
        assert_eq!(path.segments().collect::<Vec<_>>(), vec!["Address", "City"]);
    }

    #[test]
    fn test_default_codec_passes_bson_through() {
        let bson = FieldCodec::Default.encode(&FieldValue::from("x")).unwrap();
        assert_eq!(bson, Bson::String("x".to_string()));
    }

    #[test]
    fn test_default_codec_widens_unsigned() {
        let bson = FieldCodec::Default.encode(&FieldValue::from(7u32)).unwrap();
        assert_eq!(bson, Bson::Int64(7));
    }

    #[test]
    fn test_default_codec_rejects_large_u64() {
        let err = FieldCodec::Default.encode(&FieldValue::from(u64::MAX)).unwrap_err();
        assert!(matches!(err, DocketError::Codec(_)));
    }

    #[test]
    fn test_uint32_codec_reinterprets_bits() {
        let bson = FieldCodec::UInt32.encode(&FieldValue::from(0x8000_0000u32)).unwrap();
        assert_eq!(bson, Bson::Int32(i32::MIN));

        let bson = FieldCodec::UInt32.encode(&FieldValue::from(5)).unwrap();
        assert_eq!(bson, Bson::Int32(5));
    }

    #[test]
    fn test_uint32_codec_rejects_negative() {
        let err = FieldCodec::UInt32.encode(&FieldValue::from(-1)).unwrap_err();
        assert!(matches!(err, DocketError::Codec(_)));
    }

    #[test]
    fn test_uint64_codec_reinterprets_bits() {
        let bson = FieldCodec::UInt64.encode(&FieldValue::from(u64::MAX)).unwrap();
        assert_eq!(bson, Bson::Int64(-1));
    }

    #[test]
    fn test_array_codec_encodes_items() {
        let codec = FieldCodec::array_of(FieldCodec::UInt32);
        let bson = codec.encode(&FieldValue::from(vec![1u32, u32::MAX])).unwrap();
        assert_eq!(bson, Bson::Array(vec![Bson::Int32(1), Bson::Int32(-1)]));

        let single = codec.encode(&FieldValue::from(2u32)).unwrap();
        assert_eq!(single, Bson::Int32(2));
    }

    #[test]
    fn test_chrono_value() {
        let now = chrono::Utc::now();
        let value = FieldValue::from(now);
        assert!(matches!(value, FieldValue::Bson(Bson::DateTime(_))));
    }
}

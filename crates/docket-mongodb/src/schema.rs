//! Document schemas: the in-crate [`FieldResolver`] implementation.
//!
//! A schema lists the members of one document type with their logical name,
//! the element name used on the wire, a value codec and, for embedded
//! documents or arrays of documents, a nested schema. Strict schemas reject
//! unknown paths; dynamic schemas pass unknown segments through verbatim,
//! which is how untyped `Document` collections behave.

use std::fmt;
use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{Bson, Document};
use docket_common::{DocketError, Result};
use tracing::debug;

use crate::field::{FieldCodec, FieldPath, FieldResolver, ResolvedField};
use crate::validation::{is_array_position, ValidatedFieldName};

/// Generates identity values for inserted documents
pub trait IdGenerator: Send + Sync + fmt::Debug {
    fn generate(&self) -> Bson;

    /// True when `id` is a placeholder that should be replaced
    fn is_empty(&self, id: &Bson) -> bool;
}

/// Generates fresh ObjectIds; null and the all-zero ObjectId count as empty
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjectIdGenerator;

impl IdGenerator for ObjectIdGenerator {
    fn generate(&self) -> Bson {
        Bson::ObjectId(ObjectId::new())
    }

    fn is_empty(&self, id: &Bson) -> bool {
        match id {
            Bson::Null | Bson::Undefined => true,
            Bson::ObjectId(oid) => oid.bytes() == [0u8; 12],
            _ => false,
        }
    }
}

/// Identity member of a schema
#[derive(Debug, Clone)]
pub struct IdMember {
    element_name: String,
    generator: Arc<dyn IdGenerator>,
}

impl IdMember {
    pub fn new(element_name: impl Into<String>, generator: impl IdGenerator + 'static) -> Self {
        Self {
            element_name: element_name.into(),
            generator: Arc::new(generator),
        }
    }

    pub fn element_name(&self) -> &str {
        &self.element_name
    }

    /// Assign an id to `document` when it has none (or an empty one).
    ///
    /// A missing id is inserted as the first element. Returns the assigned id.
    pub fn assign(&self, document: &mut Document) -> Option<Bson> {
        match document.get(&self.element_name) {
            Some(existing) if !self.generator.is_empty(existing) => None,
            Some(_) => {
                let id = self.generator.generate();
                document.insert(self.element_name.clone(), id.clone());
                Some(id)
            }
            None => {
                let id = self.generator.generate();
                let mut with_id = Document::new();
                with_id.insert(self.element_name.clone(), id.clone());
                for (key, value) in std::mem::take(document) {
                    with_id.insert(key, value);
                }
                *document = with_id;
                Some(id)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaMode {
    /// Unknown members are configuration errors
    Strict,
    /// Unknown members resolve to themselves with the default codec
    Dynamic,
}

/// One member of a document schema
#[derive(Debug, Clone)]
pub struct SchemaMember {
    pub member_name: String,
    pub element_name: String,
    pub codec: FieldCodec,
    pub nested: Option<Arc<DocumentSchema>>,
}

/// Schema of one document type
#[derive(Debug, Clone)]
pub struct DocumentSchema {
    name: String,
    mode: SchemaMode,
    members: Vec<SchemaMember>,
    id: Option<IdMember>,
}

impl DocumentSchema {
    /// Schema that only accepts declared members
    pub fn strict(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: SchemaMode::Strict,
            members: Vec::new(),
            id: None,
        }
    }

    /// Schema for untyped documents, with an ObjectId `_id`
    pub fn dynamic() -> Self {
        Self {
            name: "Document".to_string(),
            mode: SchemaMode::Dynamic,
            members: Vec::new(),
            id: Some(IdMember::new("_id", ObjectIdGenerator)),
        }
    }

    pub fn with_id(
        mut self,
        element_name: impl Into<String>,
        generator: impl IdGenerator + 'static,
    ) -> Self {
        self.id = Some(IdMember::new(element_name, generator));
        self
    }

    pub fn without_id(mut self) -> Self {
        self.id = None;
        self
    }

    /// Declare a member written with the default codec
    pub fn member(self, member_name: impl Into<String>, element_name: impl Into<String>) -> Self {
        self.member_with_codec(member_name, element_name, FieldCodec::Default)
    }

    pub fn member_with_codec(
        self,
        member_name: impl Into<String>,
        element_name: impl Into<String>,
        codec: FieldCodec,
    ) -> Self {
        self.push(SchemaMember {
            member_name: member_name.into(),
            element_name: element_name.into(),
            codec,
            nested: None,
        })
    }

    /// Declare an embedded document member
    pub fn embedded(
        self,
        member_name: impl Into<String>,
        element_name: impl Into<String>,
        schema: DocumentSchema,
    ) -> Self {
        self.push(SchemaMember {
            member_name: member_name.into(),
            element_name: element_name.into(),
            codec: FieldCodec::Default,
            nested: Some(Arc::new(schema)),
        })
    }

    /// Declare an array of scalars
    pub fn array(
        self,
        member_name: impl Into<String>,
        element_name: impl Into<String>,
        item_codec: FieldCodec,
    ) -> Self {
        self.member_with_codec(member_name, element_name, FieldCodec::array_of(item_codec))
    }

    /// Declare an array of embedded documents
    pub fn array_of(
        self,
        member_name: impl Into<String>,
        element_name: impl Into<String>,
        schema: DocumentSchema,
    ) -> Self {
        self.push(SchemaMember {
            member_name: member_name.into(),
            element_name: element_name.into(),
            codec: FieldCodec::array_of(FieldCodec::Default),
            nested: Some(Arc::new(schema)),
        })
    }

    fn push(mut self, member: SchemaMember) -> Self {
        self.members.push(member);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> SchemaMode {
        self.mode
    }

    pub fn members(&self) -> &[SchemaMember] {
        &self.members
    }

    fn find_member(&self, segment: &str, typed: bool) -> Option<&SchemaMember> {
        self.members
            .iter()
            .find(|m| m.member_name == segment)
            .or_else(|| {
                if typed {
                    None
                } else {
                    self.members.iter().find(|m| m.element_name == segment)
                }
            })
    }

    fn walk(&self, path: &FieldPath) -> Result<Walk<'_>> {
        if path.as_str().is_empty() {
            return Err(DocketError::Configuration(
                "Field path cannot be empty".to_string(),
            ));
        }

        let typed = path.is_typed();
        let mut scope = Scope::Schema(self);
        let mut wire: Vec<String> = Vec::new();
        let mut codec = FieldCodec::Default;
        let mut nested: Option<&Arc<DocumentSchema>> = None;

        for segment in path.segments() {
            let segment = ValidatedFieldName::new(segment).map_err(|e| {
                DocketError::Configuration(format!("Invalid field path '{}': {}", path, e))
            })?;
            let segment = segment.as_str();

            if is_array_position(segment) {
                wire.push(segment.to_string());
                codec = codec.item_codec();
                continue;
            }

            let schema = match scope {
                Scope::Schema(schema) => schema,
                Scope::Opaque(member) => {
                    return Err(DocketError::Configuration(format!(
                        "Unable to resolve field path '{}': member '{}' of '{}' has no sub-fields",
                        path, member, self.name
                    )));
                }
            };

            match schema.find_member(segment, typed) {
                Some(member) => {
                    wire.push(member.element_name.clone());
                    codec = member.codec.clone();
                    nested = member.nested.as_ref();
                    scope = match member.nested.as_deref() {
                        Some(child) => Scope::Schema(child),
                        None => Scope::Opaque(&member.member_name),
                    };
                }
                None if schema.mode == SchemaMode::Dynamic => {
                    wire.push(segment.to_string());
                    codec = FieldCodec::Default;
                    nested = None;
                }
                None => {
                    return Err(DocketError::Configuration(format!(
                        "Unable to resolve field path '{}': '{}' is not a member of '{}'",
                        path,
                        segment,
                        schema.name()
                    )));
                }
            }
        }

        let dynamic_tail = matches!(scope, Scope::Schema(s) if s.mode == SchemaMode::Dynamic)
            && nested.is_none();

        Ok(Walk {
            wire_name: wire.join("."),
            codec,
            nested,
            dynamic_tail,
        })
    }
}

#[derive(Clone, Copy)]
enum Scope<'a> {
    Schema(&'a DocumentSchema),
    Opaque(&'a str),
}

struct Walk<'a> {
    wire_name: String,
    codec: FieldCodec,
    nested: Option<&'a Arc<DocumentSchema>>,
    dynamic_tail: bool,
}

impl FieldResolver for DocumentSchema {
    fn schema_name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, path: &FieldPath) -> Result<ResolvedField> {
        let walk = self.walk(path)?;
        debug!(path = %path, wire = %walk.wire_name, "resolved field path");
        Ok(ResolvedField::new(walk.wire_name, walk.codec))
    }

    fn element_resolver(&self, path: &FieldPath) -> Result<Arc<dyn FieldResolver>> {
        let walk = self.walk(path)?;
        match walk.nested {
            Some(schema) => Ok(schema.clone()),
            None if walk.dynamic_tail => Ok(Arc::new(DocumentSchema::dynamic().without_id())),
            None => Err(DocketError::Configuration(format!(
                "Field '{}' of '{}' is not an array of documents",
                path, self.name
            ))),
        }
    }

    fn id_member(&self) -> Option<&IdMember> {
        self.id.as_ref()
    }
}

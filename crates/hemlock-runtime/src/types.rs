//! Type registry
//!
//! Process-wide table of named object types and enums, written while the
//! program initializes and read afterwards. Object types describe the fields
//! a value must carry; validation coerces typed fields, injects defaults for
//! missing optional ones and finally tags the object with the type name.
//!
//! Field types are [`TypeExpr`]s. Besides primitives and registered names
//! they may be generic instantiations (`Box<i32>`), references to a generic
//! parameter of the enclosing type, or compounds (`A & B`) that must hold
//! together.

use core::ffi::{CStr, c_char};
use std::fmt;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

use crate::convert::convert_to_type;
use crate::error::{RtError, RtResult};
use crate::exception::{abi_unit, abi_value};
use crate::object;
use crate::value::{Owned, Value, ValueTag};

// =============================================================================
// Type expressions
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum TypeExpr {
    /// No constraint.
    Any,
    Prim(ValueTag),
    /// A registered type or enum, or a generic parameter of the type being
    /// validated. Which one is decided at validation time.
    Named { name: String, args: Vec<TypeExpr> },
    /// Every part must hold; coercions apply left to right.
    Compound(Vec<TypeExpr>),
    /// `T?`: null, or a value satisfying `T`.
    Nullable(Box<TypeExpr>),
}

impl TypeExpr {
    pub fn named(name: &str) -> Self {
        TypeExpr::Named {
            name: name.to_string(),
            args: Vec::new(),
        }
    }

    /// Parse an annotation such as `i32`, `Pair<string, i32>`, `Named & Aged`
    /// or `Node?`.
    pub fn parse(text: &str) -> RtResult<Self> {
        let mut parser = Parser {
            src: text,
            pos: 0,
        };
        let expr = parser.compound()?;
        parser.skip_ws();
        if parser.pos != text.len() {
            return Err(parser.error());
        }
        Ok(expr)
    }

    fn substitute(&self, bindings: &[(&str, &TypeExpr)]) -> TypeExpr {
        match self {
            TypeExpr::Named { name, args } if args.is_empty() => bindings
                .iter()
                .find(|(param, _)| param == name)
                .map_or_else(|| self.clone(), |(_, ty)| (*ty).clone()),
            TypeExpr::Named { name, args } => TypeExpr::Named {
                name: name.clone(),
                args: args.iter().map(|a| a.substitute(bindings)).collect(),
            },
            TypeExpr::Compound(parts) => {
                TypeExpr::Compound(parts.iter().map(|p| p.substitute(bindings)).collect())
            }
            TypeExpr::Nullable(inner) => TypeExpr::Nullable(Box::new(inner.substitute(bindings))),
            TypeExpr::Any | TypeExpr::Prim(_) => self.clone(),
        }
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::Any => f.write_str("any"),
            TypeExpr::Prim(tag) => f.write_str(tag.name()),
            TypeExpr::Named { name, args } => {
                f.write_str(name)?;
                if !args.is_empty() {
                    f.write_str("<")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    f.write_str(">")?;
                }
                Ok(())
            }
            TypeExpr::Compound(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" & ")?;
                    }
                    write!(f, "{part}")?;
                }
                Ok(())
            }
            TypeExpr::Nullable(inner) => write!(f, "{inner}?"),
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self) -> RtError {
        RtError::parse(format!("Invalid type expression '{}'", self.src))
    }

    fn skip_ws(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.src[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> RtResult<&str> {
        self.skip_ws();
        let rest = &self.src[self.pos..];
        let len = rest
            .char_indices()
            .find(|&(i, c)| !(c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())))
            .map_or(rest.len(), |(i, _)| i);
        if len == 0 {
            return Err(self.error());
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn compound(&mut self) -> RtResult<TypeExpr> {
        let mut parts = vec![self.term()?];
        while self.eat('&') {
            parts.push(self.term()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            TypeExpr::Compound(parts)
        })
    }

    fn term(&mut self) -> RtResult<TypeExpr> {
        let name = self.ident()?.to_string();
        let mut args = Vec::new();
        if self.eat('<') {
            loop {
                args.push(self.compound()?);
                if self.eat('>') {
                    break;
                }
                if !self.eat(',') {
                    return Err(self.error());
                }
            }
        }
        let base = if !args.is_empty() {
            TypeExpr::Named { name, args }
        } else if name == "any" {
            TypeExpr::Any
        } else if let Some(tag) = ValueTag::from_name(&name) {
            TypeExpr::Prim(tag)
        } else {
            TypeExpr::Named { name, args }
        };
        Ok(if self.eat('?') {
            TypeExpr::Nullable(Box::new(base))
        } else {
            base
        })
    }
}

// =============================================================================
// Definitions
// =============================================================================

#[derive(Debug)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeExpr,
    pub optional: bool,
    /// Injected when an optional field is missing. Null when `None`.
    pub default: Option<Owned>,
}

impl FieldDef {
    pub fn required(name: &str, ty: TypeExpr) -> Self {
        Self {
            name: name.to_string(),
            ty,
            optional: false,
            default: None,
        }
    }

    /// Optional field. The definition takes its own reference to `default`.
    pub fn optional(name: &str, ty: TypeExpr, default: Value) -> Self {
        Self {
            name: name.to_string(),
            ty,
            optional: true,
            default: Some(Owned::retained(default)),
        }
    }
}

#[derive(Debug)]
pub struct TypeDef {
    pub name: String,
    pub params: Vec<String>,
    pub fields: Vec<FieldDef>,
}

impl TypeDef {
    pub fn new(name: &str, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            fields,
        }
    }

    pub fn with_params(mut self, params: &[&str]) -> Self {
        self.params = params.iter().map(|p| p.to_string()).collect();
        self
    }
}

#[derive(Debug)]
pub struct EnumDef {
    pub name: String,
    pub variants: Vec<(String, i64)>,
}

#[derive(Clone, Debug)]
enum Entry {
    Object(Arc<TypeDef>),
    Enum(Arc<EnumDef>),
}

static REGISTRY: LazyLock<DashMap<String, Entry>> = LazyLock::new(DashMap::new);

/// Register (or replace) an object type.
pub fn register_type(def: TypeDef) {
    tracing::debug!(name = %def.name, fields = def.fields.len(), params = ?def.params, "registered type");
    REGISTRY.insert(def.name.clone(), Entry::Object(Arc::new(def)));
}

/// Register (or replace) an enum with explicit variant values.
pub fn register_enum(name: &str, variants: &[(&str, i64)]) {
    let def = EnumDef {
        name: name.to_string(),
        variants: variants.iter().map(|(v, n)| (v.to_string(), *n)).collect(),
    };
    tracing::debug!(name, variants = def.variants.len(), "registered enum");
    REGISTRY.insert(name.to_string(), Entry::Enum(Arc::new(def)));
}

pub fn lookup_type(name: &str) -> Option<Arc<TypeDef>> {
    match REGISTRY.get(name)?.value() {
        Entry::Object(def) => Some(Arc::clone(def)),
        Entry::Enum(_) => None,
    }
}

pub fn lookup_enum(name: &str) -> Option<Arc<EnumDef>> {
    match REGISTRY.get(name)?.value() {
        Entry::Enum(def) => Some(Arc::clone(def)),
        Entry::Object(_) => None,
    }
}

pub fn is_registered(name: &str) -> bool {
    REGISTRY.contains_key(name)
}

fn lookup(name: &str) -> RtResult<Entry> {
    // Clone out of the map so no shard lock is held while validating.
    REGISTRY
        .get(name)
        .map(|e| e.value().clone())
        .ok_or_else(|| RtError::unknown_type(name))
}

fn int_value(n: i64) -> Value {
    i32::try_from(n).map_or(Value::I64(n), Value::I32)
}

/// Value of `name.variant`: i32 when it fits, i64 otherwise.
pub fn enum_variant(name: &str, variant: &str) -> RtResult<Value> {
    let def = lookup_enum(name).ok_or_else(|| RtError::unknown_type(name))?;
    def.variants
        .iter()
        .find(|(v, _)| v == variant)
        .map(|(_, n)| int_value(*n))
        .ok_or_else(|| {
            RtError::missing_field(format!("Enum '{name}' has no variant '{variant}'"))
        })
}

// =============================================================================
// Validation
// =============================================================================

/// Validate `obj` against the registered type `name` instantiated with
/// `type_args`, coercing typed fields in place and filling defaults. On
/// success the object carries the type name; on failure it is untouched.
pub fn validate_object(obj: Value, name: &str, type_args: &[TypeExpr]) -> RtResult<()> {
    let Some(cell) = obj.as_object_cell() else {
        return Err(RtError::type_mismatch(format!(
            "Expected object for type '{name}', got {}",
            obj.type_name()
        )));
    };
    let def = match lookup(name)? {
        Entry::Object(def) => def,
        Entry::Enum(_) => {
            return Err(RtError::type_mismatch(format!(
                "Expected integer for enum '{name}', got object"
            )));
        }
    };
    if def.params.len() != type_args.len() {
        return Err(RtError::type_arity(name, def.params.len(), type_args.len()));
    }
    let bindings: Vec<(&str, &TypeExpr)> = def
        .params
        .iter()
        .map(String::as_str)
        .zip(type_args)
        .collect();

    let mut staged: Vec<(&str, Owned)> = Vec::new();
    for field in &def.fields {
        match cell.get_raw(&field.name) {
            Some(current) => {
                if field.optional && current.is_null() {
                    continue;
                }
                let ty = field.ty.substitute(&bindings);
                let coerced = Owned::new(coerce(current, &ty).map_err(|err| {
                    tracing::debug!(type_name = name, field = %field.name, %err, "field coercion failed");
                    err
                })?);
                if coerced.get().cell_addr() != current.cell_addr() || !current.is_counted() {
                    staged.push((field.name.as_str(), coerced));
                }
            }
            None if field.optional => {
                let default = field.default.as_ref().map_or(Value::Null, Owned::get);
                staged.push((field.name.as_str(), Owned::retained(default)));
            }
            None => {
                return Err(RtError::missing_field(format!(
                    "Object missing required field '{}' for type '{name}'",
                    field.name
                )));
            }
        }
    }
    // Nothing is written until every field has passed.
    for (field, value) in &staged {
        object::set_field(obj, field, value.get())?;
    }
    cell.set_type_name_unchecked(name);
    Ok(())
}

/// Coerce `value` to `ty`. Returns a new reference; objects validated
/// against a registered type come back as the same cell.
pub fn coerce(value: Value, ty: &TypeExpr) -> RtResult<Value> {
    match ty {
        TypeExpr::Any => {
            value.retain();
            Ok(value)
        }
        TypeExpr::Prim(tag) => convert_to_type(value, *tag),
        TypeExpr::Nullable(inner) => {
            if value.is_null() {
                Ok(Value::Null)
            } else {
                coerce(value, inner)
            }
        }
        TypeExpr::Compound(parts) => {
            let mut current = Owned::retained(value);
            for part in parts {
                current = Owned::new(coerce(current.get(), part)?);
            }
            Ok(current.into_raw())
        }
        TypeExpr::Named { name, args } => match lookup(name)? {
            Entry::Object(_) => {
                validate_object(value, name, args)?;
                value.retain();
                Ok(value)
            }
            Entry::Enum(def) => {
                let n = value.as_i64().filter(|_| value.is_integer());
                match n {
                    Some(n) if def.variants.iter().any(|(_, v)| *v == n) => {
                        value.retain();
                        Ok(value)
                    }
                    _ => Err(RtError::type_mismatch(format!(
                        "Value {} is not a variant of enum '{name}'",
                        crate::format::to_display_string(value)
                    ))),
                }
            }
        },
    }
}

// =============================================================================
// C ABI
// =============================================================================

/// Field descriptor passed by generated code.
#[repr(C)]
pub struct TypeFieldDesc {
    pub name: *const c_char,
    /// Type expression, or null for any.
    pub type_expr: *const c_char,
    pub is_optional: i32,
    pub default_value: Value,
}

fn c_str<'a>(ptr: *const c_char, what: &'static str) -> RtResult<&'a str> {
    if ptr.is_null() {
        return Err(RtError::null_dereference(what));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| RtError::type_mismatch(format!("{what} is not valid UTF-8")))
}

unsafe fn c_slice<'a, T>(ptr: *const T, count: i32) -> &'a [T] {
    if ptr.is_null() || count <= 0 {
        &[]
    } else {
        unsafe { core::slice::from_raw_parts(ptr, count as usize) }
    }
}

/// Signature: `(ptr, ptr, i32, ptr, i32) -> ()`
///
/// # Safety
///
/// `name` and every string in `params` and `fields` must be NUL-terminated;
/// `params` and `fields` must point to `num_params` and `num_fields`
/// initialized entries.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_register_type(
    name: *const c_char,
    params: *const *const c_char,
    num_params: i32,
    fields: *const TypeFieldDesc,
    num_fields: i32,
) {
    let result = (|| -> RtResult<()> {
        let name = c_str(name, "type name")?;
        let params = unsafe { c_slice(params, num_params) }
            .iter()
            .map(|p| c_str(*p, "type parameter"))
            .collect::<RtResult<Vec<_>>>()?;
        let mut defs = Vec::new();
        for desc in unsafe { c_slice(fields, num_fields) } {
            let field_name = c_str(desc.name, "field name")?;
            let ty = if desc.type_expr.is_null() {
                TypeExpr::Any
            } else {
                TypeExpr::parse(c_str(desc.type_expr, "field type")?)?
            };
            defs.push(if desc.is_optional != 0 {
                FieldDef::optional(field_name, ty, desc.default_value)
            } else {
                FieldDef::required(field_name, ty)
            });
        }
        register_type(TypeDef::new(name, defs).with_params(&params));
        Ok(())
    })();
    abi_unit(result);
}

/// Signature: `(ptr, ptr, ptr, i32) -> ()`
///
/// # Safety
///
/// `names` and `values` must point to `count` entries; every name must be
/// NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_register_enum(
    name: *const c_char,
    names: *const *const c_char,
    values: *const i64,
    count: i32,
) {
    let result = (|| -> RtResult<()> {
        let name = c_str(name, "enum name")?;
        let names = unsafe { c_slice(names, count) };
        let values = unsafe { c_slice(values, count) };
        let variants = names
            .iter()
            .zip(values)
            .map(|(n, v)| Ok((c_str(*n, "variant name")?, *v)))
            .collect::<RtResult<Vec<_>>>()?;
        register_enum(name, &variants);
        Ok(())
    })();
    abi_unit(result);
}

/// Signature: `(ptr, ptr) -> Value`
///
/// # Safety
///
/// Both arguments must be NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_enum_variant(name: *const c_char, variant: *const c_char) -> Value {
    abi_value(
        c_str(name, "enum name")
            .and_then(|n| Ok((n, c_str(variant, "variant name")?)))
            .and_then(|(n, v)| enum_variant(n, v)),
    )
}

/// Coerce `value` to the annotation `type_expr`. Returns a new reference.
///
/// Signature: `(Value, ptr) -> Value`
///
/// # Safety
///
/// `type_expr` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_validate_object_type(value: Value, type_expr: *const c_char) -> Value {
    abi_value(
        c_str(type_expr, "type name")
            .and_then(TypeExpr::parse)
            .and_then(|ty| coerce(value, &ty)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtErrorKind;
    use serial_test::serial;

    fn field(obj: Value, name: &str) -> Value {
        object::get_field(obj, name).unwrap()
    }

    #[test]
    fn test_parse_expressions() {
        assert_eq!(TypeExpr::parse("i32").unwrap(), TypeExpr::Prim(ValueTag::I32));
        assert_eq!(TypeExpr::parse(" any ").unwrap(), TypeExpr::Any);
        let expr = TypeExpr::parse("Pair<string, Box<i64>> & Tagged").unwrap();
        assert_eq!(expr.to_string(), "Pair<string, Box<i64>> & Tagged");
        let expr = TypeExpr::parse("Node?").unwrap();
        assert!(matches!(expr, TypeExpr::Nullable(_)));
        for bad in ["", "Box<", "A &", "1abc", "Box<i32> x"] {
            let err = TypeExpr::parse(bad).unwrap_err();
            assert!(matches!(err.kind(), RtErrorKind::ParseError(_)), "{bad}");
        }
    }

    #[test]
    #[serial]
    fn test_required_and_default_fields() {
        let guest = Value::string_from("guest");
        register_type(TypeDef::new(
            "TyUser",
            vec![
                FieldDef::required("id", TypeExpr::Prim(ValueTag::I64)),
                FieldDef::optional("name", TypeExpr::Prim(ValueTag::String), guest),
            ],
        ));
        guest.release();

        let obj = Value::object();
        object::set_field(obj, "id", Value::I32(7)).unwrap();
        validate_object(obj, "TyUser", &[]).unwrap();
        assert!(matches!(field(obj, "id"), Value::I64(7)));
        let name = field(obj, "name");
        assert_eq!(name.as_str(), Some("guest"));
        name.release();
        assert_eq!(object::type_name(obj).unwrap().as_deref(), Some("TyUser"));
        obj.release();

        let empty = Value::object();
        let err = validate_object(empty, "TyUser", &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Object missing required field 'id' for type 'TyUser'"
        );
        empty.release();
    }

    #[test]
    #[serial]
    fn test_failed_validation_leaves_object_untouched() {
        register_type(TypeDef::new(
            "TyPoint",
            vec![
                FieldDef::required("x", TypeExpr::Prim(ValueTag::F64)),
                FieldDef::optional("tag", TypeExpr::Any, Value::I32(7)),
                FieldDef::required("y", TypeExpr::Prim(ValueTag::F64)),
            ],
        ));
        let obj = Value::object();
        object::set_field(obj, "x", Value::I32(1)).unwrap();

        let err = validate_object(obj, "TyPoint", &[]).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::MissingField(_)));
        assert!(matches!(field(obj, "x"), Value::I32(1)));
        assert!(matches!(field(obj, "tag"), Value::Null));
        assert_eq!(object::num_fields(obj).unwrap(), 1);
        assert_eq!(object::type_name(obj).unwrap(), None);

        object::set_field(obj, "y", Value::I32(2)).unwrap();
        validate_object(obj, "TyPoint", &[]).unwrap();
        assert!(matches!(field(obj, "x"), Value::F64(x) if x == 1.0));
        assert!(matches!(field(obj, "tag"), Value::I32(7)));
        obj.release();
    }

    #[test]
    #[serial]
    fn test_unknown_type_and_non_object() {
        let obj = Value::object();
        let err = validate_object(obj, "TyNowhere", &[]).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::UnknownType(_)));
        obj.release();

        register_type(TypeDef::new("TyEmpty", Vec::new()));
        let err = validate_object(Value::I32(1), "TyEmpty", &[]).unwrap_err();
        assert_eq!(err.to_string(), "Expected object for type 'TyEmpty', got i32");
    }

    #[test]
    #[serial]
    fn test_generic_substitution_and_arity() {
        register_type(
            TypeDef::new("TyBox", vec![FieldDef::required("value", TypeExpr::named("T"))])
                .with_params(&["T"]),
        );
        let obj = Value::object();
        object::set_field(obj, "value", Value::I8(5)).unwrap();
        validate_object(obj, "TyBox", &[TypeExpr::Prim(ValueTag::F64)]).unwrap();
        assert!(matches!(field(obj, "value"), Value::F64(x) if x == 5.0));

        let err = validate_object(obj, "TyBox", &[]).unwrap_err();
        assert!(matches!(
            err.kind(),
            RtErrorKind::TypeArityMismatch { expected: 1, got: 0, .. }
        ));

        let ty = TypeExpr::parse("TyBox<u8>").unwrap();
        object::set_field(obj, "value", Value::I32(300)).unwrap();
        let err = coerce(obj, &ty).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::RangeError(_)));
        obj.release();
    }

    #[test]
    #[serial]
    fn test_compound_types() {
        register_type(TypeDef::new(
            "TyNamed",
            vec![FieldDef::required("name", TypeExpr::Prim(ValueTag::String))],
        ));
        register_type(TypeDef::new(
            "TyAged",
            vec![FieldDef::optional("age", TypeExpr::Prim(ValueTag::I32), Value::I32(0))],
        ));
        let ty = TypeExpr::parse("TyNamed & TyAged").unwrap();
        let obj = Value::object();
        let n = Value::string_from("ada");
        object::set_field(obj, "name", n).unwrap();
        n.release();
        let out = coerce(obj, &ty).unwrap();
        assert_eq!(out.cell_addr(), obj.cell_addr());
        assert!(matches!(field(obj, "age"), Value::I32(0)));
        assert_eq!(object::type_name(obj).unwrap().as_deref(), Some("TyAged"));
        out.release();

        let bare = Value::object();
        assert!(coerce(bare, &ty).is_err());
        bare.release();
        obj.release();
    }

    #[test]
    #[serial]
    fn test_enums() {
        register_enum("TyColor", &[("Red", 0), ("Green", 1), ("Big", 1 << 40)]);
        assert!(matches!(enum_variant("TyColor", "Green").unwrap(), Value::I32(1)));
        assert!(matches!(enum_variant("TyColor", "Big").unwrap(), Value::I64(_)));
        assert!(enum_variant("TyColor", "Blue").is_err());
        assert!(enum_variant("TyShade", "Red").is_err());

        let ty = TypeExpr::named("TyColor");
        assert!(matches!(coerce(Value::U8(1), &ty).unwrap(), Value::U8(1)));
        let err = coerce(Value::I32(5), &ty).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::TypeMismatch(_)));
        assert!(lookup_type("TyColor").is_none());
        assert!(lookup_enum("TyColor").is_some());
    }

    #[test]
    fn test_nullable() {
        let ty = TypeExpr::parse("i32?").unwrap();
        assert!(coerce(Value::Null, &ty).unwrap().is_null());
        assert!(matches!(coerce(Value::U8(3), &ty).unwrap(), Value::I32(3)));
    }
}

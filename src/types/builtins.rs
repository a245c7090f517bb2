//! Descriptors for compiler builtins and the standard library types whose
//! metadata never appears in a user module's sections.

use super::{CaseSpec, TypeDescriptor, TypeKind};
use crate::{
    metadata::mangling::{BuiltinType, Ownership},
    value::layout::Scalar,
};
use std::sync::Arc;

pub const BUILTIN_MODULE: &str = "Builtin";
pub const STANDARD_MODULE: &str = "Swift";

fn scalar(name: &str, layout: Scalar) -> TypeDescriptor {
    TypeDescriptor::new(TypeKind::Struct, BUILTIN_MODULE, name, layout)
}

/// Descriptor of a `Builtin` type, or `None` for widths without a scalar.
pub fn builtin(ty: BuiltinType) -> Option<TypeDescriptor> {
    Some(match ty {
        BuiltinType::Int(1) => scalar("Int1", Scalar::Bool),
        BuiltinType::Int(8) => scalar("Int8", Scalar::Int8),
        BuiltinType::Int(16) => scalar("Int16", Scalar::Int16),
        BuiltinType::Int(32) => scalar("Int32", Scalar::Int32),
        BuiltinType::Int(64) => scalar("Int64", Scalar::Int64),
        BuiltinType::Int(_) => return None,
        BuiltinType::Float(32) => scalar("FPIEEE32", Scalar::Float32),
        BuiltinType::Float(64) => scalar("FPIEEE64", Scalar::Float64),
        BuiltinType::Float(_) => return None,
        BuiltinType::NativeObject => native_object(),
        BuiltinType::BridgeObject => scalar("BridgeObject", Scalar::Reference),
        BuiltinType::UnknownObject => scalar("UnknownObject", Scalar::Reference),
        BuiltinType::RawPointer => scalar("RawPointer", Scalar::RawPointer),
        BuiltinType::Word => scalar("Word", Scalar::Int64),
    })
}

pub fn native_object() -> TypeDescriptor {
    scalar("NativeObject", Scalar::Reference)
}

/// Storage of a reference with non-strong ownership.
pub fn reference(ownership: Ownership, referent: &TypeDescriptor) -> TypeDescriptor {
    let (prefix, layout) = match ownership {
        Ownership::Weak => ("weak", Scalar::WeakReference),
        Ownership::Unowned => ("unowned", Scalar::Reference),
        Ownership::Unmanaged => ("unowned(unsafe)", Scalar::RawPointer),
    };
    TypeDescriptor::new(
        TypeKind::Struct,
        BUILTIN_MODULE,
        format!("{prefix} {}", referent.full_name()),
        layout,
    )
}

fn wrapper(name: &str, fields: &[(&str, BuiltinType)]) -> Option<TypeDescriptor> {
    let fields = fields
        .iter()
        .map(|(field, ty)| Some((field.to_string(), Arc::new(builtin(*ty)?))))
        .collect::<Option<Vec<_>>>()?;
    Some(TypeDescriptor::structure(STANDARD_MODULE, name, fields))
}

/// A non-generic standard library type by its unqualified name.
pub fn standard(name: &str) -> Option<TypeDescriptor> {
    let value = |ty| wrapper(name, &[("_value", ty)]);
    match name {
        "Int" | "UInt" | "Int64" | "UInt64" => value(BuiltinType::Int(64)),
        "Int32" | "UInt32" => value(BuiltinType::Int(32)),
        "Int16" | "UInt16" => value(BuiltinType::Int(16)),
        "Int8" | "UInt8" => value(BuiltinType::Int(8)),
        "Bool" => value(BuiltinType::Int(1)),
        "Double" => value(BuiltinType::Float(64)),
        "Float" => value(BuiltinType::Float(32)),
        "String" | "Character" | "Substring" => wrapper(
            name,
            &[
                ("_countAndFlagsBits", BuiltinType::Int(64)),
                ("_object", BuiltinType::BridgeObject),
            ],
        ),
        "UnsafeRawPointer" | "UnsafeMutableRawPointer" | "OpaquePointer" => {
            wrapper(name, &[("_rawValue", BuiltinType::RawPointer)])
        }
        _ => None,
    }
}

/// A bound standard library generic whose layout does not depend on its
/// arguments: collections are a single buffer reference and typed pointers a
/// raw pointer.
pub fn standard_generic(name: &str, arguments: &[Arc<TypeDescriptor>]) -> Option<TypeDescriptor> {
    let field = match name {
        "Array" | "ContiguousArray" | "Dictionary" | "Set" => ("_buffer", BuiltinType::BridgeObject),
        "UnsafePointer" | "UnsafeMutablePointer" => ("_rawValue", BuiltinType::RawPointer),
        _ => return None,
    };
    let mut ty = wrapper(name, &[field])?;
    ty.name = bound_name(name, arguments);
    Some(ty)
}

fn bound_name(base: &str, arguments: &[Arc<TypeDescriptor>]) -> String {
    let arguments = arguments
        .iter()
        .map(|a| a.full_name())
        .collect::<Vec<_>>()
        .join(", ");
    format!("{base}<{arguments}>")
}

/// `Optional<wrapped>`: the payload case `some` has tag 0, `none` tag 1.
pub fn optional(wrapped: Arc<TypeDescriptor>) -> TypeDescriptor {
    let name = bound_name("Optional", std::slice::from_ref(&wrapped));
    TypeDescriptor::enumeration(
        STANDARD_MODULE,
        name,
        vec![
            CaseSpec::Payload("some".to_string(), wrapped),
            CaseSpec::Empty("none".to_string()),
        ],
    )
}

/// An unlabeled tuple; elements are fields named by position.
pub fn tuple(elements: Vec<Arc<TypeDescriptor>>) -> TypeDescriptor {
    let name = format!(
        "({})",
        elements
            .iter()
            .map(|e| e.full_name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    TypeDescriptor::structure(
        "",
        name,
        elements
            .into_iter()
            .enumerate()
            .map(|(i, e)| (i.to_string(), e))
            .collect(),
    )
}

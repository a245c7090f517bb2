use super::Value;
use crate::{
    error::{BridgeError, Result},
    memory::Memory,
    types::{members::EnumCase, TypeDescriptor},
};
use std::sync::Arc;
use tracing::trace;

/// An enum value split into its case and payload.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedEnum {
    pub tag: u32,
    pub case: String,
    /// An owned copy of the payload with any tag bits cleared.
    pub payload: Option<Value>,
}

fn enum_case(ty: &TypeDescriptor, tag: u32) -> Result<&EnumCase> {
    ty.case_by_tag(tag).ok_or_else(|| {
        BridgeError::InvalidValue(format!("tag {tag} out of range for {}", ty.full_name()))
    })
}

pub fn decode(value: &Value) -> Result<DecodedEnum> {
    let ty = value.ty();
    let layout = ty
        .enum_layout()
        .ok_or_else(|| BridgeError::InvalidValue(format!("{} is not an enum", ty.full_name())))?;
    let bytes = value.bytes()?;
    let tag = layout.get_tag(&bytes);
    let case = enum_case(ty, tag)?;
    trace!(ty = %ty.full_name(), tag, case = %case.name, "decoded enum");
    let payload = match &case.payload {
        Some(payload) => {
            let projected = layout.project_payload(&bytes);
            Some(Value::from_bytes(
                value.memory().clone(),
                payload.ty.clone(),
                &projected,
            )?)
        }
        None => None,
    };
    Ok(DecodedEnum {
        tag,
        case: case.name.clone(),
        payload,
    })
}

/// Builds an owned value of the case named `case`.
pub fn make_case(
    memory: Arc<dyn Memory>,
    ty: &Arc<TypeDescriptor>,
    case: &str,
    payload: Option<&Value>,
) -> Result<Value> {
    let tag = ty
        .case(case)
        .ok_or_else(|| BridgeError::not_found(format!("case {case} of {}", ty.full_name())))?
        .tag;
    make_tag(memory, ty, tag, payload)
}

pub fn make_tag(
    memory: Arc<dyn Memory>,
    ty: &Arc<TypeDescriptor>,
    tag: u32,
    payload: Option<&Value>,
) -> Result<Value> {
    let layout = ty
        .enum_layout()
        .ok_or_else(|| BridgeError::InvalidValue(format!("{} is not an enum", ty.full_name())))?;
    let case = enum_case(ty, tag)?;
    let mut bytes = vec![0; ty.stride()];
    match (&case.payload, payload) {
        (Some(expected), Some(payload)) => {
            if expected.ty != *payload.ty() {
                return Err(BridgeError::InvalidValue(format!(
                    "case {} expects {}, got {}",
                    case.name,
                    expected.ty.full_name(),
                    payload.ty().full_name()
                )));
            }
            let payload = payload.bytes()?;
            bytes[..payload.len()].copy_from_slice(&payload);
        }
        (None, None) => {}
        (Some(_), None) => {
            return Err(BridgeError::InvalidValue(format!(
                "case {} requires a payload",
                case.name
            )))
        }
        (None, Some(_)) => {
            return Err(BridgeError::InvalidValue(format!(
                "case {} has no payload",
                case.name
            )))
        }
    }
    layout.inject_tag(&mut bytes, tag);
    Value::from_bytes(memory, ty.clone(), &bytes)
}

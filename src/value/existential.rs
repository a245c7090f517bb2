use super::{
    layout::{align_up, HasLayout, LayoutManager, HEAP_OBJECT_HEADER_SIZE, INLINE_BUFFER_SIZE},
    Value,
};
use crate::{
    error::{BridgeError, Result},
    memory::POINTER_SIZE,
    resolve::Catalog,
    runtime::BoxAllocator,
    types::{protocols::ProtocolComposition, TypeDescriptor},
    utils::{bytes_from_words, words_from_bytes},
};
use std::sync::Arc;
use tracing::trace;

/// The raw contents of a protocol-typed value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExistentialContainer {
    OpaqueInline {
        metadata: usize,
        buffer: [u64; 3],
        witness_tables: Vec<usize>,
    },
    OpaqueBoxed {
        metadata: usize,
        box_object: usize,
        witness_tables: Vec<usize>,
    },
    Class {
        object: usize,
        witness_tables: Vec<usize>,
    },
}

/// Whether a value of this layout is stored directly in the three-word buffer.
pub fn fits_inline(layout: &LayoutManager) -> bool {
    layout.size() <= INLINE_BUFFER_SIZE
        && layout.alignment() <= POINTER_SIZE
        && layout.is_bitwise_takable()
}

/// Offset of the value inside a box allocated for a value of `alignment`.
pub fn boxed_value_offset(alignment: usize) -> usize {
    align_up(HEAP_OBJECT_HEADER_SIZE, alignment.max(1))
}

impl ExistentialContainer {
    pub fn witness_tables(&self) -> &[usize] {
        match self {
            Self::OpaqueInline { witness_tables, .. }
            | Self::OpaqueBoxed { witness_tables, .. }
            | Self::Class { witness_tables, .. } => witness_tables,
        }
    }

    pub fn metadata(&self) -> Option<usize> {
        match self {
            Self::OpaqueInline { metadata, .. } | Self::OpaqueBoxed { metadata, .. } => {
                Some(*metadata)
            }
            Self::Class { .. } => None,
        }
    }

    pub fn to_words(&self) -> Vec<u64> {
        let mut words = match self {
            Self::OpaqueInline {
                metadata, buffer, ..
            } => vec![buffer[0], buffer[1], buffer[2], *metadata as u64],
            Self::OpaqueBoxed {
                metadata,
                box_object,
                ..
            } => vec![*box_object as u64, 0, 0, *metadata as u64],
            Self::Class { object, .. } => vec![*object as u64],
        };
        words.extend(self.witness_tables().iter().map(|&w| w as u64));
        words
    }

    /// Splits raw container words. `stored_inline` decides, from the dynamic
    /// type's metadata, whether an opaque container holds its value inline.
    pub fn parse(
        composition: &ProtocolComposition,
        words: &[u64],
        stored_inline: impl FnOnce(usize) -> Result<bool>,
    ) -> Result<Self> {
        let expected = composition.container_words();
        if words.len() < expected {
            return Err(BridgeError::InvalidBuffer {
                required: expected * POINTER_SIZE,
                actual: words.len() * POINTER_SIZE,
            });
        }
        let header = if composition.class_only { 1 } else { 4 };
        let witness_tables = words[header..expected].iter().map(|&w| w as usize).collect();
        if composition.class_only {
            return Ok(Self::Class {
                object: words[0] as usize,
                witness_tables,
            });
        }
        let metadata = words[3] as usize;
        Ok(if stored_inline(metadata)? {
            Self::OpaqueInline {
                metadata,
                buffer: [words[0], words[1], words[2]],
                witness_tables,
            }
        } else {
            Self::OpaqueBoxed {
                metadata,
                box_object: words[0] as usize,
                witness_tables,
            }
        })
    }

    /// Reads the container held by a protocol-typed value.
    pub fn read(catalog: &Catalog, container: &Value) -> Result<Self> {
        let composition = composition_of(container.ty())?;
        let words = words_from_bytes(&container.bytes()?);
        Self::parse(composition, &words, |metadata| {
            Ok(fits_inline(&catalog.type_for_metadata(metadata)?.layout))
        })
    }
}

fn composition_of(ty: &TypeDescriptor) -> Result<&ProtocolComposition> {
    ty.existential.as_ref().ok_or_else(|| {
        BridgeError::InvalidValue(format!("{} is not a protocol type", ty.full_name()))
    })
}

/// Packs `value` into an owned container of `composition`.
///
/// The container copies the value's bits and takes no references of its own.
pub fn wrap(
    catalog: &Catalog,
    allocator: &dyn BoxAllocator,
    value: &Value,
    composition: &ProtocolComposition,
) -> Result<Value> {
    let ty = value.ty();
    let witness_tables = composition
        .protocols
        .iter()
        .map(|protocol| catalog.witness_table(ty, protocol))
        .collect::<Result<Vec<_>>>()?;
    let memory = catalog.memory();

    let container = if composition.class_only {
        if !ty.is_class() {
            return Err(BridgeError::InvalidValue(format!(
                "{} requires a class, got {}",
                composition.name(),
                ty.full_name()
            )));
        }
        ExistentialContainer::Class {
            object: value.object_address()?,
            witness_tables,
        }
    } else if ty.is_class() {
        let object = value.object_address()?;
        ExistentialContainer::OpaqueInline {
            metadata: memory.read_pointer(object)?,
            buffer: [object as u64, 0, 0],
            witness_tables,
        }
    } else {
        let metadata = catalog.metadata_of(ty)?;
        let bytes = value.bytes()?;
        if fits_inline(&ty.layout) {
            let mut buffer = [0u64; 3];
            for (slot, word) in buffer.iter_mut().zip(words_from_bytes(&bytes)) {
                *slot = word;
            }
            ExistentialContainer::OpaqueInline {
                metadata,
                buffer,
                witness_tables,
            }
        } else {
            let (box_object, address) = allocator.allocate_box(memory.as_ref(), metadata, &ty.layout())?;
            memory.write(address, &bytes)?;
            ExistentialContainer::OpaqueBoxed {
                metadata,
                box_object,
                witness_tables,
            }
        }
    };
    trace!(ty = %ty.full_name(), composition = %composition.name(), ?container, "wrapped");

    let container_ty = catalog.existential_type(composition);
    Value::from_bytes(
        memory.clone(),
        container_ty,
        &bytes_from_words(&container.to_words()),
    )
}

/// Recovers the dynamic type and the value held by a container. Inline and
/// boxed values are views into the container or the box.
pub fn unwrap(catalog: &Catalog, container: &Value) -> Result<(Arc<TypeDescriptor>, Value)> {
    let memory = catalog.memory();
    match ExistentialContainer::read(catalog, container)? {
        ExistentialContainer::Class { object, .. } => {
            let ty = catalog.type_for_object(object)?;
            let value = Value::from_bytes(memory.clone(), ty.clone(), &object.to_le_bytes())?;
            Ok((ty, value))
        }
        ExistentialContainer::OpaqueInline { metadata, .. } => {
            let ty = catalog.type_for_metadata(metadata)?;
            Ok((ty.clone(), container.project(ty, 0)))
        }
        ExistentialContainer::OpaqueBoxed {
            metadata,
            box_object,
            ..
        } => {
            let ty = catalog.type_for_metadata(metadata)?;
            let address = box_object + boxed_value_offset(ty.layout.alignment());
            Ok((ty.clone(), Value::borrowed(memory.clone(), ty, address)))
        }
    }
}

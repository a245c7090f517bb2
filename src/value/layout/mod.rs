use crate::{
    memory::POINTER_SIZE,
    metadata::ValueWitnessTable,
    utils::{read_uint, write_uint},
};
use enum_dispatch::enum_dispatch;
use std::{ops::Range, sync::Arc};

mod enums;
pub use enums::*;

/// Capacity of the inline buffer of an opaque existential container.
pub const INLINE_BUFFER_SIZE: usize = 3 * POINTER_SIZE;
/// Metadata pointer plus reference counts.
pub const HEAP_OBJECT_HEADER_SIZE: usize = 2 * POINTER_SIZE;

/// Addresses below this are never valid heap objects and serve as extra
/// inhabitants of non-null pointers.
#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
pub const LEAST_VALID_POINTER: u64 = 0x1_0000_0000;
#[cfg(not(all(target_vendor = "apple", target_arch = "aarch64")))]
pub const LEAST_VALID_POINTER: u64 = 0x1000;

/// High bits of a native object pointer that never carry address information.
pub const REFERENCE_SPARE_BITS: u64 = 0xf000_0000_0000_0000;

pub fn pointer_extra_inhabitants() -> u32 {
    LEAST_VALID_POINTER.min(i32::MAX as u64) as u32
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    let misalignment = value % align;
    if misalignment == 0 {
        value
    } else {
        value + align - misalignment
    }
}

#[enum_dispatch]
pub trait HasLayout {
    fn size(&self) -> usize;
    fn alignment(&self) -> usize;
    fn extra_inhabitant_count(&self) -> u32;
    /// Bits that are never significant in a valid value.
    fn spare_bits(&self) -> SpareBits;
    fn is_pod(&self) -> bool;
    fn is_bitwise_takable(&self) -> bool;
    fn contains_floats(&self) -> bool;
    /// Returns the extra inhabitant encoded in `bytes`, or `None` for a valid value.
    fn extra_inhabitant_index(&self, bytes: &[u8]) -> Option<u32>;
    fn store_extra_inhabitant(&self, bytes: &mut [u8], index: u32);
}

#[enum_dispatch(HasLayout)]
#[derive(Clone, Debug, PartialEq)]
pub enum LayoutManager {
    Scalar,
    FieldLayoutManager,
    EnumLayoutManager,
    ExistentialLayoutManager,
    OpaqueLayoutManager,
}

/// The summary the runtime publishes in a type's value witness table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Layout {
    pub size: usize,
    pub stride: usize,
    pub alignment: usize,
    pub extra_inhabitants: u32,
}

impl LayoutManager {
    pub fn empty() -> Self {
        FieldLayoutManager::sequential(std::iter::empty()).into()
    }

    pub fn stride(&self) -> usize {
        align_up(self.size(), self.alignment()).max(1)
    }

    pub fn summary(&self) -> Layout {
        Layout {
            size: self.size(),
            stride: self.stride(),
            alignment: self.alignment(),
            extra_inhabitants: self.extra_inhabitant_count(),
        }
    }

    /// Extra inhabitants this crate can encode itself. Opaque layouts only know
    /// how many exist.
    pub fn usable_extra_inhabitants(&self) -> u32 {
        match self {
            LayoutManager::OpaqueLayoutManager(_) => 0,
            _ => self.extra_inhabitant_count(),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, LayoutManager::Scalar(Scalar::Reference))
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            LayoutManager::FieldLayoutManager(_) => "struct",
            LayoutManager::EnumLayoutManager(e) => match e.strategy {
                EnumStrategy::NoPayload { .. } => "enum",
                EnumStrategy::SinglePayload { .. } => "enum1",
                EnumStrategy::MultiPayload { .. } => "enumN",
            },
            LayoutManager::ExistentialLayoutManager(e) => {
                if e.class_bound {
                    "any-object"
                } else {
                    "any"
                }
            }
            LayoutManager::OpaqueLayoutManager(_) => "opaque",
            LayoutManager::Scalar(s) => match s {
                Scalar::Int8 => "i8",
                Scalar::Int16 => "i16",
                Scalar::Int32 => "i32",
                Scalar::Int64 => "i64",
                Scalar::Float32 => "f32",
                Scalar::Float64 => "f64",
                Scalar::Bool => "bool",
                Scalar::Reference => "obj",
                Scalar::WeakReference => "weak",
                Scalar::RawPointer => "ptr",
            },
        }
    }
}

/// Spare bit mask over a value's bytes, little-endian bit numbering.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SpareBits(Vec<u8>);

impl SpareBits {
    pub fn none(size: usize) -> Self {
        Self(vec![0; size])
    }

    pub fn all(size: usize) -> Self {
        Self(vec![0xff; size])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Overwrites the mask at `offset` with `other`.
    pub fn place(&mut self, offset: usize, other: &SpareBits) {
        for (i, b) in other.0.iter().enumerate() {
            if let Some(slot) = self.0.get_mut(offset + i) {
                *slot = *b;
            }
        }
    }

    pub fn resized(&self, size: usize, fill: u8) -> Self {
        let mut bytes = self.0.clone();
        bytes.resize(size, fill);
        Self(bytes)
    }

    pub fn intersect(&self, other: &SpareBits) -> Self {
        Self(self.0.iter().zip(&other.0).map(|(a, b)| a & b).collect())
    }

    /// Positions of the `n` lowest-order spare bits.
    pub fn lowest(&self, n: usize) -> Vec<usize> {
        (0..self.0.len() * 8)
            .filter(|&bit| self.0[bit / 8] & (1 << (bit % 8)) != 0)
            .take(n)
            .collect()
    }

    pub fn clear(&mut self, positions: &[usize]) {
        for &bit in positions {
            self.0[bit / 8] &= !(1 << (bit % 8));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    /// Strong native object reference; never null.
    Reference,
    WeakReference,
    /// Raw pointer that Swift treats as non-null.
    RawPointer,
}

impl HasLayout for Scalar {
    fn size(&self) -> usize {
        match self {
            Scalar::Int8 | Scalar::Bool => 1,
            Scalar::Int16 => 2,
            Scalar::Int32 | Scalar::Float32 => 4,
            Scalar::Int64 | Scalar::Float64 => 8,
            Scalar::Reference | Scalar::WeakReference | Scalar::RawPointer => POINTER_SIZE,
        }
    }

    fn alignment(&self) -> usize {
        self.size()
    }

    fn extra_inhabitant_count(&self) -> u32 {
        match self {
            Scalar::Bool => 254,
            Scalar::Reference | Scalar::RawPointer => pointer_extra_inhabitants(),
            _ => 0,
        }
    }

    fn spare_bits(&self) -> SpareBits {
        match self {
            Scalar::Bool => SpareBits::from_bytes(vec![0xfe]),
            Scalar::Reference => SpareBits::from_bytes(REFERENCE_SPARE_BITS.to_le_bytes().to_vec()),
            _ => SpareBits::none(self.size()),
        }
    }

    fn is_pod(&self) -> bool {
        !matches!(self, Scalar::Reference | Scalar::WeakReference)
    }

    fn is_bitwise_takable(&self) -> bool {
        *self != Scalar::WeakReference
    }

    fn contains_floats(&self) -> bool {
        matches!(self, Scalar::Float32 | Scalar::Float64)
    }

    fn extra_inhabitant_index(&self, bytes: &[u8]) -> Option<u32> {
        match self {
            Scalar::Bool => bytes.first().filter(|&&b| b >= 2).map(|&b| (b - 2) as u32),
            Scalar::Reference | Scalar::RawPointer => {
                let value = read_uint(bytes, 0, POINTER_SIZE);
                (value < pointer_extra_inhabitants() as u64).then_some(value as u32)
            }
            _ => None,
        }
    }

    fn store_extra_inhabitant(&self, bytes: &mut [u8], index: u32) {
        match self {
            Scalar::Bool => write_uint(bytes, 0, 1, 2 + index as u64),
            Scalar::Reference | Scalar::RawPointer => {
                write_uint(bytes, 0, POINTER_SIZE, index as u64)
            }
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldLayout {
    pub name: String,
    pub position: usize,
    pub layout: Arc<LayoutManager>,
}

impl FieldLayout {
    pub fn as_range(&self) -> Range<usize> {
        self.position..self.position + self.layout.size()
    }
}

/// Struct, tuple and class instance layouts.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldLayoutManager {
    pub fields: Vec<FieldLayout>,
    pub total_size: usize,
    pub alignment: usize,
}

impl FieldLayoutManager {
    pub fn sequential(fields: impl IntoIterator<Item = (String, Arc<LayoutManager>)>) -> Self {
        Self::sequential_from(0, 1, fields)
    }

    /// Lays fields out one after another starting at `start`, the way class
    /// instances continue after their superclass.
    pub fn sequential_from(
        start: usize,
        start_alignment: usize,
        fields: impl IntoIterator<Item = (String, Arc<LayoutManager>)>,
    ) -> Self {
        let mut offset = start;
        let mut alignment = start_alignment.max(1);
        let fields = fields
            .into_iter()
            .map(|(name, layout)| {
                let align = layout.alignment().max(1);
                alignment = alignment.max(align);
                let position = align_up(offset, align);
                offset = position + layout.size();
                FieldLayout {
                    name,
                    position,
                    layout,
                }
            })
            .collect();
        Self {
            fields,
            total_size: offset,
            alignment,
        }
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn offsets(&self) -> Vec<usize> {
        self.fields.iter().map(|f| f.position).collect()
    }

    /// The field whose extra inhabitants the aggregate borrows: the one with
    /// the most, the first on ties.
    fn extra_inhabitant_field(&self) -> Option<&FieldLayout> {
        let mut best: Option<&FieldLayout> = None;
        for field in &self.fields {
            let count = field.layout.usable_extra_inhabitants();
            if count > 0 && best.is_none_or(|b| count > b.layout.usable_extra_inhabitants()) {
                best = Some(field);
            }
        }
        best
    }
}

impl HasLayout for FieldLayoutManager {
    fn size(&self) -> usize {
        self.total_size
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn extra_inhabitant_count(&self) -> u32 {
        self.extra_inhabitant_field()
            .map_or(0, |f| f.layout.usable_extra_inhabitants())
    }

    fn spare_bits(&self) -> SpareBits {
        let mut bits = SpareBits::all(self.total_size);
        for field in &self.fields {
            bits.place(field.position, &field.layout.spare_bits());
        }
        bits
    }

    fn is_pod(&self) -> bool {
        self.fields.iter().all(|f| f.layout.is_pod())
    }

    fn is_bitwise_takable(&self) -> bool {
        self.fields.iter().all(|f| f.layout.is_bitwise_takable())
    }

    fn contains_floats(&self) -> bool {
        self.fields.iter().any(|f| f.layout.contains_floats())
    }

    fn extra_inhabitant_index(&self, bytes: &[u8]) -> Option<u32> {
        let field = self.extra_inhabitant_field()?;
        field
            .layout
            .extra_inhabitant_index(bytes.get(field.as_range())?)
    }

    fn store_extra_inhabitant(&self, bytes: &mut [u8], index: u32) {
        if let Some(field) = self.extra_inhabitant_field() {
            if let Some(slice) = bytes.get_mut(field.as_range()) {
                field.layout.store_extra_inhabitant(slice, index);
            }
        }
    }
}

/// Protocol-typed storage: an opaque container (three-word buffer, metadata
/// pointer) or a class container (object pointer), followed by one witness
/// table pointer per protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExistentialLayoutManager {
    pub class_bound: bool,
    pub witness_tables: usize,
}

impl ExistentialLayoutManager {
    pub fn header_words(&self) -> usize {
        if self.class_bound {
            1
        } else {
            4
        }
    }

    pub fn witness_table_offset(&self, index: usize) -> usize {
        (self.header_words() + index) * POINTER_SIZE
    }

    fn pointer_range(&self) -> Range<usize> {
        let word = if self.class_bound { 0 } else { 3 };
        word * POINTER_SIZE..(word + 1) * POINTER_SIZE
    }
}

impl HasLayout for ExistentialLayoutManager {
    fn size(&self) -> usize {
        (self.header_words() + self.witness_tables) * POINTER_SIZE
    }

    fn alignment(&self) -> usize {
        POINTER_SIZE
    }

    fn extra_inhabitant_count(&self) -> u32 {
        pointer_extra_inhabitants()
    }

    fn spare_bits(&self) -> SpareBits {
        SpareBits::none(self.size())
    }

    fn is_pod(&self) -> bool {
        false
    }

    fn is_bitwise_takable(&self) -> bool {
        true
    }

    fn contains_floats(&self) -> bool {
        false
    }

    fn extra_inhabitant_index(&self, bytes: &[u8]) -> Option<u32> {
        Scalar::Reference.extra_inhabitant_index(bytes.get(self.pointer_range())?)
    }

    fn store_extra_inhabitant(&self, bytes: &mut [u8], index: u32) {
        if let Some(slice) = bytes.get_mut(self.pointer_range()) {
            Scalar::Reference.store_extra_inhabitant(slice, index);
        }
    }
}

/// A layout known only from the runtime's value witness table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpaqueLayoutManager {
    pub size: usize,
    pub alignment: usize,
    pub extra_inhabitants: u32,
    pub pod: bool,
    pub bitwise_takable: bool,
}

impl OpaqueLayoutManager {
    pub fn from_witnesses(vwt: &ValueWitnessTable) -> Self {
        Self {
            size: vwt.size,
            alignment: vwt.alignment(),
            extra_inhabitants: vwt.extra_inhabitant_count,
            pod: vwt.flags.is_pod(),
            bitwise_takable: vwt.flags.is_bitwise_takable(),
        }
    }
}

impl HasLayout for OpaqueLayoutManager {
    fn size(&self) -> usize {
        self.size
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn extra_inhabitant_count(&self) -> u32 {
        self.extra_inhabitants
    }

    fn spare_bits(&self) -> SpareBits {
        SpareBits::none(self.size)
    }

    fn is_pod(&self) -> bool {
        self.pod
    }

    fn is_bitwise_takable(&self) -> bool {
        self.bitwise_takable
    }

    fn contains_floats(&self) -> bool {
        false
    }

    fn extra_inhabitant_index(&self, _bytes: &[u8]) -> Option<u32> {
        None
    }

    fn store_extra_inhabitant(&self, _bytes: &mut [u8], _index: u32) {}
}

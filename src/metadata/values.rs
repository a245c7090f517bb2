//! Flag words and discriminators published by the Swift runtime ABI.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextDescriptorKind {
    Module,
    Extension,
    Anonymous,
    Protocol,
    OpaqueType,
    Class,
    Struct,
    Enum,
}

impl ContextDescriptorKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Module,
            1 => Self::Extension,
            2 => Self::Anonymous,
            3 => Self::Protocol,
            4 => Self::OpaqueType,
            16 => Self::Class,
            17 => Self::Struct,
            18 => Self::Enum,
            _ => return None,
        })
    }

    pub fn is_type(self) -> bool {
        matches!(self, Self::Class | Self::Struct | Self::Enum)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextDescriptorFlags(pub u32);

impl ContextDescriptorFlags {
    pub fn kind(self) -> Option<ContextDescriptorKind> {
        ContextDescriptorKind::from_raw(self.0 & 0x1f)
    }

    pub fn is_generic(self) -> bool {
        self.0 & 0x80 != 0
    }

    pub fn is_unique(self) -> bool {
        self.0 & 0x40 != 0
    }

    pub fn kind_specific_flags(self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }
}

/// Kind-specific flags of class, struct and enum descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeContextDescriptorFlags(pub u16);

impl TypeContextDescriptorFlags {
    const METADATA_INITIALIZATION_MASK: u16 = 0x3;
    const CLASS_HAS_RESILIENT_SUPERCLASS: u16 = 1 << 13;
    const CLASS_HAS_OVERRIDE_TABLE: u16 = 1 << 14;
    const CLASS_HAS_VTABLE: u16 = 1 << 15;

    pub fn metadata_initialization(self) -> u16 {
        self.0 & Self::METADATA_INITIALIZATION_MASK
    }

    pub fn class_has_vtable(self) -> bool {
        self.0 & Self::CLASS_HAS_VTABLE != 0
    }

    pub fn class_has_override_table(self) -> bool {
        self.0 & Self::CLASS_HAS_OVERRIDE_TABLE != 0
    }

    pub fn class_has_resilient_superclass(self) -> bool {
        self.0 & Self::CLASS_HAS_RESILIENT_SUPERCLASS != 0
    }
}

/// Kind-specific flags of protocol descriptors. Bit 0 is the class constraint,
/// where zero means the protocol is class-bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolContextDescriptorFlags(pub u16);

impl ProtocolContextDescriptorFlags {
    pub fn is_class_constrained(self) -> bool {
        self.0 & 0x1 == 0
    }

    pub fn is_resilient(self) -> bool {
        self.0 & 0x2 != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MethodDescriptorKind {
    Method,
    Init,
    Getter,
    Setter,
    ModifyCoroutine,
    ReadCoroutine,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MethodDescriptorFlags(pub u32);

impl MethodDescriptorFlags {
    pub fn kind(self) -> Option<MethodDescriptorKind> {
        Some(match self.0 & 0x0f {
            0 => MethodDescriptorKind::Method,
            1 => MethodDescriptorKind::Init,
            2 => MethodDescriptorKind::Getter,
            3 => MethodDescriptorKind::Setter,
            4 => MethodDescriptorKind::ModifyCoroutine,
            5 => MethodDescriptorKind::ReadCoroutine,
            _ => return None,
        })
    }

    pub fn is_instance(self) -> bool {
        self.0 & 0x10 != 0
    }

    pub fn is_dynamic(self) -> bool {
        self.0 & 0x20 != 0
    }

    pub fn is_async(self) -> bool {
        self.0 & 0x40 != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeReferenceKind {
    DirectTypeDescriptor,
    IndirectTypeDescriptor,
    DirectObjCClassName,
    IndirectObjCClass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConformanceFlags(pub u32);

impl ConformanceFlags {
    pub fn type_reference_kind(self) -> Option<TypeReferenceKind> {
        Some(match (self.0 >> 3) & 0x7 {
            0 => TypeReferenceKind::DirectTypeDescriptor,
            1 => TypeReferenceKind::IndirectTypeDescriptor,
            2 => TypeReferenceKind::DirectObjCClassName,
            3 => TypeReferenceKind::IndirectObjCClass,
            _ => return None,
        })
    }

    pub fn is_retroactive(self) -> bool {
        self.0 & 0x40 != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldRecordFlags(pub u32);

impl FieldRecordFlags {
    pub fn is_indirect_case(self) -> bool {
        self.0 & 0x1 != 0
    }

    pub fn is_var(self) -> bool {
        self.0 & 0x2 != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    Class,
    Struct,
    Enum,
    Optional,
    ForeignClass,
    Opaque,
    Tuple,
    Function,
    Existential,
    Metatype,
    ObjCClassWrapper,
    ExistentialMetatype,
    HeapLocalVariable,
    HeapGenericLocalVariable,
    ErrorObject,
}

impl MetadataKind {
    /// Values above this are ObjC isa pointers of class metadata.
    pub const LAST_ENUMERATED: u64 = 0x7ff;

    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Class,
            0x200 => Self::Struct,
            0x201 => Self::Enum,
            0x202 => Self::Optional,
            0x203 => Self::ForeignClass,
            0x300 => Self::Opaque,
            0x301 => Self::Tuple,
            0x302 => Self::Function,
            0x303 => Self::Existential,
            0x304 => Self::Metatype,
            0x305 => Self::ObjCClassWrapper,
            0x306 => Self::ExistentialMetatype,
            0x400 => Self::HeapLocalVariable,
            0x500 => Self::HeapGenericLocalVariable,
            0x501 => Self::ErrorObject,
            raw if raw > Self::LAST_ENUMERATED => Self::Class,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValueWitnessFlags(pub u32);

impl ValueWitnessFlags {
    const ALIGNMENT_MASK: u32 = 0xff;
    const IS_NON_POD: u32 = 0x0001_0000;
    const IS_NON_INLINE: u32 = 0x0002_0000;
    const HAS_SPARE_BITS: u32 = 0x0008_0000;
    const IS_NON_BITWISE_TAKABLE: u32 = 0x0010_0000;
    const HAS_ENUM_WITNESSES: u32 = 0x0020_0000;
    const INCOMPLETE: u32 = 0x0040_0000;

    pub fn alignment_mask(self) -> usize {
        (self.0 & Self::ALIGNMENT_MASK) as usize
    }

    pub fn alignment(self) -> usize {
        self.alignment_mask() + 1
    }

    pub fn is_pod(self) -> bool {
        self.0 & Self::IS_NON_POD == 0
    }

    pub fn is_inline_storage(self) -> bool {
        self.0 & Self::IS_NON_INLINE == 0
    }

    pub fn has_spare_bits(self) -> bool {
        self.0 & Self::HAS_SPARE_BITS != 0
    }

    pub fn is_bitwise_takable(self) -> bool {
        self.0 & Self::IS_NON_BITWISE_TAKABLE == 0
    }

    pub fn has_enum_witnesses(self) -> bool {
        self.0 & Self::HAS_ENUM_WITNESSES != 0
    }

    pub fn is_incomplete(self) -> bool {
        self.0 & Self::INCOMPLETE != 0
    }

    pub fn with_alignment(align: usize) -> Self {
        Self((align.max(1) - 1) as u32 & Self::ALIGNMENT_MASK)
    }

    pub fn non_pod(self) -> Self {
        Self(self.0 | Self::IS_NON_POD)
    }

    pub fn non_inline(self) -> Self {
        Self(self.0 | Self::IS_NON_INLINE)
    }

    pub fn non_bitwise_takable(self) -> Self {
        Self(self.0 | Self::IS_NON_BITWISE_TAKABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_flags() {
        let flags = ContextDescriptorFlags(0x8000_0051);
        assert_eq!(flags.kind(), Some(ContextDescriptorKind::Struct));
        assert!(flags.is_unique());
        assert!(!flags.is_generic());
        assert_eq!(flags.kind_specific_flags(), 0x8000);
        assert!(TypeContextDescriptorFlags(flags.kind_specific_flags()).class_has_vtable());
    }

    #[test]
    fn test_protocol_class_constraint() {
        assert!(ProtocolContextDescriptorFlags(0).is_class_constrained());
        assert!(!ProtocolContextDescriptorFlags(1).is_class_constrained());
    }

    #[test]
    fn test_value_witness_flags() {
        let flags = ValueWitnessFlags::with_alignment(8).non_pod();
        assert_eq!(flags.alignment(), 8);
        assert!(!flags.is_pod());
        assert!(flags.is_inline_storage());
        assert!(flags.is_bitwise_takable());
        assert!(!flags.non_inline().is_inline_storage());
    }

    #[test]
    fn test_metadata_kind_isa() {
        assert_eq!(MetadataKind::from_raw(0x200), Some(MetadataKind::Struct));
        assert_eq!(
            MetadataKind::from_raw(0x1_0000_4000),
            Some(MetadataKind::Class)
        );
        assert_eq!(MetadataKind::from_raw(0x100), None);
    }
}

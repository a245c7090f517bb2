//! Loaded images and the Swift metadata sections they carry.

use crate::{
    error::{BridgeError, MemoryError, Result},
    memory::Memory,
};
use object::{BinaryFormat, Object, ObjectSection, ObjectSymbol};
use std::{collections::HashMap, path::Path, sync::Arc};
use tracing::debug;

/// Section names for (Mach-O, ELF).
pub const TYPES_SECTION: (&str, &str) = ("__swift5_types", "swift5_type_metadata");
pub const PROTOCOLS_SECTION: (&str, &str) = ("__swift5_protos", "swift5_protocols");
pub const CONFORMANCES_SECTION: (&str, &str) = ("__swift5_proto", "swift5_protocol_conformances");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Section {
    pub address: usize,
    pub size: usize,
}

impl Section {
    /// Addresses of the 32-bit relative pointers the section is made of.
    pub fn entries(&self) -> impl Iterator<Item = usize> {
        let address = self.address;
        (0..self.size / 4).map(move |i| address + i * 4)
    }

    /// Addresses of fixed-size records.
    pub fn records(&self, record_size: usize) -> impl Iterator<Item = usize> {
        let address = self.address;
        (0..self.size / record_size).map(move |i| address + i * record_size)
    }
}

/// A loaded module image (executable or library).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleImage {
    pub name: String,
    pub base: usize,
    pub size: usize,
    pub types: Option<Section>,
    pub protocols: Option<Section>,
    pub conformances: Option<Section>,
}

impl ModuleImage {
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base < self.size
    }

    pub fn has_swift_metadata(&self) -> bool {
        self.types.is_some() || self.protocols.is_some() || self.conformances.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub name: String,
    pub address: usize,
}

/// Enumerates the images of the target process.
pub trait ModuleSource: Send + Sync {
    fn list_modules(&self) -> Result<Vec<ModuleImage>>;

    fn enumerate_symbols(&self, _image: &ModuleImage) -> Result<Vec<Symbol>> {
        Ok(vec![])
    }
}

/// A fixed set of images, for hosts that already know what is loaded.
#[derive(Clone, Debug, Default)]
pub struct StaticModuleSource {
    images: Vec<ModuleImage>,
    symbols: HashMap<String, Vec<Symbol>>,
}

impl StaticModuleSource {
    pub fn new(images: Vec<ModuleImage>) -> Self {
        Self {
            images,
            symbols: HashMap::new(),
        }
    }

    pub fn with_symbols(mut self, image: &str, symbols: Vec<Symbol>) -> Self {
        self.symbols.insert(image.to_string(), symbols);
        self
    }
}

impl ModuleSource for StaticModuleSource {
    fn list_modules(&self) -> Result<Vec<ModuleImage>> {
        Ok(self.images.clone())
    }

    fn enumerate_symbols(&self, image: &ModuleImage) -> Result<Vec<Symbol>> {
        Ok(self.symbols.get(&image.name).cloned().unwrap_or_default())
    }
}

/// The sections of an image file mapped at their link-time addresses.
/// Read-only.
#[derive(Debug, Default)]
pub struct ImageMemory {
    segments: Vec<(usize, Vec<u8>)>,
}

impl ImageMemory {
    pub fn new(mut segments: Vec<(usize, Vec<u8>)>) -> Self {
        segments.sort_by_key(|(address, _)| *address);
        Self { segments }
    }

    fn segment(&self, address: usize, len: usize) -> Option<&[u8]> {
        let index = self
            .segments
            .partition_point(|(start, _)| *start <= address)
            .checked_sub(1)?;
        let (start, bytes) = &self.segments[index];
        let offset = address - start;
        bytes.get(offset..offset.checked_add(len)?)
    }
}

impl Memory for ImageMemory {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let bytes = self
            .segment(address, buf.len())
            .ok_or(MemoryError::AccessViolation(address))?;
        buf.copy_from_slice(bytes);
        Ok(())
    }

    fn write(&self, address: usize, _bytes: &[u8]) -> Result<(), MemoryError> {
        Err(MemoryError::ReadOnly(address))
    }

    fn allocate(&self, size: usize, _align: usize) -> Result<usize, MemoryError> {
        Err(MemoryError::OutOfMemory(size))
    }
}

/// A Mach-O or ELF image read from disk.
pub struct ObjectFile {
    image: ModuleImage,
    memory: Arc<ImageMemory>,
    symbols: Vec<Symbol>,
}

impl ObjectFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| BridgeError::Image(format!("{}: {e}", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(name, &data)
    }

    pub fn parse(name: impl Into<String>, data: &[u8]) -> Result<Self> {
        let name = name.into();
        let file = object::File::parse(data).map_err(|e| BridgeError::Image(format!("{name}: {e}")))?;
        let mach_o = file.format() == BinaryFormat::MachO;
        let find = |(mach, elf): (&str, &str)| {
            let section = file.section_by_name(if mach_o { mach } else { elf })?;
            Some(Section {
                address: section.address() as usize,
                size: section.size() as usize,
            })
        };

        let mut segments = vec![];
        let (mut low, mut high) = (usize::MAX, 0);
        for section in file.sections() {
            let Ok(bytes) = section.data() else { continue };
            if bytes.is_empty() {
                continue;
            }
            let address = section.address() as usize;
            low = low.min(address);
            high = high.max(address + bytes.len());
            segments.push((address, bytes.to_vec()));
        }
        let symbols = file
            .symbols()
            .filter(|s| s.is_definition())
            .filter_map(|s| {
                let name = s.name().ok()?;
                let name = if mach_o { name.strip_prefix('_').unwrap_or(name) } else { name };
                Some(Symbol {
                    name: name.to_string(),
                    address: s.address() as usize,
                })
            })
            .collect::<Vec<_>>();

        let image = ModuleImage {
            types: find(TYPES_SECTION),
            protocols: find(PROTOCOLS_SECTION),
            conformances: find(CONFORMANCES_SECTION),
            base: if low == usize::MAX { 0 } else { low },
            size: high.saturating_sub(low),
            name,
        };
        debug!(
            image = %image.name,
            sections = segments.len(),
            symbols = symbols.len(),
            swift = image.has_swift_metadata(),
            "parsed image"
        );
        Ok(Self {
            image,
            memory: Arc::new(ImageMemory::new(segments)),
            symbols,
        })
    }

    pub fn image(&self) -> &ModuleImage {
        &self.image
    }

    pub fn memory(&self) -> Arc<dyn Memory> {
        self.memory.clone()
    }
}

impl ModuleSource for ObjectFile {
    fn list_modules(&self) -> Result<Vec<ModuleImage>> {
        Ok(vec![self.image.clone()])
    }

    fn enumerate_symbols(&self, image: &ModuleImage) -> Result<Vec<Symbol>> {
        if image.name == self.image.name {
            Ok(self.symbols.clone())
        } else {
            Ok(vec![])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_image_memory() {
        let memory = ImageMemory::new(vec![(0x2000, vec![5, 6]), (0x1000, vec![1, 2, 3, 4])]);
        assert_eq!(memory.read_bytes(0x1001, 3).unwrap(), vec![2, 3, 4]);
        assert_eq!(memory.read_u8(0x2001).unwrap(), 6);
        assert_eq!(
            memory.read_bytes(0x1002, 4),
            Err(MemoryError::AccessViolation(0x1002))
        );
        assert_eq!(memory.read_u8(0xfff), Err(MemoryError::AccessViolation(0xfff)));
        assert_eq!(memory.write(0x1000, &[0]), Err(MemoryError::ReadOnly(0x1000)));
    }

    #[test]
    fn test_section_entries() {
        let section = Section {
            address: 0x100,
            size: 10,
        };
        assert_eq!(section.entries().collect::<Vec<_>>(), vec![0x100, 0x104]);
        assert_eq!(section.records(16).count(), 0);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            ObjectFile::parse("junk", b"not an object file"),
            Err(BridgeError::Image(_))
        ));
    }
}

use super::{HasLayout, LayoutManager, SpareBits};
use crate::utils::{read_uint, write_uint};
use std::sync::Arc;

/// How the case discriminator of a multi-payload enum is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MultiPayloadTag {
    /// Tag bit `i` lives at this bit position of the payload region.
    SpareBits(Vec<usize>),
    /// Tag field of this many bytes right after the payload region.
    ExtraTagBytes(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub enum EnumStrategy {
    NoPayload {
        tag_bytes: usize,
    },
    SinglePayload {
        payload: Arc<LayoutManager>,
        /// Empty cases encoded as payload extra inhabitants.
        payload_extra_inhabitants: u32,
        extra_tag_bytes: usize,
    },
    MultiPayload {
        payloads: Vec<Arc<LayoutManager>>,
        region: usize,
        tag: MultiPayloadTag,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnumLayoutManager {
    pub strategy: EnumStrategy,
    pub num_payload_cases: usize,
    pub num_empty_cases: usize,
    size: usize,
    alignment: usize,
    extra_inhabitants: u32,
    spare_bits: SpareBits,
}

fn cap_extra_inhabitants(count: u64) -> u32 {
    count.min(i32::MAX as u64) as u32
}

/// Width of a tag field able to hold `num_tags` distinct values, rounded the
/// way the runtime rounds it.
pub fn tag_bytes_for(num_tags: u64) -> usize {
    match num_tags {
        0..=1 => 0,
        2..=0xff => 1,
        0x100..=0xffff => 2,
        _ => 4,
    }
}

/// Number of tag values and extra tag bytes for an enum whose payload area is
/// `payload_size` bytes.
pub fn enum_tag_counts(payload_size: usize, empty_cases: usize, payload_cases: usize) -> (u64, usize) {
    let mut num_tags = payload_cases as u64;
    if empty_cases > 0 {
        if payload_size >= 4 {
            num_tags += 1;
        } else {
            let bits = payload_size * 8;
            let cases_per_tag_value = 1u64 << bits;
            num_tags += (empty_cases as u64).div_ceil(cases_per_tag_value);
        }
    }
    (num_tags, tag_bytes_for(num_tags))
}

/// Tag width of an enum without payloads, holding the case index directly.
fn no_payload_tag_bytes(num_cases: usize) -> usize {
    match num_cases {
        0..=1 => 0,
        2..=0x100 => 1,
        0x101..=0x10000 => 2,
        _ => 4,
    }
}

fn bits_for(num_values: u64) -> usize {
    (64 - num_values.saturating_sub(1).leading_zeros()) as usize
}

impl EnumLayoutManager {
    /// `payloads` are the payload case layouts in declaration order.
    pub fn new(payloads: Vec<Arc<LayoutManager>>, num_empty_cases: usize) -> Self {
        let num_payload_cases = payloads.len();
        match num_payload_cases {
            0 => Self::no_payload(num_empty_cases),
            1 => Self::single_payload(payloads[0].clone(), num_empty_cases),
            _ => Self::multi_payload(payloads, num_empty_cases),
        }
    }

    fn no_payload(num_cases: usize) -> Self {
        let tag_bytes = no_payload_tag_bytes(num_cases);
        let extra_inhabitants = if tag_bytes == 0 {
            0
        } else {
            cap_extra_inhabitants((1u64 << (tag_bytes * 8)) - num_cases as u64)
        };
        Self {
            strategy: EnumStrategy::NoPayload { tag_bytes },
            num_payload_cases: 0,
            num_empty_cases: num_cases,
            size: tag_bytes,
            alignment: tag_bytes.max(1),
            extra_inhabitants,
            spare_bits: SpareBits::none(tag_bytes),
        }
    }

    fn single_payload(payload: Arc<LayoutManager>, num_empty_cases: usize) -> Self {
        let available = payload.usable_extra_inhabitants();
        let used = (available as usize).min(num_empty_cases) as u32;
        let (_, extra_tag_bytes) =
            enum_tag_counts(payload.size(), num_empty_cases - used as usize, 1);
        let size = payload.size() + extra_tag_bytes;
        let spare_bits = if num_empty_cases == 0 {
            payload.spare_bits().resized(size, 0)
        } else {
            SpareBits::none(size)
        };
        Self {
            num_payload_cases: 1,
            num_empty_cases,
            size,
            alignment: payload.alignment(),
            extra_inhabitants: if extra_tag_bytes == 0 {
                available - used
            } else {
                0
            },
            spare_bits,
            strategy: EnumStrategy::SinglePayload {
                payload,
                payload_extra_inhabitants: used,
                extra_tag_bytes,
            },
        }
    }

    fn multi_payload(payloads: Vec<Arc<LayoutManager>>, num_empty_cases: usize) -> Self {
        let region = payloads.iter().map(|p| p.size()).max().unwrap_or(0);
        let alignment = payloads.iter().map(|p| p.alignment()).max().unwrap_or(1);
        // bytes past the end of a smaller payload are spare for that payload
        let common = payloads.iter().fold(SpareBits::all(region), |acc, p| {
            acc.intersect(&p.spare_bits().resized(region, 0xff))
        });
        let num_tags = (payloads.len() + num_empty_cases) as u64;
        let bits_needed = bits_for(num_tags);

        let (tag, size, extra_inhabitants, spare_bits) = if region > 0 && common.count() >= bits_needed {
            let positions = common.lowest(bits_needed);
            let mut spare = common.clone();
            spare.clear(&positions);
            let values = 1u64 << bits_needed.min(63);
            (
                MultiPayloadTag::SpareBits(positions),
                region,
                cap_extra_inhabitants(values - num_tags),
                spare,
            )
        } else {
            let count = tag_bytes_for(num_tags);
            (
                MultiPayloadTag::ExtraTagBytes(count),
                region + count,
                cap_extra_inhabitants((1u64 << (count * 8)) - num_tags),
                common.resized(region + count, 0),
            )
        };
        Self {
            strategy: EnumStrategy::MultiPayload {
                payloads,
                region,
                tag,
            },
            num_payload_cases: num_tags as usize - num_empty_cases,
            num_empty_cases,
            size,
            alignment,
            extra_inhabitants,
            spare_bits,
        }
    }

    pub fn num_cases(&self) -> usize {
        self.num_payload_cases + self.num_empty_cases
    }

    /// Size of the area holding the payload of `tag`'s case.
    pub fn payload_size(&self) -> usize {
        match &self.strategy {
            EnumStrategy::NoPayload { .. } => 0,
            EnumStrategy::SinglePayload { payload, .. } => payload.size(),
            EnumStrategy::MultiPayload { region, .. } => *region,
        }
    }

    fn read_tag_value(&self, bytes: &[u8]) -> u64 {
        match &self.strategy {
            EnumStrategy::NoPayload { tag_bytes } => read_uint(bytes, 0, *tag_bytes),
            EnumStrategy::MultiPayload { region, tag, .. } => match tag {
                MultiPayloadTag::SpareBits(positions) => positions
                    .iter()
                    .enumerate()
                    .map(|(i, &bit)| (((bytes[bit / 8] >> (bit % 8)) & 1) as u64) << i)
                    .sum(),
                MultiPayloadTag::ExtraTagBytes(count) => read_uint(bytes, *region, *count),
            },
            EnumStrategy::SinglePayload { .. } => 0,
        }
    }

    fn write_tag_value(&self, bytes: &mut [u8], value: u64) {
        match &self.strategy {
            EnumStrategy::NoPayload { tag_bytes } => write_uint(bytes, 0, *tag_bytes, value),
            EnumStrategy::MultiPayload { region, tag, .. } => match tag {
                MultiPayloadTag::SpareBits(positions) => {
                    for (i, &bit) in positions.iter().enumerate() {
                        let mask = 1u8 << (bit % 8);
                        if (value >> i) & 1 == 1 {
                            bytes[bit / 8] |= mask;
                        } else {
                            bytes[bit / 8] &= !mask;
                        }
                    }
                }
                MultiPayloadTag::ExtraTagBytes(count) => write_uint(bytes, *region, *count, value),
            },
            EnumStrategy::SinglePayload { .. } => {}
        }
    }

    /// Decodes the case tag: payload cases first, then empty cases.
    pub fn get_tag(&self, bytes: &[u8]) -> u32 {
        match &self.strategy {
            EnumStrategy::SinglePayload {
                payload,
                payload_extra_inhabitants,
                extra_tag_bytes,
            } => {
                let payload_size = payload.size();
                if *extra_tag_bytes > 0 {
                    let extra = read_uint(bytes, payload_size, *extra_tag_bytes);
                    if extra != 0 {
                        let from_tag = if payload_size >= 4 {
                            0
                        } else {
                            (extra - 1) << (payload_size * 8)
                        };
                        let from_value = read_uint(bytes, 0, payload_size.min(4));
                        return (from_tag | from_value) as u32 + payload_extra_inhabitants + 1;
                    }
                }
                if *payload_extra_inhabitants > 0 {
                    if let Some(index) = payload.extra_inhabitant_index(&bytes[..payload_size]) {
                        if index < *payload_extra_inhabitants {
                            return index + 1;
                        }
                    }
                }
                0
            }
            _ => self.read_tag_value(bytes) as u32,
        }
    }

    /// Stores `tag`. For payload cases the payload bytes must already be in
    /// place; empty cases overwrite the payload area.
    pub fn inject_tag(&self, bytes: &mut [u8], tag: u32) {
        match &self.strategy {
            EnumStrategy::SinglePayload {
                payload,
                payload_extra_inhabitants,
                extra_tag_bytes,
            } => {
                let payload_size = payload.size();
                if tag == 0 {
                    write_uint(bytes, payload_size, *extra_tag_bytes, 0);
                    return;
                }
                let which = tag - 1;
                if which < *payload_extra_inhabitants {
                    payload.store_extra_inhabitant(&mut bytes[..payload_size], which);
                    write_uint(bytes, payload_size, *extra_tag_bytes, 0);
                    return;
                }
                let case_index = (which - payload_extra_inhabitants) as u64;
                let (extra_tag, payload_value) = if payload_size >= 4 {
                    (1, case_index)
                } else {
                    let bits = payload_size * 8;
                    (1 + (case_index >> bits), case_index & ((1u64 << bits) - 1))
                };
                bytes[..payload_size].fill(0);
                write_uint(bytes, 0, payload_size.min(4), payload_value);
                write_uint(bytes, payload_size, *extra_tag_bytes, extra_tag);
            }
            EnumStrategy::MultiPayload { region, .. } => {
                if tag as usize >= self.num_payload_cases {
                    bytes[..*region].fill(0);
                }
                self.write_tag_value(bytes, tag as u64);
            }
            EnumStrategy::NoPayload { .. } => self.write_tag_value(bytes, tag as u64),
        }
    }

    /// Copies the payload area with any tag bits cleared.
    pub fn project_payload(&self, bytes: &[u8]) -> Vec<u8> {
        let mut payload = bytes[..self.payload_size()].to_vec();
        if let EnumStrategy::MultiPayload {
            tag: MultiPayloadTag::SpareBits(positions),
            ..
        } = &self.strategy
        {
            for &bit in positions {
                payload[bit / 8] &= !(1 << (bit % 8));
            }
        }
        payload
    }

    pub fn payload_layout(&self, tag: u32) -> Option<&Arc<LayoutManager>> {
        match &self.strategy {
            EnumStrategy::SinglePayload { payload, .. } if tag == 0 => Some(payload),
            EnumStrategy::MultiPayload { payloads, .. } => payloads.get(tag as usize),
            _ => None,
        }
    }

    fn payloads(&self) -> Vec<&Arc<LayoutManager>> {
        match &self.strategy {
            EnumStrategy::NoPayload { .. } => vec![],
            EnumStrategy::SinglePayload { payload, .. } => vec![payload],
            EnumStrategy::MultiPayload { payloads, .. } => payloads.iter().collect(),
        }
    }
}

impl HasLayout for EnumLayoutManager {
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
        self.spare_bits.clone()
    }

    fn is_pod(&self) -> bool {
        self.payloads().iter().all(|p| p.is_pod())
    }

    fn is_bitwise_takable(&self) -> bool {
        self.payloads().iter().all(|p| p.is_bitwise_takable())
    }

    fn contains_floats(&self) -> bool {
        self.payloads().iter().any(|p| p.contains_floats())
    }

    fn extra_inhabitant_index(&self, bytes: &[u8]) -> Option<u32> {
        if self.extra_inhabitants == 0 {
            return None;
        }
        match &self.strategy {
            EnumStrategy::SinglePayload {
                payload,
                payload_extra_inhabitants,
                ..
            } => payload
                .extra_inhabitant_index(bytes.get(..payload.size())?)
                .and_then(|i| i.checked_sub(*payload_extra_inhabitants)),
            _ => {
                let value = self.read_tag_value(bytes);
                let cases = self.num_cases() as u64;
                (value >= cases).then(|| (value - cases) as u32)
            }
        }
    }

    fn store_extra_inhabitant(&self, bytes: &mut [u8], index: u32) {
        match &self.strategy {
            EnumStrategy::SinglePayload {
                payload,
                payload_extra_inhabitants,
                ..
            } => {
                let size = payload.size();
                payload.store_extra_inhabitant(&mut bytes[..size], payload_extra_inhabitants + index)
            }
            EnumStrategy::MultiPayload { region, .. } => {
                bytes[..*region].fill(0);
                self.write_tag_value(bytes, self.num_cases() as u64 + index as u64);
            }
            EnumStrategy::NoPayload { .. } => {
                self.write_tag_value(bytes, self.num_cases() as u64 + index as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::layout::{pointer_extra_inhabitants, Scalar};
    use pretty_assertions::assert_eq;

    fn scalar(s: Scalar) -> Arc<LayoutManager> {
        Arc::new(s.into())
    }

    fn encode(layout: &EnumLayoutManager, tag: u32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0; layout.size()];
        bytes[..payload.len()].copy_from_slice(payload);
        layout.inject_tag(&mut bytes, tag);
        bytes
    }

    #[test]
    fn test_c_style() {
        let layout = EnumLayoutManager::new(vec![], 3);
        assert_eq!(layout.size(), 1);
        assert_eq!(layout.extra_inhabitant_count(), 253);
        let bytes = encode(&layout, 2, &[]);
        assert_eq!(bytes, vec![2]);
        assert_eq!(layout.get_tag(&bytes), 2);

        let single = EnumLayoutManager::new(vec![], 1);
        assert_eq!(single.size(), 0);
    }

    #[test]
    fn test_optional_int_uses_extra_tag_byte() {
        let layout = EnumLayoutManager::new(vec![scalar(Scalar::Int64)], 1);
        assert_eq!(layout.size(), 9);
        let none = encode(&layout, 1, &[]);
        assert_eq!(none[8], 1);
        assert_eq!(layout.get_tag(&none), 1);
        let some = encode(&layout, 0, &42u64.to_le_bytes());
        assert_eq!(layout.get_tag(&some), 0);
        assert_eq!(layout.project_payload(&some), 42u64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_optional_reference_uses_null() {
        let layout = EnumLayoutManager::new(vec![scalar(Scalar::Reference)], 1);
        assert_eq!(layout.size(), 8);
        assert_eq!(layout.extra_inhabitant_count(), pointer_extra_inhabitants() - 1);
        let none = encode(&layout, 1, &[]);
        assert_eq!(none, vec![0; 8]);
        assert_eq!(layout.get_tag(&none), 1);
        let some = encode(&layout, 0, &0x1_0000_8000u64.to_le_bytes());
        assert_eq!(layout.get_tag(&some), 0);
    }

    #[test]
    fn test_zero_extra_inhabitant_payload_with_four_empty_cases() {
        let layout = EnumLayoutManager::new(vec![scalar(Scalar::Int64)], 4);
        assert_eq!(layout.size(), 9);
        let bytes = encode(&layout, 4, &[]);
        assert_eq!(bytes[..8], 3u64.to_le_bytes());
        assert_eq!(bytes[8], 1);
        assert_eq!(layout.get_tag(&bytes), 4);
    }

    #[test]
    fn test_small_payload_spills_case_index_into_tag() {
        let layout = EnumLayoutManager::new(vec![scalar(Scalar::Int8)], 300);
        assert_eq!(layout.size(), 2);
        let bytes = encode(&layout, 300, &[]);
        assert_eq!(bytes, vec![43, 2]);
        assert_eq!(layout.get_tag(&bytes), 300);
    }

    #[test]
    fn test_bool_payload_extra_inhabitants() {
        let layout = EnumLayoutManager::new(vec![scalar(Scalar::Bool)], 3);
        assert_eq!(layout.size(), 1);
        assert_eq!(layout.extra_inhabitant_count(), 251);
        for tag in 1..=3 {
            let bytes = encode(&layout, tag, &[]);
            assert_eq!(bytes, vec![1 + tag as u8]);
            assert_eq!(layout.get_tag(&bytes), tag);
        }
        assert_eq!(layout.get_tag(&[1]), 0);
    }

    #[test]
    fn test_multi_payload_extra_tag_byte() {
        let layout = EnumLayoutManager::new(vec![scalar(Scalar::Int64); 4], 2);
        assert_eq!(
            layout.strategy,
            EnumStrategy::MultiPayload {
                payloads: vec![scalar(Scalar::Int64); 4],
                region: 8,
                tag: MultiPayloadTag::ExtraTagBytes(1),
            }
        );
        assert_eq!(layout.size(), 9);
        for tag in 0..6 {
            let bytes = encode(&layout, tag, &7u64.to_le_bytes());
            assert_eq!(bytes[8], tag as u8);
            assert_eq!(layout.get_tag(&bytes), tag);
        }
        let empty = encode(&layout, 5, &7u64.to_le_bytes());
        assert_eq!(empty[..8], [0; 8]);
    }

    #[test]
    fn test_multi_payload_spare_bits() {
        let layout = EnumLayoutManager::new(vec![scalar(Scalar::Bool), scalar(Scalar::Bool)], 1);
        assert_eq!(
            layout.strategy,
            EnumStrategy::MultiPayload {
                payloads: vec![scalar(Scalar::Bool), scalar(Scalar::Bool)],
                region: 1,
                tag: MultiPayloadTag::SpareBits(vec![1, 2]),
            }
        );
        assert_eq!(layout.size(), 1);
        let bytes = encode(&layout, 1, &[1]);
        assert_eq!(bytes, vec![0b011]);
        assert_eq!(layout.get_tag(&bytes), 1);
        assert_eq!(layout.project_payload(&bytes), vec![1]);

        let empty = encode(&layout, 2, &[1]);
        assert_eq!(empty, vec![0b100]);
        assert_eq!(layout.get_tag(&empty), 2);
        assert_eq!(layout.extra_inhabitant_count(), 1);
    }

    #[test]
    fn test_multi_payload_reference_spare_bits() {
        let layout =
            EnumLayoutManager::new(vec![scalar(Scalar::Reference), scalar(Scalar::Reference)], 0);
        assert_eq!(layout.size(), 8);
        let pointer = 0x0000_7fff_0000_1000u64;
        let bytes = encode(&layout, 1, &pointer.to_le_bytes());
        assert_eq!(u64::from_le_bytes(bytes.clone().try_into().unwrap()), pointer | 1 << 60);
        assert_eq!(layout.get_tag(&bytes), 1);
        assert_eq!(layout.project_payload(&bytes), pointer.to_le_bytes().to_vec());
    }

    #[test]
    fn test_mixed_payload_sizes_share_region() {
        let layout = EnumLayoutManager::new(vec![scalar(Scalar::Int8), scalar(Scalar::Int64)], 0);
        // no byte of the Int64 payload is spare
        assert_eq!(layout.size(), 9);
        assert_eq!(layout.payload_size(), 8);
    }

    #[test]
    fn test_nested_enum_extra_inhabitants() {
        let inner = EnumLayoutManager::new(vec![], 3);
        let outer = EnumLayoutManager::new(vec![Arc::new(inner.into())], 1);
        assert_eq!(outer.size(), 1);
        let none = encode(&outer, 1, &[]);
        assert_eq!(none, vec![3]);
        assert_eq!(outer.get_tag(&none), 1);
        assert_eq!(outer.get_tag(&[2]), 0);
    }
}

/// Reads a little-endian unsigned integer of `width` bytes (at most 8).
pub fn read_uint(bytes: &[u8], offset: usize, width: usize) -> u64 {
    let mut buf = [0u8; 8];
    let end = (offset + width).min(bytes.len());
    if offset < end {
        buf[..end - offset].copy_from_slice(&bytes[offset..end]);
    }
    u64::from_le_bytes(buf)
}

/// Writes the low `width` bytes of `value` little-endian, clipped to the slice.
pub fn write_uint(bytes: &mut [u8], offset: usize, width: usize, value: u64) {
    let end = (offset + width).min(bytes.len());
    if offset < end {
        bytes[offset..end].copy_from_slice(&value.to_le_bytes()[..end - offset]);
    }
}

pub fn words_from_bytes(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks(8)
        .map(|chunk| read_uint(chunk, 0, chunk.len()))
        .collect()
}

pub fn bytes_from_words(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Splits `s` at `separator` outside of `<>`, `()` and `[]`. The `>` of an
/// arrow does not close a bracket.
pub fn split_top_level(s: &str, separator: char) -> Vec<&str> {
    let mut parts = vec![];
    let mut depth = 0i32;
    let mut start = 0;
    let mut previous = ' ';
    for (i, c) in s.char_indices() {
        match c {
            '<' | '(' | '[' => depth += 1,
            '>' if previous == '-' => {}
            '>' | ')' | ']' => depth -= 1,
            c if c == separator && depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
        previous = c;
    }
    parts.push(s[start..].trim());
    parts
}

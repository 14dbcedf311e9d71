//! Image header, byte order and per-image profiles.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Bytes of the image header read when an image is opened.
pub const HEADER_SIZE: usize = 0x40;

/// Offset of the 4-character image code within the header.
const CODE_OFFSET: usize = 0x3B;

/// Addresses handed to the word accessors are masked with this.
pub const ADDRESS_MASK: u64 = 0x07FF_FFFF;

/// Byte order of an image as stored on the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Native big-endian order.
    BigEndian,
    /// Each 16-bit pair has its bytes swapped. Magic starts 0x37 0x80.
    ByteSwapped,
}

/// The fixed-size header at the start of an image.
#[derive(Debug, Clone)]
pub struct ImageHeader {
    /// Header bytes in native order.
    bytes: [u8; HEADER_SIZE],
    order: ByteOrder,
}

impl ImageHeader {
    /// Parse the header from its first `HEADER_SIZE` bytes as stored.
    /// Short input is zero-padded.
    pub fn from_raw(raw: &[u8]) -> Self {
        let mut bytes = [0u8; HEADER_SIZE];
        let len = raw.len().min(HEADER_SIZE);
        bytes[..len].copy_from_slice(&raw[..len]);

        let order = if bytes[0] == 0x37 && bytes[1] == 0x80 {
            swap_pairs(&mut bytes, HEADER_SIZE);
            ByteOrder::ByteSwapped
        } else {
            ByteOrder::BigEndian
        };

        Self { bytes, order }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Whether loaded data must be pair-swapped into native order.
    pub fn needs_flip(&self) -> bool {
        self.order == ByteOrder::ByteSwapped
    }

    pub fn bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.bytes
    }

    /// Four-character image code, with non-printable bytes shown as `?`.
    pub fn code(&self) -> String {
        self.code_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect()
    }

    pub fn code_bytes(&self) -> [u8; 4] {
        let mut code = [0u8; 4];
        code.copy_from_slice(&self.bytes[CODE_OFFSET..CODE_OFFSET + 4]);
        code
    }

    /// Compare the image code against `code`, ignoring ASCII case.
    pub fn test_code(&self, code: &str) -> bool {
        code.len() == 4 && self.code_bytes().eq_ignore_ascii_case(code.as_bytes())
    }
}

/// Swap the bytes of every 16-bit pair in the first `len` bytes of `buf`,
/// rounded up to a whole 32-bit word (but never past the buffer).
pub fn swap_pairs(buf: &mut [u8], len: usize) {
    let end = len.next_multiple_of(4).min(buf.len() & !1);
    for pair in buf[..end].chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Executor entry address derived from the boot code, if it is recognised.
///
/// `boot` is the first 0x1000 bytes of the image in native order. The sum of
/// the boot code words identifies the boot chip variant, which relocates the
/// entry address stored in the header.
pub fn boot_address(boot: &[u8]) -> Option<u64> {
    if boot.len() < 0x1000 {
        return None;
    }
    let word = |i: usize| u32::from_be_bytes([boot[i * 4], boot[i * 4 + 1], boot[i * 4 + 2], boot[i * 4 + 3]]);

    let sum = (0x10..0x400).fold(0u32, |acc, i| acc.wrapping_add(word(i)));
    let relocation = match sum {
        0x49F6_0E96 | 0xFB63_1223 | 0x2ADF_E50A | 0x57C8_5244 => 0,
        0x497E_414B | 0xE6DE_CB4B | 0x27C4_ED44 => 0x10_0000,
        0xD5BE_5580 => 0x20_0000,
        _ => return None,
    };
    Some(u64::from(word(2).wrapping_sub(relocation)))
}

/// A byte range of the image. `end` is exclusive; `None` means the end of
/// the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    #[serde(default)]
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end: Some(end) }
    }

    /// Build from an inclusive `[first, last]` pair.
    pub fn inclusive(first: u64, last: u64) -> Self {
        Self::new(first, last + 1)
    }

    pub fn to_eof(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Resolve against an image of `image_size` bytes.
    pub fn resolve(&self, image_size: u64) -> Range<u64> {
        let end = self.end.unwrap_or(image_size).min(image_size);
        self.start.min(end)..end
    }
}

/// Cache behaviour for the images matching one of `codes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageProfile {
    /// Image codes this profile applies to (case-insensitive).
    pub codes: Vec<String>,

    /// Ranges loaded and pinned when the image is first used.
    #[serde(default)]
    pub pinned: Vec<ByteRange>,

    /// Ranges whose blocks are prefetched once a read lands inside them.
    #[serde(default)]
    pub hot: Vec<ByteRange>,
}

impl ImageProfile {
    pub fn matches(&self, header: &ImageHeader) -> bool {
        self.codes.iter().any(|code| header.test_code(code))
    }
}

/// Profiles that ship with the cache.
pub fn builtin_profiles() -> Vec<ImageProfile> {
    vec![ImageProfile {
        codes: vec!["NZSJ".to_string(), "NZSE".to_string()],
        pinned: vec![
            ByteRange::inclusive(0, 0x00EF_AB5F),
            ByteRange::inclusive(0x0167_CE40, 0x016B_4E8F),
            ByteRange::to_eof(0x01F8_2960),
        ],
        hot: Vec::new(),
    }]
}

/// First profile in `profiles` matching `header`.
pub fn select_profile<'a>(profiles: &'a [ImageProfile], header: &ImageHeader) -> Option<&'a ImageProfile> {
    profiles.iter().find(|p| p.matches(header))
}

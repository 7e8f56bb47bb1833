//! Combined dual images
//!
//! A combined image starts with a 40 byte header followed by two complete
//! application images. The first one is linked for the first OTA slot, the
//! second one for the other slot; only the one matching the slot being
//! written ends up in flash.

use std::mem::size_of;

use bytemuck::{pod_read_unaligned, Pod, Zeroable};

use crate::error::ClassificationError;

const COMBINED_MAGIC: &[u8; 4] = b"EHUG";
const TAG_LEN: usize = 28;
/// Tags are compared up to this many characters
const TAG_SIGNIFICANT_LEN: usize = TAG_LEN - 1;

/// Size of the header preceding the two sub-images
pub const COMBINED_HEADER_LEN: usize = size_of::<RawCombinedHeader>();

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawCombinedHeader {
    magic: [u8; 4],
    tag: [u8; TAG_LEN],
    len1: u32,
    len2: u32,
}

/// One of the two images carried by a combined image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubImage {
    First,
    Second,
}

impl SubImage {
    /// Name under which the sub-image is distributed on its own
    pub fn file_name(&self) -> &'static str {
        match self {
            SubImage::First => "user1.bin",
            SubImage::Second => "user2.bin",
        }
    }
}

/// Parsed header of a combined image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedHeader {
    tag: String,
    len1: u32,
    len2: u32,
}

impl CombinedHeader {
    pub fn new(tag: impl Into<String>, len1: u32, len2: u32) -> Self {
        Self {
            tag: tag.into(),
            len1,
            len2,
        }
    }

    pub(super) fn parse(header: &[u8]) -> Result<Self, ClassificationError> {
        if header.len() < COMBINED_HEADER_LEN {
            return Err(ClassificationError::Truncated(COMBINED_HEADER_LEN as u64));
        }

        let raw: RawCombinedHeader = pod_read_unaligned(&header[..COMBINED_HEADER_LEN]);
        let tag_len = raw.tag[..TAG_SIGNIFICANT_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TAG_SIGNIFICANT_LEN);

        Ok(Self {
            tag: String::from_utf8_lossy(&raw.tag[..tag_len]).into_owned(),
            len1: u32::from_le(raw.len1),
            len2: u32::from_le(raw.len2),
        })
    }

    /// Device tag the image was built for
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn len1(&self) -> u32 {
        self.len1
    }

    pub fn len2(&self) -> u32 {
        self.len2
    }

    /// Length of the given sub-image
    pub fn len_of(&self, image: SubImage) -> u32 {
        match image {
            SubImage::First => self.len1,
            SubImage::Second => self.len2,
        }
    }

    /// Header plus both sub-images
    pub fn total_len(&self) -> u64 {
        COMBINED_HEADER_LEN as u64 + u64::from(self.len1) + u64::from(self.len2)
    }

    pub(super) fn matches_tag(&self, expected: &str) -> bool {
        let expected = &expected.as_bytes()[..expected.len().min(TAG_SIGNIFICANT_LEN)];
        self.tag.as_bytes() == expected
    }
}

pub(super) fn has_magic(header: &[u8]) -> bool {
    header.starts_with(COMBINED_MAGIC)
}

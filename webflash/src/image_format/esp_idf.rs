//! ESP-IDF application images
//!
//! ## Header documentation:
//! * [Header](https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/firmware-image-format.html#file-header)
//! * [Application description](https://docs.espressif.com/projects/esp-idf/en/latest/esp32/api-reference/system/misc_system_api.html#app-version)

use std::mem::size_of;

use bytemuck::{bytes_of, bytes_of_mut, pod_read_unaligned, Pod, Zeroable};
use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{
    error::{FlashError, VerifyError},
    flash_target::FlashStorage,
};

const ESP_CHECKSUM_MAGIC: u8 = 0xEF;
const ESP_MAGIC: u8 = 0xE9;
const APP_DESC_MAGIC: u32 = 0xABCD_5432;
const SHA256_LEN: usize = 32;

/// Upper half of the entry point: the ESP32 starts in internal RAM
const ENTRY_PREFIX: u16 = 0x4008;
/// Exclusive lower and inclusive upper bound of the first segment's load
/// address
const FIRST_SEGMENT_RANGE: (u32, u32) = (0x3F00_0000, 0x4040_0000);

/// Firmware header used by the ESP-IDF bootloader.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
#[doc(alias = "esp_image_header_t")]
struct ImageHeader {
    magic: u8,
    segment_count: u8,
    /// Flash read mode (esp_image_spi_mode_t)
    flash_mode: u8,
    /// ..4 bits are flash chip size (esp_image_flash_size_t)
    /// 4.. bits are flash frequency (esp_image_spi_freq_t)
    flash_config: u8,
    entry: u32,

    // extended header part
    wp_pin: u8,
    clk_q_drv: u8,
    d_cs_drv: u8,
    gd_wp_drv: u8,
    chip_id: u16,
    min_rev: u8,
    min_chip_rev_full: u16,
    max_chip_rev_full: u16,
    reserved: [u8; 4],
    append_digest: u8,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct SegmentHeader {
    addr: u32,
    length: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
#[doc(alias = "esp_app_desc_t")]
struct RawAppDescription {
    magic_word: u32,
    secure_version: u32,
    reserv1: [u32; 2],
    version: [u8; 32],
    project_name: [u8; 32],
    time: [u8; 16],
    date: [u8; 16],
    idf_ver: [u8; 32],
}

/// Build information embedded in the first segment of an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppDescription {
    pub version: String,
    pub project_name: String,
    pub date: String,
    pub time: String,
    pub idf_version: String,
}

pub(super) fn is_app_header(header: &[u8]) -> bool {
    let header_len = size_of::<ImageHeader>();
    if header.len() < header_len + size_of::<SegmentHeader>() {
        return false;
    }

    let image: ImageHeader = pod_read_unaligned(&header[..header_len]);
    let segment: SegmentHeader =
        pod_read_unaligned(&header[header_len..header_len + size_of::<SegmentHeader>()]);

    let entry = u32::from_le(image.entry);
    let first_addr = u32::from_le(segment.addr);

    image.magic == ESP_MAGIC
        && (entry >> 16) as u16 == ENTRY_PREFIX
        && (first_addr == 0
            || (first_addr > FIRST_SEGMENT_RANGE.0 && first_addr <= FIRST_SEGMENT_RANGE.1))
}

/// Walk an application image stored at `base` and check its checksum and,
/// when the header asks for one, its appended SHA-256 digest.
///
/// The image must fit in `size` bytes.
pub fn verify_app_image(
    flash: &mut dyn FlashStorage,
    base: u32,
    size: u32,
) -> Result<(), VerifyError> {
    let mut reader = ImageReader::new(flash, base, size);

    let mut header = ImageHeader::zeroed();
    reader.read(bytes_of_mut(&mut header))?;
    if header.magic != ESP_MAGIC {
        return Err(VerifyError::InvalidHeader);
    }

    let mut checksum = ESP_CHECKSUM_MAGIC;
    let mut chunk = [0u8; 256];

    for index in 0..header.segment_count {
        let mut segment = SegmentHeader::zeroed();
        reader.read(bytes_of_mut(&mut segment))?;

        let length = u32::from_le(segment.length);
        if !reader.fits(length) {
            return Err(VerifyError::SegmentOutOfBounds { index, length });
        }

        let mut remaining = length as usize;
        while remaining > 0 {
            let len = remaining.min(chunk.len());
            reader.read(&mut chunk[..len])?;
            checksum = update_checksum(&chunk[..len], checksum);
            remaining -= len;
        }
    }

    let padding = 15 - (reader.position() % 16) as usize;
    let mut trailer = [0u8; 16];
    reader.read(&mut trailer[..=padding])?;

    let expected = trailer[padding];
    if expected != checksum {
        return Err(VerifyError::ChecksumMismatch {
            expected,
            computed: checksum,
        });
    }

    if header.append_digest == 1 {
        let computed = reader.digest();
        let mut stored = [0u8; SHA256_LEN];
        reader.read(&mut stored)?;

        if computed[..] != stored[..] {
            return Err(VerifyError::DigestMismatch);
        }
    }

    debug!(
        "Verified image at {:#x}: {} segments, {} bytes",
        base,
        header.segment_count,
        reader.position()
    );

    Ok(())
}

/// Read the application description from the image at `base`, if present
pub fn read_app_description(
    flash: &mut dyn FlashStorage,
    base: u32,
) -> Result<Option<AppDescription>, FlashError> {
    let offset = (size_of::<ImageHeader>() + size_of::<SegmentHeader>()) as u32;

    let mut magic = [0u8; 1];
    flash.read(base, &mut magic)?;
    if magic[0] != ESP_MAGIC {
        return Ok(None);
    }

    let mut raw = RawAppDescription::zeroed();
    flash.read(base + offset, bytes_of_mut(&mut raw))?;
    if u32::from_le(raw.magic_word) != APP_DESC_MAGIC {
        return Ok(None);
    }

    Ok(Some(AppDescription {
        version: c_string(&raw.version),
        project_name: c_string(&raw.project_name),
        date: c_string(&raw.date),
        time: c_string(&raw.time),
        idf_version: c_string(&raw.idf_ver),
    }))
}

fn c_string(raw: &[u8]) -> String {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..len]).into_owned()
}

/// Update the checksum with the given data
fn update_checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// Sequential reader over an image in flash which hashes everything it reads
struct ImageReader<'a> {
    flash: &'a mut dyn FlashStorage,
    base: u32,
    size: u32,
    position: u32,
    hasher: Sha256,
}

impl<'a> ImageReader<'a> {
    fn new(flash: &'a mut dyn FlashStorage, base: u32, size: u32) -> Self {
        Self {
            flash,
            base,
            size,
            position: 0,
            hasher: Sha256::new(),
        }
    }

    fn position(&self) -> u32 {
        self.position
    }

    fn fits(&self, len: u32) -> bool {
        u64::from(self.position) + u64::from(len) <= u64::from(self.size)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), VerifyError> {
        let len = buf.len() as u32;
        if !self.fits(len) {
            return Err(FlashError::OutOfBounds {
                address: self.base + self.position,
                len: buf.len(),
                limit: self.base + self.size,
            }
            .into());
        }

        self.flash.read(self.base + self.position, buf)?;
        self.hasher.update(&*buf);
        self.position += len;

        Ok(())
    }

    /// Digest of everything read so far
    fn digest(&self) -> [u8; SHA256_LEN] {
        self.hasher.clone().finalize().into()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::flash_target::RamFlash;

    /// Build a well formed application image with the given segments
    pub(crate) fn build_image(segments: &[(u32, &[u8])], append_digest: bool) -> Vec<u8> {
        let header = ImageHeader {
            magic: ESP_MAGIC,
            segment_count: segments.len() as u8,
            flash_mode: 2,
            flash_config: 0x20,
            entry: 0x4008_0400u32.to_le(),
            wp_pin: 0xEE,
            clk_q_drv: 0,
            d_cs_drv: 0,
            gd_wp_drv: 0,
            chip_id: 0,
            min_rev: 0,
            min_chip_rev_full: 0,
            max_chip_rev_full: u16::MAX,
            reserved: [0; 4],
            append_digest: append_digest as u8,
        };

        let mut data = bytes_of(&header).to_vec();
        let mut checksum = ESP_CHECKSUM_MAGIC;
        for (addr, payload) in segments {
            let segment = SegmentHeader {
                addr: addr.to_le(),
                length: (payload.len() as u32).to_le(),
            };
            data.extend_from_slice(bytes_of(&segment));
            data.extend_from_slice(payload);
            checksum = update_checksum(payload, checksum);
        }

        let padding = 15 - (data.len() % 16);
        data.extend_from_slice(&[0u8; 16][..padding]);
        data.push(checksum);

        if append_digest {
            let hash = Sha256::digest(&data);
            data.extend_from_slice(&hash);
        }

        data
    }

    pub(crate) fn app_description(version: &str, project: &str) -> Vec<u8> {
        let mut raw = RawAppDescription::zeroed();
        raw.magic_word = APP_DESC_MAGIC.to_le();
        raw.version[..version.len()].copy_from_slice(version.as_bytes());
        raw.project_name[..project.len()].copy_from_slice(project.as_bytes());
        bytes_of(&raw).to_vec()
    }

    fn flash_with(image: &[u8]) -> RamFlash {
        let mut flash = RamFlash::new(0x10000);
        flash.erase_sector(0).unwrap();
        flash.write_page(0, image).unwrap();
        flash
    }

    #[test]
    fn built_image_passes_classification() {
        let image = build_image(&[(0x3F40_0020, &[1, 2, 3, 4])], true);

        assert!(is_app_header(&image));
    }

    #[test]
    fn verifies_checksum_and_digest() {
        let image = build_image(&[(0x3F40_0020, &[7; 100]), (0x4008_0000, &[9; 36])], true);
        let mut flash = flash_with(&image);

        verify_app_image(&mut flash, 0, 0x10000).unwrap();
    }

    #[test]
    fn verifies_without_digest() {
        let image = build_image(&[(0x3F40_0020, &[3; 10])], false);
        let mut flash = flash_with(&image);

        verify_app_image(&mut flash, 0, image.len() as u32).unwrap();
    }

    #[test]
    fn detects_corrupted_payload() {
        let mut image = build_image(&[(0x3F40_0020, &[7; 100])], false);
        image[40] ^= 0x01;
        let mut flash = flash_with(&image);

        assert!(matches!(
            verify_app_image(&mut flash, 0, 0x10000),
            Err(VerifyError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn detects_corrupted_digest() {
        let mut image = build_image(&[(0x3F40_0020, &[7; 100])], true);
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        let mut flash = flash_with(&image);

        assert!(matches!(
            verify_app_image(&mut flash, 0, 0x10000),
            Err(VerifyError::DigestMismatch)
        ));
    }

    #[test]
    fn segment_must_fit_partition() {
        let image = build_image(&[(0x3F40_0020, &[7; 100])], false);
        let mut flash = flash_with(&image);

        assert!(matches!(
            verify_app_image(&mut flash, 0, 64),
            Err(VerifyError::SegmentOutOfBounds { index: 0, .. })
        ));
    }

    #[test]
    fn erased_flash_is_not_an_image() {
        let mut flash = RamFlash::new(0x10000);

        assert!(matches!(
            verify_app_image(&mut flash, 0, 0x10000),
            Err(VerifyError::InvalidHeader)
        ));
        assert_eq!(read_app_description(&mut flash, 0).unwrap(), None);
    }

    #[test]
    fn reads_app_description() {
        let desc = app_description("1.2.3", "blinky");
        let image = build_image(&[(0x3F40_0020, &desc)], true);
        let mut flash = flash_with(&image);

        let desc = read_app_description(&mut flash, 0).unwrap().unwrap();
        assert_eq!(desc.version, "1.2.3");
        assert_eq!(desc.project_name, "blinky");
        assert_eq!(desc.idf_version, "");
    }
}

use std::mem::size_of;

use bytemuck::{pod_read_unaligned, Pod, Zeroable};

const ESP8266_V2_MAGIC: u8 = 0xEA;
const ESP8266_V2_SEGMENT: u8 = 4;
const IROM_ENTRY_PREFIX: u16 = 0x4010;

/// Header of an SDK v2 application image
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct ImageHeader {
    magic: u8,
    segment: u8,
    flash_mode: u8,
    /// ..4 bits are flash frequency, 4.. bits are flash size
    flash_config: u8,
    entry: u32,
    irom_addr: u32,
}

pub(super) fn is_app_header(header: &[u8]) -> bool {
    if header.len() < size_of::<ImageHeader>() {
        return false;
    }

    let header: ImageHeader = pod_read_unaligned(&header[..size_of::<ImageHeader>()]);
    let entry = u32::from_le(header.entry);

    header.magic == ESP8266_V2_MAGIC
        && header.segment == ESP8266_V2_SEGMENT
        && header.flash_mode <= 3
        && header.flash_config <= 0x40
        && (entry >> 16) as u16 == IROM_ENTRY_PREFIX
        && u32::from_le(header.irom_addr) == 0
}

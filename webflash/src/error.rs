//! Library and application errors

use std::io;

use miette::Diagnostic;
use strum::VariantNames;
use thiserror::Error;

use crate::image_format::Platform;

/// All possible errors returned by webflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Flash(#[from] FlashError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Boot(#[from] BootError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to parse partition table")]
    Partition(#[from] esp_idf_part::Error),

    #[error("The partition table does not contain an `otadata` partition")]
    #[diagnostic(
        code(webflash::missing_otadata),
        help("Add a `data, ota` partition of two sectors to the partition table")
    )]
    MissingOtaData,

    #[error("The platform '{0}' is not supported")]
    #[diagnostic(
        code(webflash::invalid_platform),
        help("The accepted values are: {:?}", Platform::VARIANTS)
    )]
    InvalidPlatform(String),

    #[error("Invalid page size {page_size:#x} for a sector size of {sector_size:#x}")]
    #[diagnostic(
        code(webflash::invalid_page_size),
        help("The page size must be non-zero and divide the sector size evenly")
    )]
    InvalidPageSize { page_size: u32, sector_size: u32 },

    #[error("Failed to open file: {0}")]
    FileOpenError(String, #[source] io::Error),

    #[error(transparent)]
    #[diagnostic(code(webflash::io))]
    IoError(#[from] io::Error),
}

/// Reasons an upload header was rejected
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ClassificationError {
    #[error("Invalid flash image type!")]
    #[diagnostic(
        code(webflash::classify::unrecognized),
        help("Only application images, combined `EHUG` images and `ESfs` filesystem images are accepted")
    )]
    Unrecognized,

    #[error("Firmware not intended for this device!")]
    #[diagnostic(
        code(webflash::classify::tag_mismatch),
        help("The image was built for '{found}' but this device expects '{expected}'. Pass `force=1` to flash it anyway")
    )]
    TagMismatch { expected: String, found: String },

    #[error("Firmware image too large")]
    #[diagnostic(code(webflash::classify::too_large))]
    TooLarge { size: u32, capacity: u32 },

    #[error("Combined image is truncated")]
    #[diagnostic(
        code(webflash::classify::truncated),
        help("The sub-image lengths in the header ({0} bytes in total) exceed the upload length")
    )]
    Truncated(u64),

    #[error("Combined image carries no {0} for this partition")]
    #[diagnostic(
        code(webflash::classify::empty_sub_image),
        help("The header declares a length of zero for the sub-image this partition needs")
    )]
    EmptySubImage(&'static str),
}

/// Failures while mapping an upload to a flash region
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ResolveError {
    #[error("update_partition not found!")]
    #[diagnostic(code(webflash::resolve::not_found))]
    NotFound(String),

    #[error("Partition error, OTA not supported?")]
    #[diagnostic(
        code(webflash::resolve::unsupported),
        help("The partition table needs at least one `ota_N` application partition and a known running partition")
    )]
    Unsupported,

    #[error("Partition '{0}' is already being written")]
    #[diagnostic(code(webflash::resolve::busy))]
    Busy(String),

    #[error("Partition '{0}' is the running partition")]
    #[diagnostic(
        code(webflash::resolve::running),
        help("Upload to the other OTA slot, or omit the partition to pick it automatically")
    )]
    Running(String),

    #[error("Refusing to write the factory partition '{0}'")]
    #[diagnostic(
        code(webflash::resolve::factory_protected),
        help("Enable `allow_factory_write` in the configuration to permit this")
    )]
    FactoryProtected(String),
}

/// Errors reported by the flash storage layer
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum FlashError {
    #[error("Failed to erase sector {sector:#x}")]
    #[diagnostic(code(webflash::flash::erase))]
    Erase { sector: u32 },

    #[error("Failed to write {len} bytes at {address:#x}")]
    #[diagnostic(code(webflash::flash::write))]
    Write { address: u32, len: usize },

    #[error("Failed to read {len} bytes at {address:#x}")]
    #[diagnostic(code(webflash::flash::read))]
    Read { address: u32, len: usize },

    #[error("Access of {len} bytes at {address:#x} is outside of {limit:#x}")]
    #[diagnostic(code(webflash::flash::out_of_bounds))]
    OutOfBounds { address: u32, len: usize, limit: u32 },

    #[error("Address {address:#x} is not aligned to the {sector_size:#x} byte sector size")]
    #[diagnostic(code(webflash::flash::unaligned))]
    Unaligned { address: u32, sector_size: u32 },

    #[error("Flash I/O error")]
    #[diagnostic(code(webflash::flash::io))]
    Io(#[from] io::Error),
}

/// Errors while reading or updating the boot selection
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum BootError {
    #[error("Partition '{0}' is not a bootable application partition")]
    #[diagnostic(code(webflash::boot::not_bootable))]
    NotBootable(String),

    #[error("No OTA application partitions are available")]
    #[diagnostic(code(webflash::boot::no_ota_slots))]
    NoOtaSlots,

    #[error("The otadata sequence number cannot advance past {0:#x}")]
    #[diagnostic(
        code(webflash::boot::sequence_exhausted),
        help("Select the factory partition to reset the otadata partition")
    )]
    SequenceExhausted(u32),

    #[error("Failed to update the boot selection")]
    #[diagnostic(transparent)]
    Storage(#[from] FlashError),
}

/// Transport level irregularities
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Premature end")]
    #[diagnostic(code(webflash::protocol::premature_end))]
    PrematureEnd,

    #[error("Received {0} bytes after the image was complete")]
    #[diagnostic(code(webflash::protocol::excess_data))]
    ExcessData(usize),

    #[error("Upload aborted")]
    #[diagnostic(code(webflash::protocol::aborted))]
    Aborted,
}

/// Verification failures of a written image
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum VerifyError {
    #[error("Image header is invalid")]
    #[diagnostic(code(webflash::verify::header))]
    InvalidHeader,

    #[error("Segment {index} of {length} bytes does not fit the partition")]
    #[diagnostic(code(webflash::verify::segment))]
    SegmentOutOfBounds { index: u8, length: u32 },

    #[error("Checksum mismatch: expected {expected:#04x}, computed {computed:#04x}")]
    #[diagnostic(code(webflash::verify::checksum))]
    ChecksumMismatch { expected: u8, computed: u8 },

    #[error("SHA-256 digest mismatch")]
    #[diagnostic(code(webflash::verify::digest))]
    DigestMismatch,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] FlashError),
}

/// Problems with the configuration file
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Failed to parse configuration file '{path}'")]
    #[diagnostic(
        code(webflash::config::parse),
        help("{message}")
    )]
    Parse { path: String, message: String },

    #[error("Page size {0:#x} is not supported")]
    #[diagnostic(
        code(webflash::config::page_size),
        help("Use a power of two no larger than the 0x1000 byte sector size")
    )]
    PageSize(u32),

    #[error("Unable to determine the user configuration directory")]
    #[diagnostic(code(webflash::config::no_directory))]
    NoConfigDirectory,
}

pub use self::{
    file::FileFlash,
    ram::{FlashOp, RamFlash},
};
use crate::error::FlashError;

mod file;
mod ram;

/// Size of the smallest erasable unit on all supported flash chips
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// Operations for interacting with a flash device
///
/// Pages may only be written to erased memory; writing to memory that was
/// not erased first leaves undefined contents.
pub trait FlashStorage {
    /// Size of an erase sector in bytes
    fn sector_size(&self) -> u32;

    /// Total size of the flash in bytes
    fn size(&self) -> u32;

    /// Erase the sector with the given index
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError>;

    /// Write `data` starting at `address`
    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Fill `buf` with the contents starting at `address`
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;
}

/// Check that `len` bytes at `address` fit into a flash of `size` bytes
pub(crate) fn check_bounds(address: u32, len: usize, size: u32) -> Result<(), FlashError> {
    if u64::from(address) + len as u64 > u64::from(size) {
        Err(FlashError::OutOfBounds {
            address,
            len,
            limit: size,
        })
    } else {
        Ok(())
    }
}

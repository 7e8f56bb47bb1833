use log::trace;

use super::{check_bounds, FlashStorage, FLASH_SECTOR_SIZE};
use crate::error::FlashError;

/// A single operation performed on a [RamFlash]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    Erase { sector: u32 },
    Write { address: u32, len: usize },
}

/// Flash emulated in memory
///
/// Writes behave like NOR flash: bits can only be cleared, so a page written
/// over memory that was not erased will not read back as written. Every
/// operation is recorded, and faults can be injected for testing error paths.
#[derive(Debug, Clone)]
pub struct RamFlash {
    data: Vec<u8>,
    sector_size: u32,
    ops: Vec<FlashOp>,
    fail_erase: Option<u32>,
    fail_write: Option<u32>,
}

impl RamFlash {
    /// Create an erased flash of `size` bytes
    pub fn new(size: u32) -> Self {
        Self::with_sector_size(size, FLASH_SECTOR_SIZE)
    }

    pub fn with_sector_size(size: u32, sector_size: u32) -> Self {
        RamFlash {
            data: vec![0xFF; size as usize],
            sector_size,
            ops: Vec::new(),
            fail_erase: None,
            fail_write: None,
        }
    }

    /// Make erasing `sector` fail
    pub fn fail_erase_of(&mut self, sector: u32) {
        self.fail_erase = Some(sector);
    }

    /// Make any page write starting at `address` fail
    pub fn fail_write_at(&mut self, address: u32) {
        self.fail_write = Some(address);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Every operation performed so far, in order
    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    pub fn erases(&self) -> impl Iterator<Item = u32> + '_ {
        self.ops.iter().filter_map(|op| match op {
            FlashOp::Erase { sector } => Some(*sector),
            _ => None,
        })
    }

    pub fn writes(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.ops.iter().filter_map(|op| match op {
            FlashOp::Write { address, len } => Some((*address, *len)),
            _ => None,
        })
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }
}

impl FlashStorage for RamFlash {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        let address = sector * self.sector_size;
        check_bounds(address, self.sector_size as usize, self.size())?;

        if self.fail_erase == Some(sector) {
            return Err(FlashError::Erase { sector });
        }

        trace!("Erasing sector {:#x}", sector);
        let start = address as usize;
        self.data[start..start + self.sector_size as usize].fill(0xFF);
        self.ops.push(FlashOp::Erase { sector });

        Ok(())
    }

    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        check_bounds(address, data.len(), self.size())?;

        if self.fail_write == Some(address) {
            return Err(FlashError::Write {
                address,
                len: data.len(),
            });
        }

        let start = address as usize;
        for (cell, byte) in self.data[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.ops.push(FlashOp::Write {
            address,
            len: data.len(),
        });

        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        check_bounds(address, buf.len(), self.size())?;

        let start = address as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);

        Ok(())
    }
}

//! Page buffered flash writing
//!
//! Uploads arrive in chunks of arbitrary size. The [PageWriter] collects them
//! into a fixed size page buffer and writes whole pages, erasing each sector
//! right before the first page inside of it is written.

use log::{debug, trace};

use crate::{
    error::{Error, FlashError},
    flash_target::FlashStorage,
};

/// Buffers a byte stream into pages and writes them sequentially
#[derive(Debug)]
pub struct PageWriter {
    page: Box<[u8]>,
    filled: usize,
    sector_size: u32,
    address: u32,
    end: u32,
    bytes_written: u32,
    pages_written: u32,
    sectors_erased: u32,
}

impl PageWriter {
    /// Create a writer with a page buffer of `page_size` bytes
    pub fn new(page_size: u32) -> Self {
        Self {
            page: vec![0xFF; page_size as usize].into_boxed_slice(),
            filled: 0,
            sector_size: 0,
            address: 0,
            end: 0,
            bytes_written: 0,
            pages_written: 0,
            sectors_erased: 0,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page.len() as u32
    }

    /// Prepare to write the region of `size` bytes at `base`
    pub fn begin(&mut self, base: u32, size: u32, sector_size: u32) -> Result<(), Error> {
        let page_size = self.page_size();
        if page_size == 0 || sector_size == 0 || sector_size % page_size != 0 {
            return Err(Error::InvalidPageSize {
                page_size,
                sector_size,
            });
        }
        if base % sector_size != 0 {
            return Err(FlashError::Unaligned {
                address: base,
                sector_size,
            }
            .into());
        }

        debug!(
            "Writing {:#x} bytes at {:#x} in pages of {:#x}",
            size, base, page_size
        );

        self.filled = 0;
        self.sector_size = sector_size;
        self.address = base;
        self.end = base.saturating_add(size);
        self.bytes_written = 0;
        self.pages_written = 0;
        self.sectors_erased = 0;

        Ok(())
    }

    /// Buffer `data`, writing out every page that fills up.
    ///
    /// `remaining` is the number of bytes still expected for the image,
    /// including `data`. Once it is reached the final, possibly short, page is
    /// written immediately. Returns the number of bytes taken from `data`.
    pub fn write(
        &mut self,
        flash: &mut dyn FlashStorage,
        mut data: &[u8],
        mut remaining: u32,
    ) -> Result<usize, FlashError> {
        let mut consumed = 0;

        while !data.is_empty() && remaining > 0 {
            let room = (self.page.len() - self.filled).min(remaining as usize);
            let len = room.min(data.len());

            self.page[self.filled..self.filled + len].copy_from_slice(&data[..len]);
            self.filled += len;
            remaining -= len as u32;
            consumed += len;
            data = &data[len..];

            if len == room {
                self.flush(flash)?;
            }
        }

        Ok(consumed)
    }

    /// Write out whatever is left in the page buffer
    pub fn finish(&mut self, flash: &mut dyn FlashStorage) -> Result<(), FlashError> {
        self.flush(flash)
    }

    /// Address the next page will be written to
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Bytes waiting in the page buffer
    pub fn buffered(&self) -> usize {
        self.filled
    }

    pub fn pages_written(&self) -> u32 {
        self.pages_written
    }

    pub fn sectors_erased(&self) -> u32 {
        self.sectors_erased
    }

    /// Bytes handed to flash so far, excluding the unused tail of a short
    /// last page
    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    fn flush(&mut self, flash: &mut dyn FlashStorage) -> Result<(), FlashError> {
        if self.filled == 0 {
            return Ok(());
        }

        if u64::from(self.address) + self.filled as u64 > u64::from(self.end) {
            return Err(FlashError::OutOfBounds {
                address: self.address,
                len: self.filled,
                limit: self.end,
            });
        }

        if self.address % self.sector_size == 0 {
            flash.erase_sector(self.address / self.sector_size)?;
            self.sectors_erased += 1;
        }

        trace!("Writing page at {:#x} ({} bytes)", self.address, self.filled);
        flash.write_page(self.address, &self.page[..self.filled])?;

        self.address += self.page.len() as u32;
        self.bytes_written += self.filled as u32;
        self.filled = 0;
        self.pages_written += 1;

        Ok(())
    }
}

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use log::{debug, info};

use super::{check_bounds, FlashStorage, FLASH_SECTOR_SIZE};
use crate::error::{Error, FlashError};

/// Flash backed by an image file on the host
///
/// Erased memory reads as `0xFF`, like on the device, so the file can be
/// written to a real chip unchanged.
#[derive(Debug)]
pub struct FileFlash {
    file: File,
    size: u32,
}

impl FileFlash {
    /// Open an existing flash image, or create an erased one of `size` bytes
    pub fn open_or_create(path: &Path, size: u32) -> Result<Self, Error> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;

        let size = if exists {
            let len = file.metadata()?.len();
            debug!("Opened flash image {} ({:#x} bytes)", path.display(), len);
            u32::try_from(len).map_err(|_| FlashError::OutOfBounds {
                address: 0,
                len: len as usize,
                limit: u32::MAX,
            })?
        } else {
            info!(
                "Creating erased flash image {} ({:#x} bytes)",
                path.display(),
                size
            );
            let sector = vec![0xFF; FLASH_SECTOR_SIZE as usize];
            let mut left = size as usize;
            while left > 0 {
                let len = left.min(sector.len());
                file.write_all(&sector[..len])?;
                left -= len;
            }
            file.flush()?;
            size
        };

        Ok(Self { file, size })
    }

    fn seek(&mut self, address: u32) -> Result<(), FlashError> {
        self.file.seek(SeekFrom::Start(u64::from(address)))?;
        Ok(())
    }
}

impl FlashStorage for FileFlash {
    fn sector_size(&self) -> u32 {
        FLASH_SECTOR_SIZE
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        let address = sector * FLASH_SECTOR_SIZE;
        check_bounds(address, FLASH_SECTOR_SIZE as usize, self.size)?;

        self.seek(address)?;
        self.file.write_all(&[0xFF; FLASH_SECTOR_SIZE as usize])?;

        Ok(())
    }

    fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        check_bounds(address, data.len(), self.size)?;

        // NOR semantics: a write can only clear bits
        let mut current = vec![0u8; data.len()];
        self.read(address, &mut current)?;
        for (cell, byte) in current.iter_mut().zip(data) {
            *cell &= *byte;
        }

        self.seek(address)?;
        self.file.write_all(&current)?;

        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        check_bounds(address, buf.len(), self.size)?;

        self.seek(address)?;
        self.file.read_exact(buf)?;

        Ok(())
    }
}

impl Drop for FileFlash {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
    }
}

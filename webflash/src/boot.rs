//! Boot partition selection
//!
//! The ESP-IDF bootloader picks the application to start from the `otadata`
//! partition. It holds two sectors, each starting with an
//! `esp_ota_select_entry_t`. The valid entry with the highest sequence number
//! wins, and `(seq - 1) % number_of_ota_slots` is the slot to boot. When
//! neither entry is valid the factory partition boots.
//!
//! Updating writes a new entry into the sector that does not hold the active
//! one, so an interrupted update leaves the previous selection in place.

use bytemuck::{bytes_of, bytes_of_mut, Pod, Zeroable};
use crc::{Algorithm, Crc};
use log::{debug, info};

use crate::{
    error::{BootError, Error},
    flash_target::FlashStorage,
    partition::PartitionDescriptor,
};

/// CRC-32 as computed by `esp_rom_crc32_le(UINT32_MAX, ..)`
const OTA_SEQ_CRC: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0x0000_0000,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0xd202_d277,
    residue: 0xdebb_20e3,
};
const CRC: Crc<u32> = Crc::<u32>::new(&OTA_SEQ_CRC);

const OTA_STATE_UNDEFINED: u32 = 0xFFFF_FFFF;
const OTA_STATE_INVALID: u32 = 0x3;
const OTA_STATE_ABORTED: u32 = 0x4;

/// Operations for reading and changing which application boots next
pub trait BootControl {
    /// The partition that will be started on the next boot
    fn boot_target(
        &self,
        flash: &mut dyn FlashStorage,
    ) -> Result<Option<PartitionDescriptor>, BootError>;

    /// Make `target` the partition started on the next boot
    fn set_boot_target(
        &mut self,
        flash: &mut dyn FlashStorage,
        target: &PartitionDescriptor,
    ) -> Result<(), BootError>;
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
#[doc(alias = "esp_ota_select_entry_t")]
struct OtaSelectEntry {
    ota_seq: u32,
    seq_label: [u8; 20],
    ota_state: u32,
    crc: u32,
}

impl OtaSelectEntry {
    fn new(seq: u32) -> Self {
        Self {
            ota_seq: seq.to_le(),
            seq_label: [0xFF; 20],
            ota_state: OTA_STATE_UNDEFINED.to_le(),
            crc: seq_crc(seq).to_le(),
        }
    }

    fn seq(&self) -> u32 {
        u32::from_le(self.ota_seq)
    }

    fn is_valid(&self) -> bool {
        let seq = self.seq();
        let state = u32::from_le(self.ota_state);

        seq != u32::MAX
            && u32::from_le(self.crc) == seq_crc(seq)
            && state != OTA_STATE_INVALID
            && state != OTA_STATE_ABORTED
    }
}

fn seq_crc(seq: u32) -> u32 {
    CRC.checksum(&seq.to_le_bytes())
}

/// Boot selection through the ESP-IDF `otadata` partition
#[derive(Debug, Clone)]
pub struct OtaDataBoot {
    otadata: PartitionDescriptor,
    slots: Vec<PartitionDescriptor>,
    factory: Option<PartitionDescriptor>,
}

impl OtaDataBoot {
    /// Set up boot selection from the partition table
    pub fn new(partitions: &[PartitionDescriptor]) -> Result<Self, Error> {
        let otadata = partitions
            .iter()
            .find(|p| p.is_otadata())
            .cloned()
            .ok_or(Error::MissingOtaData)?;

        let mut slots: Vec<_> = partitions
            .iter()
            .filter(|p| p.ota_slot().is_some())
            .cloned()
            .collect();
        slots.sort_by_key(|p| p.ota_slot());

        Ok(Self {
            otadata,
            slots,
            factory: partitions.iter().find(|p| p.is_factory()).cloned(),
        })
    }

    /// Index and sequence number of the entry currently in effect
    fn active_entry(&self, flash: &mut dyn FlashStorage) -> Result<Option<(u32, u32)>, BootError> {
        let sector_size = flash.sector_size();
        let mut active: Option<(u32, u32)> = None;

        for index in 0..2 {
            let mut entry = OtaSelectEntry::zeroed();
            flash.read(
                self.otadata.address() + index * sector_size,
                bytes_of_mut(&mut entry),
            )?;

            if entry.is_valid() && active.map_or(true, |(_, seq)| entry.seq() > seq) {
                active = Some((index, entry.seq()));
            }
        }

        Ok(active)
    }

    fn erase_otadata(&self, flash: &mut dyn FlashStorage) -> Result<(), BootError> {
        let sector_size = flash.sector_size();
        let first = self.otadata.address() / sector_size;

        for sector in first..first + 2 {
            flash.erase_sector(sector)?;
        }

        Ok(())
    }
}

impl BootControl for OtaDataBoot {
    fn boot_target(
        &self,
        flash: &mut dyn FlashStorage,
    ) -> Result<Option<PartitionDescriptor>, BootError> {
        let target = match self.active_entry(flash)? {
            Some((_, seq)) if !self.slots.is_empty() => {
                let slot = (seq.wrapping_sub(1) as usize) % self.slots.len();
                Some(self.slots[slot].clone())
            }
            _ => self
                .factory
                .clone()
                .or_else(|| self.slots.first().cloned()),
        };

        Ok(target)
    }

    fn set_boot_target(
        &mut self,
        flash: &mut dyn FlashStorage,
        target: &PartitionDescriptor,
    ) -> Result<(), BootError> {
        if target.is_factory() {
            info!("Selecting factory partition for the next boot");
            return self.erase_otadata(flash);
        }

        let count = self.slots.len() as u32;
        if count == 0 {
            return Err(BootError::NoOtaSlots);
        }

        let index = self
            .slots
            .iter()
            .position(|p| p == target)
            .ok_or_else(|| BootError::NotBootable(target.label().to_string()))?
            as u32;

        let active = self.active_entry(flash)?;
        let current = active.map_or(0, |(_, seq)| seq);

        // smallest sequence number above the current one that maps to `index`
        let seq = current
            .checked_add(1 + (index + count - current % count) % count)
            .filter(|&seq| seq != u32::MAX)
            .ok_or(BootError::SequenceExhausted(current))?;

        let sector_size = flash.sector_size();
        let entry_index = match active {
            Some((0, _)) => 1,
            _ => 0,
        };
        let address = self.otadata.address() + entry_index * sector_size;

        debug!(
            "Writing otadata entry {} with sequence {} for '{}'",
            entry_index,
            seq,
            target.label()
        );

        flash.erase_sector(address / sector_size)?;
        flash.write_page(address, bytes_of(&OtaSelectEntry::new(seq)))?;

        info!("Selected '{}' for the next boot", target.label());

        Ok(())
    }
}

use std::collections::HashMap;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use sha2::{Digest, Sha256};
use webflash::{
    boot::{BootControl, OtaDataBoot},
    error::{BootError, ClassificationError, Error, ResolveError},
    flash_target::{FlashOp, FlashStorage, RamFlash},
    image_format::{Platform, UploadKind},
    partition::{parse_partition_table, PartitionDescriptor},
    upload::{BodyChunk, Phase, UploadResult, UploadSession},
    Updater, UpdaterConfig,
};

const PARTITIONS: &str = "\
# Name,   Type, SubType, Offset,  Size,    Flags
nvs,      data, nvs,     0x9000,  0x4000,
otadata,  data, ota,     0xd000,  0x2000,
phy_init, data, phy,     0xf000,  0x1000,
factory,  app,  factory, 0x10000, 0x10000,
ota_0,    app,  ota_0,   0x20000, 0x10000,
ota_1,    app,  ota_1,   0x30000, 0x10000,
espfs,    data, spiffs,  0x40000, 0x8000,
";

const FLASH_SIZE: u32 = 0x48000;
const OTA_0: u32 = 0x20000;
const OTA_1: u32 = 0x30000;
const ESPFS: u32 = 0x40000;

fn partitions() -> Vec<PartitionDescriptor> {
    parse_partition_table(PARTITIONS.as_bytes().to_vec()).unwrap()
}

/// ESP32 application image with one segment per payload and an appended
/// SHA-256 digest
fn esp32_image(payloads: &[&[u8]]) -> Vec<u8> {
    let mut image = vec![0u8; 24];
    image[0] = 0xE9;
    image[1] = payloads.len() as u8;
    image[2] = 2;
    image[3] = 0x20;
    image[4..8].copy_from_slice(&0x4008_0400u32.to_le_bytes());
    image[23] = 1;

    let mut checksum = 0xEFu8;
    for (i, payload) in payloads.iter().enumerate() {
        let addr = 0x3F40_0020u32 + (i as u32) * 0x1_0000;
        image.extend_from_slice(&addr.to_le_bytes());
        image.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        image.extend_from_slice(payload);
        checksum = payload.iter().fold(checksum, |c, b| c ^ b);
    }

    let padding = 15 - (image.len() % 16);
    image.extend(std::iter::repeat(0).take(padding));
    image.push(checksum);

    let digest = Sha256::digest(&image);
    image.extend_from_slice(&digest);
    image
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

fn combined(tag: &str, first: &[u8], second: &[u8]) -> Vec<u8> {
    let mut body = b"EHUG".to_vec();
    let mut raw_tag = [0u8; 28];
    raw_tag[..tag.len()].copy_from_slice(tag.as_bytes());
    body.extend_from_slice(&raw_tag);
    body.extend_from_slice(&(first.len() as u32).to_le_bytes());
    body.extend_from_slice(&(second.len() as u32).to_le_bytes());
    body.extend_from_slice(first);
    body.extend_from_slice(second);
    body
}

fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct Device {
    updater: Updater,
    flash: RamFlash,
    boot: OtaDataBoot,
}

impl Device {
    fn new(page_size: u32) -> Self {
        Self::with_config(UpdaterConfig {
            platform: Platform::Esp32,
            page_size: Some(page_size),
            device_tag: Some("lamp".into()),
            verify: true,
            ..UpdaterConfig::default()
        })
    }

    fn with_config(config: UpdaterConfig) -> Self {
        let partitions = partitions();
        Self {
            boot: OtaDataBoot::new(&partitions).unwrap(),
            updater: Updater::new(config, partitions, Some("factory".into())),
            flash: RamFlash::new(FLASH_SIZE),
        }
    }

    fn begin(&self, route: UploadKind, pairs: &[(&str, &str)]) -> UploadSession {
        self.updater.begin_upload(route, &params(pairs)).unwrap()
    }

    fn feed(&mut self, session: &mut UploadSession, body: &[u8], sizes: &[usize]) -> UploadResult {
        let mut results = Vec::new();
        let mut offset = 0;

        for size in sizes.iter().cycle() {
            let end = (offset + size).min(body.len());
            let chunk = BodyChunk {
                data: &body[offset..end],
                total_len: body.len() as u32,
                received: end as u32,
            };
            results.extend(session.on_chunk(&mut self.flash, &mut self.boot, chunk));

            offset = end;
            if offset == body.len() {
                break;
            }
        }

        assert_eq!(results.len(), 1, "exactly one result per upload");
        results.remove(0)
    }

    fn upload(&mut self, route: UploadKind, pairs: &[(&str, &str)], body: &[u8]) -> UploadResult {
        let mut session = self.begin(route, pairs);
        self.feed(&mut session, body, &[1460])
    }

    fn boot_label(&mut self) -> String {
        self.boot
            .boot_target(&mut self.flash)
            .unwrap()
            .map(|p| p.label().to_string())
            .unwrap_or_default()
    }

    fn region(&self, address: u32, len: usize) -> &[u8] {
        &self.flash.data()[address as usize..address as usize + len]
    }
}

#[test]
fn single_firmware_happy_path() {
    let mut device = Device::new(0x1000);
    let image = esp32_image(&[&payload(0x2800, 1), &payload(0x300, 2)]);
    let mut session = device.begin(UploadKind::Firmware, &[]);

    assert_eq!(session.phase(), Phase::Start);
    assert_eq!(session.target_label(), "ota_0");

    let total_len = image.len() as u32;
    let mut phases = Vec::new();
    let mut result = None;
    for (offset, piece) in [&image[..20], &image[20..1000], &image[1000..]]
        .into_iter()
        .scan(0, |offset, piece| {
            *offset += piece.len();
            Some((*offset, piece))
        })
    {
        let chunk = BodyChunk {
            data: piece,
            total_len,
            received: offset as u32,
        };
        result = session.on_chunk(&mut device.flash, &mut device.boot, chunk);
        phases.push(session.phase());
    }

    assert_eq!(phases, vec![Phase::Start, Phase::Write, Phase::Done]);
    assert_eq!(
        result,
        Some(UploadResult {
            success: true,
            message: "Flash Success.".into(),
            target_label: "ota_0".into(),
        })
    );
    assert_eq!(device.region(OTA_0, image.len()), &image[..]);
    assert_eq!(device.boot_label(), "ota_0");
}

#[test]
fn page_and_sector_accounting() {
    const PAGE: usize = 0x400;
    const SECTOR: usize = 0x1000;

    let mut device = Device::with_config(UpdaterConfig {
        page_size: Some(PAGE as u32),
        ..UpdaterConfig::default()
    });
    let mut image = esp32_image(&[]);
    image.resize(0x2345, 0x77);

    let result = device.upload(UploadKind::Firmware, &[], &image);
    assert!(result.success, "{result:?}");

    let in_partition = |address: u32| (OTA_0..OTA_0 + 0x10000).contains(&address);
    let writes: Vec<_> = device
        .flash
        .writes()
        .filter(|(address, _)| in_partition(*address))
        .collect();
    let erases: Vec<_> = device
        .flash
        .erases()
        .filter(|sector| in_partition(sector * SECTOR as u32))
        .collect();

    assert_eq!(writes.len(), image.len().div_ceil(PAGE));
    assert_eq!(erases.len(), image.len().div_ceil(SECTOR));
    assert_eq!(erases, vec![0x20, 0x21, 0x22]);
    assert_eq!(writes.last(), Some(&(OTA_0 + 0x2000, 0x2345 % PAGE)));

    // every erase precedes the first write into its sector
    let ops = device.flash.ops();
    for sector in erases {
        let erase = ops
            .iter()
            .position(|op| *op == FlashOp::Erase { sector })
            .unwrap();
        let first_write = ops
            .iter()
            .position(|op| matches!(op, FlashOp::Write { address, .. } if address / SECTOR as u32 == sector))
            .unwrap();
        assert!(erase < first_write);
    }
}

#[test]
fn abort_keeps_boot_selection() {
    let mut device = Device::new(0x400);
    let image = esp32_image(&[&payload(0x1800, 3)]);
    let mut session = device.begin(UploadKind::Firmware, &[]);

    let chunk = BodyChunk {
        data: &image[..0x900],
        total_len: image.len() as u32,
        received: 0x900,
    };
    assert_eq!(
        session.on_chunk(&mut device.flash, &mut device.boot, chunk),
        None
    );
    assert_eq!(session.phase(), Phase::Write);

    session.abort();

    assert_ne!(session.phase(), Phase::Done);
    assert_eq!(device.boot_label(), "factory");
    assert!(device
        .updater
        .begin_upload(UploadKind::Firmware, &params(&[]))
        .is_ok());
}

#[test]
fn dropped_session_releases_partition() {
    let device = Device::new(0x400);

    let first = device.begin(UploadKind::Firmware, &[]);
    assert!(matches!(
        device
            .updater
            .begin_upload(UploadKind::Firmware, &params(&[])),
        Err(ResolveError::Busy(_))
    ));

    // a different slot is still available
    assert!(device
        .updater
        .begin_upload(UploadKind::Firmware, &params(&[("partition", "ota_1")]))
        .is_ok());

    drop(first);
    assert!(device
        .updater
        .begin_upload(UploadKind::Firmware, &params(&[]))
        .is_ok());
}

#[test]
fn busy_until_completion() {
    let mut device = Device::new(0x400);
    let image = esp32_image(&[&payload(0x500, 4)]);

    let mut session = device.begin(UploadKind::Firmware, &[]);
    assert!(matches!(
        device
            .updater
            .begin_upload(UploadKind::Firmware, &params(&[("partition", "ota_0")])),
        Err(ResolveError::Busy(_))
    ));

    let result = device.feed(&mut session, &image, &[0x100]);
    assert!(result.success);

    let session = device.begin(UploadKind::Firmware, &[("partition", "ota_0")]);
    assert_eq!(session.phase(), Phase::Start);
}

#[test]
fn combined_image_selects_sub_image_per_slot() {
    let mut device = Device::new(0x400);
    let first = esp32_image(&[&payload(0x700, 5)]);
    let second = esp32_image(&[&payload(0x900, 6)]);
    let body = combined("lamp", &first, &second);

    let result = device.upload(UploadKind::Firmware, &[], &body);
    assert!(result.success, "{result:?}");
    assert_eq!(result.target_label, "ota_0");
    assert_eq!(device.region(OTA_0, first.len()), &first[..]);
    assert_eq!(device.region(OTA_0 + first.len() as u32, 1), &[0xFF]);

    let result = device.upload(UploadKind::Firmware, &[("partition", "ota_1")], &body);
    assert!(result.success, "{result:?}");
    assert_eq!(device.region(OTA_1, second.len()), &second[..]);
    assert_eq!(device.boot_label(), "ota_1");
}

#[test]
fn tag_mismatch_needs_force() {
    let mut device = Device::new(0x400);
    let image = esp32_image(&[&payload(0x200, 7)]);
    let body = combined("heater", &image, &image);

    let mut session = device.begin(UploadKind::Firmware, &[]);
    let result = device.feed(&mut session, &body, &[17]);

    assert!(!result.success);
    assert_eq!(result.message, "Firmware not intended for this device!");
    assert!(matches!(
        session.error(),
        Some(Error::Classification(ClassificationError::TagMismatch { .. }))
    ));
    assert!(device.flash.ops().is_empty());

    let result = device.upload(UploadKind::Firmware, &[("force", "1")], &body);
    assert!(result.success, "{result:?}");
    assert_eq!(device.boot_label(), "ota_0");
}

#[test]
fn excess_bytes_do_not_change_result() {
    let mut device = Device::new(0x400);
    let image = esp32_image(&[&payload(0x300, 8)]);
    let mut session = device.begin(UploadKind::Firmware, &[]);

    let result = device.feed(&mut session, &image, &[0x80]);
    assert!(result.success);

    let late = BodyChunk {
        data: &[0xAB; 64],
        total_len: image.len() as u32,
        received: image.len() as u32 + 64,
    };
    assert_eq!(
        session.on_chunk(&mut device.flash, &mut device.boot, late),
        None
    );
    assert_eq!(session.phase(), Phase::Done);
    assert_eq!(device.region(OTA_0 + image.len() as u32, 64), &[0xFF; 64]);
}

#[test]
fn filesystem_upload_does_not_touch_boot() {
    let mut device = Device::new(0x400);
    let mut image = b"ESfs".to_vec();
    image.extend_from_slice(&payload(0x3000, 9));

    let ops_before = device.flash.ops().len();
    let result = device.upload(UploadKind::Filesystem, &[], &image);

    assert!(result.success, "{result:?}");
    assert_eq!(result.target_label, "espfs");
    assert_eq!(device.region(ESPFS, image.len()), &image[..]);
    assert!(device.flash.ops()[ops_before..].iter().all(|op| match op {
        FlashOp::Erase { sector } => sector * 0x1000 >= ESPFS,
        FlashOp::Write { address, .. } => *address >= ESPFS,
    }));
    assert_eq!(device.boot_label(), "factory");

    // application images are not filesystems
    let result = device.upload(UploadKind::Filesystem, &[], &esp32_image(&[]));
    assert_eq!(result.message, "Invalid flash image type!");
}

#[test]
fn corrupted_image_fails_verification() {
    let mut device = Device::new(0x400);
    let mut image = esp32_image(&[&payload(0x600, 10)]);
    image[0x100] ^= 0x01;

    let mut session = device.begin(UploadKind::Firmware, &[]);
    let result = device.feed(&mut session, &image, &[0x333]);

    assert!(!result.success);
    assert!(matches!(session.error(), Some(Error::Verify(_))));
    // the data stays where it was written
    assert_eq!(device.region(OTA_0, image.len()), &image[..]);
    assert_eq!(device.boot_label(), "factory");
}

#[test]
fn oversized_image_is_rejected() {
    let mut device = Device::new(0x1000);
    let mut image = esp32_image(&[]);
    image.resize(0x10001, 0);

    let result = device.upload(UploadKind::Firmware, &[], &image);

    assert_eq!(result.message, "Firmware image too large");
    assert!(device.flash.ops().is_empty());
}

#[derive(Debug)]
struct BrokenBoot;

impl BootControl for BrokenBoot {
    fn boot_target(
        &self,
        _flash: &mut dyn FlashStorage,
    ) -> Result<Option<PartitionDescriptor>, BootError> {
        Ok(None)
    }

    fn set_boot_target(
        &mut self,
        _flash: &mut dyn FlashStorage,
        target: &PartitionDescriptor,
    ) -> Result<(), BootError> {
        Err(BootError::NotBootable(target.label().to_string()))
    }
}

#[test]
fn boot_selection_failure_fails_upload() {
    let mut device = Device::new(0x400);
    let image = esp32_image(&[&payload(0x200, 11)]);
    let mut session = device.begin(UploadKind::Firmware, &[]);

    let chunk = BodyChunk {
        data: &image,
        total_len: image.len() as u32,
        received: image.len() as u32,
    };
    let result = session
        .on_chunk(&mut device.flash, &mut BrokenBoot, chunk)
        .unwrap();

    assert!(!result.success);
    assert!(matches!(session.error(), Some(Error::Boot(_))));
    assert_eq!(device.region(OTA_0, image.len()), &image[..]);
}

fn run(page_size: u32, slot: &str, body: &[u8], sizes: &[usize]) -> (Vec<u8>, String, bool) {
    let mut device = Device::new(page_size);
    let mut session = device.begin(UploadKind::Firmware, &[("partition", slot)]);
    let result = device.feed(&mut session, body, sizes);

    let label = device.boot_label();
    (device.flash.data().to_vec(), label, result.success)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn chunking_does_not_change_outcome(
        sizes in prop::collection::vec(1usize..1500, 1..24),
        page_size in prop::sample::select(vec![64u32, 256, 1024, 4096]),
        slot in prop::sample::select(vec!["ota_0", "ota_1"]),
        combined_body in any::<bool>(),
    ) {
        let first = esp32_image(&[&payload(0x1234, 12), &payload(0x321, 13)]);
        let second = esp32_image(&[&payload(0x876, 14), &payload(0x45, 15)]);
        let body = if combined_body {
            combined("lamp", &first, &second)
        } else {
            first.clone()
        };

        let reference = run(page_size, slot, &body, &[body.len()]);
        prop_assert!(reference.2);
        prop_assert_eq!(&reference.1, slot);

        // ota_1 skips the first sub-image of a combined body
        let address = if slot == "ota_0" { OTA_0 as usize } else { OTA_1 as usize };
        let expected = if combined_body && slot == "ota_1" { &second } else { &first };
        prop_assert_eq!(&reference.0[address..address + expected.len()], &expected[..]);

        prop_assert_eq!(run(page_size, slot, &body, &sizes), reference);
    }
}

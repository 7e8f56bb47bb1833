use log::info;

use crate::{
    boot::BootControl,
    error::{Error, VerifyError},
    flash_target::FlashStorage,
    flasher::PageWriter,
    image_format::{verify_app_image, Classifier, ImageKind, Platform, UploadKind, PROBE_LEN},
    partition::{ImageTarget, PartitionDescriptor},
};

/// Finish a completely received image.
///
/// The last page is flushed and the lease closed. Unless verification fails,
/// application images are then selected for the next boot.
pub(crate) fn commit(
    flash: &mut dyn FlashStorage,
    boot: &mut dyn BootControl,
    writer: &mut PageWriter,
    target: ImageTarget,
    kind: &ImageKind,
    platform: Platform,
    verify: bool,
) -> Result<PartitionDescriptor, Error> {
    writer.finish(flash)?;
    let partition = target.release();

    info!(
        "Wrote {:#x} bytes to '{}' ({} pages, {} sectors erased)",
        writer.bytes_written(),
        partition.label(),
        writer.pages_written(),
        writer.sectors_erased()
    );

    if verify {
        verify_written_image(flash, &partition, kind, platform)?;
        info!("Verified image in '{}'", partition.label());
    }

    if kind.is_bootable() {
        boot.set_boot_target(flash, &partition)?;
    }

    Ok(partition)
}

/// Check the image now stored in `partition`
///
/// ESP32 application images are checked completely; other images only by
/// their header.
pub fn verify_written_image(
    flash: &mut dyn FlashStorage,
    partition: &PartitionDescriptor,
    kind: &ImageKind,
    platform: Platform,
) -> Result<(), VerifyError> {
    if kind.is_bootable() && platform == Platform::Esp32 {
        return verify_app_image(flash, partition.address(), partition.size());
    }

    let route = if kind.is_bootable() {
        UploadKind::Firmware
    } else {
        UploadKind::Filesystem
    };

    let mut header = [0u8; PROBE_LEN];
    let len = header.len().min(partition.size() as usize);
    flash.read(partition.address(), &mut header[..len])?;

    Classifier::new(platform, None)
        .classify(route, &header[..len], true)
        .map(|_| ())
        .map_err(|_| VerifyError::InvalidHeader)
}

use std::fmt;

use crate::{image_format::SubImage, partition::PartitionDescriptor};

/// Decides which half of a combined image belongs in a partition
pub trait SubImageSelector: fmt::Debug + Send + Sync {
    fn select(&self, target: &PartitionDescriptor) -> SubImage;
}

/// Even OTA slots (and the factory partition) take the first image, odd
/// slots the second
#[derive(Debug, Default, Clone, Copy)]
pub struct ByOtaSlot;

impl SubImageSelector for ByOtaSlot {
    fn select(&self, target: &PartitionDescriptor) -> SubImage {
        match target.ota_slot() {
            Some(slot) if slot % 2 == 1 => SubImage::Second,
            _ => SubImage::First,
        }
    }
}

/// Always picks the same sub-image
#[derive(Debug, Clone, Copy)]
pub struct FixedSubImage(pub SubImage);

impl SubImageSelector for FixedSubImage {
    fn select(&self, _target: &PartitionDescriptor) -> SubImage {
        self.0
    }
}

//! Upload image formats
//!
//! Three kinds of images are accepted over the upload routes:
//!
//! * plain application images, as produced by the ESP-IDF or the ESP8266 SDK
//! * combined images, which bundle two application images behind an `EHUG`
//!   header so that one file can serve either OTA slot
//! * `ESfs` filesystem images, which are only accepted on the filesystem route
//!
//! The [Classifier] only looks at the first [PROBE_LEN] bytes of the stream.

use log::warn;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};

pub use self::{
    combined::{CombinedHeader, SubImage, COMBINED_HEADER_LEN},
    esp_idf::{read_app_description, verify_app_image, AppDescription},
};
use crate::error::ClassificationError;

mod combined;
mod esp8266;
mod esp_idf;
mod espfs;

/// Number of bytes collected before an upload is classified
pub const PROBE_LEN: usize = COMBINED_HEADER_LEN;

/// Supported device families
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    VariantNames,
    Deserialize,
    Serialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// ESP32 family, ESP-IDF application images
    #[default]
    Esp32,
    /// ESP8266, SDK v2 application images
    Esp8266,
}

impl Platform {
    /// Default number of bytes buffered per flash page write
    pub fn default_page_size(&self) -> u32 {
        match self {
            Platform::Esp32 => 4096,
            Platform::Esp8266 => 64,
        }
    }

    fn is_app_header(&self, header: &[u8]) -> bool {
        match self {
            Platform::Esp32 => esp_idf::is_app_header(header),
            Platform::Esp8266 => esp8266::is_app_header(header),
        }
    }
}

/// The route an upload arrived on
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum UploadKind {
    /// Application images, written to an OTA slot
    #[default]
    Firmware,
    /// Filesystem images, written to a data partition
    Filesystem,
}

/// Result of classifying the first bytes of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageKind {
    /// Two application images behind an `EHUG` header
    Combined(CombinedHeader),
    /// A single application image
    SingleFirmware,
    /// An `ESfs` filesystem image
    Filesystem,
}

impl ImageKind {
    /// Number of leading bytes that belong to a container header and are
    /// never written to flash
    pub fn header_len(&self) -> usize {
        match self {
            ImageKind::Combined(_) => COMBINED_HEADER_LEN,
            _ => 0,
        }
    }

    /// Whether a successful write should update the boot selection
    pub fn is_bootable(&self) -> bool {
        !matches!(self, ImageKind::Filesystem)
    }
}

/// Decides what kind of image an upload carries
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    platform: Platform,
    device_tag: Option<String>,
}

impl Classifier {
    pub fn new(platform: Platform, device_tag: Option<String>) -> Self {
        Self {
            platform,
            device_tag: device_tag.filter(|tag| !tag.is_empty()),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Classify an upload from its first bytes.
    ///
    /// `header` holds up to [PROBE_LEN] bytes; shorter slices are accepted
    /// when the upload itself is shorter. A combined image whose tag differs
    /// from the configured device tag is rejected unless `force` is set.
    pub fn classify(
        &self,
        route: UploadKind,
        header: &[u8],
        force: bool,
    ) -> Result<ImageKind, ClassificationError> {
        match route {
            UploadKind::Filesystem if espfs::is_espfs_header(header) => Ok(ImageKind::Filesystem),
            UploadKind::Filesystem => Err(ClassificationError::Unrecognized),
            UploadKind::Firmware if combined::has_magic(header) => {
                let combined = CombinedHeader::parse(header)?;
                self.check_tag(&combined, force)?;
                Ok(ImageKind::Combined(combined))
            }
            UploadKind::Firmware if self.platform.is_app_header(header) => {
                Ok(ImageKind::SingleFirmware)
            }
            UploadKind::Firmware => Err(ClassificationError::Unrecognized),
        }
    }

    fn check_tag(&self, header: &CombinedHeader, force: bool) -> Result<(), ClassificationError> {
        let Some(expected) = self.device_tag.as_deref() else {
            return Ok(());
        };

        if header.matches_tag(expected) {
            return Ok(());
        }

        if force {
            warn!(
                "Flashing image tagged '{}' on device '{}' (forced)",
                header.tag(),
                expected
            );
            Ok(())
        } else {
            Err(ClassificationError::TagMismatch {
                expected: expected.to_string(),
                found: header.tag().to_string(),
            })
        }
    }
}

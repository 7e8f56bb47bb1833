//! Entry point for uploads and flash queries
//!
//! The [Updater] owns everything that outlives a single request: the
//! classifier settings, the partition table with its write leases, and the
//! sub-image selection policy. Transports call [Updater::begin_upload] once
//! per request and then drive the returned [UploadSession].

use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::{
    boot::BootControl,
    error::{Error, FlashError, ResolveError},
    flash_target::FlashStorage,
    image_format::{
        read_app_description, Classifier, ImageKind, Platform, SubImage, UploadKind,
    },
    partition::{PartitionDescriptor, PartitionKind, TargetResolver},
    upload::{
        verify_written_image, ByOtaSlot, RequestParams, SessionConfig, SubImageSelector,
        UploadSession,
    },
};

/// Name of the data partition filesystem images go to by default
pub const DEFAULT_FILESYSTEM_PARTITION: &str = "espfs";

/// Settings shared by all uploads
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub platform: Platform,
    /// Page buffer size; the platform default when `None`
    pub page_size: Option<u32>,
    /// Tag combined images must carry, unless forced
    pub device_tag: Option<String>,
    pub allow_factory_write: bool,
    /// Check written images before selecting them for boot
    pub verify: bool,
    /// Data partition used when a filesystem upload names none
    pub filesystem_partition: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            page_size: None,
            device_tag: None,
            allow_factory_write: false,
            verify: false,
            filesystem_partition: DEFAULT_FILESYSTEM_PARTITION.to_string(),
        }
    }
}

/// Outcome of a boot selection request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootSelection {
    /// Partition that boots next
    pub boot: String,
    pub success: bool,
}

/// Which partitions [Updater::flash_info] reports
#[derive(Debug, Clone, Default)]
pub struct FlashInfoQuery {
    /// Only partitions of this kind
    pub kind: Option<PartitionKind>,
    /// Only the partition with this label
    pub name: Option<String>,
    /// Verify application images
    pub verify: bool,
}

/// Application partition details
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppInfo {
    pub name: String,
    pub size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub ota: bool,
    pub running: bool,
    pub bootset: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
}

/// Data partition details
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataInfo {
    pub name: String,
    pub size: u32,
    pub format: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlashInfo {
    pub app: Vec<AppInfo>,
    pub data: Vec<DataInfo>,
}

/// Creates upload sessions and answers flash queries
#[derive(Debug, Clone)]
pub struct Updater {
    classifier: Classifier,
    resolver: TargetResolver,
    selector: Arc<dyn SubImageSelector>,
    page_size: u32,
    verify: bool,
    filesystem_partition: String,
}

impl Updater {
    /// `running` is the label of the partition the device booted from
    pub fn new(
        config: UpdaterConfig,
        partitions: Vec<PartitionDescriptor>,
        running: Option<String>,
    ) -> Self {
        let page_size = config
            .page_size
            .unwrap_or_else(|| config.platform.default_page_size());

        Self {
            classifier: Classifier::new(config.platform, config.device_tag),
            resolver: TargetResolver::new(partitions, running)
                .with_factory_write(config.allow_factory_write),
            selector: Arc::new(ByOtaSlot),
            page_size,
            verify: config.verify,
            filesystem_partition: config.filesystem_partition,
        }
    }

    /// Replace the policy deciding which half of a combined image is written
    pub fn with_selector(mut self, selector: impl SubImageSelector + 'static) -> Self {
        self.selector = Arc::new(selector);
        self
    }

    pub fn resolver(&self) -> &TargetResolver {
        &self.resolver
    }

    pub fn platform(&self) -> Platform {
        self.classifier.platform()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Start handling an upload request.
    ///
    /// The `partition` parameter names the destination and `force` (a
    /// non-zero integer) accepts combined images tagged for another device.
    /// A partition that is already being written is refused right away; any
    /// other resolution failure is reported through the session once the
    /// body has been received.
    pub fn begin_upload(
        &self,
        route: UploadKind,
        params: &dyn RequestParams,
    ) -> Result<UploadSession, ResolveError> {
        let name = params.param("partition").filter(|name| !name.is_empty());
        let config = SessionConfig {
            route,
            classifier: self.classifier.clone(),
            selector: self.selector.clone(),
            page_size: self.page_size,
            force: params.flag("force"),
            verify: self.verify,
        };

        let target = match route {
            UploadKind::Firmware => self.resolver.resolve(name),
            UploadKind::Filesystem => self
                .resolver
                .resolve_data(name.unwrap_or(&self.filesystem_partition)),
        };

        match target {
            Ok(target) => Ok(UploadSession::new(config, target)),
            Err(err @ ResolveError::Busy(_)) => {
                warn!("{}", err);
                Err(err)
            }
            Err(err) => Ok(UploadSession::rejected(config, err)),
        }
    }

    /// File name of the combined image half the next firmware upload needs
    pub fn next_firmware_name(&self) -> &'static str {
        let image = match self.resolver.peek(None) {
            Ok(partition) => self.selector.select(partition),
            Err(_) => SubImage::First,
        };

        image.file_name()
    }

    /// Select the application partition `name` for the next boot, or just
    /// report the current selection
    pub fn set_boot(
        &self,
        flash: &mut dyn FlashStorage,
        boot: &mut dyn BootControl,
        name: Option<&str>,
    ) -> Result<BootSelection, Error> {
        let mut success = true;

        if let Some(name) = name {
            let partition = self
                .resolver
                .find_app(name)
                .ok_or_else(|| ResolveError::NotFound(name.to_string()))?;

            if self.resolver.is_leased(partition) {
                return Err(ResolveError::Busy(name.to_string()).into());
            }

            if let Err(err) = boot.set_boot_target(flash, partition) {
                warn!("Failed to select '{}' for boot: {}", name, err);
                success = false;
            }
        }

        let boot = boot
            .boot_target(flash)?
            .map(|p| p.label().to_string())
            .unwrap_or_default();

        if let Some(name) = name {
            success &= boot == name;
        }

        if let Some(running) = self.resolver.running() {
            if running.label() != boot {
                warn!(
                    "Partition '{}' boots next, the device is running '{}'",
                    boot,
                    running.label()
                );
            }
        }

        Ok(BootSelection { boot, success })
    }

    /// Erase every sector of the data partition `name`
    pub fn erase_data_partition(
        &self,
        flash: &mut dyn FlashStorage,
        name: &str,
    ) -> Result<PartitionDescriptor, Error> {
        let target = self.resolver.resolve_data(name)?;
        let partition = target.partition();

        let sector_size = flash.sector_size();
        if partition.address() % sector_size != 0 {
            return Err(FlashError::Unaligned {
                address: partition.address(),
                sector_size,
            }
            .into());
        }

        let first = partition.address() / sector_size;
        let count = partition.size().div_ceil(sector_size);
        for sector in first..first + count {
            flash.erase_sector(sector)?;
        }

        info!("Erased {} sectors of '{}'", count, partition.label());

        Ok(target.release())
    }

    /// Describe the partitions selected by `query`
    pub fn flash_info(
        &self,
        flash: &mut dyn FlashStorage,
        boot: &dyn BootControl,
        query: &FlashInfoQuery,
    ) -> Result<FlashInfo, Error> {
        let boot_label = boot.boot_target(flash)?.map(|p| p.label().to_string());
        let running_label = self.resolver.running().map(|p| p.label().to_string());

        let selected = self.resolver.partitions().iter().filter(|p| {
            query.kind.map_or(true, |kind| p.kind() == kind)
                && query.name.as_deref().map_or(true, |name| p.label() == name)
        });

        let mut info = FlashInfo::default();
        for partition in selected {
            match partition.kind() {
                PartitionKind::App => {
                    let app = self.app_info(
                        flash,
                        partition,
                        boot_label.as_deref(),
                        running_label.as_deref(),
                        query.verify,
                    )?;
                    info.app.push(app);
                }
                PartitionKind::Data => info.data.push(DataInfo {
                    name: partition.label().to_string(),
                    size: partition.size(),
                    format: partition.subtype(),
                }),
                PartitionKind::Other => {}
            }
        }

        Ok(info)
    }

    fn app_info(
        &self,
        flash: &mut dyn FlashStorage,
        partition: &PartitionDescriptor,
        boot_label: Option<&str>,
        running_label: Option<&str>,
        verify: bool,
    ) -> Result<AppInfo, Error> {
        let description = match self.platform() {
            Platform::Esp32 => read_app_description(flash, partition.address())?,
            _ => None,
        };

        // images still being written are neither valid nor invalid
        let valid = (verify && !self.resolver.is_leased(partition)).then(|| {
            verify_written_image(
                flash,
                partition,
                &ImageKind::SingleFirmware,
                self.platform(),
            )
            .is_ok()
        });

        let (version, project) = description
            .map(|d| (Some(d.version), Some(d.project_name)))
            .unwrap_or_default();

        Ok(AppInfo {
            name: partition.label().to_string(),
            size: partition.size(),
            version,
            project,
            ota: partition.ota_slot().is_some(),
            running: running_label == Some(partition.label()),
            bootset: boot_label == Some(partition.label()),
            valid,
        })
    }
}

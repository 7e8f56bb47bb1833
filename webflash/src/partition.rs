//! Partition lookup and write leases
//!
//! The partition table is read once and never modified. Uploads ask the
//! [TargetResolver] for a destination; the returned [ImageTarget] holds a
//! [WriteLease] which keeps any other upload away from the same partition
//! until it is dropped.

use std::{
    collections::BTreeSet,
    fmt,
    fs,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use esp_idf_part::{PartitionTable, SubType, Type};
use log::{debug, warn};
use serde::Serialize;
use strum::Display;

use crate::error::{Error, ResolveError};

const APP_FACTORY: u8 = 0x00;
const APP_OTA_MIN: u8 = 0x10;
const APP_OTA_MAX: u8 = 0x1F;
const DATA_OTA: u8 = 0x00;

/// Coarse partition type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    App,
    Data,
    Other,
}

/// Read-only description of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionDescriptor {
    label: String,
    kind: PartitionKind,
    subtype: u8,
    address: u32,
    size: u32,
}

impl PartitionDescriptor {
    pub fn new(
        label: impl Into<String>,
        kind: PartitionKind,
        subtype: u8,
        address: u32,
        size: u32,
    ) -> Self {
        Self {
            label: label.into(),
            kind,
            subtype,
            address,
            size,
        }
    }

    /// Shorthand for the `ota_N` application partition
    pub fn ota(slot: u8, address: u32, size: u32) -> Self {
        Self::new(
            format!("ota_{slot}"),
            PartitionKind::App,
            APP_OTA_MIN + slot,
            address,
            size,
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> PartitionKind {
        self.kind
    }

    pub fn subtype(&self) -> u8 {
        self.subtype
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// First address past the partition
    pub fn end(&self) -> u32 {
        self.address.saturating_add(self.size)
    }

    pub fn is_app(&self) -> bool {
        self.kind == PartitionKind::App
    }

    pub fn is_factory(&self) -> bool {
        self.is_app() && self.subtype == APP_FACTORY
    }

    /// Index of the OTA slot, for `ota_N` application partitions
    pub fn ota_slot(&self) -> Option<u8> {
        (self.is_app() && (APP_OTA_MIN..=APP_OTA_MAX).contains(&self.subtype))
            .then(|| self.subtype - APP_OTA_MIN)
    }

    pub fn is_otadata(&self) -> bool {
        self.kind == PartitionKind::Data && self.subtype == DATA_OTA
    }
}

impl fmt::Display for PartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {:#04x} at {:#x}, {:#x} bytes)",
            self.label, self.kind, self.subtype, self.address, self.size
        )
    }
}

impl From<&esp_idf_part::Partition> for PartitionDescriptor {
    fn from(partition: &esp_idf_part::Partition) -> Self {
        let kind = match partition.ty() {
            Type::App => PartitionKind::App,
            Type::Data => PartitionKind::Data,
            _ => PartitionKind::Other,
        };
        let subtype = match partition.subtype() {
            SubType::App(ty) => ty as u8,
            SubType::Data(ty) => ty as u8,
            _ => 0xFF,
        };

        Self::new(
            partition.name().to_string(),
            kind,
            subtype,
            partition.offset(),
            partition.size(),
        )
    }
}

/// Parse a CSV or binary partition table
pub fn parse_partition_table(data: Vec<u8>) -> Result<Vec<PartitionDescriptor>, Error> {
    let table = PartitionTable::try_from(data)?;
    Ok(table.partitions().iter().map(Into::into).collect())
}

/// Read and parse the partition table at `path`
pub fn read_partition_table(path: &Path) -> Result<Vec<PartitionDescriptor>, Error> {
    let data = fs::read(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;
    parse_partition_table(data)
}

/// Set of partition addresses currently being written
#[derive(Debug, Clone, Default)]
struct LeaseRegistry(Arc<Mutex<BTreeSet<u32>>>);

impl LeaseRegistry {
    fn acquire(&self, partition: &PartitionDescriptor) -> Result<WriteLease, ResolveError> {
        let mut leased = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !leased.insert(partition.address()) {
            return Err(ResolveError::Busy(partition.label().to_string()));
        }

        debug!("Leased partition '{}'", partition.label());

        Ok(WriteLease {
            registry: self.clone(),
            address: partition.address(),
            label: partition.label().to_string(),
        })
    }

    fn contains(&self, address: u32) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&address)
    }
}

/// Exclusive write access to one partition, released on drop
#[derive(Debug)]
pub struct WriteLease {
    registry: LeaseRegistry,
    address: u32,
    label: String,
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        self.registry
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.address);
        debug!("Released partition '{}'", self.label);
    }
}

/// A resolved upload destination
#[derive(Debug)]
pub struct ImageTarget {
    partition: PartitionDescriptor,
    lease: WriteLease,
}

impl ImageTarget {
    pub fn partition(&self) -> &PartitionDescriptor {
        &self.partition
    }

    pub fn label(&self) -> &str {
        self.partition.label()
    }

    /// Close the write handle, keeping the partition description
    pub fn release(self) -> PartitionDescriptor {
        drop(self.lease);
        self.partition
    }
}

/// Maps upload requests to partitions
#[derive(Debug, Clone)]
pub struct TargetResolver {
    partitions: Vec<PartitionDescriptor>,
    running: Option<String>,
    allow_factory_write: bool,
    leases: LeaseRegistry,
}

impl TargetResolver {
    /// `running` is the label of the partition the device booted from
    pub fn new(partitions: Vec<PartitionDescriptor>, running: Option<String>) -> Self {
        if let Some(label) = &running {
            if !partitions.iter().any(|p| p.is_app() && p.label() == label) {
                warn!("Running partition '{}' is not in the partition table", label);
            }
        }

        Self {
            partitions,
            running,
            allow_factory_write: false,
            leases: LeaseRegistry::default(),
        }
    }

    /// Permit uploads into the factory partition
    pub fn with_factory_write(mut self, allow: bool) -> Self {
        self.allow_factory_write = allow;
        self
    }

    pub fn partitions(&self) -> &[PartitionDescriptor] {
        &self.partitions
    }

    pub fn find(&self, label: &str) -> Option<&PartitionDescriptor> {
        self.partitions.iter().find(|p| p.label() == label)
    }

    pub fn find_app(&self, label: &str) -> Option<&PartitionDescriptor> {
        self.partitions
            .iter()
            .find(|p| p.is_app() && p.label() == label)
    }

    pub fn find_data(&self, label: &str) -> Option<&PartitionDescriptor> {
        self.partitions
            .iter()
            .find(|p| p.kind() == PartitionKind::Data && p.label() == label)
    }

    pub fn running(&self) -> Option<&PartitionDescriptor> {
        self.running.as_deref().and_then(|label| self.find_app(label))
    }

    pub fn factory(&self) -> Option<&PartitionDescriptor> {
        self.partitions.iter().find(|p| p.is_factory())
    }

    pub fn otadata(&self) -> Option<&PartitionDescriptor> {
        self.partitions.iter().find(|p| p.is_otadata())
    }

    /// OTA application partitions, ordered by slot
    pub fn ota_slots(&self) -> Vec<&PartitionDescriptor> {
        let mut slots: Vec<_> = self
            .partitions
            .iter()
            .filter(|p| p.ota_slot().is_some())
            .collect();
        slots.sort_by_key(|p| p.ota_slot());
        slots
    }

    /// Whether an upload currently holds the partition
    pub fn is_leased(&self, partition: &PartitionDescriptor) -> bool {
        self.leases.contains(partition.address())
    }

    /// Work out which application partition an upload would go to, without
    /// reserving it
    pub fn peek(&self, explicit_name: Option<&str>) -> Result<&PartitionDescriptor, ResolveError> {
        match explicit_name {
            Some(name) => self
                .find_app(name)
                .ok_or_else(|| ResolveError::NotFound(name.to_string())),
            None => self.next_update_slot(),
        }
    }

    /// Resolve and reserve the application partition for an upload.
    ///
    /// With no explicit name the OTA slot following the running partition is
    /// chosen.
    pub fn resolve(&self, explicit_name: Option<&str>) -> Result<ImageTarget, ResolveError> {
        let partition = self.peek(explicit_name)?;

        if partition.is_factory() && !self.allow_factory_write {
            return Err(ResolveError::FactoryProtected(partition.label().to_string()));
        }
        if self.running.as_deref() == Some(partition.label()) {
            return Err(ResolveError::Running(partition.label().to_string()));
        }

        self.lease(partition)
    }

    /// Resolve and reserve a named data partition
    pub fn resolve_data(&self, name: &str) -> Result<ImageTarget, ResolveError> {
        let partition = self
            .find_data(name)
            .ok_or_else(|| ResolveError::NotFound(name.to_string()))?;

        self.lease(partition)
    }

    fn lease(&self, partition: &PartitionDescriptor) -> Result<ImageTarget, ResolveError> {
        let lease = self.leases.acquire(partition)?;

        Ok(ImageTarget {
            partition: partition.clone(),
            lease,
        })
    }

    fn next_update_slot(&self) -> Result<&PartitionDescriptor, ResolveError> {
        let slots = self.ota_slots();
        let running = self.running().ok_or(ResolveError::Unsupported)?;

        let next = match slots.iter().position(|p| p.label() == running.label()) {
            Some(index) => slots.get((index + 1) % slots.len()),
            None => slots.first(),
        };

        next.copied().ok_or(ResolveError::Unsupported)
    }
}

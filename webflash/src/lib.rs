//! Stream firmware and filesystem uploads into ESP flash partitions
//!
//! Uploads are fed to an [upload::UploadSession] chunk by chunk. The session
//! classifies the image from its first bytes, writes it page by page into
//! the partition picked by the [partition::TargetResolver], and finally
//! selects the new application for the next boot.
//!
//! ## As a library
//!
//! ```toml
//! webflash = { version = "0.1", default-features = false }
//! ```
//!
//! Disabling default features drops the dependencies of the command-line
//! front end.

pub mod boot;
pub mod error;
pub mod flash_target;
pub mod flasher;
pub mod image_format;
pub mod partition;
pub mod updater;
pub mod upload;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod config;
#[cfg(feature = "cli")]
pub mod logging;

pub use self::{
    error::Error,
    updater::{Updater, UpdaterConfig},
    upload::{BodyChunk, UploadResult, UploadSession},
};

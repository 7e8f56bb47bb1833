//! Command-line front end
//!
//! Runs the same upload sessions a web server would, against a flash image
//! file on the host. The file is read in `chunk_size` pieces so the session
//! sees the body the way a transport delivers it.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::{Args, ValueEnum};
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use miette::{bail, miette, IntoDiagnostic, Result, WrapErr};
use serde::Serialize;

use crate::{
    boot::{BootControl, OtaDataBoot},
    config::Config,
    error::Error,
    flash_target::{FileFlash, ProgressCallbacks},
    image_format::{Platform, UploadKind},
    partition::{read_partition_table, PartitionKind},
    updater::{FlashInfo, FlashInfoQuery, Updater},
    upload::BodyChunk,
};

/// Size of a newly created flash image
const DEFAULT_FLASH_SIZE: u32 = 0x40_0000;
const DEFAULT_FLASH_IMAGE: &str = "flash.bin";

/// Flash image and partition layout
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashArgs {
    /// Flash image file, created erased when missing
    #[arg(short = 'f', long, env = "WEBFLASH_FLASH")]
    pub flash: Option<PathBuf>,
    /// Size of a newly created flash image
    #[arg(long, value_parser = parse_u32, default_value_t = DEFAULT_FLASH_SIZE)]
    pub flash_size: u32,
    /// Partition table, CSV or binary
    #[arg(short = 'T', long)]
    pub partition_table: Option<PathBuf>,
    /// Partition the device is running from, by default the one selected
    /// for boot
    #[arg(long)]
    pub running: Option<String>,
    /// Device family
    #[arg(long)]
    pub platform: Option<String>,
}

/// Upload an image the way the web server receives it
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct UploadArgs {
    /// Image to upload
    pub image: PathBuf,
    /// Upload a filesystem image into a data partition
    #[arg(long)]
    pub filesystem: bool,
    /// Destination partition
    #[arg(short = 'p', long)]
    pub partition: Option<String>,
    /// Accept combined images tagged for another device
    #[arg(long)]
    pub force: bool,
    /// Bytes handed to the session per read
    #[arg(long)]
    pub chunk_size: Option<usize>,
    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
    #[command(flatten)]
    pub flash_args: FlashArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    App,
    Data,
}

/// Show the partitions and what they contain
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct InfoArgs {
    /// Only partitions of this kind
    #[arg(long, value_enum)]
    pub kind: Option<KindArg>,
    /// Only the partition with this name
    #[arg(long)]
    pub name: Option<String>,
    /// Verify application images
    #[arg(long)]
    pub verify: bool,
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
    #[command(flatten)]
    pub flash_args: FlashArgs,
}

/// Select the partition to boot next
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct SetBootArgs {
    /// Application partition; prints the current selection when omitted
    pub name: Option<String>,
    #[command(flatten)]
    pub flash_args: FlashArgs,
}

/// Erase a data partition
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct EraseDataArgs {
    /// Data partition to erase
    pub name: String,
    #[command(flatten)]
    pub flash_args: FlashArgs,
}

/// Flash image, boot selection and updater opened from the arguments
struct Device {
    flash: FileFlash,
    boot: OtaDataBoot,
    updater: Updater,
}

impl Device {
    fn open(args: &FlashArgs, config: &Config) -> Result<Self> {
        let mut config = config.clone();
        if let Some(platform) = &args.platform {
            config.platform =
                Platform::from_str(platform).map_err(|_| Error::InvalidPlatform(platform.clone()))?;
        }

        let table = args
            .partition_table
            .as_deref()
            .or(config.partition_table.as_deref())
            .ok_or_else(|| {
                miette!(
                    help = "Pass `--partition-table` or set `partition_table` in webflash.toml",
                    "No partition table given"
                )
            })?;
        let partitions = read_partition_table(table)
            .wrap_err_with(|| format!("Failed to read partition table {}", table.display()))?;

        let path = args
            .flash
            .clone()
            .or(config.flash.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FLASH_IMAGE));
        let mut flash = FileFlash::open_or_create(&path, args.flash_size)?;

        let boot = OtaDataBoot::new(&partitions)?;
        let running = match args.running.clone().or(config.running.clone()) {
            Some(running) => Some(running),
            None => boot
                .boot_target(&mut flash)?
                .map(|p| p.label().to_string()),
        };
        debug!("Running partition: {:?}", running);

        Ok(Self {
            flash,
            boot,
            updater: Updater::new(config.updater_config(), partitions, running),
        })
    }
}

/// Upload an image through a session
pub fn upload(args: UploadArgs, config: &Config) -> Result<()> {
    let mut device = Device::open(&args.flash_args, config)?;
    let body = read_image(&args.image)?;

    let mut params = HashMap::new();
    if let Some(partition) = args.partition {
        params.insert("partition".to_string(), partition);
    }
    if args.force {
        params.insert("force".to_string(), "1".to_string());
    }

    let route = if args.filesystem {
        UploadKind::Filesystem
    } else {
        UploadKind::Firmware
    };

    let mut session = device
        .updater
        .begin_upload(route, &params)?
        .with_progress(Box::new(WebflashProgress::default()));

    let chunk_size = args.chunk_size.unwrap_or(config.chunk_size);
    info!(
        "Uploading {} ({} bytes) in chunks of {}",
        args.image.display(),
        body.len(),
        chunk_size
    );

    let mut result = None;
    for chunk in BodyChunk::split(&body, chunk_size) {
        if let Some(r) = session.on_chunk(&mut device.flash, &mut device.boot, chunk) {
            result = Some(r);
        }
    }
    let result = result.ok_or_else(|| miette!("The upload produced no result"))?;

    if args.json {
        print_json(&result)?;
    } else {
        println!("{}: {}", result.target_label, result.message);
    }

    if !result.success {
        bail!("Upload to '{}' failed", result.target_label);
    }

    Ok(())
}

/// Print the partitions and their contents
pub fn info(args: InfoArgs, config: &Config) -> Result<()> {
    let mut device = Device::open(&args.flash_args, config)?;

    let query = FlashInfoQuery {
        kind: args.kind.map(|kind| match kind {
            KindArg::App => PartitionKind::App,
            KindArg::Data => PartitionKind::Data,
        }),
        name: args.name,
        verify: args.verify,
    };
    let info = device
        .updater
        .flash_info(&mut device.flash, &device.boot, &query)?;

    if args.json {
        print_json(&info)
    } else {
        pretty_print(&info);
        Ok(())
    }
}

/// Change or show the boot selection
pub fn set_boot(args: SetBootArgs, config: &Config) -> Result<()> {
    let mut device = Device::open(&args.flash_args, config)?;

    let selection = device.updater.set_boot(
        &mut device.flash,
        &mut device.boot,
        args.name.as_deref(),
    )?;
    print_json(&selection)?;

    if !selection.success {
        bail!("'{}' is still selected for boot", selection.boot);
    }

    Ok(())
}

/// Erase a data partition
pub fn erase_data(args: EraseDataArgs, config: &Config) -> Result<()> {
    let mut device = Device::open(&args.flash_args, config)?;

    let partition = device
        .updater
        .erase_data_partition(&mut device.flash, &args.name)?;
    println!("Erased {partition}");

    Ok(())
}

/// Print which half of a combined image the next upload writes
pub fn next_firmware(args: FlashArgs, config: &Config) -> Result<()> {
    let device = Device::open(&args, config)?;
    println!("{}", device.updater.next_firmware_name());

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .map_err(|e| Error::FileOpenError(path.display().to_string(), e))
        .wrap_err("Failed to read the image")
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    println!("{json}");

    Ok(())
}

fn parse_u32(input: &str) -> Result<u32, std::num::ParseIntError> {
    match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    }
}

fn header(name: &str, color: Color) -> Cell {
    Cell::new(name).fg(color).add_attribute(Attribute::Bold)
}

fn flag(set: bool) -> &'static str {
    if set {
        "*"
    } else {
        ""
    }
}

/// Render flash info as tables
pub fn pretty_print(info: &FlashInfo) {
    if !info.app.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
            .set_header(vec![
                header("Name", Color::Green),
                header("Size", Color::Yellow),
                header("Version", Color::Cyan),
                header("Project", Color::Magenta),
                header("OTA", Color::Red),
                header("Running", Color::DarkCyan),
                header("Boot", Color::DarkCyan),
                header("Valid", Color::DarkCyan),
            ]);

        for app in &info.app {
            table.add_row(vec![
                Cell::new(&app.name).fg(Color::Green),
                Cell::new(format!("{:#x} ({}KiB)", app.size, app.size / 1024)).fg(Color::Yellow),
                Cell::new(app.version.as_deref().unwrap_or_default()).fg(Color::Cyan),
                Cell::new(app.project.as_deref().unwrap_or_default()).fg(Color::Magenta),
                Cell::new(flag(app.ota)).fg(Color::Red),
                Cell::new(flag(app.running)),
                Cell::new(flag(app.bootset)),
                Cell::new(match app.valid {
                    Some(true) => "yes",
                    Some(false) => "no",
                    None => "",
                }),
            ]);
        }
        println!("{table}");
    }

    if !info.data.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
            .set_header(vec![
                header("Name", Color::Green),
                header("Size", Color::Yellow),
                header("Format", Color::Magenta),
            ]);

        for data in &info.data {
            table.add_row(vec![
                Cell::new(&data.name).fg(Color::Green),
                Cell::new(format!("{:#x} ({}KiB)", data.size, data.size / 1024)).fg(Color::Yellow),
                Cell::new(format!("{:#04x}", data.format)).fg(Color::Magenta),
            ]);
        }
        println!("{table}");
    }
}

/// Progress bar shown while an image is written
#[derive(Default)]
pub struct WebflashProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for WebflashProgress {
    fn init(&mut self, addr: u32, len: usize) {
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let pb = ProgressBar::new(len as u64)
            .with_message(format!("{addr:#X}"))
            .with_style(style);

        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(ref pb) = self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(ref pb) = self.pb {
            pb.finish();
        }
    }
}

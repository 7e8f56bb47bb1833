use clap::{Parser, Subcommand};
use log::{debug, LevelFilter};
use miette::Result;
use webflash::{
    cli::{self, EraseDataArgs, FlashArgs, InfoArgs, SetBootArgs, UploadArgs},
    config::Config,
    logging::initialize_logger,
};

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stream an image into its partition and select it for boot
    Upload(UploadArgs),
    /// Show the partitions, their images and the boot selection
    Info(InfoArgs),
    /// Select the application partition to boot next
    SetBoot(SetBootArgs),
    /// Erase a data partition
    EraseData(EraseDataArgs),
    /// Print which half of a combined image the next upload needs
    Next(FlashArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let args = Cli::parse().subcommand;
    debug!("{:#?}", args);

    // Load any user configuration, if present.
    let config = Config::load()?;

    match args {
        Commands::Upload(args) => cli::upload(args, &config),
        Commands::Info(args) => cli::info(args, &config),
        Commands::SetBoot(args) => cli::set_boot(args, &config),
        Commands::EraseData(args) => cli::erase_data(args, &config),
        Commands::Next(args) => cli::next_firmware(args, &config),
    }
}

use std::path::PathBuf;

use structopt::StructOpt;
use xteink::FirmwareKey;

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Identify the firmware family and version of a binary
    Identify {
        /// The firmware binary to inspect
        #[structopt(required = true)]
        filename: PathBuf,
        /// Print the result as JSON
        #[structopt(long = "json")]
        json: bool,
    },
    /// Read the full device flash into a file
    Save {
        /// The name of the file to save the contents to
        #[structopt(short = "o", long = "output", default_value = "flash.bin")]
        output: PathBuf,
    },
    /// Write a full flash image from a file
    Write {
        /// The name of the file to read from
        filename: Option<PathBuf>,
    },
    /// Download an official firmware and install it over OTA
    Ota {
        /// The firmware release to install
        #[structopt(short = "f", long = "firmware", default_value = "3.1.0-EN")]
        firmware: FirmwareKey,
    },
    /// Download the official English firmware and install it over OTA
    FlashEnglish,
    /// Download an official firmware without flashing it
    Fetch {
        /// The firmware release to download
        #[structopt(short = "f", long = "firmware", required = true)]
        firmware: FirmwareKey,
        /// The name of the file to save the firmware to
        #[structopt(short = "o", long = "output")]
        output: Option<PathBuf>,
    },
}

#[derive(StructOpt, Debug)]
#[structopt(about = "Identify and flash firmware of Xteink e-ink readers")]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// The flash image backing the device
    #[structopt(
        env = "XTEINK_DEVICE",
        short = "d",
        long = "device",
        default_value = "device.bin"
    )]
    pub device: PathBuf,
    /// Timeout of a single device operation, in seconds
    #[structopt(env = "XTEINK_TIMEOUT", short = "t", long = "timeout", default_value = "10")]
    pub timeout: u64,
    /// Number of bytes transferred per device operation
    #[structopt(env = "XTEINK_CHUNK_SIZE", long = "chunk-size", default_value = "16384")]
    pub chunk_size: usize,
    /// Do not erase the flash before a full write
    #[structopt(long = "no-erase")]
    pub no_erase: bool,
    /// Do not read the flash back after a full write
    #[structopt(long = "no-verify")]
    pub no_verify: bool,
    /// Log debug output
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}

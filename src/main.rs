use std::env;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{info, warn, LevelFilter};
use structopt::StructOpt;

use xteink::firmware::image::ImageHeader;
use xteink::flash::{StepStatus, WorkflowRun};
use xteink::transport::{EmulatedDevice, EmulatedDeviceConfig};
use xteink::{
    identify_firmware, is_identification_successful, ErasePolicy, FirmwareBinary, FirmwareFetcher,
    FirmwareKey, FlashConfig, HttpFetcher, Orchestrator,
};

mod cli;

type Flasher = Orchestrator<EmulatedDevice, HttpFetcher>;

/// Number of ticks of a step progress bar
const BAR_LENGTH: u64 = 1000;

/// Renders the steps of a run as one progress bar each.
struct StepBars {
    multi: MultiProgress,
    bars: Vec<ProgressBar>,
}

impl StepBars {
    fn new() -> StepBars {
        StepBars {
            multi: MultiProgress::new(),
            bars: Vec::new(),
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
    }

    fn render(&mut self, run: &WorkflowRun) {
        if self.bars.len() != run.steps.len() {
            self.bars = run
                .steps
                .iter()
                .map(|step| {
                    let bar = self.multi.add(ProgressBar::new(BAR_LENGTH));
                    bar.set_style(StepBars::style());
                    bar.set_message(step.label);
                    bar
                })
                .collect();
        }

        for (bar, step) in self.bars.iter().zip(&run.steps) {
            if bar.is_finished() {
                continue;
            }

            match step.status {
                StepStatus::Pending => {}
                StepStatus::Running => match step.progress.fraction() {
                    Some(fraction) => bar.set_position((fraction * BAR_LENGTH as f32) as u64),
                    None => bar.tick(),
                },
                StepStatus::Succeeded => {
                    bar.set_position(BAR_LENGTH);
                    bar.finish_with_message(format!("{} - done", step.label));
                }
                StepStatus::Skipped => bar.abandon_with_message(format!("{} - skipped", step.label)),
                StepStatus::Failed => {
                    let reason = step
                        .error
                        .as_ref()
                        .map(|err| err.to_string())
                        .unwrap_or_default();

                    bar.abandon_with_message(format!("{} - failed: {}", step.label, reason));
                }
            }
        }
    }
}

/// Runs `operation` while rendering its progress, cancelling it on Ctrl-C.
async fn drive<R, Fut>(orchestrator: &Flasher, operation: Fut) -> Result<R, xteink::Error>
where
    Fut: Future<Output = Result<R, xteink::Error>>,
{
    let mut updates = orchestrator.subscribe();
    let mut bars = StepBars::new();

    tokio::pin!(operation);

    loop {
        tokio::select! {
            result = &mut operation => {
                bars.render(&updates.borrow_and_update());
                return result;
            }
            changed = updates.changed() => {
                if changed.is_ok() {
                    bars.render(&updates.borrow_and_update());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling the running operation");
                orchestrator.cancel();
            }
        }
    }
}

fn init_logger(verbose: bool) {
    // Log with a timestamp at Info level or above unless RUST_LOG says otherwise
    let mut builder = pretty_env_logger::formatted_timed_builder();

    match env::var("RUST_LOG") {
        Ok(filters) => {
            builder.parse_filters(&filters);
        }
        Err(_) => {
            builder.filter_level(LevelFilter::Info);
        }
    }

    if verbose {
        builder.filter_module("xteink", LevelFilter::Debug);
    }

    builder.init();
}

fn flash_config(opts: &cli::Opts) -> FlashConfig {
    let erase_policy = if opts.no_erase {
        ErasePolicy::Skip
    } else {
        ErasePolicy::EraseBeforeWrite
    };

    FlashConfig::default()
        .with_io_timeout(Duration::from_secs(opts.timeout))
        .with_chunk_size(opts.chunk_size)
        .with_erase_policy(erase_policy)
        .with_verify_after_write(!opts.no_verify)
}

fn open_device(path: &Path, config: FlashConfig) -> Result<Flasher, anyhow::Error> {
    let device = EmulatedDevice::load(path, EmulatedDeviceConfig::default())
        .with_context(|| format!("Failed to open device image '{}'", path.display()))?;

    Ok(Orchestrator::new(device, HttpFetcher::new(), config))
}

fn persist_device(orchestrator: Flasher, path: &Path) -> Result<(), anyhow::Error> {
    orchestrator
        .into_transport()
        .persist(path)
        .with_context(|| format!("Failed to save device image '{}'", path.display()))
}

fn identify(filename: &Path, json: bool) -> Result<(), anyhow::Error> {
    let data = fs::read(filename)
        .with_context(|| format!("Failed to read firmware file '{}'", filename.display()))?;
    let firmware = FirmwareBinary::new(data);
    let info = identify_firmware(&firmware);

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Firmware: {}", info.display_name);
    println!("Version:  {}", info.version);
    println!("Size:     {} bytes", firmware.len());
    println!("SHA-256:  {}", firmware.sha256());

    match ImageHeader::parse(&firmware) {
        Ok(header) => println!("Header:   {}", header),
        Err(_) => println!("Header:   none"),
    }

    if !is_identification_successful(&info) {
        println!("The firmware could not be identified");
    }

    Ok(())
}

async fn fetch(key: FirmwareKey, output: Option<PathBuf>, limit: Duration) -> Result<(), anyhow::Error> {
    let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.bin", key)));

    let firmware = tokio::time::timeout(limit, HttpFetcher::new().fetch(key))
        .await
        .with_context(|| format!("Download of {} timed out", key))?
        .with_context(|| format!("Failed to download {}", key))?;

    let info = identify_firmware(&firmware);
    println!(
        "Downloaded {} ({} bytes, {} {})",
        key,
        firmware.len(),
        info.display_name,
        info.version
    );

    fs::write(&output, firmware.as_bytes())
        .with_context(|| format!("Failed to write '{}'", output.display()))?;

    println!("Saved to {}", output.display());

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    use cli::Command;

    // Parse the command-line arguments
    let opts = cli::Opts::from_args();

    init_logger(opts.verbose);

    let config = flash_config(&opts);

    match &opts.command {
        Command::Identify { filename, json } => identify(filename, *json)?,
        Command::Fetch { firmware, output } => {
            fetch(*firmware, output.clone(), config.fetch_timeout).await?
        }
        Command::Save { output } => {
            let orchestrator = open_device(&opts.device, config)?;
            let image = drive(&orchestrator, orchestrator.save_full_flash()).await?;

            fs::write(output, image.as_bytes())
                .with_context(|| format!("Failed to write '{}'", output.display()))?;

            println!("Saved {} bytes to {}", image.len(), output.display());
            println!("SHA-256: {}", image.sha256());
        }
        Command::Write { filename } => {
            let image = match filename {
                Some(path) => Some(fs::read(path).with_context(|| {
                    format!("Failed to read flash image '{}'", path.display())
                })?),
                None => None,
            };

            let orchestrator = open_device(&opts.device, config)?;
            let result = drive(
                &orchestrator,
                orchestrator.write_full_flash(move || image.map(FirmwareBinary::new)),
            )
            .await;

            // Whatever was erased or written before a failure stays on the device
            persist_device(orchestrator, &opts.device)?;
            result?;

            println!("Flash written");
        }
        Command::Ota { firmware } => {
            let orchestrator = open_device(&opts.device, config)?;
            let result = drive(&orchestrator, orchestrator.flash_official_firmware(*firmware)).await;

            persist_device(orchestrator, &opts.device)?;
            let info = result?;

            println!("Installed {} {}", info.display_name, info.version);
        }
        Command::FlashEnglish => {
            let orchestrator = open_device(&opts.device, config)?;
            let result = drive(&orchestrator, orchestrator.flash_english_firmware()).await;

            persist_device(orchestrator, &opts.device)?;
            let info = result?;

            println!("Installed {} {}", info.display_name, info.version);
        }
    }

    info!("Done");

    Ok(())
}

mod logger;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use imgr_core::cancel::CancelToken;
use imgr_core::config::Settings;
use imgr_core::device::Device;
use imgr_core::escalation::{Escalation, next_step};
use imgr_core::metadata::DescriptiveFields;
use imgr_core::method::CopyMethod;
use imgr_core::orchestrator::{Orchestrator, RunReport};
use imgr_core::output::{OutputPlan, discard_previous, plan};
use imgr_core::probe::{DeviceProbe, SystemProbe, TrayStatus};
use imgr_core::request::{AcquisitionRequest, MediaKind};
use imgr_core::tools;
use imgr_core::validator::IsolyzerValidator;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdin};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "imgr")]
#[command(about = "Image disks and optical media to archival files", version)]
struct Cli {
    /// Settings file (default: ~/.config/imgr/imgr.json, then /etc/imgr/imgr.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Image a device into an output directory
    Image(ImageArgs),
    /// List block devices
    List,
    /// Show the tray status of an optical drive
    Tray {
        /// Optical drive (default: the configured one)
        device: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ImageArgs {
    /// Output directory (default: the configured one)
    output_dir: Option<PathBuf>,

    /// Source device; asks when omitted
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// The source is an optical disc
    #[arg(long)]
    optical: bool,

    /// Copy tool: dd, ddrescue or readom
    #[arg(short, long)]
    method: Option<CopyMethod>,

    #[arg(short, long)]
    block_size: Option<u32>,

    /// Maximum number of read retries
    #[arg(short, long)]
    retries: Option<u32>,

    /// Image file name prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Image file extension
    #[arg(long)]
    extension: Option<String>,

    /// Use direct disc access (ddrescue only)
    #[arg(long)]
    direct_disc: bool,

    /// Retry with ddrescue right away if the copy fails
    #[arg(long)]
    auto_retry: bool,

    #[arg(long)]
    identifier: Option<String>,

    /// Use a freshly generated UUID as identifier
    #[arg(long, conflicts_with = "identifier")]
    uuid: bool,

    #[arg(long)]
    description: Option<String>,

    #[arg(long)]
    notes: Option<String>,

    /// Take identifier, description and notes from an earlier metadata file
    #[arg(long)]
    metadata_from: Option<PathBuf>,

    /// IANA time zone for the acquisition timestamps
    #[arg(long)]
    time_zone: Option<String>,

    /// Kill the copy tool after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Image optical discs without validating them with isolyzer
    #[arg(long)]
    no_validate: bool,

    /// Don't ask before overwriting earlier output
    #[arg(short, long)]
    yes: bool,
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No block devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a "Yes/No" confirmation to the user. Without a terminal the
/// answer is no.
fn confirm_operation(prompt: &str) -> Result<bool> {
    if !stdin().is_terminal() {
        return Ok(false);
    }

    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Builds the first request of a session from settings and flags.
fn build_request(args: &ImageArgs, settings: &Settings) -> Result<AcquisitionRequest> {
    let media = if args.optical {
        MediaKind::Optical
    } else {
        MediaKind::Disk
    };

    let device = match (&args.device, media) {
        (Some(device), _) => device.clone(),
        (None, MediaKind::Optical) => PathBuf::from(&settings.optical_device),
        (None, MediaKind::Disk) => {
            let devices = imgr_core::platform::list_block_devices()?;
            select_device(&devices, "Select the source device to image")?.path
        }
    };

    let output_dir = match &args.output_dir {
        Some(dir) => dir.clone(),
        None if !settings.default_dir.is_empty() => PathBuf::from(&settings.default_dir),
        None => bail!("No output directory given and none configured."),
    };

    let mut request = settings.request(device, output_dir, media);

    if media == MediaKind::Optical {
        request.method = CopyMethod::OpticalCopy;
        request.extension = "iso".into();
    }
    if let Some(method) = args.method {
        request.method = method;
    }
    if let Some(block_size) = args.block_size {
        request.block_size = block_size;
    }
    if let Some(retries) = args.retries {
        request.max_retries = retries;
    }
    if let Some(prefix) = &args.prefix {
        request.prefix = prefix.clone();
    }
    if let Some(extension) = &args.extension {
        request.extension = extension.clone();
    }
    if let Some(tz) = &args.time_zone {
        request.time_zone = tz.clone();
    }
    request.rescue_direct_mode |= args.direct_disc;
    request.auto_retry |= args.auto_retry;

    if let Some(path) = &args.metadata_from {
        let fields = DescriptiveFields::read(path)
            .with_context(|| format!("cannot import metadata from {}", path.display()))?;
        request.identifier = fields.identifier;
        request.description = fields.description;
        request.notes = fields.notes;
    }
    if args.uuid {
        request.identifier = uuid::Uuid::new_v4().to_string();
    }
    if let Some(identifier) = &args.identifier {
        request.identifier = identifier.clone();
    }
    if let Some(description) = &args.description {
        request.description = description.clone();
    }
    if let Some(notes) = &args.notes {
        request.notes = notes.clone();
    }

    Ok(request)
}

/// Clears the way for `request` according to what earlier runs left behind.
/// Returns false if the user declined to overwrite.
fn prepare_output(request: &AcquisitionRequest, assume_yes: bool) -> Result<bool> {
    match plan(request) {
        OutputPlan::Fresh => {}
        OutputPlan::ConfirmOverwrite => {
            if !assume_yes
                && !confirm_operation("The output directory holds an earlier image. Overwrite it?")?
            {
                return Ok(false);
            }
            discard_previous(request, true)?;
        }
        OutputPlan::ReplaceUnresumable => discard_previous(request, false)?,
        OutputPlan::Resume => {
            println!(
                "{} Resuming from {}.",
                style("NOTE:").yellow().bold(),
                style(request.paths().map.display()).cyan()
            );
        }
    }
    Ok(true)
}

fn spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_prefix("Imaging");
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {wide_msg}")?
            .tick_strings(&["■  ", " ■ ", "  ■", " ■ ", "■■■"]),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

/// Runs one acquisition on a worker thread while the spinner shows the
/// copy tool's latest output line.
fn run_once(
    orchestrator: &Orchestrator,
    request: &AcquisitionRequest,
    cancel: &CancelToken,
) -> Result<RunReport> {
    let pb = spinner()?;

    let result = thread::scope(|scope| {
        let line_pb = pb.clone();
        let worker = scope.spawn(move || {
            orchestrator.run(request, cancel, |line| line_pb.set_message(line.to_string()))
        });
        worker.join()
    });

    match result {
        Ok(Ok(report)) => {
            let message = if report.success {
                style("Done.").green().to_string()
            } else {
                style("Finished with errors.").red().to_string()
            };
            pb.finish_with_message(message);
            Ok(report)
        }
        Ok(Err(errors)) => {
            pb.finish_and_clear();
            eprintln!("{}", style("Cannot start imaging:").red().bold());
            for failure in errors.failures() {
                eprintln!("  - {failure}");
            }
            Err(errors.into())
        }
        Err(_) => {
            pb.finish_with_message(style("❌ Operation failed.").red().to_string());
            Err(anyhow!("acquisition worker panicked"))
        }
    }
}

fn print_summary(orchestrator: &Orchestrator, request: &AcquisitionRequest) {
    let program = orchestrator.tools().copy_program(request.method);
    let location = tools::resolve(program)
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "not installed".into());

    println!("This will image '{}'.", request.device.display());
    println!("  Method: {} ({location})", style(request.method).cyan());
    println!("  Output: {}", style(request.paths().image.display()).cyan());
    if !request.identifier.is_empty() {
        println!("  Identifier: {}", style(&request.identifier).cyan());
    }
    println!();
}

fn print_report(report: &RunReport) {
    println!();
    for (file, digest) in report.checksums.entries() {
        println!("  {}  {}", style(&digest[..16]).dim(), file);
    }
    if let Some(verdict) = report.validator {
        println!(
            "  Image validation: {}, truncated: {}",
            verdict.success, verdict.size_anomaly_detected
        );
    }
    println!(
        "  Metadata: {}{}",
        style(report.paths.metadata.display()).cyan(),
        if report.metadata_written {
            ""
        } else {
            " (not written)"
        }
    );
}

fn image(args: ImageArgs, settings: Settings, verbose: bool) -> Result<()> {
    let mut request = build_request(&args, &settings)?;

    let log_file = request
        .output_dir
        .is_dir()
        .then(|| request.paths().log);
    logger::init(verbose, log_file.as_deref())?;

    let mut orchestrator = Orchestrator::new();
    if let Some(secs) = args.timeout.or(settings.timeout_secs) {
        orchestrator = orchestrator.with_deadline(Duration::from_secs(secs));
    }
    if request.media == MediaKind::Optical {
        if args.no_validate {
            warn!("image validation disabled, isolyzer will not be run");
        } else {
            // Refused up front by the orchestrator if isolyzer is missing.
            orchestrator = orchestrator.with_validator(IsolyzerValidator::default());
        }
    }

    // Shared with the Ctrl+C handler; the supervisor takes each request once.
    let cancel = CancelToken::new();
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        c.request();
    })?;

    print_summary(&orchestrator, &request);
    if !args.yes && stdin().is_terminal() && !confirm_operation("Start imaging?")? {
        println!("Imaging cancelled.");
        return Ok(());
    }

    loop {
        // Drop a Ctrl+C that arrived after the previous run had finished.
        cancel.take();

        if !prepare_output(&request, args.yes)? {
            println!("Imaging cancelled.");
            return Ok(());
        }

        info!("starting {} run on {}", request.method, request.device.display());
        let report = run_once(&orchestrator, &request, &cancel)?;
        print_report(&report);

        match next_step(&request, &report) {
            Escalation::Done => {
                println!(
                    "\n✨ Successfully imaged {} to {}.",
                    style(request.device.display()).cyan(),
                    style(request.output_dir.display()).cyan()
                );
                return Ok(());
            }
            Escalation::Stop => {
                let reason = if report.timed_out {
                    "timed out"
                } else {
                    "interrupted"
                };
                bail!("Imaging {reason}.");
            }
            Escalation::Retry(next) => {
                println!(
                    "\n{} Retrying with {}.",
                    style("NOTE:").yellow().bold(),
                    style(next.method).cyan()
                );
                request = next;
            }
            Escalation::Offer { request: next, prompt } => {
                if !confirm_operation(prompt)? {
                    bail!("Medium was not imaged without errors.");
                }
                request = next;
            }
        }
    }
}

fn describe_tray(status: TrayStatus) -> &'static str {
    match status {
        TrayStatus::NoInfo => "no information",
        TrayStatus::NoDisc => "no disc",
        TrayStatus::Open => "tray open",
        TrayStatus::Reading => "not ready",
        TrayStatus::DiscPresent => "disc present",
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Image(args) => image(args, settings, cli.verbose)?,
        Commands::List => {
            logger::init(cli.verbose, None)?;
            let devices = imgr_core::platform::list_block_devices()?;
            if devices.is_empty() {
                println!("No block devices found.");
                return Ok(());
            }

            println!("Found {} block devices:", devices.len());
            println!("\n  {:<14} {:<10} {:>10}  {}", "DEVICE", "NAME", "SIZE", "LOCATION");
            println!("  {:-<14} {:-<10} {:-<10}  {:-<20}", "", "", "", "");
            for device in devices {
                let location = if device.mount_point.is_empty() {
                    "(Not mounted)".to_string()
                } else {
                    device.mount_point.clone()
                };
                println!(
                    "  {:<14} {:<10} {:>10}  {}",
                    device.path.display(),
                    device.name,
                    device.human_size(),
                    location
                );
            }
        }
        Commands::Tray { device } => {
            logger::init(cli.verbose, None)?;
            let device = device.unwrap_or_else(|| PathBuf::from(&settings.optical_device));
            let status = SystemProbe::new().tray_status(&device)?;
            println!(
                "{}: {}",
                device.display(),
                style(describe_tray(status)).cyan()
            );
        }
    }

    Ok(())
}

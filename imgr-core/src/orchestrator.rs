//! The acquisition state machine.
//!
//! One call to [`Orchestrator::run`] is one pass through
//! `Validating → Unmounting → Copying → ValidatingImage? → Checksumming →
//! WritingMetadata → Done`. Phases only move forward. A failed step does not
//! cut the run short: a partial image is still checksummed and described,
//! and only the success flag records what went wrong. Whether to try again,
//! and how, is decided by the caller (see [`crate::escalation`]).
use crate::cancel::CancelToken;
use crate::checksum::{CHECKSUM_TYPE, ChecksumSet, checksum_directory};
use crate::error::{ValidationErrors, ValidationFailure};
use crate::metadata::{MetadataRecord, parse_time_zone, timestamp};
use crate::method::CopyMethod;
use crate::probe::{DeviceProbe, SystemProbe, TrayStatus};
use crate::request::{AcquisitionRequest, MediaKind, RunPaths};
use crate::supervisor::{ProcessOutcome, ProcessSupervisor};
use crate::tools::{self, ToolPaths};
use crate::validator::{ImageValidator, ValidatorVerdict, validate_fail_closed};
use nix::unistd::{AccessFlags, access};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Version recorded in the metadata.
pub const IMGR_VERSION: &str = env!("CARGO_PKG_VERSION");

const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Validating,
    Unmounting,
    Copying,
    ValidatingImage,
    Checksumming,
    WritingMetadata,
    Done,
}

/// Mutable state of one run, owned by the orchestrator while it runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub paths: RunPaths,
    phase: Phase,
    pub read_error: bool,
    pub interrupted: bool,
    pub timed_out: bool,
    pub validator: Option<ValidatorVerdict>,
    pub success: bool,
}

impl RunContext {
    fn new(paths: RunPaths) -> Self {
        Self {
            paths,
            phase: Phase::Validating,
            read_error: false,
            interrupted: false,
            timed_out: false,
            validator: None,
            success: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, next: Phase) {
        debug_assert!(next > self.phase, "phase {next:?} after {:?}", self.phase);
        debug!("phase {:?} -> {next:?}", self.phase);
        self.phase = next;
    }
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub success: bool,
    pub read_error: bool,
    pub interrupted: bool,
    pub timed_out: bool,
    pub outcome: ProcessOutcome,
    pub validator: Option<ValidatorVerdict>,
    pub checksums: ChecksumSet,
    pub metadata: MetadataRecord,
    pub metadata_written: bool,
    pub paths: RunPaths,
}

/// Overall success of the copy step: a clean exit with no error markers,
/// no cancellation, no timeout, and, when validated, a complete image.
pub fn copy_succeeded(outcome: &ProcessOutcome, verdict: Option<ValidatorVerdict>) -> bool {
    outcome.is_clean() && verdict.is_none_or(|v| v.is_complete())
}

/// Drives acquisition runs.
pub struct Orchestrator {
    probe: Box<dyn DeviceProbe>,
    tools: ToolPaths,
    validator: Option<Box<dyn ImageValidator>>,
    supervisor: ProcessSupervisor,
    settle: Duration,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            probe: Box::new(SystemProbe::new()),
            tools: ToolPaths::default(),
            validator: None,
            supervisor: ProcessSupervisor::new(),
            settle: Duration::from_secs(2),
        }
    }

    pub fn with_probe(mut self, probe: impl DeviceProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_tools(mut self, tools: ToolPaths) -> Self {
        self.tools = tools;
        self
    }

    /// Validates every image after the copy.
    pub fn with_validator(mut self, validator: impl ImageValidator + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Kills a copy tool that is still running after `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.supervisor = ProcessSupervisor::with_deadline(deadline);
        self
    }

    /// How long to wait, at most, for the device to become free again after
    /// a run.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn probe(&self) -> &dyn DeviceProbe {
        self.probe.as_ref()
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    /// Checks everything that can be checked before anything is touched.
    /// All failures are collected.
    pub fn validate(&self, request: &AcquisitionRequest) -> Result<(), ValidationErrors> {
        let mut failures = Vec::new();
        let dir = &request.output_dir;

        let dir_ok = if !dir.is_dir() {
            failures.push(ValidationFailure::OutputDirMissing(dir.clone()));
            false
        } else if access(dir.as_path(), AccessFlags::W_OK | AccessFlags::X_OK).is_err() {
            failures.push(ValidationFailure::OutputDirNotWritable(dir.clone()));
            false
        } else {
            true
        };

        let device = &request.device;
        if !self.probe.exists(device) {
            failures.push(ValidationFailure::DeviceMissing(device.clone()));
        } else {
            if !self.probe.is_accessible(device) {
                failures.push(ValidationFailure::DeviceInaccessible(device.clone()));
            }

            match request.media {
                MediaKind::Optical => match self.probe.tray_status(device) {
                    Ok(TrayStatus::DiscPresent) => {}
                    Ok(status) => {
                        debug!("tray status of {}: {status:?}", device.display());
                        failures.push(ValidationFailure::NoDiscInTray(device.clone()));
                    }
                    Err(e) => {
                        warn!("cannot query tray of {}: {e}", device.display());
                        failures.push(ValidationFailure::NoDiscInTray(device.clone()));
                    }
                },
                MediaKind::Disk if dir_ok => self.check_space(device, dir, &mut failures),
                MediaKind::Disk => {}
            }
        }

        let mut required = vec![request.method];
        if request.auto_retry && request.method != CopyMethod::RescueCopy {
            required.push(CopyMethod::RescueCopy);
        }
        for method in required {
            if !tools::is_installed(self.tools.copy_program(method)) {
                failures.push(ValidationFailure::ToolMissing(method.tool().to_string()));
            }
        }
        if let Some(validator) = &self.validator {
            if !validator.is_available() {
                failures.push(ValidationFailure::ToolMissing(validator.name().to_string()));
            }
        }

        if parse_time_zone(&request.time_zone).is_err() {
            failures.push(ValidationFailure::InvalidTimeZone(request.time_zone.clone()));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(failures))
        }
    }

    fn check_space(&self, device: &Path, dir: &Path, failures: &mut Vec<ValidationFailure>) {
        let size = self.probe.size_bytes(device);
        let available = self.probe.available_space(dir);
        match (size, available) {
            (Ok(device_bytes), Ok(available_bytes)) if device_bytes >= available_bytes => {
                failures.push(ValidationFailure::InsufficientSpace {
                    device_bytes,
                    available_bytes,
                });
            }
            (Ok(_), Ok(_)) => {}
            (Err(e), _) | (_, Err(e)) => warn!("skipping free space check: {e}"),
        }
    }

    /// Performs one acquisition run.
    ///
    /// `cancel` may be triggered from any thread while the copy runs. Every
    /// tidied output line of the copy tool is passed to `on_line` as it
    /// arrives.
    ///
    /// # Errors
    ///
    /// Only validation failures are returned as errors, and only before
    /// anything has been touched. Everything that goes wrong later is
    /// reported through [`RunReport::success`] and the log.
    pub fn run<F>(
        &self,
        request: &AcquisitionRequest,
        cancel: &CancelToken,
        on_line: F,
    ) -> Result<RunReport, ValidationErrors>
    where
        F: FnMut(&str),
    {
        self.validate(request)?;
        let tz = parse_time_zone(&request.time_zone).map_err(|_| {
            ValidationErrors(vec![ValidationFailure::InvalidTimeZone(
                request.time_zone.clone(),
            )])
        })?;

        let mut ctx = RunContext::new(request.paths());
        log_request(request);
        let acquisition_start = timestamp(tz);

        ctx.enter(Phase::Unmounting);
        info!("*** Unmounting medium ***");
        tools::unmount(&self.tools.umount, &request.device);

        ctx.enter(Phase::Copying);
        info!("*** Starting image acquisition ***");
        let method = request.method;
        let program = self.tools.copy_program(method);
        let tool_version = tools::version_string(program, method.tool());
        let argv = method.build_args(program, request, &ctx.paths);

        let outcome = self
            .supervisor
            .run(&argv, method.watched_stream(), method.classifier(), cancel, on_line)
            .unwrap_or_else(|e| {
                error!("{e}");
                ProcessOutcome::failed_to_run(argv.join(" "))
            });
        ctx.read_error = outcome.error_detected;
        ctx.interrupted = outcome.interrupted;
        ctx.timed_out = outcome.timed_out;

        if let Some(validator) = &self.validator {
            ctx.enter(Phase::ValidatingImage);
            info!("*** Validating image with {} ***", validator.name());
            ctx.validator = Some(validate_fail_closed(validator.as_ref(), &ctx.paths.image, 0));
        }
        ctx.success = copy_succeeded(&outcome, ctx.validator);

        ctx.enter(Phase::Checksumming);
        info!("*** Creating checksum file ***");
        let checksums = checksum_directory(&request.output_dir, &request.extension, &ctx.paths.checksums);
        if !checksums.persisted {
            ctx.success = false;
        }

        let acquisition_end = timestamp(tz);

        ctx.enter(Phase::WritingMetadata);
        info!("*** Writing metadata file ***");
        let metadata = MetadataRecord {
            identifier: request.identifier.clone(),
            description: request.description.clone(),
            notes: request.notes.clone(),
            imgr_version: IMGR_VERSION.to_string(),
            block_device: request.device.display().to_string(),
            read_method: method,
            read_method_version: tool_version,
            read_command_line: outcome.command_line.clone(),
            max_retries: request.max_retries,
            rescue_direct_disc_mode: request.rescue_direct_mode,
            auto_retry: request.auto_retry,
            prefix: request.prefix.clone(),
            extension: request.extension.clone(),
            acquisition_start,
            acquisition_end,
            success_flag: ctx.success,
            interrupted_flag: ctx.interrupted,
            isolyzer_success: ctx.validator.map(|v| v.success),
            image_truncated: ctx.validator.map(|v| v.size_anomaly_detected),
            checksums: checksums.to_map(),
            checksum_type: CHECKSUM_TYPE.to_string(),
        };

        let metadata_written = match metadata.write(&ctx.paths.metadata) {
            Ok(()) => true,
            Err(e) => {
                error!("error while writing metadata file: {e}");
                ctx.success = false;
                false
            }
        };

        info!("Success: {}", ctx.success);
        if ctx.success {
            info!("Medium processed without errors");
            if request.media == MediaKind::Optical {
                info!("Ejecting disc");
                tools::eject(&self.tools.eject, &request.device);
            }
        } else {
            error!("One or more errors occurred while processing medium, check log file for details");
        }

        ctx.enter(Phase::Done);
        self.wait_for_release(&request.device);

        Ok(RunReport {
            success: ctx.success,
            read_error: ctx.read_error,
            interrupted: ctx.interrupted,
            timed_out: ctx.timed_out,
            outcome,
            validator: ctx.validator,
            checksums,
            metadata,
            metadata_written,
            paths: ctx.paths,
        })
    }

    /// Waits until the device can be opened again, so a caller that probes
    /// or restarts right away does not find it busy.
    fn wait_for_release(&self, device: &Path) {
        let started = Instant::now();
        loop {
            let remaining = self.settle.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            if self.probe.is_accessible_within(device, remaining) {
                return;
            }
            let remaining = self.settle.saturating_sub(started.elapsed());
            thread::sleep(RELEASE_POLL_INTERVAL.min(remaining));
        }
        debug!("{} still busy after {:?}", device.display(), self.settle);
    }
}

fn log_request(request: &AcquisitionRequest) {
    info!("*** IMGR ACQUISITION LOG ***");
    info!("imgrVersion: {IMGR_VERSION}");
    info!("dirOut: {}", request.output_dir.display());
    info!("blockDevice: {}", request.device.display());
    info!("readMethod: {}", request.method);
    info!("blockSize: {}", request.block_size);
    info!("maxRetries: {}", request.max_retries);
    info!("prefix: {}", request.prefix);
    info!("extension: {}", request.extension);
    info!("direct disc mode (ddrescue only): {}", request.rescue_direct_mode);
    info!("automatically retry with ddrescue on failure: {}", request.auto_retry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SYNTHETIC_FAILURE_EXIT_CODE;

    fn outcome(exit_code: i32) -> ProcessOutcome {
        ProcessOutcome {
            exit_code,
            command_line: "dd if=/dev/sdb".into(),
            error_detected: false,
            interrupted: false,
            timed_out: false,
            error_count: None,
        }
    }

    const COMPLETE: ValidatorVerdict = ValidatorVerdict {
        success: true,
        size_anomaly_detected: false,
    };

    #[test]
    fn success_needs_clean_exit() {
        assert!(copy_succeeded(&outcome(0), None));
        assert!(!copy_succeeded(&outcome(1), None));
        assert!(!copy_succeeded(&outcome(SYNTHETIC_FAILURE_EXIT_CODE), None));
    }

    #[test]
    fn error_markers_and_interrupts_fail_the_run() {
        let mut o = outcome(0);
        o.error_detected = true;
        assert!(!copy_succeeded(&o, None));

        let mut o = outcome(0);
        o.interrupted = true;
        assert!(!copy_succeeded(&o, Some(COMPLETE)));

        let mut o = outcome(0);
        o.timed_out = true;
        assert!(!copy_succeeded(&o, None));
    }

    #[test]
    fn validator_verdict_gates_success() {
        assert!(copy_succeeded(&outcome(0), Some(COMPLETE)));
        assert!(!copy_succeeded(&outcome(0), Some(ValidatorVerdict::FAIL_CLOSED)));
        assert!(!copy_succeeded(
            &outcome(0),
            Some(ValidatorVerdict {
                success: true,
                size_anomaly_detected: true
            })
        ));
    }

    /// A device that never opens and takes its time saying so.
    struct BusyProbe;

    impl DeviceProbe for BusyProbe {
        fn exists(&self, _path: &Path) -> bool {
            true
        }

        fn is_accessible(&self, _path: &Path) -> bool {
            thread::sleep(Duration::from_secs(5));
            false
        }

        fn is_accessible_within(&self, _path: &Path, limit: Duration) -> bool {
            thread::sleep(limit.min(Duration::from_secs(5)));
            false
        }

        fn size_bytes(&self, _path: &Path) -> Result<u64, crate::error::ProbeError> {
            Ok(0)
        }

        fn available_space(&self, _dir: &Path) -> Result<u64, crate::error::ProbeError> {
            Ok(0)
        }

        fn tray_status(&self, _path: &Path) -> Result<TrayStatus, crate::error::ProbeError> {
            Ok(TrayStatus::NoInfo)
        }
    }

    #[test]
    fn release_wait_is_bounded_by_settle_time() {
        let orchestrator = Orchestrator::new()
            .with_probe(BusyProbe)
            .with_settle(Duration::from_millis(300));

        let started = Instant::now();
        orchestrator.wait_for_release(Path::new("/dev/sdz"));
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(2), "waited {elapsed:?}");
    }

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::Validating < Phase::Unmounting);
        assert!(Phase::Copying < Phase::ValidatingImage);
        assert!(Phase::ValidatingImage < Phase::Checksumming);
        assert!(Phase::WritingMetadata < Phase::Done);
    }
}

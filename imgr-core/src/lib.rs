//! The core, UI-agnostic acquisition engine of the `imgr` imaging utility.
//!
//! `imgr-core` images disks and optical media into archival files by driving
//! external copy tools (`dd`, `ddrescue`, `readom`), verifies the result and
//! records provenance metadata. It is meant to be used by any front-end, be
//! it the `imgr` command-line tool or a graphical application.
//!
//! The library is structured into several key modules:
//! - [`probe`]: Existence, accessibility, capacity and tray queries for the
//!   source device.
//! - [`supervisor`]: Runs one copy-tool invocation, classifies its output and
//!   honours cancellation.
//! - [`checksum`]: SHA-512 digests of the output and the checksum manifest.
//! - [`validator`]: Optional structural validation of the image.
//! - [`orchestrator`]: The state machine tying the above together.
//! - [`escalation`]: The caller's retry and failover decision after a run.
//! - [`platform`]: Lists candidate devices for a front-end to present.
//!
//! The primary entry point is [`orchestrator::Orchestrator::run`]. It blocks
//! until the run is over, reports every output line of the copy tool via a
//! callback, and can be cancelled from another thread through a
//! [`cancel::CancelToken`].
//!
//! ## Example: Imaging a USB stick
//!
//! ```rust,no_run
//! use imgr_core::cancel::CancelToken;
//! use imgr_core::config::Settings;
//! use imgr_core::orchestrator::Orchestrator;
//! use imgr_core::request::MediaKind;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let settings = Settings::load(None)?;
//!     let mut request = settings.request("/dev/sdb".into(), "/data/acc-001".into(), MediaKind::Disk);
//!     request.identifier = "acc-001".into();
//!
//!     // Trigger `cancel.request()` from a Ctrl+C handler to stop the copy.
//!     let cancel = CancelToken::new();
//!
//!     let report = Orchestrator::new().run(&request, &cancel, |line| println!("{line}"))?;
//!
//!     println!("success: {}", report.success);
//!     for (file, digest) in report.checksums.entries() {
//!         println!("{digest} {file}");
//!     }
//!
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("imgr-core drives Unix copy tools and ioctls and only builds on Unix-like systems");

pub mod cancel;
pub mod checksum;
pub mod classify;
pub mod config;
pub mod device;
pub mod error;
pub mod escalation;
pub mod metadata;
pub mod method;
pub mod orchestrator;
pub mod output;
pub mod platform;
pub mod probe;
pub mod request;
pub mod supervisor;
pub mod tools;
pub mod validator;

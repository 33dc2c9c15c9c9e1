//! What a caller should do after a run: stop, retry on its own, or ask.
//!
//! This is deliberately separate from the orchestrator. A run never retries
//! itself; the caller feeds the finished report in here and decides, possibly
//! with the user, whether to start another run with the returned request.
use crate::method::CopyMethod;
use crate::orchestrator::RunReport;
use crate::request::{AcquisitionRequest, MediaKind};

/// Block size used for rescue copies of optical media (one CD/DVD sector).
pub const OPTICAL_SECTOR_SIZE: u32 = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// The run succeeded; nothing left to do.
    Done,
    /// The run was stopped by the user or by the deadline; do not retry
    /// without being asked again.
    Stop,
    /// Start this run right away, without asking.
    Retry(AcquisitionRequest),
    /// Ask the user whether to start this run.
    Offer {
        request: AcquisitionRequest,
        prompt: &'static str,
    },
}

/// The request for a rescue copy following a failed `request`.
pub fn rescue_request(request: &AcquisitionRequest) -> AcquisitionRequest {
    let mut next = request.with_method(CopyMethod::RescueCopy);
    if request.media == MediaKind::Optical {
        next.block_size = OPTICAL_SECTOR_SIZE;
    }
    next
}

/// Decides the follow-up of a finished run.
pub fn next_step(request: &AcquisitionRequest, report: &RunReport) -> Escalation {
    if report.success && !report.read_error {
        return Escalation::Done;
    }
    if report.interrupted || report.timed_out {
        return Escalation::Stop;
    }

    match request.method {
        CopyMethod::DirectCopy | CopyMethod::OpticalCopy if request.auto_retry => {
            Escalation::Retry(rescue_request(request))
        }
        CopyMethod::DirectCopy | CopyMethod::OpticalCopy => Escalation::Offer {
            request: rescue_request(request),
            prompt: "Errors occurred while imaging this medium. Try again with ddrescue? \
                     (This will overwrite the existing image file)",
        },
        CopyMethod::RescueCopy => Escalation::Offer {
            request: request.clone(),
            prompt: "One or more errors occurred while imaging this medium. Try another \
                     ddrescue pass? (Hint: you may try direct disc mode and/or another \
                     reader device)",
        },
    }
}

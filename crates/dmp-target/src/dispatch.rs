//! Per-request dispatch
//!
//! [`DmpTarget::map`] is the hot path: classify, account, decide, act. It
//! takes `&self`, holds no lock and never waits, so any number of threads may
//! map bios through the same target at once. Forwarded bios complete later
//! through the backing device; local completions and kills fire the bio's
//! completion token before `map` returns.
//!
//! Outcomes a submitter can tell apart:
//!
//! - `Kill` + `IoErr`: the target refuses this request kind
//! - `Submitted` + `Again`: a NOWAIT bio would have waited on the device
//! - `Submitted` + the device's own status otherwise

use tracing::trace;

use crate::bio::{Bio, BlkStatus};
use crate::classify::classify;
use crate::error::TargetError;
use crate::policy::Decision;
use crate::target::DmpTarget;

/// Result of mapping one bio
#[derive(Debug)]
pub enum MapOutcome {
    /// Handed to the backing device; completes asynchronously
    Submitted,
    /// Completed locally
    Completed,
    /// Rejected; the bio was ended with an I/O error
    Kill(TargetError),
}

impl MapOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, MapOutcome::Submitted)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, MapOutcome::Completed)
    }

    pub fn is_kill(&self) -> bool {
        matches!(self, MapOutcome::Kill(_))
    }
}

impl DmpTarget {
    /// Map one bio. `bio.sector()` is relative to the start of this target.
    pub fn map(&self, mut bio: Bio) -> MapOutcome {
        let req = classify(&bio);
        self.policy.account(&self.stats, &req);

        match self.policy.decide(&req) {
            Decision::Forward { dev, start } => {
                let Some(sector) = start.checked_add(bio.sector()) else {
                    return kill(bio, "sector beyond addressable range");
                };
                trace!("{:?} -> {}:{sector}", bio, dev.path());
                bio.remap(dev.id(), sector);
                dev.device().submit(bio);
                MapOutcome::Submitted
            }
            Decision::ZeroFill => {
                bio.zero_fill();
                bio.endio(BlkStatus::Ok);
                MapOutcome::Completed
            }
            Decision::Drop => {
                bio.endio(BlkStatus::Ok);
                MapOutcome::Completed
            }
            Decision::Reject(reason) => kill(bio, reason),
        }
    }
}

fn kill(bio: Bio, reason: &'static str) -> MapOutcome {
    trace!("{:?} killed: {reason}", bio);
    let op = bio.op();
    bio.endio(BlkStatus::IoErr);
    MapOutcome::Kill(TargetError::UnsupportedOperation { op, reason })
}

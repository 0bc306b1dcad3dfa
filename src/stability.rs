//! Size-stability detection.
//!
//! A candidate is stable once its size has been observed unchanged across at
//! least one full check period. The detector never sleeps; quiescence is
//! achieved by the scheduler's periodic re-entry, with the measurement
//! history kept in the metadata store so the decision survives restarts.

use std::time::Duration;

use crate::inventory::Candidate;
use crate::store::MetadataStore;

/// Outcome of a stability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Below the size floor. Skipped entirely: neither observed nor published.
    Skip,
    /// The size is new, changed, or has not yet been quiet for a full period.
    NotStable,
    /// The size has been unchanged for at least one full period.
    Stable,
}

/// Run the stability ladder for a candidate measured at `now_ms`.
///
/// Once a candidate is stable it stays stable on every later check until its
/// size changes again: the recorded measurement time is only advanced on a
/// first sighting or a size change, never while the candidate is quiet.
pub fn check(
    store: &MetadataStore,
    candidate: &Candidate,
    period: Duration,
    min_file_size: u64,
    now_ms: i64,
) -> crate::store::Result<Verdict> {
    if candidate.size == 0 || candidate.size < min_file_size {
        return Ok(Verdict::Skip);
    }

    let prior = match store.get_observation(&candidate.path, candidate.is_bundle)? {
        None => {
            store.record_observation(&candidate.path, candidate.is_bundle, candidate.size, now_ms)?;
            return Ok(Verdict::NotStable);
        }
        Some(prior) => prior,
    };

    if prior.size != candidate.size {
        store.record_observation(&candidate.path, candidate.is_bundle, candidate.size, now_ms)?;
        return Ok(Verdict::NotStable);
    }

    if now_ms - prior.last_measured_at < period.as_millis() as i64 {
        return Ok(Verdict::NotStable);
    }

    Ok(Verdict::Stable)
}

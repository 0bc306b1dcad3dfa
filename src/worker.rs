//! Per-source-set mirror workers.
//!
//! One worker per configured source set, spawned as an independent task.
//! Within a worker every tick is sequential: destinations in declared order,
//! source roots in declared order, candidates in inventory order, and a copy
//! completes before the next candidate is considered. Ticks never overlap; a
//! long copy simply delays the next tick. Workers share nothing mutable but
//! the metadata store.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConfigError, MirrorConfig};
use crate::inventory::{self, Candidate};
use crate::notify::Notifier;
use crate::pipeline::{self, PublishOutcome, PublishPolicy, PublishRequest};
use crate::space;
use crate::stability::{self, Verdict};
use crate::store::MetadataStore;

/// Shared engine state handed to every worker: the store (behind its
/// process-wide lock), the notification sink, and the shutdown token.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<MetadataStore>,
    pub notifier: Notifier,
    pub cancel: CancellationToken,
}

/// The control loop for one source set.
pub struct MirrorWorker {
    config: MirrorConfig,
    period: Duration,
    policy: PublishPolicy,
    ctx: EngineContext,
}

impl MirrorWorker {
    pub fn new(config: MirrorConfig, ctx: EngineContext) -> Result<Self, ConfigError> {
        let period = config.period()?;
        let policy = PublishPolicy {
            min_free_space: config.min_free_space,
            override_if_different: config.override_if_different,
        };
        Ok(Self {
            config,
            period,
            policy,
            ctx,
        })
    }

    /// Tick until cancelled.
    pub async fn run(self) {
        info!(
            name = %self.config.name,
            period_ms = self.period.as_millis() as u64,
            "mirror worker started"
        );
        loop {
            self.run_once().await;
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
        }
        info!(name = %self.config.name, "mirror worker stopped");
    }

    /// One full pass over every destination and source root of the set.
    ///
    /// Every per-candidate failure is swallowed here so that one bad path
    /// cannot stall the rest of the tick.
    pub async fn run_once(&self) {
        for destination in &self.config.destinations {
            if self.ctx.cancel.is_cancelled() {
                return;
            }
            let destination_root = Path::new(destination);

            let free = match space::free_space(destination_root) {
                Ok(free) => free,
                Err(err) => {
                    error!(
                        name = %self.config.name,
                        destination = %destination,
                        error = %err,
                        "free-space query failed; skipping destination this tick"
                    );
                    continue;
                }
            };
            if free <= self.config.min_free_space {
                warn!(
                    name = %self.config.name,
                    destination = %destination,
                    free,
                    min_free_space = self.config.min_free_space,
                    "destination below free-space floor; skipping this tick"
                );
                self.ctx
                    .notifier
                    .notify(&format!(
                        "{}: destination {destination} below free-space floor ({free} bytes free)",
                        self.config.name
                    ))
                    .await;
                continue;
            }

            for directory in &self.config.directories {
                if self.ctx.cancel.is_cancelled() {
                    return;
                }
                let source_root = Path::new(directory);

                let candidates = match inventory::list_candidates(source_root) {
                    Ok(candidates) => candidates,
                    Err(err) => {
                        error!(
                            name = %self.config.name,
                            directory = %directory,
                            error = %err,
                            "inventory failed; aborting this source root for the tick"
                        );
                        continue;
                    }
                };

                for candidate in candidates {
                    if self.ctx.cancel.is_cancelled() {
                        return;
                    }
                    self.process_candidate(source_root, destination_root, &candidate)
                        .await;
                }
            }
        }
    }

    async fn process_candidate(
        &self,
        source_root: &Path,
        destination_root: &Path,
        candidate: &Candidate,
    ) {
        let verdict = match stability::check(
            &self.ctx.store,
            candidate,
            self.period,
            self.config.min_file_size,
            epoch_millis(),
        ) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(
                    path = %candidate.path.display(),
                    error = %err,
                    "stability check failed; skipping candidate this tick"
                );
                return;
            }
        };
        match verdict {
            Verdict::Skip => {
                trace!(path = %candidate.path.display(), size = candidate.size, "below size floor");
                return;
            }
            Verdict::NotStable => {
                debug!(path = %candidate.path.display(), size = candidate.size, "not yet stable");
                return;
            }
            Verdict::Stable => {}
        }

        if !self.policy.override_if_different {
            match self
                .ctx
                .store
                .is_published(&candidate.path, destination_root, candidate.is_bundle)
            {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        path = %candidate.path.display(),
                        error = %err,
                        "publication lookup failed; skipping candidate this tick"
                    );
                    return;
                }
            }
        }

        let request = PublishRequest {
            source_path: &candidate.path,
            source_root,
            destination_root,
            is_bundle: candidate.is_bundle,
            size: candidate.size,
        };
        match pipeline::publish(&self.ctx.store, &self.ctx.cancel, &request, &self.policy).await {
            Ok(PublishOutcome::Published { size, digest }) => {
                info!(
                    name = %self.config.name,
                    source = %candidate.path.display(),
                    destination = %destination_root.display(),
                    size,
                    digest = %digest,
                    "copied and verified"
                );
                self.ctx
                    .notifier
                    .notify(&format!(
                        "{}: copied and verified {} -> {}",
                        self.config.name,
                        candidate.path.display(),
                        destination_root.display()
                    ))
                    .await;
            }
            Ok(PublishOutcome::AlreadyPublished) => {
                debug!(path = %candidate.path.display(), "already published");
            }
            Ok(PublishOutcome::DestinationDiffers) => {
                debug!(path = %candidate.path.display(), "destination differs; overriding is off");
            }
            Ok(PublishOutcome::SpaceExhausted { free, required }) => {
                warn!(
                    name = %self.config.name,
                    path = %candidate.path.display(),
                    free,
                    required,
                    "copy would breach free-space floor; skipping"
                );
                self.ctx
                    .notifier
                    .notify(&format!(
                        "{}: not enough space at {} for {} ({} bytes needed, {} free)",
                        self.config.name,
                        destination_root.display(),
                        candidate.path.display(),
                        required,
                        free
                    ))
                    .await;
            }
            Ok(PublishOutcome::HashMismatch) => {
                warn!(
                    path = %candidate.path.display(),
                    "digest mismatch after copy; staging removed, will retry next tick"
                );
                self.ctx
                    .notifier
                    .notify(&format!(
                        "{}: digest mismatch copying {}; will retry",
                        self.config.name,
                        candidate.path.display()
                    ))
                    .await;
            }
            Ok(PublishOutcome::Cancelled) => {
                debug!(path = %candidate.path.display(), "copy cancelled");
            }
            Err(err) => {
                error!(
                    name = %self.config.name,
                    path = %candidate.path.display(),
                    error = %err,
                    "publication failed"
                );
                self.ctx
                    .notifier
                    .notify(&format!(
                        "{}: failed to publish {}: {err}",
                        self.config.name,
                        candidate.path.display()
                    ))
                    .await;
            }
        }
    }
}

/// Current wall-clock time as unix epoch milliseconds.
pub(crate) fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const HELLO_DIGEST: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    struct Fixture {
        _dir: tempfile::TempDir,
        src: PathBuf,
        dst: PathBuf,
        ctx: EngineContext,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        Fixture {
            src,
            dst,
            _dir: dir,
            ctx: EngineContext {
                store: Arc::new(MetadataStore::open_in_memory().unwrap()),
                notifier: Notifier::disabled(),
                cancel: CancellationToken::new(),
            },
        }
    }

    fn config(fx: &Fixture, min_free_space: u64) -> MirrorConfig {
        MirrorConfig {
            name: "test".to_string(),
            directories: vec![fx.src.to_string_lossy().into_owned()],
            destinations: vec![fx.dst.to_string_lossy().into_owned()],
            check_interval: "1s".to_string(),
            min_free_space,
            min_file_size: 1,
            override_if_different: false,
        }
    }

    fn backdate(fx: &Fixture, path: &Path, size: u64) {
        fx.ctx
            .store
            .record_observation(path, false, size, epoch_millis() - 10_000)
            .unwrap();
    }

    #[tokio::test]
    async fn test_publishes_after_one_quiet_period() {
        let fx = fixture();
        let source = fx.src.join("a.txt");
        fs::write(&source, b"hello").unwrap();
        let worker = MirrorWorker::new(config(&fx, 0), fx.ctx.clone()).unwrap();

        // First tick only observes.
        worker.run_once().await;
        assert!(!fx.dst.join("a.txt").exists());
        assert!(fx.ctx.store.get_observation(&source, false).unwrap().is_some());

        // Once the size has been quiet for a full period, the next tick
        // copies, verifies, and records.
        backdate(&fx, &source, 5);
        worker.run_once().await;

        assert_eq!(fs::read(fx.dst.join("a.txt")).unwrap(), b"hello");
        assert!(!fx.dst.join("a.txt.cat.part").exists());
        let row = fx.ctx.store.get_publication(&source, &fx.dst, false).unwrap().unwrap();
        assert_eq!(row.content_digest.as_deref(), Some(HELLO_DIGEST));
    }

    #[tokio::test]
    async fn test_mid_write_truncation_holds_off_the_copy() {
        let fx = fixture();
        let source = fx.src.join("b.txt");
        fs::write(&source, b"12345").unwrap();
        let worker = MirrorWorker::new(config(&fx, 0), fx.ctx.clone()).unwrap();

        worker.run_once().await;

        // Writer truncates between ticks: the size change resets the clock.
        fs::write(&source, b"123").unwrap();
        worker.run_once().await;
        assert!(!fx.dst.join("b.txt").exists());

        // Quiet again for a full period at the new size.
        backdate(&fx, &source, 3);
        worker.run_once().await;

        assert_eq!(fs::read(fx.dst.join("b.txt")).unwrap(), b"123");
        let row = fx.ctx.store.get_publication(&source, &fx.dst, false).unwrap().unwrap();
        assert_eq!(row.size, 3);
    }

    #[tokio::test]
    async fn test_zero_and_undersized_candidates_never_observed() {
        let fx = fixture();
        fs::write(fx.src.join("empty.bin"), b"").unwrap();
        fs::write(fx.src.join("tiny.bin"), b"x").unwrap();

        let mut cfg = config(&fx, 0);
        cfg.min_file_size = 2;
        let worker = MirrorWorker::new(cfg, fx.ctx.clone()).unwrap();
        worker.run_once().await;
        worker.run_once().await;

        assert!(!fx.dst.join("empty.bin").exists());
        assert!(!fx.dst.join("tiny.bin").exists());
        let store = &fx.ctx.store;
        assert!(store.get_observation(&fx.src.join("empty.bin"), false).unwrap().is_none());
        assert!(store.get_observation(&fx.src.join("tiny.bin"), false).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_space_floor_skips_destination_without_writing() {
        let fx = fixture();
        fs::write(fx.src.join("a.txt"), b"hello").unwrap();
        let worker = MirrorWorker::new(config(&fx, u64::MAX), fx.ctx.clone()).unwrap();

        worker.run_once().await;
        worker.run_once().await;

        assert!(fs::read_dir(&fx.dst).unwrap().next().is_none());
        assert!(fx
            .ctx
            .store
            .get_observation(&fx.src.join("a.txt"), false)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_smaller_candidate_proceeds_when_larger_breaches_floor() {
        let fx = fixture();
        let big = fx.src.join("big.bin");
        let small = fx.src.join("small.txt");
        fs::write(&big, vec![0u8; 4 * 1024 * 1024]).unwrap();
        fs::write(&small, b"hello").unwrap();

        // A floor the 4 MiB candidate's own pre-flight breaches while the
        // 5-byte one still clears it, with 2 MiB of slack either way for
        // filesystem churn while the test runs.
        let free = space::free_space(&fx.dst).unwrap();
        let floor = free.saturating_sub(2 * 1024 * 1024);
        let worker = MirrorWorker::new(config(&fx, floor), fx.ctx.clone()).unwrap();

        worker.run_once().await;
        backdate(&fx, &big, 4 * 1024 * 1024);
        backdate(&fx, &small, 5);
        worker.run_once().await;

        // Same tick: the larger candidate is blocked by its own admission
        // check, the smaller one after it still publishes.
        assert!(!fx.dst.join("big.bin").exists());
        assert!(!fx.dst.join("big.bin.cat.part").exists());
        assert_eq!(fs::read(fx.dst.join("small.txt")).unwrap(), b"hello");
        assert!(!fx.ctx.store.is_published(&big, &fx.dst, false).unwrap());
        assert!(fx.ctx.store.is_published(&small, &fx.dst, false).unwrap());
    }

    #[tokio::test]
    async fn test_mirrors_to_every_destination_in_order() {
        let fx = fixture();
        let dst2 = fx._dir.path().join("dst2");
        fs::create_dir_all(&dst2).unwrap();
        let source = fx.src.join("a.txt");
        fs::write(&source, b"hello").unwrap();

        let mut cfg = config(&fx, 0);
        cfg.destinations.push(dst2.to_string_lossy().into_owned());
        let worker = MirrorWorker::new(cfg, fx.ctx.clone()).unwrap();

        worker.run_once().await;
        backdate(&fx, &source, 5);
        worker.run_once().await;

        assert_eq!(fs::read(fx.dst.join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dst2.join("a.txt")).unwrap(), b"hello");
        assert!(fx.ctx.store.is_published(&source, &fx.dst, false).unwrap());
        assert!(fx.ctx.store.is_published(&source, &dst2, false).unwrap());
    }

    #[tokio::test]
    async fn test_published_candidate_not_recopied() {
        let fx = fixture();
        let source = fx.src.join("a.txt");
        fs::write(&source, b"hello").unwrap();
        let worker = MirrorWorker::new(config(&fx, 0), fx.ctx.clone()).unwrap();

        worker.run_once().await;
        backdate(&fx, &source, 5);
        worker.run_once().await;

        // Remove the mirrored copy out from under the engine: the published
        // row still marks the work done, so nothing is recopied.
        fs::remove_file(fx.dst.join("a.txt")).unwrap();
        worker.run_once().await;
        assert!(!fx.dst.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_worker_loop_publishes_and_stops_on_cancel() {
        let fx = fixture();
        let source = fx.src.join("a.txt");
        fs::write(&source, b"hello").unwrap();

        let mut cfg = config(&fx, 0);
        cfg.check_interval = "50ms".to_string();
        let worker = MirrorWorker::new(cfg, fx.ctx.clone()).unwrap();
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(400)).await;
        fx.ctx.cancel.cancel();
        handle.await.unwrap();

        assert_eq!(fs::read(fx.dst.join("a.txt")).unwrap(), b"hello");
        assert!(!fx.dst.join("a.txt.cat.part").exists());
    }
}

//! Copy, verify, and atomically publish candidates at a destination.
//!
//! Bytes are streamed to a staging name (`<final>.cat.part`), re-hashed on
//! both endpoints, and published with a single atomic rename. The `published`
//! row is committed together with the observed digest, so a row only ever
//! exists for a verified, fully-renamed copy. Nothing is ever observable
//! under its final name with partial content.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::hash;
use crate::inventory::{self, STAGING_SUFFIX};
use crate::space;
use crate::store::{MetadataStore, StoreError};
use crate::worker::epoch_millis;

const COPY_BUF_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("source {path} is not under root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
    #[error("rename to final name failed for {path} (staging preserved for inspection): {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

fn io_err(path: &Path, source: io::Error) -> PipelineError {
    PipelineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Policy knobs of the candidate's source set.
#[derive(Debug, Clone, Copy)]
pub struct PublishPolicy {
    pub min_free_space: u64,
    pub override_if_different: bool,
}

/// One unit of publication work.
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    pub source_path: &'a Path,
    pub source_root: &'a Path,
    pub destination_root: &'a Path,
    pub is_bundle: bool,
    /// Size measured at inventory time.
    pub size: u64,
}

/// How a publication attempt ended. Errors are reserved for conditions the
/// caller cannot act on; everything the scheduler routinely handles is an
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Copied, verified, renamed, and recorded.
    Published { size: u64, digest: String },
    /// Endpoints already identical; the store row is in place.
    AlreadyPublished,
    /// The destination holds different content and overriding is off.
    DestinationDiffers,
    /// Copying would breach the destination's free-space floor.
    SpaceExhausted { free: u64, required: u64 },
    /// Staged bytes did not match the source; staging deleted, retried on a
    /// later tick.
    HashMismatch,
    /// Shutdown observed mid-copy; staging deleted.
    Cancelled,
}

/// Publish one candidate at one destination.
pub async fn publish(
    store: &MetadataStore,
    cancel: &CancellationToken,
    req: &PublishRequest<'_>,
    policy: &PublishPolicy,
) -> Result<PublishOutcome> {
    if req.is_bundle {
        publish_bundle(store, cancel, req, policy).await
    } else {
        publish_file(store, cancel, req, policy).await
    }
}

async fn publish_file(
    store: &MetadataStore,
    cancel: &CancellationToken,
    req: &PublishRequest<'_>,
    policy: &PublishPolicy,
) -> Result<PublishOutcome> {
    let dest_final = destination_path(req)?;

    if let Some(outcome) = short_circuit(store, req, &dest_final).await? {
        return Ok(outcome);
    }

    if exists(&dest_final).await? {
        match reconcile_existing(store, req, &dest_final, policy).await? {
            Reconciled::Identical => return Ok(PublishOutcome::AlreadyPublished),
            Reconciled::Differs => return Ok(PublishOutcome::DestinationDiffers),
            Reconciled::Replace => {}
        }
    }

    match copy_and_verify(cancel, req.source_path, &dest_final, policy, req.destination_root).await? {
        CopyVerify::Done { digest, bytes } => {
            store.record_publication_and_observed_digest(
                req.source_path,
                req.destination_root,
                false,
                bytes,
                &digest,
                epoch_millis(),
            )?;
            Ok(PublishOutcome::Published { size: bytes, digest })
        }
        CopyVerify::SpaceExhausted { free, required } => {
            Ok(PublishOutcome::SpaceExhausted { free, required })
        }
        CopyVerify::HashMismatch => Ok(PublishOutcome::HashMismatch),
        CopyVerify::Cancelled => Ok(PublishOutcome::Cancelled),
    }
}

/// Mirror a bundle directory as a single publication unit.
///
/// Components are copied and verified with the same staging machinery as
/// standalone files but never get their own `published` rows; one
/// bundle-level row is committed after the whole walk succeeds. Components
/// already identical at the destination are skipped, which is what makes a
/// retry after a crashed or aborted walk converge instead of recopying.
async fn publish_bundle(
    store: &MetadataStore,
    cancel: &CancellationToken,
    req: &PublishRequest<'_>,
    policy: &PublishPolicy,
) -> Result<PublishOutcome> {
    let dest_bundle = destination_path(req)?;

    if let Some(outcome) = short_circuit(store, req, &dest_bundle).await? {
        return Ok(outcome);
    }

    for entry in WalkDir::new(req.source_path).sort_by_file_name() {
        let entry = entry.map_err(|e| io_err(req.source_path, e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(req.source_path)
            .map_err(|_| PipelineError::OutsideRoot {
                path: entry.path().to_path_buf(),
                root: req.source_path.to_path_buf(),
            })?;
        let target = dest_bundle.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).await.map_err(|e| io_err(&target, e))?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if cancel.is_cancelled() {
            return Ok(PublishOutcome::Cancelled);
        }

        match copy_component(cancel, entry.path(), &target, policy, req.destination_root).await? {
            ComponentOutcome::Copied | ComponentOutcome::SkippedIdentical => {}
            ComponentOutcome::Differs => return Ok(PublishOutcome::DestinationDiffers),
            ComponentOutcome::SpaceExhausted { free, required } => {
                return Ok(PublishOutcome::SpaceExhausted { free, required })
            }
            ComponentOutcome::HashMismatch => return Ok(PublishOutcome::HashMismatch),
            ComponentOutcome::Cancelled => return Ok(PublishOutcome::Cancelled),
        }
    }

    let digest = hash::bundle_digest(req.source_path)
        .await
        .map_err(|e| io_err(req.source_path, e))?;
    let size = inventory::bundle_size(req.source_path).map_err(|e| io_err(req.source_path, e))?;

    store.record_publication_and_observed_digest(
        req.source_path,
        req.destination_root,
        true,
        size,
        &digest,
        epoch_millis(),
    )?;
    Ok(PublishOutcome::Published { size, digest })
}

/// The size-change short-circuit: a recorded publication whose size matches
/// the current measurement is a no-op once the stored digests on both
/// endpoints agree. Missing digests are recomputed from disk and repaired in
/// the store before deciding.
async fn short_circuit(
    store: &MetadataStore,
    req: &PublishRequest<'_>,
    dest_final: &Path,
) -> Result<Option<PublishOutcome>> {
    let Some(publication) = store.get_publication(req.source_path, req.destination_root, req.is_bundle)?
    else {
        return Ok(None);
    };
    if publication.size != req.size {
        return Ok(None);
    }

    let observed_digest = store
        .get_observation(req.source_path, req.is_bundle)?
        .and_then(|o| o.content_digest);

    match (observed_digest, publication.content_digest) {
        (Some(src), Some(dst)) if src == dst => Ok(Some(PublishOutcome::AlreadyPublished)),
        (Some(_), Some(_)) => Ok(None),
        _ => {
            if !exists(dest_final).await? {
                return Ok(None);
            }
            let src_digest = endpoint_digest(req.source_path, req.is_bundle).await?;
            let dst_digest = endpoint_digest(dest_final, req.is_bundle).await?;
            if src_digest == dst_digest {
                store.set_observed_digest(req.source_path, req.is_bundle, &src_digest)?;
                store.update_published_digest(
                    req.source_path,
                    req.destination_root,
                    req.is_bundle,
                    &dst_digest,
                )?;
                debug!(
                    source = %req.source_path.display(),
                    "repaired missing digests for recorded publication"
                );
                Ok(Some(PublishOutcome::AlreadyPublished))
            } else {
                Ok(None)
            }
        }
    }
}

enum Reconciled {
    Identical,
    Replace,
    Differs,
}

/// The destination already carries a file at the final name. Decide whether
/// it is the same content (record and move on), replaceable, or blocking.
async fn reconcile_existing(
    store: &MetadataStore,
    req: &PublishRequest<'_>,
    dest_final: &Path,
    policy: &PublishPolicy,
) -> Result<Reconciled> {
    let src_digest = match store
        .get_observation(req.source_path, req.is_bundle)?
        .and_then(|o| o.content_digest)
    {
        Some(digest) => digest,
        None => endpoint_digest(req.source_path, req.is_bundle).await?,
    };
    let dst_digest = match store
        .get_publication(req.source_path, req.destination_root, req.is_bundle)?
        .and_then(|p| p.content_digest)
    {
        Some(digest) => digest,
        None => endpoint_digest(dest_final, req.is_bundle).await?,
    };

    if src_digest == dst_digest {
        store.record_publication_and_observed_digest(
            req.source_path,
            req.destination_root,
            req.is_bundle,
            req.size,
            &src_digest,
            epoch_millis(),
        )?;
        debug!(
            destination = %dest_final.display(),
            "destination already holds identical content"
        );
        return Ok(Reconciled::Identical);
    }

    if policy.override_if_different {
        info!(
            destination = %dest_final.display(),
            "replacing destination file with different content"
        );
        fs::remove_file(dest_final).await.map_err(|e| io_err(dest_final, e))?;
        return Ok(Reconciled::Replace);
    }

    warn!(
        destination = %dest_final.display(),
        "destination holds different content; leaving it in place"
    );
    Ok(Reconciled::Differs)
}

enum ComponentOutcome {
    Copied,
    SkippedIdentical,
    Differs,
    SpaceExhausted { free: u64, required: u64 },
    HashMismatch,
    Cancelled,
}

async fn copy_component(
    cancel: &CancellationToken,
    source: &Path,
    target: &Path,
    policy: &PublishPolicy,
    destination_root: &Path,
) -> Result<ComponentOutcome> {
    if exists(target).await? {
        let src_digest = hash::file_digest(source).await.map_err(|e| io_err(source, e))?;
        let dst_digest = hash::file_digest(target).await.map_err(|e| io_err(target, e))?;
        if src_digest == dst_digest {
            return Ok(ComponentOutcome::SkippedIdentical);
        }
        if !policy.override_if_different {
            warn!(
                destination = %target.display(),
                "bundle component differs at destination; aborting bundle this tick"
            );
            return Ok(ComponentOutcome::Differs);
        }
        fs::remove_file(target).await.map_err(|e| io_err(target, e))?;
    }

    match copy_and_verify(cancel, source, target, policy, destination_root).await? {
        CopyVerify::Done { .. } => Ok(ComponentOutcome::Copied),
        CopyVerify::SpaceExhausted { free, required } => {
            Ok(ComponentOutcome::SpaceExhausted { free, required })
        }
        CopyVerify::HashMismatch => Ok(ComponentOutcome::HashMismatch),
        CopyVerify::Cancelled => Ok(ComponentOutcome::Cancelled),
    }
}

enum CopyVerify {
    Done { digest: String, bytes: u64 },
    SpaceExhausted { free: u64, required: u64 },
    HashMismatch,
    Cancelled,
}

/// Preflight the free-space floor, clear stale staging, stream to the
/// staging name, re-hash both endpoints, and atomically rename into place.
/// The store is untouched here.
async fn copy_and_verify(
    cancel: &CancellationToken,
    source: &Path,
    dest_final: &Path,
    policy: &PublishPolicy,
    destination_root: &Path,
) -> Result<CopyVerify> {
    let required = fs::metadata(source)
        .await
        .map_err(|e| io_err(source, e))?
        .len();
    let free = space::free_space(destination_root).map_err(|e| io_err(destination_root, e))?;
    if free.saturating_sub(required) <= policy.min_free_space {
        return Ok(CopyVerify::SpaceExhausted { free, required });
    }

    let staging = staging_path(dest_final);
    if exists(&staging).await? {
        debug!(staging = %staging.display(), "removing stale staging file");
        fs::remove_file(&staging).await.map_err(|e| io_err(&staging, e))?;
    }
    if let Some(parent) = dest_final.parent() {
        fs::create_dir_all(parent).await.map_err(|e| io_err(parent, e))?;
    }

    let bytes = match stream_copy(cancel, source, &staging).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            let _ = fs::remove_file(&staging).await;
            return Ok(CopyVerify::Cancelled);
        }
        Err(err) => {
            let _ = fs::remove_file(&staging).await;
            return Err(err);
        }
    };

    let source_digest = hash::file_digest(source).await.map_err(|e| io_err(source, e))?;
    let staged_digest = hash::file_digest(&staging).await.map_err(|e| io_err(&staging, e))?;
    if source_digest != staged_digest {
        warn!(
            source = %source.display(),
            expected = %source_digest,
            actual = %staged_digest,
            "staged copy does not match source; deleting staging"
        );
        fs::remove_file(&staging).await.map_err(|e| io_err(&staging, e))?;
        return Ok(CopyVerify::HashMismatch);
    }

    fs::rename(&staging, dest_final)
        .await
        .map_err(|source| PipelineError::Rename {
            path: dest_final.to_path_buf(),
            source,
        })?;

    Ok(CopyVerify::Done {
        digest: source_digest,
        bytes,
    })
}

/// Stream `source` into `staging` in fixed-size chunks, yielding to the
/// cancellation token on every chunk boundary. Returns the byte count, or
/// `None` when cancelled.
async fn stream_copy(
    cancel: &CancellationToken,
    source: &Path,
    staging: &Path,
) -> Result<Option<u64>> {
    let mut src = fs::File::open(source).await.map_err(|e| io_err(source, e))?;
    let mut dst = fs::File::create(staging).await.map_err(|e| io_err(staging, e))?;

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let n = src.read(&mut buf).await.map_err(|e| io_err(source, e))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await.map_err(|e| io_err(staging, e))?;
        copied += n as u64;
    }
    dst.flush().await.map_err(|e| io_err(staging, e))?;
    Ok(Some(copied))
}

fn destination_path(req: &PublishRequest<'_>) -> Result<PathBuf> {
    let relative = req
        .source_path
        .strip_prefix(req.source_root)
        .map_err(|_| PipelineError::OutsideRoot {
            path: req.source_path.to_path_buf(),
            root: req.source_root.to_path_buf(),
        })?;
    Ok(req.destination_root.join(relative))
}

fn staging_path(dest_final: &Path) -> PathBuf {
    let mut name = dest_final.as_os_str().to_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

async fn exists(path: &Path) -> Result<bool> {
    fs::try_exists(path).await.map_err(|e| io_err(path, e))
}

async fn endpoint_digest(path: &Path, is_bundle: bool) -> Result<String> {
    let digest = if is_bundle {
        hash::bundle_digest(path).await
    } else {
        hash::file_digest(path).await
    };
    digest.map_err(|e| io_err(path, e))
}

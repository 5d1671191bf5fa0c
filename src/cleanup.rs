use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use futures_util::Stream;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

/// A uniquely named work directory owned by exactly one request.
///
/// The directory is removed when the guard is dropped, or earlier through
/// [`TempWorkspace::remove`]. Removal is idempotent.
#[derive(Debug)]
pub struct TempWorkspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl TempWorkspace {
    /// Create `<base>/<prefix><random>`. `base` is created if missing.
    pub fn create(base: &Path, prefix: &str) -> io::Result<Self> {
        std::fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(base)?;
        let path = dir.path().to_path_buf();
        debug!("Allocated work dir: {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    /// Same as [`TempWorkspace::create`], run on the blocking pool.
    pub async fn create_async(base: PathBuf, prefix: String) -> io::Result<Self> {
        tokio::task::spawn_blocking(move || Self::create(&base, &prefix))
            .await
            .map_err(|e| io::Error::other(format!("Work dir task failed: {e}")))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory now. Later calls and the eventual drop are no-ops.
    pub fn remove(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match dir.close() {
            Ok(()) => debug!("Cleaned up work dir: {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                // TempDir::close consumed the handle; retry by path so a
                // transient failure doesn't strand the folder.
                if let Err(e2) = remove_folder(&self.path) {
                    error!(
                        "Error cleaning up work dir {}: {e} ({e2})",
                        self.path.display()
                    );
                }
            }
        }
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Remove a folder and all its contents, treating an absent folder as done.
pub fn remove_folder(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Drop `workspace` on the blocking pool when a runtime is around, inline
/// otherwise.
pub fn release_in_background(workspace: TempWorkspace) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || drop(workspace));
        }
        Err(_) => drop(workspace),
    }
}

fn remove_folder_in_background(path: PathBuf) {
    let remove = move || {
        if let Err(e) = remove_folder(&path) {
            error!("Error cleaning up work dir {}: {e}", path.display());
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(remove);
        }
        Err(_) => remove(),
    }
}

/// Response body stream that keeps its work directory alive until the body
/// is dropped, i.e. after the last chunk was sent or the client went away.
pub struct GuardedStream<S> {
    inner: S,
    workspace: Option<TempWorkspace>,
}

impl<S> GuardedStream<S> {
    pub fn new(inner: S, workspace: TempWorkspace) -> Self {
        Self {
            inner,
            workspace: Some(workspace),
        }
    }
}

impl<S> Drop for GuardedStream<S> {
    fn drop(&mut self) {
        // Runs inside the connection task; keep the recursive delete off it.
        if let Some(workspace) = self.workspace.take() {
            release_in_background(workspace);
        }
    }
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Pair a work dir with a blocking task that writes into it.
///
/// The [`WriterWatch`] stays with the awaiting future and the [`WriterLink`]
/// moves into the blocking closure. If the future is dropped before it
/// disarms the watch, the link removes the directory again once the writer
/// returns, so a writer that recreates it mid-flight cannot strand it.
#[cfg_attr(not(feature = "ytdlp"), allow(dead_code))]
pub fn link_blocking_writer(dir: &Path) -> (WriterWatch, WriterLink) {
    let abandoned = Arc::new(AtomicBool::new(false));
    let watch = WriterWatch {
        abandoned: abandoned.clone(),
        dir: dir.to_path_buf(),
        armed: true,
    };
    let link = WriterLink {
        abandoned,
        dir: dir.to_path_buf(),
    };
    (watch, link)
}

#[cfg_attr(not(feature = "ytdlp"), allow(dead_code))]
pub struct WriterWatch {
    abandoned: Arc<AtomicBool>,
    dir: PathBuf,
    armed: bool,
}

#[cfg_attr(not(feature = "ytdlp"), allow(dead_code))]
impl WriterWatch {
    /// The writer was awaited to completion; nothing left to do.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WriterWatch {
    fn drop(&mut self) {
        if self.armed {
            self.abandoned.store(true, Ordering::SeqCst);
            remove_folder_in_background(self.dir.clone());
        }
    }
}

#[cfg_attr(not(feature = "ytdlp"), allow(dead_code))]
pub struct WriterLink {
    abandoned: Arc<AtomicBool>,
    dir: PathBuf,
}

#[cfg_attr(not(feature = "ytdlp"), allow(dead_code))]
impl WriterLink {
    /// Call from the blocking task after its last write. Returns whether the
    /// request was abandoned, in which case the directory has been removed.
    pub fn finish(self) -> bool {
        if !self.abandoned.load(Ordering::SeqCst) {
            return false;
        }
        match remove_folder(&self.dir) {
            Ok(()) => warn!(
                "Removed work dir {} after its request went away",
                self.dir.display()
            ),
            Err(e) => error!("Error removing work dir {}: {e}", self.dir.display()),
        }
        true
    }
}

/// Remove `prefix`-named folders under `base_dir` older than `max_age`.
/// Returns the number of folders removed.
pub fn cleanup_stale_folders(base_dir: &Path, prefix: &str, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(base_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            error!("Error scanning directory {}: {e}", base_dir.display());
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0usize;

    for entry in entries.flatten() {
        let path = entry.path();
        let name_matches = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(prefix));
        if !name_matches || !path.is_dir() {
            continue;
        }

        let age = match entry.metadata().and_then(|m| m.modified()) {
            Ok(mtime) => now.duration_since(mtime).unwrap_or_default(),
            Err(_) => continue,
        };

        if age > max_age {
            match remove_folder(&path) {
                Ok(()) => {
                    removed += 1;
                    info!(
                        "Removed stale folder: {} (age: {}s)",
                        path.display(),
                        age.as_secs()
                    );
                }
                Err(e) => error!("Error removing folder {}: {e}", path.display()),
            }
        }
    }

    removed
}

/// Spawn the periodic sweeper for folders a crashed process left behind.
pub fn spawn_sweeper(base_dir: PathBuf, prefix: String, interval: Duration, max_age: Duration) {
    tokio::spawn(async move {
        info!(
            "Sweeping stale {prefix}* folders in {} every {}s",
            base_dir.display(),
            interval.as_secs()
        );
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let dir = base_dir.clone();
            let pfx = prefix.clone();
            let removed =
                tokio::task::spawn_blocking(move || cleanup_stale_folders(&dir, &pfx, max_age))
                    .await
                    .unwrap_or(0);

            if removed > 0 {
                info!("Scheduled cleanup: removed {removed} stale folders");
            }
        }
    });
}

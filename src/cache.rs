//! Shared cache of parsed project files.
//!
//! Imported `.props`/`.targets` files are shared by every project that pulls
//! them in, so they are parsed once and kept while referenced.  A
//! [`ProjectHandle`] is a refcount on the cached entry: when the last handle
//! for a path drops, the parsed project is evicted.  A cached entry is
//! reloaded when the file's modification time changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::debug;
use parking_lot::Mutex;

use crate::error::EvalError;
use crate::project::Project;

/// Process-shareable cache of parsed projects, keyed by canonical path.
#[derive(Clone, Default)]
pub struct ProjectCache {
    inner: Arc<CacheShared>,
}

#[derive(Default)]
struct CacheShared {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
    loads: AtomicUsize,
}

struct CacheEntry {
    refcount: usize,
    slot: Arc<Mutex<Slot>>,
}

#[derive(Default)]
struct Slot {
    project: Option<Arc<Project>>,
    modified: Option<SystemTime>,
}

/// A live reference to a cached project.  Dropping the handle releases the
/// reference; the entry is evicted when no handles remain.
pub struct ProjectHandle {
    cache: Arc<CacheShared>,
    path: PathBuf,
    project: Arc<Project>,
}

impl ProjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or reuse) the project at `path`, returning a handle that keeps
    /// it cached.
    pub fn acquire(&self, path: &Path) -> Result<ProjectHandle, EvalError> {
        let canonical = path
            .canonicalize()
            .map_err(|e| EvalError::Io { path: path.to_path_buf(), source: e })?;

        // Take the reference under the map lock, then parse under the entry
        // lock so concurrent loads of different files do not serialize.
        let slot = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(canonical.clone())
                .or_insert_with(|| CacheEntry { refcount: 0, slot: Arc::default() });
            entry.refcount += 1;
            entry.slot.clone()
        };

        let mut guard = slot.lock();
        let modified = std::fs::metadata(&canonical).and_then(|m| m.modified()).ok();
        let project = match &guard.project {
            Some(project) if guard.modified == modified => project.clone(),
            _ => {
                if guard.project.is_some() {
                    debug!("reloading changed project {}", canonical.display());
                }
                match Project::from_file(&canonical) {
                    Ok(parsed) => {
                        self.inner.loads.fetch_add(1, Ordering::Relaxed);
                        let parsed = Arc::new(parsed);
                        guard.project = Some(parsed.clone());
                        guard.modified = modified;
                        parsed
                    }
                    Err(e) => {
                        drop(guard);
                        self.inner.release(&canonical);
                        return Err(e);
                    }
                }
            }
        };
        drop(guard);

        Ok(ProjectHandle { cache: self.inner.clone(), path: canonical, project })
    }

    /// How many times a file has been parsed (reloads included).
    pub fn load_count(&self) -> usize {
        self.inner.loads.load(Ordering::Relaxed)
    }

    /// How many entries are currently referenced.
    pub fn cached_count(&self) -> usize {
        self.inner.entries.lock().len()
    }
}

impl CacheShared {
    fn release(&self, path: &Path) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(path) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entries.remove(path);
            }
        }
    }
}

impl ProjectHandle {
    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    /// The canonical path of the cached file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectHandle {
    fn drop(&mut self) {
        self.cache.release(&self.path);
    }
}

impl std::fmt::Debug for ProjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectHandle").field("path", &self.path).finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════

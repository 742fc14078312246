// DotStore
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Asynchronous file access layer
//!
//! One trait, two implementations: [`StdFileAccess`] for production and
//! [`MemoryFileAccess`] for tests and fault injection. Every operation is
//! time-boxed; an expired timeout surfaces as [`StoreError::Timeout`] and
//! releases the underlying timer.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use dotstore_common::{StoreError, StoreResult};

/// Byte-level file operations the storage handlers are written against
#[async_trait]
pub trait FileAccess: Send + Sync {
    /// Full contents of the file, or None when it does not exist.
    async fn read(&self, path: &Path) -> StoreResult<Option<Vec<u8>>>;

    /// Replace the file's contents as one atomic unit (write to a
    /// temporary file, fsync, rename into place).
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()>;

    /// Remove the file; absent files are not an error.
    async fn remove(&self, path: &Path) -> StoreResult<()>;

    /// Remove the directory and everything under it; absent directories
    /// are not an error.
    async fn remove_dir(&self, path: &Path) -> StoreResult<()>;

    /// Create the directory and any missing parents.
    async fn create_dir_all(&self, path: &Path) -> StoreResult<()>;

    /// File names (not paths) directly under the directory, sorted.
    /// An absent directory lists as empty.
    async fn list(&self, path: &Path) -> StoreResult<Vec<String>>;

    /// Names of subdirectories directly under the directory, sorted.
    /// Used when rebuilding the catalog from a directory scan.
    async fn list_dirs(&self, path: &Path) -> StoreResult<Vec<String>>;
}

/// Production file access backed by the real filesystem
pub struct StdFileAccess {
    timeout: Duration,
}

impl StdFileAccess {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn timed<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl FileAccess for StdFileAccess {
    async fn read(&self, path: &Path) -> StoreResult<Option<Vec<u8>>> {
        self.timed(async {
            match tokio::fs::read(path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(StoreError::from_io_read(e)),
            }
        })
        .await
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let path = path.to_path_buf();
        let bytes = bytes.to_vec();
        self.timed(async move {
            let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
            tokio::task::spawn_blocking(move || {
                let mut tmp = NamedTempFile::new_in(&parent).map_err(StoreError::from_io_write)?;
                tmp.write_all(&bytes).map_err(StoreError::from_io_write)?;
                tmp.as_file().sync_all().map_err(StoreError::from_io_write)?;
                tmp.persist(&path).map_err(|e| StoreError::from_io_write(e.error))?;
                Ok(())
            })
            .await
            .map_err(|e| StoreError::Unknown(e.to_string()))?
        })
        .await
    }

    async fn remove(&self, path: &Path) -> StoreResult<()> {
        self.timed(async {
            match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::from_io_write(e)),
            }
        })
        .await
    }

    async fn remove_dir(&self, path: &Path) -> StoreResult<()> {
        self.timed(async {
            match tokio::fs::remove_dir_all(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::from_io_write(e)),
            }
        })
        .await
    }

    async fn create_dir_all(&self, path: &Path) -> StoreResult<()> {
        self.timed(async { tokio::fs::create_dir_all(path).await.map_err(StoreError::from_io_write) }).await
    }

    async fn list(&self, path: &Path) -> StoreResult<Vec<String>> {
        self.timed(async {
            let mut dir = match tokio::fs::read_dir(path).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(StoreError::from_io_read(e)),
            };

            let mut names = Vec::new();
            while let Some(entry) = dir.next_entry().await.map_err(StoreError::from_io_read)? {
                if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn list_dirs(&self, path: &Path) -> StoreResult<Vec<String>> {
        self.timed(async {
            let mut dir = match tokio::fs::read_dir(path).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(StoreError::from_io_read(e)),
            };

            let mut names = Vec::new();
            while let Some(entry) = dir.next_entry().await.map_err(StoreError::from_io_read)? {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names.sort();
            Ok(names)
        })
        .await
    }
}

/// In-memory file access for tests
///
/// Stores files in a map and offers fault-injection hooks: corrupt a
/// stored file's bytes, or make the next writes to a path fail with a
/// transient error to exercise the retry paths.
#[derive(Default)]
pub struct MemoryFileAccess {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    failing_writes: Mutex<HashMap<PathBuf, u32>>,
}

impl MemoryFileAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate the stored bytes at `path` in place (corruption injection).
    pub fn corrupt<F>(&self, path: &Path, mutate: F) -> bool
    where
        F: FnOnce(&mut Vec<u8>),
    {
        let mut files = self.files.lock();
        match files.get_mut(path) {
            Some(bytes) => {
                mutate(bytes);
                true
            }
            None => false,
        }
    }

    /// Make the next `count` writes to `path` fail with a transient
    /// WriteFailed error.
    pub fn fail_next_writes(&self, path: &Path, count: u32) {
        self.failing_writes.lock().insert(path.to_path_buf(), count);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }
}

#[async_trait]
impl FileAccess for MemoryFileAccess {
    async fn read(&self, path: &Path) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.files.lock().get(path).cloned())
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        {
            let mut failing = self.failing_writes.lock();
            if let Some(remaining) = failing.get_mut(path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::WriteFailed("injected transient failure".into()));
                }
                failing.remove(path);
            }
        }
        self.files.lock().insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, path: &Path) -> StoreResult<()> {
        self.files.lock().remove(path);
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> StoreResult<()> {
        let mut files = self.files.lock();
        let doomed: Vec<PathBuf> = files.keys().filter(|p| p.starts_with(path)).cloned().collect();
        for p in doomed {
            files.remove(&p);
        }
        Ok(())
    }

    async fn create_dir_all(&self, _path: &Path) -> StoreResult<()> {
        Ok(())
    }

    async fn list(&self, path: &Path) -> StoreResult<Vec<String>> {
        let files = self.files.lock();
        let mut names: Vec<String> = files
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_dirs(&self, path: &Path) -> StoreResult<Vec<String>> {
        let files = self.files.lock();
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|p| {
                let rest = p.strip_prefix(path).ok()?;
                let mut components = rest.components();
                let first = components.next()?;
                // Only paths with at least one more component live in a
                // subdirectory.
                components.next()?;
                Some(first.as_os_str().to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

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

//! Single-file persistence handler
//!
//! The whole table lives in one `<table>.db` envelope, replaced atomically
//! on every write. A single file has no partial-failure boundary, so a
//! digest mismatch fails the read outright instead of being contained.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use dotstore_common::{Record, StoreResult};

use crate::crypto::CryptoProvider;
use crate::fs::FileAccess;
use crate::storage::envelope;
use crate::storage::{PersistenceHandler, ReadOutcome};

pub struct SingleFileHandler {
    path: PathBuf,
    fs: Arc<dyn FileAccess>,
    crypto: Arc<dyn CryptoProvider>,
}

impl SingleFileHandler {
    pub fn new(path: PathBuf, fs: Arc<dyn FileAccess>, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { path, fs, crypto }
    }

    /// Verified contents, or an empty set when the file does not exist.
    async fn read(&self) -> StoreResult<Vec<Record>> {
        match self.fs.read(&self.path).await? {
            None => Ok(Vec::new()),
            Some(bytes) => envelope::open(&bytes, self.crypto.as_ref()),
        }
    }

    async fn write(&self, records: &[Record]) -> StoreResult<()> {
        let bytes = envelope::seal(&records, self.crypto.as_ref())?;
        self.fs.write_atomic(&self.path, &bytes).await
    }
}

#[async_trait]
impl PersistenceHandler for SingleFileHandler {
    async fn read_all(&self) -> StoreResult<ReadOutcome> {
        Ok(ReadOutcome {
            records: self.read().await?,
            skipped_chunks: 0,
        })
    }

    async fn append(&self, records: &[Record]) -> StoreResult<()> {
        let mut all = self.read().await?;
        all.extend_from_slice(records);
        self.write(&all).await
    }

    async fn rewrite(&self, records: &[Record]) -> StoreResult<()> {
        self.write(records).await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.fs.remove(&self.path).await
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.read().await?.len())
    }

    async fn chunk_count(&self) -> StoreResult<u32> {
        Ok(0)
    }
}

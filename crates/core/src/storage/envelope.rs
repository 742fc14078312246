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

//! Checksummed payload envelope
//!
//! Every durable payload is stored as `{ "data": ..., "hash": "<hex>" }`
//! where the hash covers the serialized `data` value alone. The same
//! envelope wraps single-file tables, chunk files, and the catalog.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use dotstore_common::{StoreError, StoreResult};

use crate::crypto::CryptoProvider;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    data: T,
    hash: String,
}

/// Serialize `data` with its content digest into envelope bytes.
pub fn seal<T: Serialize>(data: &T, crypto: &dyn CryptoProvider) -> StoreResult<Vec<u8>> {
    let payload = serde_json::to_vec(data).map_err(|e| StoreError::WriteFailed(format!("serialization failed: {e}")))?;
    let envelope = Envelope {
        data,
        hash: crypto.digest(&payload),
    };
    serde_json::to_vec(&envelope).map_err(|e| StoreError::WriteFailed(format!("serialization failed: {e}")))
}

/// Parse envelope bytes, verify the digest, and return the payload.
/// Any parse failure or digest mismatch is [`StoreError::CorruptedData`].
pub fn open<T: Serialize + DeserializeOwned>(bytes: &[u8], crypto: &dyn CryptoProvider) -> StoreResult<T> {
    let envelope: Envelope<T> = serde_json::from_slice(bytes).map_err(|e| StoreError::CorruptedData(format!("malformed envelope: {e}")))?;

    let payload = serde_json::to_vec(&envelope.data).map_err(|e| StoreError::CorruptedData(format!("payload re-serialization failed: {e}")))?;
    let actual = crypto.digest(&payload);
    if actual != envelope.hash {
        return Err(StoreError::CorruptedData(format!("digest mismatch: stored {} computed {}", envelope.hash, actual)));
    }

    Ok(envelope.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StdCrypto;
    use dotstore_common::Record;
    use dotstore_common::record_from_value;
    use serde_json::json;

    fn sample_records() -> Vec<Record> {
        vec![
            record_from_value(json!({"id": 1, "name": "Ada"})).unwrap(),
            record_from_value(json!({"id": 2, "tags": ["a", "b"], "nested": {"x": 1}})).unwrap(),
        ]
    }

    #[test]
    fn test_seal_open_round_trip() {
        let crypto = StdCrypto::new();
        let records = sample_records();

        let bytes = seal(&records, &crypto).unwrap();
        let opened: Vec<Record> = open(&bytes, &crypto).unwrap();
        assert_eq!(opened, records);
    }

    #[test]
    fn test_open_detects_tampering() {
        let crypto = StdCrypto::new();
        let bytes = seal(&sample_records(), &crypto).unwrap();

        // Flip a byte inside the data payload, leaving valid JSON.
        let text = String::from_utf8(bytes).unwrap();
        let tampered = text.replace("Ada", "Eve");
        assert_ne!(text, tampered);

        let result: StoreResult<Vec<Record>> = open(tampered.as_bytes(), &crypto);
        assert!(matches!(result, Err(StoreError::CorruptedData(_))));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let crypto = StdCrypto::new();
        let result: StoreResult<Vec<Record>> = open(b"not json at all", &crypto);
        assert!(matches!(result, Err(StoreError::CorruptedData(_))));
    }

    #[test]
    fn test_envelope_shape_on_disk() {
        let crypto = StdCrypto::new();
        let bytes = seal(&sample_records(), &crypto).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert!(value.get("data").unwrap().is_array());
        assert_eq!(value.get("hash").unwrap().as_str().unwrap().len(), 64);
    }
}

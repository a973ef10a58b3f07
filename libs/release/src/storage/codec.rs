//! Record encoding for backends that store opaque strings.
//!
//! Records are serialized to JSON, gzip-compressed, and base64-encoded.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{StoreError, StoreResult};
use crate::release::Release;

/// Default maximum encoded record size (1 MiB).
pub const DEFAULT_RECORD_LIMIT: usize = 1024 * 1024;

/// Encode a release, enforcing `limit` on the encoded size.
pub fn encode(release: &Release, limit: usize) -> StoreResult<String> {
    let json = serde_json::to_vec(release)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    let encoded = STANDARD.encode(compressed);
    if encoded.len() > limit {
        return Err(StoreError::RecordTooLarge {
            size: encoded.len(),
            limit,
        });
    }
    Ok(encoded)
}

/// Decode a release produced by [`encode`].
pub fn decode(data: &str) -> StoreResult<Release> {
    let compressed = STANDARD
        .decode(data.trim())
        .map_err(|e| StoreError::Codec(format!("invalid base64: {e}")))?;

    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| StoreError::Codec(format!("invalid gzip stream: {e}")))?;

    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::ReleaseStatus;
    use crate::storage::testing::release;

    #[test]
    fn test_encode_decode() {
        let original = release("demo", 1, ReleaseStatus::Deployed);
        let encoded = encode(&original, DEFAULT_RECORD_LIMIT).unwrap();
        assert_eq!(decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_size_limit() {
        let mut big = release("demo", 1, ReleaseStatus::Deployed);
        // Incompressible-ish payload so gzip cannot hide the size.
        big.manifest = (0..20_000u32)
            .map(|i| format!("{:08x}", i.wrapping_mul(2_654_435_761)))
            .collect();

        let err = encode(&big, 4096).unwrap_err();
        assert!(matches!(err, StoreError::RecordTooLarge { limit: 4096, .. }));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode("%%%"), Err(StoreError::Codec(_))));
        let not_gzip = STANDARD.encode(b"plain");
        assert!(matches!(decode(&not_gzip), Err(StoreError::Codec(_))));
    }
}

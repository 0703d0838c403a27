//! Gzip request body compression.

use std::io::Read;

use flate2::read::GzEncoder;
use flate2::Compression;
use kpistream_core::error::CoreError;

/// Compress `data` with gzip at the default level.
///
/// The gzip header carries no timestamp, so equal input gives equal output.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>, CoreError> {
    let mut encoder = GzEncoder::new(data, Compression::default());
    let mut compressed = Vec::with_capacity(data.len() / 4);
    encoder
        .read_to_end(&mut compressed)
        .map_err(|e| CoreError::Internal(format!("gzip compression failed: {e}")))?;
    Ok(compressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut decompressed = Vec::new();
        GzDecoder::new(data).read_to_end(&mut decompressed)?;
        Ok(decompressed)
    }

    #[test]
    fn gzip_roundtrip() {
        let data = br#"[{"common":{"attributes":{}},"metrics":[]}]"#;
        let compressed = gzip(data).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert_eq!(gunzip(&compressed).unwrap(), data.to_vec());
    }

    #[test]
    fn gzip_is_deterministic() {
        let data = "bztRPS ".repeat(500);
        assert_eq!(gzip(data.as_bytes()).unwrap(), gzip(data.as_bytes()).unwrap());
    }

    #[test]
    fn gunzip_rejects_garbage() {
        assert!(gunzip(b"not gzip").is_err());
    }
}

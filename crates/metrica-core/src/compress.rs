//! Gzip helpers for request and response bodies.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Value of the `Content-Encoding` / `Accept-Encoding` token handled here.
pub const GZIP: &str = "gzip";

/// Compresses `data` at the default level.
pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompresses a complete gzip stream of at most `limit` bytes.
///
/// Fails on truncated or non-gzip input and with `InvalidData` once the
/// output would exceed `limit`.
pub fn gunzip(data: &[u8], limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(limit));
    GzDecoder::new(data)
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("decompressed body exceeds {limit} bytes"),
        ));
    }
    Ok(out)
}

/// Returns true if a comma-separated header value lists the gzip token.
pub fn accepts_gzip(header: &str) -> bool {
    header
        .split(',')
        .filter_map(|part| part.split(';').next())
        .any(|token| token.trim().eq_ignore_ascii_case(GZIP))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let body = br#"[{"id":"a","type":"gauge","value":2.5}]"#.repeat(20);
        let packed = gzip(&body).unwrap();
        assert!(packed.len() < body.len());
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
        assert_eq!(gunzip(&packed, body.len()).unwrap(), body);
    }

    #[test]
    fn rejects_plain_input() {
        assert!(gunzip(b"{\"id\":\"a\"}", 1024).is_err());
    }

    #[test]
    fn rejects_truncated_stream() {
        let packed = gzip(b"some payload that is long enough").unwrap();
        assert!(gunzip(&packed[..packed.len() - 6], 1024).is_err());
    }

    #[test]
    fn output_is_capped() {
        let bomb = gzip(&vec![0u8; 1 << 20]).unwrap();
        assert!(bomb.len() < 4096);
        let err = gunzip(&bomb, 64 * 1024).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert_eq!(gunzip(&bomb, 1 << 20).unwrap().len(), 1 << 20);
    }

    #[test]
    fn header_tokens() {
        assert!(accepts_gzip("gzip"));
        assert!(accepts_gzip("deflate, gzip;q=0.8"));
        assert!(accepts_gzip("GZIP"));
        assert!(!accepts_gzip("br, deflate"));
        assert!(!accepts_gzip(""));
    }
}

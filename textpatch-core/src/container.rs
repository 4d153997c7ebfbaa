use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};
use tracing::warn;

use crate::{PatchError, Result};

// Auxiliary asset containers: a 4-byte little-endian uncompressed-size
// prefix followed by a gzip stream.

pub fn decompress_container(container: &[u8]) -> Result<Vec<u8>> {
    if container.len() < 4 {
        return Err(PatchError::Config(format!(
            "container of {} bytes is too small to hold a size prefix",
            container.len()
        )));
    }
    let declared = u32::from_le_bytes([container[0], container[1], container[2], container[3]])
        as usize;

    let mut decoder = GzDecoder::new(&container[4..]);
    let mut raw = Vec::with_capacity(declared);
    decoder.read_to_end(&mut raw)?;

    if raw.len() != declared {
        // Some shipped containers carry a stale prefix; the stream itself is
        // authoritative.
        warn!(declared, actual = raw.len(), "container size prefix mismatch");
    }
    Ok(raw)
}

pub fn compress_container(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    let compressed = encoder.finish()?;

    let mut out = Vec::with_capacity(4 + compressed.len());
    out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{compress_container, decompress_container};

    #[test]
    fn round_trip_preserves_length_and_content() {
        let raw: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let container = compress_container(&raw).unwrap();
        assert_eq!(container[0..4], (raw.len() as u32).to_le_bytes());
        let back = decompress_container(&container).unwrap();
        assert_eq!(back.len(), raw.len());
        assert_eq!(back, raw);
    }

    #[test]
    fn empty_payload_round_trips() {
        let container = compress_container(&[]).unwrap();
        assert_eq!(decompress_container(&container).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn truncated_prefix_is_rejected() {
        assert!(decompress_container(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn garbage_stream_is_an_error() {
        let bogus = [0x04, 0x00, 0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        assert!(decompress_container(&bogus).is_err());
    }
}

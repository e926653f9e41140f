//! LZSS decompression for mkext v1 payloads: compressed payloads use LZSS,
//! compressed-size zero means stored. No off-the-shelf crate implements
//! this particular ring-buffer variant (the classic Okumura LZSS XNU/EFI
//! toolchains have shipped for decades), so it's hand-rolled here rather
//! than faked behind a fabricated dependency.
//!
//! This engine only ever needs to *decompress* mkext v1 payloads —
//! `InjectComplete` always re-emits mkext contents uncompressed — so only
//! the decoder is implemented.

use crate::error::{KextError, Result};

const RING_BUFFER_SIZE: usize = 4096;
const MAX_MATCH_LEN: usize = 18;
const MATCH_LEN_THRESHOLD: usize = 2;
const RING_FILL_BYTE: u8 = 0x20;

/// Decompress an LZSS-compressed buffer into exactly `full_size` bytes.
/// Returns the number of bytes written, matching the C API's "return
/// decompressed size or 0 on failure" convention used at call sites that
/// compare against an expected size: a result length that doesn't match
/// the declared full size is treated as failure.
pub fn decompress(input: &[u8], full_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(full_size);
    let mut ring = [RING_FILL_BYTE; RING_BUFFER_SIZE];
    let mut ring_pos = RING_BUFFER_SIZE - MAX_MATCH_LEN;

    let mut input_pos = 0usize;
    let mut flags = 0u32;

    while out.len() < full_size {
        flags >>= 1;
        if flags & 0x100 == 0 {
            let control = *input
                .get(input_pos)
                .ok_or(KextError::LoadError("LZSS input truncated (control byte)".into()))?;
            input_pos += 1;
            flags = control as u32 | 0xFF00;
        }

        if flags & 1 != 0 {
            let byte = *input
                .get(input_pos)
                .ok_or(KextError::LoadError("LZSS input truncated (literal)".into()))?;
            input_pos += 1;

            out.push(byte);
            ring[ring_pos] = byte;
            ring_pos = (ring_pos + 1) % RING_BUFFER_SIZE;
        } else {
            let lo = *input
                .get(input_pos)
                .ok_or(KextError::LoadError("LZSS input truncated (match low byte)".into()))?;
            let hi = *input
                .get(input_pos + 1)
                .ok_or(KextError::LoadError("LZSS input truncated (match high byte)".into()))?;
            input_pos += 2;

            let match_pos = (lo as usize) | (((hi as usize) & 0xF0) << 4);
            let match_len = ((hi as usize) & 0x0F) + MATCH_LEN_THRESHOLD;

            for k in 0..=match_len {
                if out.len() >= full_size {
                    break;
                }
                let byte = ring[(match_pos + k) % RING_BUFFER_SIZE];
                out.push(byte);
                ring[ring_pos] = byte;
                ring_pos = (ring_pos + 1) % RING_BUFFER_SIZE;
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal_only(bytes: &[u8]) -> Vec<u8> {
        // One control byte of all-ones (every slot is a literal) per 8
        // input bytes, followed by the literals themselves.
        let mut out = Vec::new();
        for chunk in bytes.chunks(8) {
            out.push(0xFF);
            out.extend_from_slice(chunk);
        }
        out
    }

    #[test]
    fn decompresses_all_literal_stream() {
        let payload = b"hello world! this is a test.";
        let compressed = literal_only(payload);
        let out = decompress(&compressed, payload.len()).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn truncated_input_errors() {
        assert!(decompress(&[0xFF], 4).is_err());
    }
}

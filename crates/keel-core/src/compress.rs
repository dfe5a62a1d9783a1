use std::io::Read;

use serde::{Deserialize, Serialize};

use keel_types::error::{KeelError, Result};

const TAG_NONE: u8 = 0x00;
const TAG_ZSTD: u8 = 0x02;

/// Upper bound on decompressed index payloads.
const MAX_DECOMPRESS_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd { level: 3 }
    }
}

/// Compress and prepend a 1-byte codec tag.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let (tag, body) = match compression {
        Compression::None => (TAG_NONE, data.to_vec()),
        Compression::Zstd { level } => (
            TAG_ZSTD,
            zstd::bulk::compress(data, level)
                .map_err(|e| KeelError::Other(format!("zstd compress: {e}")))?,
        ),
    };
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Inverse of [`compress`]. Unknown tags and oversized output are corruption.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(KeelError::Corruption("empty compressed payload".into()));
    };
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| KeelError::Corruption(format!("zstd init: {e}")))?;
            let mut output = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| KeelError::Corruption(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(KeelError::Corruption(format!(
                    "decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        other => Err(KeelError::Corruption(format!(
            "unknown compression tag 0x{other:02x}"
        ))),
    }
}

//! GGUF header parsing.
//!
//! Walks the metadata key/value table far enough to pull out classification
//! signals (`general.architecture`, `general.name`). Values are skipped
//! structurally, so arrays early in the table do not end the walk.

use crate::error::{LibraryError, Result};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// GGUF magic bytes.
pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Upper bound on metadata entries we are willing to walk.
const MAX_KV_ENTRIES: u64 = 256;
/// Upper bound on a single GGUF string.
const MAX_STRING_LEN: u64 = 1024 * 1024;

/// Signals pulled from a GGUF header.
#[derive(Debug, Clone, Default)]
pub struct GgufSignals {
    pub version: u32,
    pub architecture: Option<String>,
    pub general_name: Option<String>,
    /// Other small string-valued metadata entries under `general.`
    pub extra: HashMap<String, String>,
}

/// Read GGUF classification signals from a file.
pub fn read_gguf_signals(path: &Path) -> Result<GgufSignals> {
    let mut file = std::fs::File::open(path).map_err(|e| LibraryError::io_with_path(e, path))?;
    read_signals(&mut file).map_err(|e| match e {
        LibraryError::Io { message, source, .. } => LibraryError::Io {
            message,
            path: Some(path.to_path_buf()),
            source,
        },
        other => other,
    })
}

fn read_signals<R: Read>(reader: &mut R) -> Result<GgufSignals> {
    let mut header = [0u8; 24];
    reader.read_exact(&mut header)?;

    if &header[..4] != GGUF_MAGIC {
        return Err(LibraryError::metadata("Not a GGUF file"));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let kv_count = u64::from_le_bytes([
        header[16], header[17], header[18], header[19], header[20], header[21], header[22],
        header[23],
    ]);

    let mut signals = GgufSignals {
        version,
        ..Default::default()
    };

    for _ in 0..kv_count.min(MAX_KV_ENTRIES) {
        let key = read_string(reader)?;
        let value_type = read_u32(reader)?;

        if value_type == GGUF_TYPE_STRING {
            let value = read_string(reader)?;
            match key.as_str() {
                "general.architecture" => signals.architecture = Some(value),
                "general.name" => signals.general_name = Some(value),
                k if k.starts_with("general.") && value.len() <= 256 => {
                    signals.extra.insert(key, value);
                }
                _ => {}
            }
        } else {
            skip_value(reader, value_type)?;
        }

        if signals.architecture.is_some() && signals.general_name.is_some() {
            break;
        }
    }

    Ok(signals)
}

const GGUF_TYPE_STRING: u32 = 8;
const GGUF_TYPE_ARRAY: u32 = 9;

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(LibraryError::metadata("GGUF string exceeds size limit"));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| LibraryError::metadata("Invalid UTF-8 in GGUF string"))
}

/// Fixed byte width of a scalar GGUF value type, if it has one.
fn scalar_width(value_type: u32) -> Option<u64> {
    match value_type {
        0 | 1 | 7 => Some(1), // uint8, int8, bool
        2 | 3 => Some(2),     // uint16, int16
        4 | 5 | 6 => Some(4), // uint32, int32, float32
        10 | 11 | 12 => Some(8), // uint64, int64, float64
        _ => None,
    }
}

fn skip_value<R: Read>(reader: &mut R, value_type: u32) -> Result<()> {
    match value_type {
        GGUF_TYPE_STRING => {
            read_string(reader)?;
            Ok(())
        }
        GGUF_TYPE_ARRAY => {
            let element_type = read_u32(reader)?;
            let len = read_u64(reader)?;
            if let Some(width) = scalar_width(element_type) {
                skip_bytes(reader, width.saturating_mul(len))
            } else if element_type == GGUF_TYPE_STRING {
                for _ in 0..len {
                    read_string(reader)?;
                }
                Ok(())
            } else {
                Err(LibraryError::metadata("Nested GGUF arrays are not supported"))
            }
        }
        other => match scalar_width(other) {
            Some(width) => skip_bytes(reader, width),
            None => Err(LibraryError::metadata(format!(
                "Unknown GGUF value type {}",
                other
            ))),
        },
    }
}

fn skip_bytes<R: Read>(reader: &mut R, count: u64) -> Result<()> {
    let copied = std::io::copy(&mut reader.take(count), &mut std::io::sink())?;
    if copied != count {
        return Err(LibraryError::metadata("GGUF header truncated"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal GGUF header with the given KV entries.
    fn gguf_bytes(entries: &[(&str, GgufValue)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(GGUF_MAGIC);
        out.extend_from_slice(&3u32.to_le_bytes()); // version
        out.extend_from_slice(&0u64.to_le_bytes()); // tensor count
        out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        for (key, value) in entries {
            push_string(&mut out, key);
            value.encode(&mut out);
        }
        out
    }

    enum GgufValue {
        Str(&'static str),
        U32(u32),
        StrArray(Vec<&'static str>),
    }

    impl GgufValue {
        fn encode(&self, out: &mut Vec<u8>) {
            match self {
                GgufValue::Str(s) => {
                    out.extend_from_slice(&GGUF_TYPE_STRING.to_le_bytes());
                    push_string(out, s);
                }
                GgufValue::U32(v) => {
                    out.extend_from_slice(&4u32.to_le_bytes());
                    out.extend_from_slice(&v.to_le_bytes());
                }
                GgufValue::StrArray(items) => {
                    out.extend_from_slice(&GGUF_TYPE_ARRAY.to_le_bytes());
                    out.extend_from_slice(&GGUF_TYPE_STRING.to_le_bytes());
                    out.extend_from_slice(&(items.len() as u64).to_le_bytes());
                    for item in items {
                        push_string(out, item);
                    }
                }
            }
        }
    }

    fn push_string(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u64).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn extracts_architecture() {
        let bytes = gguf_bytes(&[
            ("general.architecture", GgufValue::Str("llama")),
            ("general.name", GgufValue::Str("Llama 2 7B")),
        ]);
        let signals = read_signals(&mut bytes.as_slice()).unwrap();
        assert_eq!(signals.version, 3);
        assert_eq!(signals.architecture.as_deref(), Some("llama"));
        assert_eq!(signals.general_name.as_deref(), Some("Llama 2 7B"));
    }

    #[test]
    fn skips_arrays_before_architecture() {
        let bytes = gguf_bytes(&[
            ("tokenizer.ggml.tokens", GgufValue::StrArray(vec!["a", "b", "c"])),
            ("llama.context_length", GgufValue::U32(4096)),
            ("general.architecture", GgufValue::Str("llama")),
        ]);
        let signals = read_signals(&mut bytes.as_slice()).unwrap();
        assert_eq!(signals.architecture.as_deref(), Some("llama"));
    }

    #[test]
    fn rejects_non_gguf() {
        let bytes = b"NOPExxxxxxxxxxxxxxxxxxxxxxxx".to_vec();
        assert!(read_signals(&mut bytes.as_slice()).is_err());
    }
}

//! Format and model-type classification from file contents.
//!
//! Inspects magic bytes and structured headers (GGUF key/value table,
//! safetensors header JSON, `config.json` architecture lists) and emits
//! [`ClassificationHints`] for the importer. Soft signals such as repo name
//! tokens are deliberately not consulted here; they only enter the scoring in
//! [`model_type`] as hints.

pub mod gguf;
pub mod model_type;
pub mod task_signature;

use crate::error::{LibraryError, Result};
use crate::types::{FileFormat, ModelType};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::debug;

mod magic {
    pub const GGUF: &[u8; 4] = b"GGUF";
    pub const GGML: &[u8; 4] = b"lmgg";
    pub const GGJT: &[u8; 4] = b"ggjt";
    /// ZIP header, used by PyTorch .pt checkpoints
    pub const ZIP: &[u8; 4] = &[0x50, 0x4B, 0x03, 0x04];
    pub const PICKLE_PROTO: u8 = 0x80;
}

/// Signals extracted from an artifact for classification.
#[derive(Debug, Clone, Default)]
pub struct ClassificationHints {
    /// Detected format of the primary file (Unknown for bare directories)
    pub format: Option<FileFormat>,
    /// Model-type candidate before rule scoring (header-derived)
    pub model_type_candidate: ModelType,
    /// Architecture strings (config.json `architectures[]`, GGUF
    /// `general.architecture`, diffusers `_class_name`)
    pub architecture_tokens: Vec<String>,
    /// `model_type` from config.json
    pub config_model_type: Option<String>,
    /// Raw task labels found alongside the artifact
    pub raw_task_hints: Vec<String>,
    /// Small free-form extras (gguf version, header names)
    pub extra: HashMap<String, String>,
}

impl ClassificationHints {
    fn merge(&mut self, other: ClassificationHints) {
        if self.format.is_none() {
            self.format = other.format;
        }
        if self.model_type_candidate == ModelType::Unknown {
            self.model_type_candidate = other.model_type_candidate;
        }
        for token in other.architecture_tokens {
            if !self.architecture_tokens.contains(&token) {
                self.architecture_tokens.push(token);
            }
        }
        if self.config_model_type.is_none() {
            self.config_model_type = other.config_model_type;
        }
        self.raw_task_hints.extend(other.raw_task_hints);
        self.extra.extend(other.extra);
    }
}

/// Detect the file format from magic bytes, falling back to the extension.
pub fn detect_format(path: &Path) -> Result<FileFormat> {
    let mut file = std::fs::File::open(path).map_err(|e| LibraryError::io_with_path(e, path))?;
    let mut header = [0u8; 16];
    let bytes_read = file
        .read(&mut header)
        .map_err(|e| LibraryError::io_with_path(e, path))?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    Ok(detect_format_from_header(&header[..bytes_read], &extension))
}

fn detect_format_from_header(header: &[u8], extension: &str) -> FileFormat {
    if header.len() >= 4 {
        if &header[..4] == magic::GGUF {
            return FileFormat::Gguf;
        }
        if &header[..4] == magic::GGML || &header[..4] == magic::GGJT {
            return FileFormat::Ggml;
        }
        if &header[..4] == magic::ZIP {
            return FileFormat::Pickle;
        }
    }

    if header.len() >= 2 && header[0] == magic::PICKLE_PROTO && (2..=5).contains(&header[1]) {
        return FileFormat::Pickle;
    }

    // Safetensors: little-endian u64 header length followed by JSON.
    if header.len() >= 9 {
        let header_size = u64::from_le_bytes(header[..8].try_into().unwrap_or([0; 8]));
        if header_size > 0 && header_size < 100_000_000 && header[8] == b'{' {
            return FileFormat::Safetensors;
        }
    }

    match extension {
        "gguf" => FileFormat::Gguf,
        "ggml" | "bin" => FileFormat::Ggml,
        "safetensors" => FileFormat::Safetensors,
        "pt" | "pth" | "ckpt" => FileFormat::Pickle,
        "onnx" => FileFormat::Onnx,
        _ => FileFormat::Unknown,
    }
}

/// Classify a file or a repository-style directory.
pub fn classify(path: &Path) -> Result<ClassificationHints> {
    if path.is_dir() {
        classify_directory(path)
    } else {
        classify_file(path)
    }
}

fn classify_file(path: &Path) -> Result<ClassificationHints> {
    let format = detect_format(path)?;
    let mut hints = ClassificationHints {
        format: Some(format),
        ..Default::default()
    };

    match format {
        FileFormat::Gguf => {
            let signals = gguf::read_gguf_signals(path)?;
            // GGUF carries LLM weights in practice; the rule scoring still
            // has the final say via the architecture token.
            hints.model_type_candidate = ModelType::Llm;
            if let Some(arch) = signals.architecture {
                hints.architecture_tokens.push(arch.clone());
                hints.config_model_type = Some(arch);
            }
            if let Some(name) = signals.general_name {
                hints.extra.insert("general.name".to_string(), name);
            }
            hints
                .extra
                .insert("gguf_version".to_string(), signals.version.to_string());
        }
        FileFormat::Safetensors => {
            if let Some(st) = read_safetensors_metadata(path)? {
                hints.merge(st);
            }
        }
        _ => {}
    }

    debug!(
        "Classified {}: format={} arch={:?}",
        path.display(),
        format.as_str(),
        hints.architecture_tokens
    );
    Ok(hints)
}

fn classify_directory(dir: &Path) -> Result<ClassificationHints> {
    let mut hints = ClassificationHints::default();

    if let Some(config) = read_config_signals(&dir.join("config.json"))? {
        hints.merge(config);
    }

    // Diffusers-style repos identify the pipeline in model_index.json.
    let model_index = dir.join("model_index.json");
    if model_index.exists() {
        if let Some(value) = crate::storage::atomic_read_json::<Value>(&model_index)? {
            if let Some(class_name) = value.get("_class_name").and_then(Value::as_str) {
                hints.architecture_tokens.push(class_name.to_string());
                hints.model_type_candidate = ModelType::Diffusion;
            }
        }
    }

    Ok(hints)
}

/// Pull `architectures[]` and `model_type` from a transformer config.json.
fn read_config_signals(config_path: &Path) -> Result<Option<ClassificationHints>> {
    let Some(config) = crate::storage::atomic_read_json::<Value>(config_path)? else {
        return Ok(None);
    };

    let mut hints = ClassificationHints::default();
    if let Some(archs) = config.get("architectures").and_then(Value::as_array) {
        hints.architecture_tokens = archs
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    hints.config_model_type = config
        .get("model_type")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());

    Ok(Some(hints))
}

/// Read the safetensors header JSON and surface `__metadata__` values.
fn read_safetensors_metadata(path: &Path) -> Result<Option<ClassificationHints>> {
    let mut file = std::fs::File::open(path).map_err(|e| LibraryError::io_with_path(e, path))?;
    let mut len_buf = [0u8; 8];
    if file.read_exact(&mut len_buf).is_err() {
        return Ok(None);
    }
    let header_len = u64::from_le_bytes(len_buf);
    if header_len == 0 || header_len > 100_000_000 {
        return Ok(None);
    }

    let mut header_bytes = vec![0u8; header_len as usize];
    if file.read_exact(&mut header_bytes).is_err() {
        return Ok(None);
    }
    let Ok(header) = serde_json::from_slice::<Value>(&header_bytes) else {
        return Ok(None);
    };

    let mut hints = ClassificationHints::default();
    if let Some(meta) = header.get("__metadata__").and_then(Value::as_object) {
        for (key, value) in meta {
            if let Some(s) = value.as_str() {
                if key == "modelspec.architecture" {
                    hints.architecture_tokens.push(s.to_string());
                }
                if s.len() <= 256 {
                    hints.extra.insert(key.clone(), s.to_string());
                }
            }
        }
    }
    Ok(Some(hints))
}

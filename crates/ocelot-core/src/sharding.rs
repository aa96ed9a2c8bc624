//! Sharded model set detection and completeness validation.
//!
//! # Supported patterns
//!
//! 1. `model-00001-of-00005.safetensors` (total count encoded)
//! 2. `model.safetensors.part-1` / `model.safetensors.part1`
//! 3. `model_00001.safetensors` (bare numeric suffix)

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Captures: (base_name, shard_index, total_count, extension)
static PATTERN_WITH_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)-(\d{5})-of-(\d{5})(\.[^.]+)$").unwrap());

/// Captures: (base_name_with_extension, part_number)
static PATTERN_PART_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+\.[^.]+)\.part-?(\d+)$").unwrap());

/// Captures: (base_name, shard_index, extension)
static PATTERN_NUMERIC_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)_(\d{5})(\.[^.]+)$").unwrap());

/// One detected group: either a sharded set or a standalone file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardGroup {
    /// Group key (`model.safetensors` for shard sets, the filename itself
    /// for standalone files)
    pub key: String,
    pub files: Vec<PathBuf>,
    pub is_sharded: bool,
}

/// Completeness check result for one shard group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ShardValidation {
    pub is_complete: bool,
    /// Expected total from the filename pattern (0 when unknown)
    pub total_shards: usize,
    pub found_shards: Vec<usize>,
    pub missing_shards: Vec<usize>,
}

/// Group files into sharded sets and standalone files.
///
/// Groups are returned in deterministic key order; files within a group are
/// sorted by filename so shard order matches index order.
pub fn detect_shard_groups(files: &[PathBuf]) -> Vec<ShardGroup> {
    let mut sharded: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut standalone: Vec<PathBuf> = Vec::new();

    for path in files {
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };

        let group_key = if let Some(caps) = PATTERN_WITH_TOTAL.captures(filename) {
            Some(format!("{}{}", &caps[1], &caps[4]))
        } else if let Some(caps) = PATTERN_PART_SUFFIX.captures(filename) {
            Some(caps[1].to_string())
        } else if let Some(caps) = PATTERN_NUMERIC_SUFFIX.captures(filename) {
            Some(format!("{}{}", &caps[1], &caps[3]))
        } else {
            None
        };

        match group_key {
            Some(key) => sharded.entry(key).or_default().push(path.clone()),
            None => standalone.push(path.clone()),
        }
    }

    let mut groups = Vec::new();
    for (key, mut group_files) in sharded {
        group_files.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
        if group_files.len() > 1 || expected_total(&group_files).is_some() {
            groups.push(ShardGroup {
                key,
                files: group_files,
                is_sharded: true,
            });
        } else {
            // Single numbered file with no declared total: treat standalone.
            standalone.extend(group_files);
        }
    }

    for path in standalone {
        if let Some(filename) = path.file_name().and_then(|s| s.to_str()) {
            groups.push(ShardGroup {
                key: filename.to_string(),
                files: vec![path],
                is_sharded: false,
            });
        }
    }

    groups.sort_by(|a, b| a.key.cmp(&b.key));
    groups
}

/// Expected shard total from the `-NNNNN-of-NNNNN` pattern, if present.
fn expected_total(files: &[PathBuf]) -> Option<usize> {
    files.iter().find_map(|path| {
        let filename = path.file_name()?.to_str()?;
        let caps = PATTERN_WITH_TOTAL.captures(filename)?;
        caps[3].parse::<usize>().ok()
    })
}

/// Validate that a shard group is complete.
///
/// Only the `-NNNNN-of-NNNNN` pattern declares its total; `.part-N` and bare
/// numeric suffixes are assumed complete when indices are contiguous from 1.
pub fn validate_shard_completeness(shard_files: &[PathBuf]) -> ShardValidation {
    let mut found: Vec<usize> = Vec::new();
    let mut total = expected_total(shard_files).unwrap_or(0);

    for path in shard_files {
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let index = PATTERN_WITH_TOTAL
            .captures(filename)
            .and_then(|c| c[2].parse::<usize>().ok())
            .or_else(|| {
                PATTERN_PART_SUFFIX
                    .captures(filename)
                    .and_then(|c| c[2].parse::<usize>().ok())
            })
            .or_else(|| {
                PATTERN_NUMERIC_SUFFIX
                    .captures(filename)
                    .and_then(|c| c[2].parse::<usize>().ok())
            });
        if let Some(index) = index {
            found.push(index);
        }
    }

    found.sort_unstable();
    found.dedup();

    if total == 0 {
        // No declared total: contiguity from 1 is the best available check.
        total = found.last().copied().unwrap_or(0);
    }

    let missing: Vec<usize> = (1..=total).filter(|i| !found.contains(i)).collect();

    ShardValidation {
        is_complete: !found.is_empty() && missing.is_empty(),
        total_shards: total,
        found_shards: found,
        missing_shards: missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn groups_counted_shards() {
        let groups = detect_shard_groups(&paths(&[
            "model-00001-of-00003.safetensors",
            "model-00002-of-00003.safetensors",
            "model-00003-of-00003.safetensors",
            "standalone.gguf",
        ]));

        assert_eq!(groups.len(), 2);
        let sharded = groups.iter().find(|g| g.is_sharded).unwrap();
        assert_eq!(sharded.key, "model.safetensors");
        assert_eq!(sharded.files.len(), 3);
        let single = groups.iter().find(|g| !g.is_sharded).unwrap();
        assert_eq!(single.key, "standalone.gguf");
    }

    #[test]
    fn groups_part_suffix_forms() {
        let groups = detect_shard_groups(&paths(&[
            "weights.bin.part-1",
            "weights.bin.part-2",
        ]));
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_sharded);
        assert_eq!(groups[0].key, "weights.bin");
    }

    #[test]
    fn lone_counted_shard_is_still_a_set() {
        // One file of a declared three-shard set: incomplete set, not a
        // standalone file.
        let groups = detect_shard_groups(&paths(&["model-00001-of-00003.safetensors"]));
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_sharded);
    }

    #[test]
    fn lone_numeric_suffix_is_standalone() {
        let groups = detect_shard_groups(&paths(&["model_00001.safetensors"]));
        assert_eq!(groups.len(), 1);
        assert!(!groups[0].is_sharded);
    }

    #[test]
    fn validates_complete_set() {
        let validation = validate_shard_completeness(&paths(&[
            "model-00001-of-00003.safetensors",
            "model-00002-of-00003.safetensors",
            "model-00003-of-00003.safetensors",
        ]));
        assert!(validation.is_complete);
        assert_eq!(validation.total_shards, 3);
        assert!(validation.missing_shards.is_empty());
    }

    #[test]
    fn reports_missing_shards() {
        let validation = validate_shard_completeness(&paths(&[
            "model-00001-of-00003.safetensors",
            "model-00002-of-00003.safetensors",
        ]));
        assert!(!validation.is_complete);
        assert_eq!(validation.total_shards, 3);
        assert_eq!(validation.missing_shards, vec![3]);
    }

    #[test]
    fn part_suffix_contiguity() {
        let validation =
            validate_shard_completeness(&paths(&["w.bin.part-1", "w.bin.part-3"]));
        assert!(!validation.is_complete);
        assert_eq!(validation.missing_shards, vec![2]);
    }
}

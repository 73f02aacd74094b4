//! Quantization tags and weight file selection
//!
//! Weight files are GGUF files whose name carries the quantization tag as
//! one of its `-` or `.` separated segments, e.g.
//! `Llama-3.2-3B-Instruct-Q4_K_M.gguf` or `model-Q8_0-00001-of-00002.gguf`.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;

use common::types::FileDescriptor;

/// Extension of weight files
pub const WEIGHT_EXTENSION: &str = ".gguf";

/// Segments reported as available tags. Repos spell tags in either case
/// (`f16`, `q4_k_m`) and selection matches them exactly, so both count.
static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i:I?Q\d+(?:_[A-Z0-9]+)*|F16|BF16|F32)$").expect("valid tag pattern")
});

static SHARD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-(\d+)-of-(\d+)\.gguf$").expect("valid shard pattern"));

/// Returns true if `name` is a weight file
pub fn is_weight_file(name: &str) -> bool {
    name.ends_with(WEIGHT_EXTENSION)
}

/// Segments of a weight file's base name, extension stripped
pub fn name_segments(name: &str) -> impl Iterator<Item = &str> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let stem = base.strip_suffix(WEIGHT_EXTENSION).unwrap_or(base);
    stem.split(['-', '.']).filter(|s| !s.is_empty())
}

/// Case-sensitive, whole-segment match of `tag` against a file name
pub fn matches_tag(name: &str, tag: &str) -> bool {
    !tag.is_empty() && name_segments(name).any(|segment| segment == tag)
}

/// Quantization tags found in a listing, sorted and deduplicated
pub fn available_tags(files: &[FileDescriptor]) -> Vec<String> {
    files
        .iter()
        .filter(|f| is_weight_file(&f.name))
        .flat_map(|f| name_segments(&f.name).map(str::to_string).collect::<Vec<_>>())
        .filter(|segment| TAG_PATTERN.is_match(segment))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Weight files of `files` matching `tag`.
///
/// Files are stored flat by base name, so when several repository paths
/// share a base name only the shallowest (then shortest) one is kept.
pub fn select_weights(files: &[FileDescriptor], tag: &str) -> Vec<FileDescriptor> {
    flatten_by_base_name(
        files
            .iter()
            .filter(|f| is_weight_file(&f.name) && matches_tag(&f.name, tag)),
    )
}

/// Keeps one file per base name, preferring the shallowest and then the
/// shortest repository path. Sorted by base name.
pub fn flatten_by_base_name<'a>(
    files: impl IntoIterator<Item = &'a FileDescriptor>,
) -> Vec<FileDescriptor> {
    let mut by_base: BTreeMap<&str, &FileDescriptor> = BTreeMap::new();

    for file in files {
        by_base
            .entry(file.base_name())
            .and_modify(|current| {
                if (file.depth(), file.name.len()) < (current.depth(), current.name.len()) {
                    *current = file;
                }
            })
            .or_insert(file);
    }

    by_base.into_values().cloned().collect()
}

/// Position of a file within a multi-part weight set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardInfo {
    /// 1-based part number
    pub index: u32,
    pub total: u32,
}

impl ShardInfo {
    /// Parses `-00001-of-00003.gguf` style names
    pub fn parse(name: &str) -> Option<Self> {
        let caps = SHARD_PATTERN.captures(name)?;
        let index = caps.get(1)?.as_str().parse().ok()?;
        let total = caps.get(2)?.as_str().parse().ok()?;
        (index >= 1 && index <= total).then_some(Self { index, total })
    }
}

/// Checks that every multi-part group among `names` has all its parts.
/// Single-file weights always count as complete.
pub fn shards_complete<'a>(names: impl IntoIterator<Item = &'a str>) -> bool {
    let mut groups: BTreeMap<String, (u32, BTreeSet<u32>)> = BTreeMap::new();

    for name in names {
        if let Some(shard) = ShardInfo::parse(name) {
            let prefix = SHARD_PATTERN.replace(name, "").into_owned();
            let group = groups.entry(prefix).or_insert((shard.total, BTreeSet::new()));
            if group.0 != shard.total {
                return false;
            }
            group.1.insert(shard.index);
        }
    }

    groups
        .values()
        .all(|(total, parts)| parts.len() as u32 == *total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(names: &[&str]) -> Vec<FileDescriptor> {
        names.iter().map(|n| FileDescriptor::new(*n, 1024)).collect()
    }

    #[test]
    fn test_tag_filtering() {
        let files = listing(&[
            "model-Q4_K_M.gguf",
            "model-Q8_0.gguf",
            "model-Q4_K_M.00001.gguf",
        ]);

        let selected = select_weights(&files, "Q4_K_M");
        let names: Vec<_> = selected.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["model-Q4_K_M.00001.gguf", "model-Q4_K_M.gguf"]);

        assert!(select_weights(&files, "Q5").is_empty());
        assert_eq!(available_tags(&files), vec!["Q4_K_M", "Q8_0"]);
    }

    #[test]
    fn test_tag_match_is_exact_and_case_sensitive() {
        assert!(matches_tag("Llama-3.2-3B-Instruct-Q4_K_M.gguf", "Q4_K_M"));
        assert!(!matches_tag("Llama-3.2-3B-Instruct-Q4_K_M.gguf", "q4_k_m"));
        assert!(!matches_tag("Llama-3.2-3B-Instruct-Q4_K_M.gguf", "Q4_K"));
        assert!(!matches_tag("Llama-3.2-3B-Instruct-Q4_K_L.gguf", "Q4_K_M"));
        assert!(!matches_tag("model-Q4_K_M.gguf", ""));
    }

    #[test]
    fn test_non_weight_files_are_ignored() {
        let files = listing(&["README.md", "Q4_K_M.txt", "imatrix-Q4_K_M.dat", "m-Q4_K_M.gguf"]);
        let selected = select_weights(&files, "Q4_K_M");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "m-Q4_K_M.gguf");
    }

    #[test]
    fn test_available_tags() {
        let files = listing(&[
            "Llama-3.2-3B-Instruct-IQ4_XS.gguf",
            "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
            "Llama-3.2-3B-Instruct-f16.gguf",
            "Llama-3.2-3B-Instruct-BF16-00001-of-00002.gguf",
            "Llama-3.2-3B-Instruct-BF16-00002-of-00002.gguf",
        ]);
        assert_eq!(available_tags(&files), vec!["BF16", "IQ4_XS", "Q4_K_M", "f16"]);
    }

    #[test]
    fn test_lower_case_tags_are_listed_and_selectable() {
        let files = listing(&["qwen2-0.5b-instruct-q4_k_m.gguf", "qwen2-0.5b-instruct-fp16.gguf"]);
        assert_eq!(available_tags(&files), vec!["q4_k_m"]);
        assert_eq!(select_weights(&files, "q4_k_m").len(), 1);
    }

    #[test]
    fn test_duplicate_base_names_prefer_shallowest() {
        let files = listing(&["old/nested/m-Q8_0.gguf", "m-Q8_0.gguf", "alt/m-Q8_0.gguf"]);
        let selected = select_weights(&files, "Q8_0");
        assert_eq!(selected, vec![FileDescriptor::new("m-Q8_0.gguf", 1024)]);
    }

    #[test]
    fn test_shards() {
        assert_eq!(
            ShardInfo::parse("m-Q8_0-00002-of-00003.gguf"),
            Some(ShardInfo { index: 2, total: 3 })
        );
        assert_eq!(ShardInfo::parse("m-Q8_0.gguf"), None);
        assert_eq!(ShardInfo::parse("m-Q8_0-00004-of-00003.gguf"), None);

        assert!(shards_complete(["a-Q8_0-00001-of-00002.gguf", "a-Q8_0-00002-of-00002.gguf"]));
        assert!(!shards_complete(["a-Q8_0-00001-of-00002.gguf"]));
        assert!(shards_complete(["a-Q8_0.gguf"]));
    }
}

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Millisecond-resolution stamp for run ids and manifest names. Sorts
/// lexically in time order.
pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

/// Creates `path` and fails if it already exists, so two runs never share
/// an output directory.
pub fn create_fresh_directory(path: &Path) -> Result<()> {
    ensure_parent_directory(path)?;
    fs::create_dir(path)
        .with_context(|| format!("failed to create fresh directory: {}", path.display()))
}

pub fn ensure_parent_directory(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_directory(parent),
        _ => Ok(()),
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];

    loop {
        let count = file
            .read(&mut buf)
            .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent_directory(path)?;

    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;

    let mut file = File::create(path)
        .with_context(|| format!("failed to create json file: {}", path.display()))?;
    file.write_all(&data)
        .with_context(|| format!("failed to write json file: {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("failed to finalize json file: {}", path.display()))?;

    Ok(())
}

pub fn write_text_file(path: &Path, text: &str) -> Result<()> {
    ensure_parent_directory(path)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// First `max_chars` characters of `text`, for log fields and manifests.
pub fn text_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_offset, _)) => format!("{}…", &text[..byte_offset]),
        None => text.to_string(),
    }
}

/// Filesystem-safe stem for a free-form name such as a city.
pub fn file_stem_for(name: &str) -> String {
    let stem = name
        .trim()
        .chars()
        .map(|character| {
            if character.is_alphanumeric() || character == '-' || character == '_' {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();

    if stem.is_empty() {
        "unnamed".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn compact_stamps_within_one_second_stay_distinct_and_ordered() {
        let first = Utc
            .with_ymd_and_hms(2026, 10, 16, 9, 30, 0)
            .single()
            .expect("valid timestamp");
        let second = first + chrono::Duration::milliseconds(5);
        let next_second = first + chrono::Duration::milliseconds(1000);

        assert_eq!(utc_compact_string(first), "20261016T093000000Z");
        assert_eq!(utc_compact_string(second), "20261016T093000005Z");
        assert!(utc_compact_string(second) > utc_compact_string(first));
        assert!(utc_compact_string(next_second) > utc_compact_string(second));
    }

    #[test]
    fn fresh_directory_refuses_an_existing_path() {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let run_dir = dir.path().join("judgments").join("dispatch-1");

        create_fresh_directory(&run_dir).expect("first creation");
        assert!(run_dir.is_dir());
        assert!(create_fresh_directory(&run_dir).is_err());
    }

    #[test]
    fn text_preview_counts_characters_not_bytes() {
        assert_eq!(text_preview("Пенза", 3), "Пен…");
        assert_eq!(text_preview("short", 10), "short");
    }

    #[test]
    fn file_stem_keeps_unicode_letters() {
        assert_eq!(file_stem_for("Пенза"), "Пенза");
        assert_eq!(file_stem_for("Saint Petersburg"), "Saint_Petersburg");
        assert_eq!(file_stem_for("  "), "unnamed");
    }

    #[test]
    fn sha256_text_matches_file_digest() {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let path = dir.path().join("nested").join("sample.txt");
        write_text_file(&path, "window body").expect("write sample");

        assert_eq!(
            sha256_file(&path).expect("hash file"),
            sha256_text("window body")
        );
    }
}

//! Append-only day shards
//!
//! One JSONL file per day under `<root>/flows/YYYY-MM-DD/`, rotated by size
//! into `flows.jsonl.rotN` siblings. Offsets are tracked at append time so
//! the index can point straight at a line. Rotated shards may later be
//! gzipped by retention; the read path decompresses transparently.

use chrono::Utc;
use flate2::read::GzDecoder;
use flowscope_core::error::Result;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

pub const CURRENT_SHARD: &str = "flows.jsonl";

pub fn shard_file_name(rotation: u32) -> String {
    if rotation == 0 {
        CURRENT_SHARD.to_string()
    } else {
        format!("{CURRENT_SHARD}.rot{rotation}")
    }
}

pub fn day_dir(flows_root: &Path, day: &str) -> PathBuf {
    flows_root.join(day)
}

pub fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Where one appended line landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendLocation {
    pub day: String,
    pub file: String,
    pub offset: u64,
}

/// Single-writer shard appender. Rotation swaps the handle under the
/// writer's exclusive hold; no fsync per record.
pub struct ShardWriter {
    flows_root: PathBuf,
    max_file_size: u64,
    day: String,
    rotation: u32,
    file: Option<File>,
    offset: u64,
}

impl ShardWriter {
    pub fn new(flows_root: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            flows_root: flows_root.into(),
            max_file_size: max_file_size.max(1),
            day: String::new(),
            rotation: 0,
            file: None,
            offset: 0,
        }
    }

    /// Append one line (newline added here), returning its location.
    pub async fn append(&mut self, line: &str) -> Result<AppendLocation> {
        let today = today();
        if self.file.is_none() || self.day != today {
            self.open_day(&today).await?;
        }

        let location = AppendLocation {
            day: self.day.clone(),
            file: shard_file_name(self.rotation),
            offset: self.offset,
        };

        let file = self.file.as_mut().expect("shard file opened above");
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        self.offset += line.len() as u64 + 1;

        // The (N+1)th byte past the threshold lands in the next shard
        if self.offset >= self.max_file_size {
            self.rotate().await?;
        }

        Ok(location)
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    async fn open_day(&mut self, day: &str) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        let dir = day_dir(&self.flows_root, day);
        tokio::fs::create_dir_all(&dir).await?;

        // Resume at the highest existing rotation for this day
        let mut rotation = 0;
        while dir.join(shard_file_name(rotation + 1)).exists()
            || dir.join(format!("{}.gz", shard_file_name(rotation + 1))).exists()
        {
            rotation += 1;
        }

        self.day = day.to_string();
        self.rotation = rotation;
        self.open_current().await?;
        if self.offset >= self.max_file_size {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn open_current(&mut self) -> Result<()> {
        let path = day_dir(&self.flows_root, &self.day).join(shard_file_name(self.rotation));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        self.offset = file.metadata().await?.len();
        self.file = Some(file);
        Ok(())
    }

    async fn rotate(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        self.rotation += 1;
        tracing::debug!(
            day = %self.day,
            rotation = self.rotation,
            "rotating shard"
        );
        self.open_current().await
    }

    pub fn current_location(&self) -> (String, String, u64) {
        (self.day.clone(), shard_file_name(self.rotation), self.offset)
    }
}

/// Read the line at `offset` in a shard, falling back to the gzipped
/// sibling. Blocking; run under `spawn_blocking`.
pub fn read_line_at(flows_root: &Path, day: &str, file: &str, offset: u64) -> Result<Option<String>> {
    let path = day_dir(flows_root, day).join(file);
    if path.exists() {
        let mut reader = BufReader::new(std::fs::File::open(&path)?);
        reader.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        return Ok(Some(line.trim_end_matches('\n').to_string()));
    }

    let gz_path = day_dir(flows_root, day).join(format!("{file}.gz"));
    if !gz_path.exists() {
        return Ok(None);
    }
    // Offsets are in uncompressed space; skip forward through the decoder.
    let mut decoder = BufReader::new(GzDecoder::new(std::fs::File::open(&gz_path)?));
    std::io::copy(
        &mut decoder.by_ref().take(offset),
        &mut std::io::sink(),
    )?;
    let mut line = String::new();
    let read = decoder.read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches('\n').to_string()))
}

/// Gzip a shard file in place (write `.gz`, remove the original).
/// Blocking; run under `spawn_blocking`.
pub fn compress_shard(path: &Path) -> Result<u64> {
    use flate2::write::GzEncoder;
    use std::io::Write;

    let contents = std::fs::read(path)?;
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let mut encoder = GzEncoder::new(std::fs::File::create(&gz_path)?, flate2::Compression::default());
    encoder.write_all(&contents)?;
    encoder.finish()?;
    std::fs::remove_file(path)?;
    let saved = (contents.len() as u64)
        .saturating_sub(std::fs::metadata(&gz_path)?.len());
    Ok(saved)
}

/// List day directories under the flows root, validating the `YYYY-MM-DD`
/// name so stray paths are never followed.
pub fn list_day_dirs(flows_root: &Path) -> Result<Vec<String>> {
    let mut days = Vec::new();
    if !flows_root.exists() {
        return Ok(days);
    }
    for entry in std::fs::read_dir(flows_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_valid_day_name(&name) {
            days.push(name);
        } else {
            tracing::warn!(name = %name, "skipping non-day directory under flows root");
        }
    }
    days.sort();
    Ok(days)
}

/// Strict `YYYY-MM-DD` check; rejects traversal components outright.
pub fn is_valid_day_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return false;
    }
    let digits = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);
    if !digits(0..4) || !digits(5..7) || !digits(8..10) {
        return false;
    }
    let month = (bytes[5] - b'0') * 10 + (bytes[6] - b'0');
    let day = (bytes[8] - b'0') * 10 + (bytes[9] - b'0');
    (1..=12).contains(&month) && (1..=31).contains(&day)
}

/// Shard files (uncompressed and gzipped) in a day directory, current
/// first then rotations in order.
pub fn list_shard_files(day_path: &Path) -> Result<Vec<String>> {
    let mut files: Vec<String> = Vec::new();
    if !day_path.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(day_path)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name == CURRENT_SHARD
            || name.starts_with(&format!("{CURRENT_SHARD}.rot"))
        {
            files.push(name);
        }
    }
    files.sort_by_key(|name| {
        let stripped = name.trim_end_matches(".gz");
        stripped
            .strip_prefix(&format!("{CURRENT_SHARD}.rot"))
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0)
    });
    Ok(files)
}

pub fn total_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    if !path.exists() {
        return Ok(0);
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            total += meta.len();
        } else if meta.is_dir() {
            total += total_size(&entry.path())?;
        }
    }
    Ok(total)
}

/// Truncate a shard to `len` bytes, discarding a partial trailing record.
pub fn truncate_shard(path: &Path, len: u64) -> Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_tracks_offsets() {
        let dir = TempDir::new().unwrap();
        let mut writer = ShardWriter::new(dir.path(), 1024 * 1024);

        let first = writer.append("{\"id\":1}").await.unwrap();
        let second = writer.append("{\"id\":2}").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 9);
        assert_eq!(first.file, CURRENT_SHARD);

        let line = read_line_at(dir.path(), &first.day, &first.file, second.offset)
            .unwrap()
            .unwrap();
        assert_eq!(line, "{\"id\":2}");
    }

    #[tokio::test]
    async fn rotation_past_threshold() {
        let dir = TempDir::new().unwrap();
        let mut writer = ShardWriter::new(dir.path(), 20);

        let first = writer.append("aaaaaaaaaaaaaaaaaaaa").await.unwrap();
        let second = writer.append("next-shard").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(first.file, CURRENT_SHARD);
        assert_eq!(second.file, "flows.jsonl.rot1");
        assert_eq!(second.offset, 0);

        let line = read_line_at(dir.path(), &second.day, &second.file, 0)
            .unwrap()
            .unwrap();
        assert_eq!(line, "next-shard");
    }

    #[tokio::test]
    async fn writer_resumes_existing_day() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = ShardWriter::new(dir.path(), 1024);
            writer.append("one").await.unwrap();
            writer.flush().await.unwrap();
        }
        let mut writer = ShardWriter::new(dir.path(), 1024);
        let location = writer.append("two").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(location.offset, 4);
    }

    #[tokio::test]
    async fn gzipped_shards_read_transparently() {
        let dir = TempDir::new().unwrap();
        let mut writer = ShardWriter::new(dir.path(), 1024);
        let first = writer.append("{\"n\":1}").await.unwrap();
        let second = writer.append("{\"n\":2}").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let path = day_dir(dir.path(), &first.day).join(&first.file);
        compress_shard(&path).unwrap();
        assert!(!path.exists());

        let line = read_line_at(dir.path(), &second.day, &second.file, second.offset)
            .unwrap()
            .unwrap();
        assert_eq!(line, "{\"n\":2}");
    }

    #[test]
    fn day_name_validation() {
        assert!(is_valid_day_name("2026-08-01"));
        assert!(!is_valid_day_name("2026-13-01"));
        assert!(!is_valid_day_name("2026-08-32"));
        assert!(!is_valid_day_name("../escape"));
        assert!(!is_valid_day_name("2026_08_01"));
    }

    #[test]
    fn shard_files_sorted_by_rotation() {
        let dir = TempDir::new().unwrap();
        for name in ["flows.jsonl.rot2", "flows.jsonl", "flows.jsonl.rot1.gz"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let files = list_shard_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec!["flows.jsonl", "flows.jsonl.rot1.gz", "flows.jsonl.rot2"]
        );
    }
}

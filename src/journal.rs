//! Per-shard journal
//!
//! Each shard directory holds a `config` file mirroring its metadata, one
//! line per record:
//!
//! ```text
//! 1=<header JSON>
//! 2=<header JSON>
//! ```
//!
//! Inserts only append. Updates and removals read the whole file, replace or
//! drop the first line carrying the target ID, and write everything back.
//! Within one process all journal writes to a shard go through that shard's
//! lock; writers in other processes are not coordinated.

use crate::error::Result;
use crate::ids::shard_dir_name;
use crate::record::Header;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Journal filename inside each shard directory
pub const JOURNAL_FILENAME: &str = "config";

/// What a rewrite does to the matching line
#[derive(Debug, Clone, Copy)]
pub enum Rewrite<'a> {
    Replace(&'a Header),
    Remove,
}

/// Rewrite journal text for `id`.
///
/// Only the first line whose ID prefix equals `id` is touched; later
/// duplicates pass through. Lines without `=` are dropped. Returns the new
/// text and whether a line matched.
pub fn rewrite_lines(contents: &str, id: u64, action: Rewrite<'_>) -> Result<(String, bool)> {
    let target = id.to_string();
    let mut output = String::with_capacity(contents.len());
    let mut hit = false;

    for line in contents.lines() {
        let Some((line_id, _)) = line.split_once('=') else {
            continue;
        };

        if !hit && line_id == target {
            hit = true;
            if let Rewrite::Replace(header) = action {
                output.push_str(&journal_line(id, header)?);
            }
            continue;
        }

        output.push_str(line);
        output.push('\n');
    }

    Ok((output, hit))
}

/// Format one newline-terminated journal line
pub fn journal_line(id: u64, header: &Header) -> Result<String> {
    Ok(format!("{}={}\n", id, serde_json::to_string(header)?))
}

/// Parse a journal line back into its ID and header
pub fn parse_line(line: &str) -> Option<(u64, Header)> {
    let (id, json) = line.split_once('=')?;
    let id = id.parse().ok()?;
    let header = serde_json::from_str(json).ok()?;
    Some((id, header))
}

/// Shard directories of one store: lazy creation plus per-shard journal locks
pub struct Journal {
    root: PathBuf,
    /// Shards known to exist on disk
    shards: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
    /// Writer locks of records with an ingestion or removal in flight
    records: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Journal {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            shards: Mutex::new(HashMap::new()),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn shard_dir(&self, shard: u64) -> PathBuf {
        self.root.join(shard_dir_name(shard))
    }

    pub fn journal_path(&self, shard: u64) -> PathBuf {
        self.shard_dir(shard).join(JOURNAL_FILENAME)
    }

    fn cached_lock(&self, shard: u64) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.shards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&shard)
            .cloned()
    }

    /// Make sure the shard directory exists, returning its lock.
    ///
    /// Existence is only checked on disk the first time a shard is seen.
    pub async fn ensure_shard(&self, shard: u64) -> Result<Arc<tokio::sync::Mutex<()>>> {
        if let Some(lock) = self.cached_lock(shard) {
            return Ok(lock);
        }

        let dir = self.shard_dir(shard);
        fs::create_dir_all(&dir).await?;
        debug!(shard, path = %dir.display(), "Shard directory ready");

        let mut shards = self.shards.lock().unwrap_or_else(|e| e.into_inner());
        Ok(shards
            .entry(shard)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// Writer lock of record `id`; pair with `prune_record_lock` once dropped
    pub fn record_lock(&self, id: u64) -> Arc<tokio::sync::Mutex<()>> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forget the lock of `id` when no writer holds or waits on it
    pub fn prune_record_lock(&self, id: u64) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            records.remove(&id);
        }
    }

    #[cfg(test)]
    fn record_locks_in_use(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Append the header of a freshly inserted record
    pub async fn append(&self, shard: u64, id: u64, header: &Header) -> Result<()> {
        let lock = self.ensure_shard(shard).await?;
        let _guard = lock.lock().await;

        let line = journal_line(id, header)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path(shard))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Replace or drop the line for `id`, returning whether it was present
    pub async fn rewrite(&self, shard: u64, id: u64, action: Rewrite<'_>) -> Result<bool> {
        let lock = self.ensure_shard(shard).await?;
        let _guard = lock.lock().await;

        let path = self.journal_path(shard);
        let contents = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let (output, hit) = rewrite_lines(&contents, id, action)?;
        fs::write(&path, output).await?;
        debug!(shard, id, hit, "Rewrote journal");
        Ok(hit)
    }

    /// Raw journal text of a shard
    pub async fn read(&self, shard: u64) -> Result<String> {
        Ok(fs::read_to_string(self.journal_path(shard)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(name: &str) -> Header {
        Header::new(name, "text/plain")
    }

    #[test]
    fn test_rewrite_replaces_first_match_only() {
        let contents = "1={\"a\":1}\n2={\"b\":2}\n1={\"stale\":true}\n";
        let (output, hit) = rewrite_lines(contents, 1, Rewrite::Replace(&header("new.txt"))).unwrap();

        assert!(hit);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("1={\"name\":\"new.txt\""));
        assert_eq!(lines[1], "2={\"b\":2}");
        assert_eq!(lines[2], "1={\"stale\":true}");
    }

    #[test]
    fn test_rewrite_remove_drops_line() {
        let contents = "1={}\n2={}\n3={}\n";
        let (output, hit) = rewrite_lines(contents, 2, Rewrite::Remove).unwrap();
        assert!(hit);
        assert_eq!(output, "1={}\n3={}\n");
    }

    #[test]
    fn test_rewrite_does_not_match_id_prefix() {
        let contents = "12={}\n";
        let (output, hit) = rewrite_lines(contents, 1, Rewrite::Remove).unwrap();
        assert!(!hit);
        assert_eq!(output, contents);
    }

    #[test]
    fn test_rewrite_skips_lines_without_separator() {
        let (output, _) = rewrite_lines("garbage\n\n4={}\n", 9, Rewrite::Remove).unwrap();
        assert_eq!(output, "4={}\n");
    }

    #[test]
    fn test_parse_line() {
        let line = journal_line(42, &header("a.txt")).unwrap();
        let (id, parsed) = parse_line(line.trim_end()).unwrap();
        assert_eq!(id, 42);
        assert_eq!(parsed.name, "a.txt");
        assert!(parse_line("nonsense").is_none());
    }

    #[tokio::test]
    async fn test_record_locks_are_pruned() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Journal::new(temp_dir.path());

        let first = journal.record_lock(7);
        let second = journal.record_lock(7);
        assert!(Arc::ptr_eq(&first, &second));

        drop(first);
        journal.prune_record_lock(7);
        assert_eq!(journal.record_locks_in_use(), 1);

        drop(second);
        journal.prune_record_lock(7);
        assert_eq!(journal.record_locks_in_use(), 0);
    }

    #[tokio::test]
    async fn test_append_then_rewrite_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Journal::new(temp_dir.path());

        journal.append(1, 1, &header("one.txt")).await.unwrap();
        journal.append(1, 2, &header("two.txt")).await.unwrap();

        let updated = header("uno.txt");
        assert!(journal.rewrite(1, 1, Rewrite::Replace(&updated)).await.unwrap());
        assert!(journal.rewrite(1, 2, Rewrite::Remove).await.unwrap());
        assert!(!journal.rewrite(1, 2, Rewrite::Remove).await.unwrap());

        let text = journal.read(1).await.unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("uno.txt"));
        assert!(temp_dir.path().join("0000000001").join("config").exists());
    }
}

//! The storage engine
//!
//! `Store` owns the catalog, the shard journals and every record file under
//! its root directory:
//!
//! ```text
//! <root>/config                              catalog {lastId, count}
//! <root>/0000000001/config                   shard journal
//! <root>/0000000001/0000000001.data          header region + payload
//! <root>/0000000001/0000000002.tmp           ingestion in progress
//! ```
//!
//! Ingestion streams the payload into `<id>.tmp` after a reserved header
//! region, fills in the header once the length is known and renames the
//! file to `<id>.data`, so a durable name never points at a partial record.

use crate::catalog::{Catalog, CatalogSnapshot};
use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::events::{EventBus, StorageEvent};
use crate::ids::{file_stem, shard_index};
use crate::image;
use crate::journal::{parse_line, Journal, Rewrite};
use crate::mime;
use crate::payload::{Payload, Source};
use crate::record::{self, Header, PayloadStream, DATA_EXTENSION, HEADER_SIZE, TEMP_EXTENSION};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Read buffer size for streamed payloads
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of an insert or update
#[derive(Debug, Clone, PartialEq)]
pub struct Stored {
    pub id: u64,
    pub header: Header,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Insert,
    Update,
}

pub struct Store {
    root: PathBuf,
    catalog: Catalog,
    journal: Journal,
    events: Arc<EventBus>,
    pub(crate) delivery_timeout: Duration,
}

impl Store {
    /// Open (or create) a store rooted at `root`
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::open_with(root, EventBus::new(), Duration::from_secs(30)).await
    }

    /// Open the store described by a config
    pub async fn with_config(config: &Config) -> Result<Self> {
        Self::open_with(
            &config.storage_dir,
            EventBus::with_capacity(config.event_capacity),
            Duration::from_secs(config.delivery_timeout_secs),
        )
        .await
    }

    async fn open_with<P: AsRef<Path>>(
        root: P,
        events: EventBus,
        delivery_timeout: Duration,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let catalog = Catalog::load(&root).await?;
        let journal = Journal::new(&root);

        info!(path = %root.display(), records = catalog.count(), "Opened file storage");

        Ok(Self {
            root,
            catalog,
            journal,
            events: Arc::new(events),
            delivery_timeout,
        })
    }

    // =========================================================================
    // Paths
    // =========================================================================

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Durable record file of `id`
    pub fn record_path(&self, id: u64) -> PathBuf {
        self.journal
            .shard_dir(shard_index(id))
            .join(format!("{}.{}", file_stem(id), DATA_EXTENSION))
    }

    fn temp_path(&self, id: u64) -> PathBuf {
        self.journal
            .shard_dir(shard_index(id))
            .join(format!("{}.{}", file_stem(id), TEMP_EXTENSION))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Store a new record under a freshly allocated ID.
    ///
    /// The ID is reserved before this returns, so inserts issued one after
    /// another get increasing IDs no matter in which order the returned
    /// futures complete.
    pub fn insert(
        &self,
        name: &str,
        payload: Payload,
        custom: Option<serde_json::Value>,
    ) -> impl Future<Output = Result<Stored>> + Send + '_ {
        let id = self.catalog.allocate();
        let name = name.to_string();
        async move { self.ingest(id, name, payload, custom, Mode::Insert).await }
    }

    /// Replace the record stored under `id`
    pub fn update(
        &self,
        id: u64,
        name: &str,
        payload: Payload,
        custom: Option<serde_json::Value>,
    ) -> impl Future<Output = Result<Stored>> + Send + '_ {
        let name = name.to_string();
        async move { self.ingest(id, name, payload, custom, Mode::Update).await }
    }

    async fn ingest(
        &self,
        id: u64,
        name: String,
        payload: Payload,
        custom: Option<serde_json::Value>,
        mode: Mode,
    ) -> Result<Stored> {
        let content_type = mime::content_type(&name);
        let mut header = Header::new(name, content_type);
        header.custom = custom.unwrap_or(serde_json::Value::Null);

        let result = match check_id(id) {
            Ok(()) => {
                self.exclusive(id, self.commit(id, &mut header, payload, mode))
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            if mode == Mode::Insert {
                self.catalog.release();
                self.persist_catalog().await;
            }
            warn!(id, error = %e, "Ingestion failed");
            self.events.error(Some(id), e.to_string());
            return Err(e);
        }

        self.persist_catalog().await;

        info!(id, name = %header.name, length = header.length, "Stored record");

        let event = match mode {
            Mode::Insert => StorageEvent::Insert { id, header: header.clone() },
            Mode::Update => StorageEvent::Update { id, header: header.clone() },
        };
        self.events.emit(event);

        Ok(Stored { id, header })
    }

    /// Run `work` while holding the writer lock of record `id`.
    ///
    /// Ingestion and removal of one ID share a single `<id>.tmp` path and
    /// journal line, so they must not interleave.
    async fn exclusive<T>(&self, id: u64, work: impl Future<Output = T>) -> T {
        let lock = self.journal.record_lock(id);
        let output = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);
        self.journal.prune_record_lock(id);
        output
    }

    /// Finalize the record file, then record it in the shard journal
    async fn commit(&self, id: u64, header: &mut Header, payload: Payload, mode: Mode) -> Result<()> {
        self.finalize(id, header, payload).await?;

        let shard = shard_index(id);
        let written = match mode {
            Mode::Insert => self.journal.append(shard, id, header).await,
            Mode::Update => self
                .journal
                .rewrite(shard, id, Rewrite::Replace(header))
                .await
                .map(|_| ()),
        };
        if let Err(e) = written {
            self.journal_failed(id, e);
        }
        Ok(())
    }

    /// Write payload and header into the temp file, then move it into place
    async fn finalize(&self, id: u64, header: &mut Header, payload: Payload) -> Result<()> {
        self.journal.ensure_shard(shard_index(id)).await?;
        let source = payload.resolve().await?;

        let temp_path = self.temp_path(id);
        let result = self.write_temp(&temp_path, header, source).await;

        match result {
            Ok(()) => {
                fs::rename(&temp_path, self.record_path(id)).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp_path).await {
                    debug!(id, error = %cleanup, "Temp file cleanup failed");
                }
                Err(e)
            }
        }
    }

    async fn write_temp(&self, temp_path: &Path, header: &mut Header, source: Source) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(temp_path)
            .await?;

        // Reserve the header region; it is filled once the length is known
        file.write_all(&[b' '; HEADER_SIZE]).await?;

        let sniff = mime::is_image(&header.content_type);
        let mut length = 0u64;

        match source {
            Source::Buffer(data) => {
                if sniff {
                    apply_dimension(header, &data);
                }
                file.write_all(&data).await?;
                length = data.len() as u64;
            }
            Source::Stream(mut reader) => {
                let mut buf = vec![0u8; CHUNK_SIZE];
                let mut first = true;
                loop {
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    if first && sniff {
                        apply_dimension(header, &buf[..n]);
                    }
                    first = false;
                    file.write_all(&buf[..n]).await?;
                    length += n as u64;
                }
            }
        }

        header.length = length;
        header.stamp = chrono::Utc::now().timestamp_millis();

        file.flush().await?;
        record::write_header(&mut file, header).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Delete the record stored under `id`
    pub async fn remove(&self, id: u64) -> Result<()> {
        if let Err(e) = check_id(id) {
            self.events.error(Some(id), e.to_string());
            return Err(e);
        }

        if let Err(e) = self.exclusive(id, self.unlink(id)).await {
            self.events.error(Some(id), e.to_string());
            return Err(e);
        }

        self.persist_catalog().await;
        self.events.emit(StorageEvent::Remove { id });

        info!(id, "Removed record");
        Ok(())
    }

    async fn unlink(&self, id: u64) -> Result<()> {
        fs::remove_file(self.record_path(id))
            .await
            .map_err(|e| StorageError::from_record_io(e, id))?;

        self.catalog.release();
        if let Err(e) = self.journal.rewrite(shard_index(id), id, Rewrite::Remove).await {
            self.journal_failed(id, e);
        }
        Ok(())
    }

    fn journal_failed(&self, id: u64, err: StorageError) {
        warn!(id, error = %err, "Journal write failed");
        self.events.error(Some(id), format!("journal: {}", err));
    }

    /// Persist the catalog; failures are logged and published only
    async fn persist_catalog(&self) {
        if let Err(e) = self.catalog.persist().await {
            warn!(error = %e, "Catalog persist failed");
            self.events.error(None, format!("catalog: {}", e));
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Header of the record stored under `id`
    pub async fn stat(&self, id: u64) -> Result<Header> {
        let result = match check_id(id) {
            Ok(()) => record::read_header(&self.record_path(id), id).await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            self.events.error(Some(id), e.to_string());
            e
        })
    }

    /// Header plus a stream over the whole payload
    pub async fn read(&self, id: u64) -> Result<(Header, PayloadStream)> {
        let header = self.stat(id).await?;
        let stream = record::open_payload(&self.record_path(id), id, 0, u64::MAX)
            .await
            .map_err(|e| {
                self.events.error(Some(id), e.to_string());
                e
            })?;

        self.events.emit(StorageEvent::Read { id, header: header.clone() });
        Ok((header, stream))
    }

    /// Concatenated journals of every shard up to the last allocated ID
    pub async fn listing(&self) -> Result<String> {
        let last_id = self.catalog.last_id();
        let mut output = String::new();
        if last_id == 0 {
            return Ok(output);
        }

        for shard in 1..=shard_index(last_id) {
            match self.journal.read(shard).await {
                Ok(text) => output.push_str(&text),
                Err(e) => {
                    debug!(shard, error = %e, "Skipping unreadable journal");
                    self.events.error(None, format!("journal of shard {}: {}", shard, e));
                }
            }
        }
        Ok(output)
    }

    /// Parsed form of `listing`, skipping lines that do not parse
    pub async fn entries(&self) -> Result<Vec<(u64, Header)>> {
        let listing = self.listing().await?;
        Ok(listing.lines().filter_map(parse_line).collect())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn catalog(&self) -> CatalogSnapshot {
        self.catalog.snapshot()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

/// IDs start at 1
fn check_id(id: u64) -> Result<()> {
    if id == 0 {
        return Err(StorageError::MalformedInput("record id 0".to_string()));
    }
    Ok(())
}

fn apply_dimension(header: &mut Header, buf: &[u8]) {
    if let Some(dim) = image::sniff(&header.content_type, buf) {
        header.width = dim.width;
        header.height = dim.height;
    }
}

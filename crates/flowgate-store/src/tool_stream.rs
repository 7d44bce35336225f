use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::types::{ToolStreamChunk, ToolStreamSummaryPayload};

const ACTIVE_FILE: &str = "tool-stream.ndjson";
const ARCHIVE_PREFIX: &str = "tool-stream-";

/// Correlation summaries kept in memory before the least recently updated are dropped.
pub const MAX_SUMMARIES: usize = 10_000;
/// Size of one streamed export block.
pub const EXPORT_BLOCK_BYTES: usize = 64 * 1024;
const EXPORT_QUEUE_BLOCKS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// A single JSON array.
    Json,
    /// One chunk per line.
    #[default]
    Ndjson,
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "ndjson" | "jsonl" => Ok(Self::Ndjson),
            other => Err(format!("unknown export format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default)]
    pub compress: bool,
}

struct Active {
    file: tokio::fs::File,
    size: u64,
    next_sequence: u64,
    summaries: HashMap<String, ToolStreamSummaryPayload>,
}

/// Committed extent of the log at the start of a read.
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    active_bytes: u64,
    next_sequence: u64,
}

/// Append-only tool-activity log with size-based rotation.
///
/// Chunks are stored one JSON object per line in `tool-stream.ndjson`. When
/// that file grows past `max_file_bytes` it is renamed to a timestamped
/// archive (gzip-compressed in the background when enabled) and a fresh
/// active file is opened. Sequence numbers are assigned under the writer
/// lock and keep increasing across rotations and restarts.
pub struct ToolStreamLog {
    dir: PathBuf,
    max_file_bytes: u64,
    compress_archives: bool,
    max_summaries: usize,
    active: tokio::sync::Mutex<Active>,
    rotations: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ToolStreamLog {
    /// Open (or create) the log under `dir`, recovering the next sequence number.
    pub fn open(dir: &Path, max_file_bytes: u64, compress_archives: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut summaries: HashMap<String, ToolStreamSummaryPayload> = HashMap::new();
        let mut last_sequence = 0;
        visit_chunks(dir, None, |chunk| {
            last_sequence = last_sequence.max(chunk.sequence);
            summaries
                .entry(chunk.correlation_id.clone())
                .and_modify(|s| s.absorb(&chunk))
                .or_insert_with(|| ToolStreamSummaryPayload::from_chunk(&chunk));
            Ok(())
        })?;
        prune_summaries(&mut summaries, MAX_SUMMARIES);

        let active_path = dir.join(ACTIVE_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        let size = file.metadata()?.len();

        info!(
            dir = %dir.display(),
            next_sequence = last_sequence + 1,
            active_bytes = size,
            "Tool-stream log opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_bytes,
            compress_archives,
            max_summaries: MAX_SUMMARIES,
            active: tokio::sync::Mutex::new(Active {
                file: tokio::fs::File::from_std(file),
                size,
                next_sequence: last_sequence + 1,
                summaries,
            }),
            rotations: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Bound the in-memory summary map. A correlation whose summary was
    /// dropped starts a fresh one on its next chunk.
    pub fn with_summary_limit(mut self, max_summaries: usize) -> Self {
        self.max_summaries = max_summaries.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Assign the next sequence, stamp `storedAt`, and append.
    ///
    /// Returns the stored chunk and the updated summary for its correlation id.
    pub async fn append_chunk(
        &self,
        mut chunk: ToolStreamChunk,
    ) -> Result<(ToolStreamChunk, ToolStreamSummaryPayload)> {
        let mut active = self.active.lock().await;

        chunk.sequence = active.next_sequence;
        chunk.stored_at = Some(Utc::now());

        let mut line = serde_json::to_vec(&chunk)?;
        line.push(b'\n');
        active.file.write_all(&line).await?;
        active.file.flush().await?;
        active.next_sequence += 1;
        active.size += line.len() as u64;

        let summary = active
            .summaries
            .entry(chunk.correlation_id.clone())
            .and_modify(|s| s.absorb(&chunk))
            .or_insert_with(|| ToolStreamSummaryPayload::from_chunk(&chunk))
            .clone();
        prune_summaries(&mut active.summaries, self.max_summaries);

        if active.size > self.max_file_bytes {
            self.rotate(&mut active, chunk.sequence).await?;
        }

        Ok((chunk, summary))
    }

    async fn rotate(&self, active: &mut Active, last_sequence: u64) -> Result<()> {
        active.file.sync_all().await?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let archive = self
            .dir
            .join(format!("{}{}-{:012}.ndjson", ARCHIVE_PREFIX, stamp, last_sequence));
        let active_path = self.dir.join(ACTIVE_FILE);

        tokio::fs::rename(&active_path, &archive).await?;
        let fresh = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)
            .await?;
        // The old handle now points at the archive; dropping it closes it.
        active.file = fresh;
        active.size = 0;

        info!(archive = %archive.display(), last_sequence, "Tool-stream log rotated");

        if self.compress_archives {
            let handle = tokio::task::spawn_blocking(move || {
                if let Err(e) = gzip_archive(&archive) {
                    warn!(archive = %archive.display(), error = %e, "Failed to compress tool-stream archive");
                }
            });
            if let Ok(mut rotations) = self.rotations.lock() {
                rotations.retain(|h| !h.is_finished());
                rotations.push(handle);
            }
        }
        Ok(())
    }

    /// Wait for any background archive compression to finish.
    pub async fn flush_rotations(&self) {
        let handles: Vec<JoinHandle<()>> = match self.rotations.lock() {
            Ok(mut rotations) => rotations.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Archive files currently on disk, oldest first.
    pub fn archives(&self) -> Result<Vec<PathBuf>> {
        list_archives(&self.dir)
    }

    /// Current size of the active file in bytes.
    pub async fn active_size(&self) -> u64 {
        self.active.lock().await.size
    }

    /// All stored chunks for `correlation_id` (or every chunk), in sequence order.
    ///
    /// The files are read on the blocking pool. Chunks appended after the
    /// call starts are not included.
    pub async fn chunks(&self, correlation_id: Option<&str>) -> Result<Vec<ToolStreamChunk>> {
        let snapshot = self.snapshot().await;
        let dir = self.dir.clone();
        let filter = correlation_id.map(str::to_string);
        let mut chunks = tokio::task::spawn_blocking(move || -> Result<Vec<ToolStreamChunk>> {
            let mut out = Vec::new();
            visit_chunks(&dir, Some(snapshot), |chunk| {
                if filter.as_deref().map_or(true, |id| id == chunk.correlation_id) {
                    out.push(chunk);
                }
                Ok(())
            })?;
            Ok(out)
        })
        .await
        .map_err(read_task_failed)??;
        chunks.sort_by_key(|c| c.sequence);
        chunks.dedup_by_key(|c| c.sequence);
        Ok(chunks)
    }

    /// Serialize matching chunks in sequence order into `out`, optionally
    /// gzip-compressed, and hand the writer back.
    pub async fn export_to<W>(&self, correlation_id: Option<&str>, opts: ExportOptions, out: W) -> Result<W>
    where
        W: Write + Send + 'static,
    {
        let snapshot = self.snapshot().await;
        let dir = self.dir.clone();
        let filter = correlation_id.map(str::to_string);
        debug!(
            correlation_id = correlation_id.unwrap_or("*"),
            format = ?opts.format,
            compress = opts.compress,
            "Exporting tool stream"
        );
        tokio::task::spawn_blocking(move || write_export(&dir, snapshot, filter.as_deref(), opts, out))
            .await
            .map_err(read_task_failed)?
    }

    /// [`export_to`](Self::export_to) into memory.
    pub async fn export(&self, correlation_id: Option<&str>, opts: ExportOptions) -> Result<Vec<u8>> {
        self.export_to(correlation_id, opts, Vec::new()).await
    }

    /// Export as a stream of body blocks of at most [`EXPORT_BLOCK_BYTES`].
    ///
    /// A failure part-way through arrives as a final `Err` item.
    pub async fn export_stream(
        &self,
        correlation_id: Option<&str>,
        opts: ExportOptions,
    ) -> mpsc::Receiver<std::io::Result<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(EXPORT_QUEUE_BLOCKS);
        let snapshot = self.snapshot().await;
        let dir = self.dir.clone();
        let filter = correlation_id.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let sink = ChannelWriter(tx.clone());
            if let Err(e) = write_export(&dir, snapshot, filter.as_deref(), opts, sink) {
                warn!(error = %e, "Tool-stream export failed");
                let _ = tx.blocking_send(Err(std::io::Error::other(e.to_string())));
            }
        });
        rx
    }

    async fn snapshot(&self) -> Snapshot {
        let active = self.active.lock().await;
        Snapshot {
            active_bytes: active.size,
            next_sequence: active.next_sequence,
        }
    }

    /// One summary per correlation id, most recently updated first.
    pub async fn summaries(&self) -> Vec<ToolStreamSummaryPayload> {
        let active = self.active.lock().await;
        let mut out: Vec<_> = active.summaries.values().cloned().collect();
        out.sort_by(|a, b| b.latest_sequence.cmp(&a.latest_sequence));
        out
    }

    pub async fn summary(&self, correlation_id: &str) -> Option<ToolStreamSummaryPayload> {
        self.active.lock().await.summaries.get(correlation_id).cloned()
    }
}

/// Compress `path` to `path.gz` and remove the original.
fn gzip_archive(path: &Path) -> std::io::Result<()> {
    let gz_path = with_suffix(path, ".gz");
    let tmp_path = with_suffix(path, ".gz.tmp");

    let mut input = fs::File::open(path)?;
    let output = fs::File::create(&tmp_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()?;

    fs::rename(&tmp_path, &gz_path)?;
    fs::remove_file(path)?;
    debug!(archive = %gz_path.display(), "Tool-stream archive compressed");
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Archives sorted oldest first. A plain archive whose compressed copy has
/// already landed is listed once.
fn list_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut plain = Vec::new();
    let mut gz = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(ARCHIVE_PREFIX) {
            continue;
        }
        if name.ends_with(".ndjson") {
            plain.push(path);
        } else if name.ends_with(".ndjson.gz") {
            gz.push(path);
        }
    }
    gz.retain(|g| !plain.iter().any(|p| with_suffix(p, ".gz") == *g));
    let mut all: Vec<PathBuf> = plain.into_iter().chain(gz).collect();
    all.sort();
    Ok(all)
}

fn parse_lines(
    reader: impl Read,
    source: &Path,
    visit: &mut impl FnMut(ToolStreamChunk) -> Result<()>,
) -> Result<()> {
    for line in BufReader::new(reader).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ToolStreamChunk>(&line) {
            Ok(chunk) => visit(chunk)?,
            Err(e) => warn!(file = %source.display(), error = %e, "Skipping malformed tool-stream line"),
        }
    }
    Ok(())
}

/// Feed every chunk under `dir` to `visit`, archives first, then the active file.
///
/// With a snapshot, the active file is read only up to its committed length
/// and chunks sequenced after the snapshot are skipped.
fn visit_chunks(
    dir: &Path,
    upto: Option<Snapshot>,
    mut visit: impl FnMut(ToolStreamChunk) -> Result<()>,
) -> Result<()> {
    let mut keep = |chunk: ToolStreamChunk| match upto {
        Some(s) if chunk.sequence >= s.next_sequence => Ok(()),
        _ => visit(chunk),
    };

    for archive in list_archives(dir)? {
        let file = match fs::File::open(&archive) {
            Ok(f) => f,
            // Compression finished between listing and opening.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let gz = with_suffix(&archive, ".gz");
                let f = fs::File::open(&gz).map_err(|e| {
                    FlowgateError::Storage(format!("archive vanished: {}: {}", gz.display(), e))
                })?;
                parse_lines(GzDecoder::new(f), &gz, &mut keep)?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if archive.extension().and_then(|e| e.to_str()) == Some("gz") {
            parse_lines(GzDecoder::new(file), &archive, &mut keep)?;
        } else {
            parse_lines(file, &archive, &mut keep)?;
        }
    }

    let active = dir.join(ACTIVE_FILE);
    match fs::File::open(&active) {
        Ok(f) => match upto {
            Some(s) => parse_lines(f.take(s.active_bytes), &active, &mut keep)?,
            None => parse_lines(f, &active, &mut keep)?,
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn write_export<W: Write>(
    dir: &Path,
    snapshot: Snapshot,
    correlation_id: Option<&str>,
    opts: ExportOptions,
    out: W,
) -> Result<W> {
    if opts.compress {
        let encoder = GzEncoder::new(out, Compression::default());
        let encoder = encode_chunks(dir, snapshot, correlation_id, opts.format, encoder)?;
        Ok(encoder.finish()?)
    } else {
        encode_chunks(dir, snapshot, correlation_id, opts.format, out)
    }
}

fn encode_chunks<W: Write>(
    dir: &Path,
    snapshot: Snapshot,
    correlation_id: Option<&str>,
    format: ExportFormat,
    out: W,
) -> Result<W> {
    let mut out = BufWriter::with_capacity(EXPORT_BLOCK_BYTES, out);
    let mut count = 0usize;
    if format == ExportFormat::Json {
        out.write_all(b"[")?;
    }
    visit_chunks(dir, Some(snapshot), |chunk| {
        if correlation_id.is_some_and(|id| id != chunk.correlation_id) {
            return Ok(());
        }
        match format {
            ExportFormat::Json => {
                if count > 0 {
                    out.write_all(b",")?;
                }
                serde_json::to_writer(&mut out, &chunk)?;
            }
            ExportFormat::Ndjson => {
                serde_json::to_writer(&mut out, &chunk)?;
                out.write_all(b"\n")?;
            }
        }
        count += 1;
        Ok(())
    })?;
    if format == ExportFormat::Json {
        out.write_all(b"]")?;
    }
    debug!(count, format = ?format, "Tool stream exported");
    out.into_inner().map_err(|e| FlowgateError::Io(e.into_error()))
}

/// Drop the least recently updated summaries once the map outgrows `max`,
/// leaving a tenth of headroom so pruning does not run on every append.
fn prune_summaries(summaries: &mut HashMap<String, ToolStreamSummaryPayload>, max: usize) {
    if summaries.len() <= max {
        return;
    }
    let keep = max - max / 10;
    let mut by_age: Vec<(u64, String)> = summaries
        .iter()
        .map(|(id, s)| (s.latest_sequence, id.clone()))
        .collect();
    by_age.sort_unstable();
    let evict = summaries.len() - keep;
    for (_, id) in by_age.into_iter().take(evict) {
        summaries.remove(&id);
    }
    debug!(evicted = evict, kept = keep, "Pruned tool-stream summaries");
}

fn read_task_failed(e: tokio::task::JoinError) -> FlowgateError {
    FlowgateError::Storage(format!("tool-stream read task failed: {}", e))
}

/// Forwards writes to an export stream as owned blocks.
struct ChannelWriter(mpsc::Sender<std::io::Result<Vec<u8>>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.0
            .blocking_send(Ok(buf.to_vec()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "export receiver dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::types::ChunkStatus;

    fn chunk(corr: &str, status: ChunkStatus) -> ToolStreamChunk {
        ToolStreamChunk::new(corr, "search", status, "x".repeat(40))
    }

    #[tokio::test]
    async fn sequences_are_monotonic_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = ToolStreamLog::open(dir.path(), 1 << 20, false).unwrap();
            let (a, _) = log.append_chunk(chunk("c1", ChunkStatus::Start)).await.unwrap();
            let (b, _) = log.append_chunk(chunk("c2", ChunkStatus::Start)).await.unwrap();
            assert_eq!(a.sequence, 1);
            assert_eq!(b.sequence, 2);
            assert!(a.stored_at.is_some());
        }
        let log = ToolStreamLog::open(dir.path(), 1 << 20, false).unwrap();
        let (c, summary) = log.append_chunk(chunk("c1", ChunkStatus::Success)).await.unwrap();
        assert_eq!(c.sequence, 3);
        assert_eq!(summary.chunk_count, 2);
        assert!(summary.completed);
        assert!(!summary.has_error);
    }

    #[tokio::test]
    async fn rotation_produces_one_archive_and_resets_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = ToolStreamLog::open(dir.path(), 512, true).unwrap();

        let mut last_seq = 0;
        while log.archives().unwrap().is_empty() {
            let (stored, _) = log.append_chunk(chunk("c1", ChunkStatus::Start)).await.unwrap();
            assert!(stored.sequence > last_seq);
            last_seq = stored.sequence;
        }
        assert_eq!(log.active_size().await, 0);

        let (after, _) = log.append_chunk(chunk("c1", ChunkStatus::Success)).await.unwrap();
        assert_eq!(after.sequence, last_seq + 1);
        let line_len = serde_json::to_vec(&after).unwrap().len() as u64 + 1;
        assert_eq!(log.active_size().await, line_len);
        assert_eq!(
            fs::metadata(dir.path().join(ACTIVE_FILE)).unwrap().len(),
            line_len
        );

        log.flush_rotations().await;
        let archives = log.archives().unwrap();
        assert_eq!(archives.len(), 1);
        assert!(archives[0].to_string_lossy().ends_with(".ndjson.gz"));

        let all = log.chunks(Some("c1")).await.unwrap();
        assert_eq!(all.len() as u64, after.sequence);
        assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn export_filters_by_correlation_in_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let log = ToolStreamLog::open(dir.path(), 1 << 20, false).unwrap();
        log.append_chunk(chunk("keep", ChunkStatus::Start)).await.unwrap();
        log.append_chunk(chunk("other", ChunkStatus::Start)).await.unwrap();
        log.append_chunk(chunk("keep", ChunkStatus::Error)).await.unwrap();

        let ndjson = log
            .export(Some("keep"), ExportOptions::default())
            .await
            .unwrap();
        let lines: Vec<&str> = std::str::from_utf8(&ndjson).unwrap().lines().collect();
        assert_eq!(lines.len(), 2);

        let json = log
            .export(
                Some("keep"),
                ExportOptions {
                    format: ExportFormat::Json,
                    compress: true,
                },
            )
            .await
            .unwrap();
        let mut decoded = String::new();
        GzDecoder::new(json.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        let parsed: Vec<ToolStreamChunk> = serde_json::from_str(&decoded).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].status, ChunkStatus::Start);
        assert_eq!(parsed[1].status, ChunkStatus::Error);

        let summary = log.summary("keep").await.unwrap();
        assert!(summary.has_error);
        assert_eq!(summary.latest_sequence, 3);
    }

    #[tokio::test]
    async fn streamed_export_matches_the_buffered_one() {
        let dir = tempfile::tempdir().unwrap();
        let log = ToolStreamLog::open(dir.path(), 1 << 20, false).unwrap();
        for i in 0..1500 {
            let corr = if i % 3 == 0 { "other" } else { "keep" };
            log.append_chunk(chunk(corr, ChunkStatus::Start)).await.unwrap();
        }

        let buffered = log
            .export(Some("keep"), ExportOptions::default())
            .await
            .unwrap();
        let mut rx = log
            .export_stream(Some("keep"), ExportOptions::default())
            .await;
        let mut streamed = Vec::new();
        let mut blocks = 0;
        while let Some(block) = rx.recv().await {
            let block = block.unwrap();
            assert!(block.len() <= EXPORT_BLOCK_BYTES);
            streamed.extend_from_slice(&block);
            blocks += 1;
        }
        assert!(blocks > 1, "export arrived in one block");
        assert_eq!(streamed, buffered);
        assert_eq!(std::str::from_utf8(&streamed).unwrap().lines().count(), 1000);
    }

    #[tokio::test]
    async fn unfinished_trailing_line_is_not_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = ToolStreamLog::open(dir.path(), 1 << 20, false).unwrap();
        log.append_chunk(chunk("c1", ChunkStatus::Start)).await.unwrap();
        log.append_chunk(chunk("c1", ChunkStatus::Success)).await.unwrap();

        // A writer caught mid-line, past the committed length.
        let mut raw = fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(ACTIVE_FILE))
            .unwrap();
        raw.write_all(br#"{"sequence":3,"correlationId":"c1","#).unwrap();

        let chunks = log.chunks(Some("c1")).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.last().unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn summaries_are_bounded_by_recency() {
        let dir = tempfile::tempdir().unwrap();
        let log = ToolStreamLog::open(dir.path(), 1 << 20, false)
            .unwrap()
            .with_summary_limit(10);
        for i in 1..=11 {
            log.append_chunk(chunk(&format!("c{}", i), ChunkStatus::Start))
                .await
                .unwrap();
        }

        let summaries = log.summaries().await;
        assert_eq!(summaries.len(), 9);
        assert_eq!(summaries[0].correlation_id, "c11");
        assert!(log.summary("c1").await.is_none());
        assert!(log.summary("c2").await.is_none());
        assert!(log.summary("c3").await.is_some());
        // Pruning forgets the summary, not the chunks.
        assert_eq!(log.chunks(Some("c1")).await.unwrap().len(), 1);
    }
}

// src/subsystems/file_manager.rs
//! Admission-gated file operations
//!
//! Every operation holds a slot of the file gate for its whole duration, so
//! at most `max_concurrent` files are open at once.

use crate::admission::AdmissionGate;
use crate::subsystems::api_client_pool::percentage;
use crate::utils::config::FileConfig;
use crate::utils::errors::{OrchestratorError, Result};
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RESOURCE: &str = "file";

/// What to do with a path
#[derive(Debug, Clone)]
pub enum FileOperationKind {
    Read,
    Write(Bytes),
    ParseJson,
    /// Element tree as JSON: `name`, `attributes`, `text`, `children`
    ParseXml,
    /// Buffered read in `stream_buffer_size` chunks
    Stream,
}

#[derive(Debug, Clone)]
pub struct FileOperation {
    pub path: PathBuf,
    pub kind: FileOperationKind,
}

impl FileOperation {
    pub fn read(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FileOperationKind::Read,
        }
    }

    pub fn write(path: impl Into<PathBuf>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            kind: FileOperationKind::Write(data.into()),
        }
    }

    pub fn parse_json(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FileOperationKind::ParseJson,
        }
    }

    pub fn parse_xml(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FileOperationKind::ParseXml,
        }
    }

    pub fn stream(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FileOperationKind::Stream,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileResult {
    pub path: PathBuf,
    /// Contents for reads and streams
    pub data: Option<Bytes>,
    /// Document for `ParseJson` and `ParseXml`
    pub parsed: Option<Value>,
    pub bytes_processed: u64,
    pub duration: Duration,
}

/// Point-in-time file metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileMetrics {
    pub total_operations: u64,
    pub successful: u64,
    pub errors: u64,
    pub success_rate: f64,
    pub total_bytes: u64,
    pub avg_bytes_per_op: f64,
    pub avg_latency_ms: f64,
    pub peak_concurrency: usize,
    pub current_concurrent: usize,
    pub max_concurrent: usize,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
    latency_ns: AtomicU64,
    peak: AtomicUsize,
}

/// File manager
pub struct FileManager {
    gate: AdmissionGate,
    stream_buffer_size: usize,
    counters: Counters,
    closed: AtomicBool,
}

impl FileManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self::from_config(&FileConfig {
            max_concurrent,
            ..FileConfig::default()
        })
    }

    pub fn from_config(config: &FileConfig) -> Self {
        Self {
            gate: AdmissionGate::new(RESOURCE, config.max_concurrent),
            stream_buffer_size: config.stream_buffer_size.max(1),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Run one operation once a slot is free
    pub async fn execute(&self, cancel: &CancellationToken, op: FileOperation) -> Result<FileResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OrchestratorError::ManagerClosed("file manager"));
        }

        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let _permit = match self.gate.acquire(cancel, None).await {
            Ok(permit) => permit,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.counters
            .peak
            .fetch_max(self.gate.in_use(), Ordering::Relaxed);

        let start = Instant::now();
        let outcome = self.run(cancel, &op).await;
        let duration = start.elapsed();

        self.counters
            .latency_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);

        match outcome {
            Ok((data, parsed, bytes_processed)) => {
                self.counters.successful.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes
                    .fetch_add(bytes_processed, Ordering::Relaxed);
                debug!("{} {} ({} bytes)", op.kind_name(), op.path.display(), bytes_processed);

                Ok(FileResult {
                    path: op.path,
                    data,
                    parsed,
                    bytes_processed,
                    duration,
                })
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!("File operation on {} failed: {}", op.path.display(), e);
                Err(e)
            }
        }
    }

    /// Run every operation concurrently; the first error (in input order)
    /// is returned once all of them have finished
    pub async fn batch_execute(
        &self,
        cancel: &CancellationToken,
        ops: Vec<FileOperation>,
    ) -> Result<Vec<FileResult>> {
        let results = join_all(ops.into_iter().map(|op| self.execute(cancel, op))).await;
        results.into_iter().collect()
    }

    /// Every regular file below `root`, depth first
    pub async fn walk_directory(
        &self,
        cancel: &CancellationToken,
        root: impl AsRef<Path>,
    ) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![root.as_ref().to_path_buf()];

        while let Some(dir) = pending.pop() {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::AdmissionCancelled(RESOURCE));
            }

            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Paths matching a shell glob such as `/var/data/*.json`.
    ///
    /// Unreadable entries are skipped; an invalid pattern is a validation error.
    pub async fn list_files(&self, cancel: &CancellationToken, pattern: &str) -> Result<Vec<PathBuf>> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::AdmissionCancelled(RESOURCE));
        }

        let pattern = pattern.to_string();
        let matches = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            let paths = glob::glob(&pattern).map_err(|e| {
                OrchestratorError::ValidationFailure(format!("invalid glob {}: {}", pattern, e))
            })?;

            Ok(paths
                .filter_map(|entry| match entry {
                    Ok(path) => Some(path),
                    Err(e) => {
                        debug!("Skipping {}: {}", e.path().display(), e.error());
                        None
                    }
                })
                .collect())
        })
        .await
        .map_err(|e| OrchestratorError::Io(std::io::Error::other(e)))??;

        debug!("Glob matched {} paths", matches.len());
        Ok(matches)
    }

    pub fn metrics(&self) -> FileMetrics {
        let total = self.counters.total.load(Ordering::Relaxed);
        let successful = self.counters.successful.load(Ordering::Relaxed);
        let errors = self.counters.errors.load(Ordering::Relaxed);
        let bytes = self.counters.bytes.load(Ordering::Relaxed);
        let completed = successful + errors;

        FileMetrics {
            total_operations: total,
            successful,
            errors,
            success_rate: percentage(successful, total),
            total_bytes: bytes,
            avg_bytes_per_op: if successful > 0 {
                bytes as f64 / successful as f64
            } else {
                0.0
            },
            avg_latency_ms: if completed > 0 {
                self.counters.latency_ns.load(Ordering::Relaxed) as f64
                    / completed as f64
                    / 1_000_000.0
            } else {
                0.0
            },
            peak_concurrency: self.counters.peak.load(Ordering::Relaxed),
            current_concurrent: self.gate.in_use(),
            max_concurrent: self.gate.capacity(),
        }
    }

    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closing file manager");
            self.gate.close();
        }
        Ok(())
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        op: &FileOperation,
    ) -> Result<(Option<Bytes>, Option<Value>, u64)> {
        match &op.kind {
            FileOperationKind::Read => {
                let data = tokio::fs::read(&op.path).await?;
                let len = data.len() as u64;
                Ok((Some(Bytes::from(data)), None, len))
            }
            FileOperationKind::Write(data) => {
                if let Some(parent) = op.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&op.path, data).await?;
                Ok((None, None, data.len() as u64))
            }
            FileOperationKind::ParseJson => {
                let data = tokio::fs::read(&op.path).await?;
                let parsed: Value = serde_json::from_slice(&data).map_err(|e| {
                    OrchestratorError::ValidationFailure(format!(
                        "invalid JSON in {}: {}",
                        op.path.display(),
                        e
                    ))
                })?;
                Ok((None, Some(parsed), data.len() as u64))
            }
            FileOperationKind::ParseXml => {
                let data = tokio::fs::read(&op.path).await?;
                let parsed = xml_to_json(&data).map_err(|e| {
                    OrchestratorError::ValidationFailure(format!(
                        "invalid XML in {}: {}",
                        op.path.display(),
                        e
                    ))
                })?;
                Ok((None, Some(parsed), data.len() as u64))
            }
            FileOperationKind::Stream => {
                let data = self.stream(cancel, &op.path).await?;
                let len = data.len() as u64;
                Ok((Some(data), None, len))
            }
        }
    }

    async fn stream(&self, cancel: &CancellationToken, path: &Path) -> Result<Bytes> {
        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::with_capacity(self.stream_buffer_size, file);
        let mut chunk = vec![0u8; self.stream_buffer_size];
        let mut out = BytesMut::new();

        loop {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::AdmissionCancelled(RESOURCE));
            }
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }

        Ok(out.freeze())
    }
}

impl FileOperation {
    fn kind_name(&self) -> &'static str {
        match self.kind {
            FileOperationKind::Read => "read",
            FileOperationKind::Write(_) => "write",
            FileOperationKind::ParseJson => "parse_json",
            FileOperationKind::ParseXml => "parse_xml",
            FileOperationKind::Stream => "stream",
        }
    }
}

struct XmlElement {
    name: String,
    attributes: Map<String, Value>,
    text: String,
    children: Vec<Value>,
}

impl XmlElement {
    fn open(start: &BytesStart<'_>) -> std::result::Result<Self, String> {
        let mut attributes = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            attributes.insert(
                String::from_utf8_lossy(attr.key.as_ref()).to_string(),
                Value::String(value.to_string()),
            );
        }

        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).to_string(),
            attributes,
            text: String::new(),
            children: Vec::new(),
        })
    }

    fn into_value(self) -> Value {
        json!({
            "name": self.name,
            "attributes": self.attributes,
            "text": self.text,
            "children": self.children,
        })
    }
}

/// Parse a whole document into the JSON shape of its root element
fn xml_to_json(data: &[u8]) -> std::result::Result<Value, String> {
    let text = std::str::from_utf8(data).map_err(|e| e.to_string())?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut open: Vec<XmlElement> = Vec::new();
    let mut root: Option<Value> = None;

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(ref e) => open.push(XmlElement::open(e)?),
            Event::Empty(ref e) => {
                let element = XmlElement::open(e)?.into_value();
                attach(&mut open, &mut root, element)?;
            }
            Event::End(_) => {
                let element = open
                    .pop()
                    .ok_or_else(|| "unexpected closing tag".to_string())?;
                attach(&mut open, &mut root, element.into_value())?;
            }
            Event::Text(ref e) => {
                if let Some(current) = open.last_mut() {
                    current.text.push_str(&e.unescape().map_err(|e| e.to_string())?);
                }
            }
            Event::CData(ref e) => {
                if let Some(current) = open.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(unclosed) = open.last() {
        return Err(format!("unclosed element <{}>", unclosed.name));
    }
    root.ok_or_else(|| "no root element".to_string())
}

fn attach(
    open: &mut [XmlElement],
    root: &mut Option<Value>,
    element: Value,
) -> std::result::Result<(), String> {
    match open.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err("more than one root element".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let manager = FileManager::new(4);
        let cancel = CancellationToken::new();
        let path = dir.path().join("nested/out.txt");

        let written = manager
            .execute(&cancel, FileOperation::write(&path, "hello"))
            .await
            .unwrap();
        assert_eq!(written.bytes_processed, 5);

        let read = manager
            .execute(&cancel, FileOperation::read(&path))
            .await
            .unwrap();
        assert_eq!(read.data.unwrap(), Bytes::from_static(b"hello"));

        let metrics = manager.metrics();
        assert_eq!(metrics.total_operations, 2);
        assert_eq!(metrics.successful, 2);
        assert_eq!(metrics.total_bytes, 10);
        assert_eq!(metrics.current_concurrent, 0);
    }

    #[tokio::test]
    async fn test_parse_json() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        std::fs::write(&good, r#"{"name": "orchestrator", "pools": 5}"#).unwrap();
        std::fs::write(&bad, "{not json").unwrap();

        let manager = FileManager::new(4);
        let cancel = CancellationToken::new();

        let result = manager
            .execute(&cancel, FileOperation::parse_json(&good))
            .await
            .unwrap();
        assert_eq!(result.parsed.unwrap()["pools"], 5);

        let err = manager
            .execute(&cancel, FileOperation::parse_json(&bad))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationFailure(_)));
        assert_eq!(manager.metrics().errors, 1);
    }

    #[tokio::test]
    async fn test_parse_xml() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("pools.xml");
        let bad = dir.path().join("bad.xml");
        std::fs::write(
            &good,
            r#"<?xml version="1.0"?>
<pools version="2">
  <pool name="api">32</pool>
  <pool name="file"/>
  <note><![CDATA[a < b]]> &amp; more</note>
</pools>"#,
        )
        .unwrap();
        std::fs::write(&bad, "<pools><pool></pools>").unwrap();

        let manager = FileManager::new(4);
        let cancel = CancellationToken::new();

        let result = manager
            .execute(&cancel, FileOperation::parse_xml(&good))
            .await
            .unwrap();
        let root = result.parsed.unwrap();
        assert_eq!(root["name"], "pools");
        assert_eq!(root["attributes"]["version"], "2");

        let children = root["children"].as_array().unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(children[0]["attributes"]["name"], "api");
        assert_eq!(children[0]["text"], "32");
        assert_eq!(children[1]["attributes"]["name"], "file");
        assert!(children[2]["text"].as_str().unwrap().starts_with("a < b"));

        let err = manager
            .execute(&cancel, FileOperation::parse_xml(&bad))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationFailure(_)));
        assert_eq!(manager.metrics().errors, 1);
    }

    #[test]
    fn test_xml_needs_one_closed_root() {
        assert!(xml_to_json(b"").is_err());
        assert!(xml_to_json(b"<a><b></b>").is_err());
        assert!(xml_to_json(b"<a/><b/>").is_err());
        assert_eq!(xml_to_json(b"<a/>").unwrap()["name"], "a");
    }

    #[tokio::test]
    async fn test_list_files() {
        let dir = TempDir::new().unwrap();
        for name in ["b.txt", "a.txt", "c.json"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }

        let manager = FileManager::new(1);
        let cancel = CancellationToken::new();

        let pattern = format!("{}/*.txt", dir.path().display());
        let files = manager.list_files(&cancel, &pattern).await.unwrap();
        assert_eq!(files, vec![dir.path().join("a.txt"), dir.path().join("b.txt")]);

        let none = format!("{}/*.xml", dir.path().display());
        assert!(manager.list_files(&cancel, &none).await.unwrap().is_empty());

        let invalid = format!("{}/[", dir.path().display());
        let err = manager.list_files(&cancel, &invalid).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationFailure(_)));

        // listing is not a gated operation
        assert_eq!(manager.metrics().total_operations, 0);
    }

    #[tokio::test]
    async fn test_stream_uses_small_buffer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let manager = FileManager::from_config(&FileConfig {
            max_concurrent: 2,
            stream_buffer_size: 64,
        });
        let result = manager
            .execute(&CancellationToken::new(), FileOperation::stream(&path))
            .await
            .unwrap();

        assert_eq!(result.bytes_processed, 10_000);
        assert_eq!(result.data.unwrap().as_ref(), content.as_slice());
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let manager = FileManager::new(1);
        let err = manager
            .execute(
                &CancellationToken::new(),
                FileOperation::read("/nonexistent/definitely/missing"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Io(_)));
        assert_eq!(manager.metrics().current_concurrent, 0);
    }

    #[tokio::test]
    async fn test_batch_reports_first_error_after_all_complete() {
        let dir = TempDir::new().unwrap();
        let manager = FileManager::new(2);
        let cancel = CancellationToken::new();

        let ops = vec![
            FileOperation::write(dir.path().join("a.txt"), "a"),
            FileOperation::read(dir.path().join("missing.txt")),
            FileOperation::write(dir.path().join("b.txt"), "bb"),
        ];

        assert!(manager.batch_execute(&cancel, ops).await.is_err());
        assert!(dir.path().join("a.txt").exists());
        assert!(dir.path().join("b.txt").exists());

        let metrics = manager.metrics();
        assert_eq!(metrics.total_operations, 3);
        assert_eq!(metrics.successful, 2);
        assert!(metrics.peak_concurrency <= 2);
    }

    #[tokio::test]
    async fn test_walk_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("x/y")).unwrap();
        std::fs::write(dir.path().join("root.txt"), "r").unwrap();
        std::fs::write(dir.path().join("x/one.txt"), "1").unwrap();
        std::fs::write(dir.path().join("x/y/two.txt"), "2").unwrap();

        let manager = FileManager::new(1);
        let files = manager
            .walk_directory(&CancellationToken::new(), dir.path())
            .await
            .unwrap();

        assert_eq!(files.len(), 3);
        assert!(files.contains(&dir.path().join("x/y/two.txt")));
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting_for_slot() {
        let manager = FileManager::new(1);
        let _held = manager.gate.try_acquire().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager
            .execute(&cancel, FileOperation::read("/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AdmissionCancelled("file")));
    }

    #[tokio::test]
    async fn test_closed_manager_rejects() {
        let manager = FileManager::new(1);
        manager.close().unwrap();
        manager.close().unwrap();

        let err = manager
            .execute(&CancellationToken::new(), FileOperation::read("/tmp/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ManagerClosed(_)));
    }

    #[test]
    fn test_metrics_without_operations() {
        let metrics = FileManager::new(500).metrics();
        assert_eq!(metrics.success_rate, 100.0);
        assert_eq!(metrics.max_concurrent, 500);
    }
}

// src/subsystems/browser_pool.rs
//! Browser instance pool with nested tab limits
//!
//! Two admission gates are involved:
//!
//! - **Instance gate**: one slot per running browser
//! - **Tab gate**: pool-wide tab slots (`max_browsers * max_tabs`)
//!
//! A tab also has to fit under its own browser's `max_tabs`. The check and
//! the insert happen under the browser's state lock, and the tab slot is
//! stored with the tab, so closing a tab or its browser returns every slot
//! exactly once.
//!
//! Only the process and debugging-port lifecycle is managed here; no
//! DevTools commands are sent.

use crate::admission::{AdmissionGate, GatePermit};
use crate::subsystems::api_client_pool::percentage;
use crate::utils::config::BrowserConfig;
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Binaries tried on PATH when none is configured
const BROWSER_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

/// Starts browser processes and finds their debugging endpoint
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Start a browser with remote debugging on `port`
    async fn launch(&self, port: u16, headless: bool) -> Result<Child>;

    /// Websocket URL of the browser listening on `port`
    async fn websocket_endpoint(&self, port: u16) -> Result<String>;
}

/// Launches Chrome/Chromium and polls `/json/version` for its endpoint
pub struct ChromeLauncher {
    binary: Option<PathBuf>,
    discovery_timeout: Duration,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

impl ChromeLauncher {
    pub fn new(binary: Option<PathBuf>, discovery_timeout: Duration) -> Self {
        Self {
            binary,
            discovery_timeout,
            http: reqwest::Client::new(),
        }
    }

    fn find_executable(&self) -> Result<PathBuf> {
        if let Some(binary) = &self.binary {
            return Ok(binary.clone());
        }

        for candidate in BROWSER_CANDIDATES {
            if let Ok(path) = which::which(candidate) {
                debug!("Found browser at {:?}", path);
                return Ok(path);
            }
        }

        Err(OrchestratorError::LaunchFailure {
            what: "browser".to_string(),
            reason: format!("none of {:?} found in PATH", BROWSER_CANDIDATES),
        })
    }
}

impl Default for ChromeLauncher {
    fn default() -> Self {
        Self::new(None, Duration::from_secs(10))
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, port: u16, headless: bool) -> Result<Child> {
        let executable = self.find_executable()?;
        let profile_dir = std::env::temp_dir().join(format!("resource-orchestrator-{}", port));

        let mut command = Command::new(&executable);
        command
            .arg(format!("--remote-debugging-port={}", port))
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");

        if headless {
            command.arg("--headless=new");
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OrchestratorError::LaunchFailure {
                what: executable.display().to_string(),
                reason: e.to_string(),
            })
    }

    async fn websocket_endpoint(&self, port: u16) -> Result<String> {
        let url = format!("http://127.0.0.1:{}/json/version", port);
        let deadline = tokio::time::Instant::now() + self.discovery_timeout;

        loop {
            let attempt = async {
                self.http
                    .get(&url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<VersionInfo>()
                    .await
            };

            match attempt.await {
                Ok(info) => return Ok(info.web_socket_debugger_url),
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(OrchestratorError::LaunchFailure {
                        what: format!("browser on port {}", port),
                        reason: format!("debugging endpoint not available: {}", e),
                    });
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }
}

/// A tab registered against a browser
#[derive(Debug, Clone, Serialize)]
pub struct Tab {
    pub id: String,
    pub cdp_url: String,
    pub created_at: DateTime<Utc>,
    pub url: String,
}

/// Snapshot of a browser instance
#[derive(Debug, Clone, Serialize)]
pub struct BrowserInstance {
    pub id: String,
    pub pid: Option<u32>,
    pub ws_endpoint: String,
    pub port: u16,
    pub tabs: Vec<Tab>,
    pub max_tabs: usize,
    pub active_tabs: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub extensions: Vec<String>,
}

/// Point-in-time browser pool metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrowserMetrics {
    pub active_browsers: u64,
    pub total_tabs: u64,
    pub active_tabs: u64,
    pub successful_launches: u64,
    pub failed_launches: u64,
    pub launch_success_rate: f64,
    pub extensions_loaded: u64,
    pub extensions_failed: u64,
    pub extension_success_rate: f64,
    pub cdp_connection_errors: u64,
    pub tab_creation_errors: u64,
    pub peak_concurrent_browsers: u64,
    pub peak_concurrent_tabs: u64,
    pub max_browsers: usize,
    pub max_tabs_per_browser: usize,
}

#[derive(Default)]
struct Counters {
    active_browsers: AtomicU64,
    total_tabs: AtomicU64,
    active_tabs: AtomicU64,
    successful_launches: AtomicU64,
    failed_launches: AtomicU64,
    extensions_loaded: AtomicU64,
    extensions_failed: AtomicU64,
    cdp_errors: AtomicU64,
    tab_errors: AtomicU64,
    peak_browsers: AtomicU64,
    peak_tabs: AtomicU64,
}

struct TabEntry {
    tab: Tab,
    _permit: GatePermit,
}

struct BrowserState {
    tabs: HashMap<String, TabEntry>,
    extensions: Vec<String>,
    last_activity_at: DateTime<Utc>,
    closed: bool,
}

struct BrowserEntry {
    id: String,
    pid: Option<u32>,
    port: u16,
    ws_endpoint: String,
    max_tabs: usize,
    created_at: DateTime<Utc>,
    state: Mutex<BrowserState>,
    child: Mutex<Option<Child>>,
    permit: Mutex<Option<GatePermit>>,
}

impl BrowserEntry {
    fn snapshot(&self) -> BrowserInstance {
        let state = self.state.lock();
        BrowserInstance {
            id: self.id.clone(),
            pid: self.pid,
            ws_endpoint: self.ws_endpoint.clone(),
            port: self.port,
            tabs: state.tabs.values().map(|entry| entry.tab.clone()).collect(),
            max_tabs: self.max_tabs,
            active_tabs: state.tabs.len(),
            created_at: self.created_at,
            last_activity_at: state.last_activity_at,
            extensions: state.extensions.clone(),
        }
    }
}

/// Browser pool
pub struct BrowserPool {
    launcher: Arc<dyn BrowserLauncher>,
    instance_gate: AdmissionGate,
    tab_gate: AdmissionGate,
    max_browsers: usize,
    max_tabs: usize,
    browsers: RwLock<HashMap<String, Arc<BrowserEntry>>>,
    extension_paths: RwLock<HashMap<String, PathBuf>>,
    counters: Counters,
    closed: AtomicBool,
}

impl BrowserPool {
    /// Pool launching Chrome found on PATH
    pub fn new(max_browsers: usize, max_tabs: usize) -> Self {
        Self::with_launcher(max_browsers, max_tabs, Arc::new(ChromeLauncher::default()))
    }

    pub fn with_launcher(
        max_browsers: usize,
        max_tabs: usize,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            launcher,
            instance_gate: AdmissionGate::new("browser", max_browsers),
            tab_gate: AdmissionGate::new("tab", max_browsers * max_tabs),
            max_browsers,
            max_tabs,
            browsers: RwLock::new(HashMap::new()),
            extension_paths: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &BrowserConfig) -> Self {
        let launcher = ChromeLauncher::new(
            config.binary.as_ref().map(PathBuf::from),
            Duration::from_millis(config.discovery_timeout_ms),
        );
        info!(
            "Browser pool ready: {} browsers x {} tabs",
            config.max_browsers, config.max_tabs
        );
        Self::with_launcher(config.max_browsers, config.max_tabs, Arc::new(launcher))
    }

    /// Start a browser and register it once its debugging endpoint answers.
    ///
    /// On any failure after the process started, the process is killed and
    /// the instance slot returned.
    pub async fn launch_browser(
        &self,
        cancel: &CancellationToken,
        headless: bool,
    ) -> Result<BrowserInstance> {
        if self.closed.load(Ordering::Acquire) {
            self.counters.failed_launches.fetch_add(1, Ordering::Relaxed);
            return Err(OrchestratorError::ManagerClosed("browser pool"));
        }

        let permit = match self.instance_gate.acquire(cancel, None).await {
            Ok(permit) => permit,
            Err(e) => {
                self.counters.failed_launches.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let port = match free_port() {
            Ok(port) => port,
            Err(e) => {
                self.counters.failed_launches.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let mut child = match self.launcher.launch(port, headless).await {
            Ok(child) => child,
            Err(e) => {
                self.counters.failed_launches.fetch_add(1, Ordering::Relaxed);
                warn!("Browser launch on port {} failed: {}", port, e);
                return Err(e);
            }
        };

        let endpoint = tokio::select! {
            endpoint = self.launcher.websocket_endpoint(port) => endpoint,
            _ = cancel.cancelled() => Err(OrchestratorError::AdmissionCancelled("browser")),
        };

        let ws_endpoint = match endpoint {
            Ok(ws_endpoint) => ws_endpoint,
            Err(e) => {
                self.counters.failed_launches.fetch_add(1, Ordering::Relaxed);
                self.counters.cdp_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Tearing down browser on port {}: {}", port, e);
                terminate(&mut child).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let entry = Arc::new(BrowserEntry {
            id: format!("browser-{}", Ulid::new().to_string().to_lowercase()),
            pid: child.id(),
            port,
            ws_endpoint,
            max_tabs: self.max_tabs,
            created_at: now,
            state: Mutex::new(BrowserState {
                tabs: HashMap::new(),
                extensions: Vec::new(),
                last_activity_at: now,
                closed: false,
            }),
            child: Mutex::new(Some(child)),
            permit: Mutex::new(Some(permit)),
        });

        let active = self.counters.active_browsers.fetch_add(1, Ordering::Relaxed) + 1;
        self.browsers
            .write()
            .insert(entry.id.clone(), Arc::clone(&entry));

        // close() may have drained the registry while discovery was running
        if self.closed.load(Ordering::Acquire) {
            let removed = self.browsers.write().remove(&entry.id);
            if let Some(entry) = removed {
                warn!("Browser pool closed while {} was starting, killing it", entry.id);
                self.teardown(entry).await;
            }
            self.counters.failed_launches.fetch_add(1, Ordering::Relaxed);
            return Err(OrchestratorError::ManagerClosed("browser pool"));
        }

        self.counters.successful_launches.fetch_add(1, Ordering::Relaxed);
        self.counters.peak_browsers.fetch_max(active, Ordering::Relaxed);

        info!("Launched {} on port {} ({})", entry.id, port, entry.ws_endpoint);
        Ok(entry.snapshot())
    }

    /// Open a tab on `browser_id`, bounded by the pool-wide tab gate and by
    /// the browser's own `max_tabs`
    pub async fn create_tab(
        &self,
        cancel: &CancellationToken,
        browser_id: &str,
        url: &str,
    ) -> Result<Tab> {
        let permit = match self.tab_gate.acquire(cancel, None).await {
            Ok(permit) => permit,
            Err(e) => {
                self.counters.tab_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let entry = match self.browser(browser_id) {
            Ok(entry) => entry,
            Err(e) => {
                self.counters.tab_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let tab = {
            let mut state = entry.state.lock();

            if state.closed {
                self.counters.tab_errors.fetch_add(1, Ordering::Relaxed);
                return Err(OrchestratorError::not_found("browser", browser_id));
            }

            if state.tabs.len() >= entry.max_tabs {
                self.counters.tab_errors.fetch_add(1, Ordering::Relaxed);
                return Err(OrchestratorError::TabLimitExceeded {
                    browser_id: browser_id.to_string(),
                    max_tabs: entry.max_tabs,
                });
            }

            let id = format!("tab-{}", Ulid::new().to_string().to_lowercase());
            let tab = Tab {
                cdp_url: format!("ws://127.0.0.1:{}/devtools/page/{}", entry.port, id),
                id: id.clone(),
                created_at: Utc::now(),
                url: url.to_string(),
            };

            state.tabs.insert(
                id,
                TabEntry {
                    tab: tab.clone(),
                    _permit: permit,
                },
            );
            state.last_activity_at = tab.created_at;
            tab
        };

        self.counters.total_tabs.fetch_add(1, Ordering::Relaxed);
        let active = self.counters.active_tabs.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.peak_tabs.fetch_max(active, Ordering::Relaxed);

        debug!("Created {} on {} for {}", tab.id, browser_id, url);
        Ok(tab)
    }

    pub fn close_tab(&self, browser_id: &str, tab_id: &str) -> Result<()> {
        let entry = self.browser(browser_id)?;

        let removed = {
            let mut state = entry.state.lock();
            let removed = state.tabs.remove(tab_id);
            if removed.is_some() {
                state.last_activity_at = Utc::now();
            }
            removed
        };

        match removed {
            Some(_) => {
                self.counters.active_tabs.fetch_sub(1, Ordering::Relaxed);
                debug!("Closed {} on {}", tab_id, browser_id);
                Ok(())
            }
            None => Err(OrchestratorError::not_found("tab", tab_id)),
        }
    }

    /// Register an extension directory or file against a browser.
    ///
    /// Returns the extension id (the path's file name).
    pub async fn load_extension(&self, browser_id: &str, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();

        let entry = match self.browser(browser_id) {
            Ok(entry) => entry,
            Err(e) => {
                self.counters.extensions_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if tokio::fs::metadata(path).await.is_err() {
            self.counters.extensions_failed.fetch_add(1, Ordering::Relaxed);
            return Err(OrchestratorError::ValidationFailure(format!(
                "extension path does not exist: {}",
                path.display()
            )));
        }

        let extension_id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        self.extension_paths
            .write()
            .insert(extension_id.clone(), path.to_path_buf());

        {
            let mut state = entry.state.lock();
            state.extensions.push(extension_id.clone());
            state.last_activity_at = Utc::now();
        }

        self.counters.extensions_loaded.fetch_add(1, Ordering::Relaxed);
        debug!("Loaded extension {} into {}", extension_id, browser_id);
        Ok(extension_id)
    }

    /// Close every tab, kill the browser process and return its slot
    pub async fn close_browser(&self, browser_id: &str) -> Result<()> {
        let entry = self
            .browsers
            .write()
            .remove(browser_id)
            .ok_or_else(|| OrchestratorError::not_found("browser", browser_id))?;

        self.teardown(entry).await;
        Ok(())
    }

    pub fn browser_status(&self, browser_id: &str) -> Result<BrowserInstance> {
        Ok(self.browser(browser_id)?.snapshot())
    }

    pub fn list_browsers(&self) -> Vec<BrowserInstance> {
        self.browsers
            .read()
            .values()
            .map(|entry| entry.snapshot())
            .collect()
    }

    /// Path registered under an extension id
    pub fn extension_path(&self, extension_id: &str) -> Option<PathBuf> {
        self.extension_paths.read().get(extension_id).cloned()
    }

    pub fn metrics(&self) -> BrowserMetrics {
        let successful = self.counters.successful_launches.load(Ordering::Relaxed);
        let failed = self.counters.failed_launches.load(Ordering::Relaxed);
        let loaded = self.counters.extensions_loaded.load(Ordering::Relaxed);
        let ext_failed = self.counters.extensions_failed.load(Ordering::Relaxed);

        BrowserMetrics {
            active_browsers: self.counters.active_browsers.load(Ordering::Relaxed),
            total_tabs: self.counters.total_tabs.load(Ordering::Relaxed),
            active_tabs: self.counters.active_tabs.load(Ordering::Relaxed),
            successful_launches: successful,
            failed_launches: failed,
            launch_success_rate: percentage(successful, successful + failed),
            extensions_loaded: loaded,
            extensions_failed: ext_failed,
            extension_success_rate: percentage(loaded, loaded + ext_failed),
            cdp_connection_errors: self.counters.cdp_errors.load(Ordering::Relaxed),
            tab_creation_errors: self.counters.tab_errors.load(Ordering::Relaxed),
            peak_concurrent_browsers: self.counters.peak_browsers.load(Ordering::Relaxed),
            peak_concurrent_tabs: self.counters.peak_tabs.load(Ordering::Relaxed),
            max_browsers: self.max_browsers,
            max_tabs_per_browser: self.max_tabs,
        }
    }

    /// Kill every browser and reject further launches. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Closing browser pool");
        self.instance_gate.close();
        self.tab_gate.close();

        let entries: Vec<Arc<BrowserEntry>> =
            self.browsers.write().drain().map(|(_, entry)| entry).collect();
        futures::future::join_all(entries.into_iter().map(|entry| self.teardown(entry))).await;

        self.extension_paths.write().clear();
        Ok(())
    }

    async fn teardown(&self, entry: Arc<BrowserEntry>) {
        let tabs = {
            let mut state = entry.state.lock();
            state.closed = true;
            state.tabs.drain().count()
        };
        self.counters
            .active_tabs
            .fetch_sub(tabs as u64, Ordering::Relaxed);

        let child = entry.child.lock().take();
        if let Some(mut child) = child {
            terminate(&mut child).await;
        }

        entry.permit.lock().take();
        self.counters.active_browsers.fetch_sub(1, Ordering::Relaxed);

        info!("Closed {} ({} tabs released)", entry.id, tabs);
    }

    fn browser(&self, browser_id: &str) -> Result<Arc<BrowserEntry>> {
        self.browsers
            .read()
            .get(browser_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("browser", browser_id))
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Browser process already gone: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap browser process: {}", e);
    }
}

fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use tokio::sync::Notify;

    /// Spawns a long sleep in place of a browser
    struct FakeLauncher {
        fail_discovery: bool,
        last_pid: Mutex<Option<u32>>,
        /// When set, discovery reports `discovering` and parks until released
        hold_discovery: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl FakeLauncher {
        fn new(fail_discovery: bool) -> Arc<Self> {
            Arc::new(Self {
                fail_discovery,
                last_pid: Mutex::new(None),
                hold_discovery: None,
            })
        }

        fn held(discovering: Arc<Notify>, release: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                fail_discovery: false,
                last_pid: Mutex::new(None),
                hold_discovery: Some((discovering, release)),
            })
        }
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(&self, _port: u16, _headless: bool) -> Result<Child> {
            let child = Command::new("sleep").arg("30").kill_on_drop(true).spawn()?;
            *self.last_pid.lock() = child.id();
            Ok(child)
        }

        async fn websocket_endpoint(&self, port: u16) -> Result<String> {
            if let Some((discovering, release)) = &self.hold_discovery {
                discovering.notify_one();
                release.notified().await;
            }
            if self.fail_discovery {
                return Err(OrchestratorError::LaunchFailure {
                    what: "fake".to_string(),
                    reason: "no endpoint".to_string(),
                });
            }
            Ok(format!("ws://127.0.0.1:{}/devtools/browser/fake", port))
        }
    }

    fn pool(max_browsers: usize, max_tabs: usize) -> BrowserPool {
        BrowserPool::with_launcher(max_browsers, max_tabs, FakeLauncher::new(false))
    }

    #[tokio::test]
    async fn test_tab_limit_per_browser() {
        let pool = pool(2, 5);
        let cancel = CancellationToken::new();
        let browser = pool.launch_browser(&cancel, true).await.unwrap();
        assert_eq!(browser.max_tabs, 5);

        for i in 0..5 {
            pool.create_tab(&cancel, &browser.id, &format!("https://example.com/{}", i))
                .await
                .unwrap();
        }

        let sixth = pool.create_tab(&cancel, &browser.id, "https://example.com/6").await;
        assert!(matches!(sixth, Err(OrchestratorError::TabLimitExceeded { max_tabs: 5, .. })));

        // the rejected tab did not keep its pool-wide slot
        assert_eq!(pool.tab_gate.available(), 10 - 5);
        assert_eq!(pool.metrics().tab_creation_errors, 1);

        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_browser_releases_its_tabs() {
        let pool = pool(2, 5);
        let cancel = CancellationToken::new();
        let first = pool.launch_browser(&cancel, true).await.unwrap();
        let second = pool.launch_browser(&cancel, true).await.unwrap();

        for _ in 0..3 {
            pool.create_tab(&cancel, &first.id, "about:blank").await.unwrap();
        }
        pool.create_tab(&cancel, &second.id, "about:blank").await.unwrap();
        assert_eq!(pool.metrics().active_tabs, 4);

        pool.close_browser(&first.id).await.unwrap();

        let metrics = pool.metrics();
        assert_eq!(metrics.active_tabs, 1);
        assert_eq!(metrics.active_browsers, 1);
        assert_eq!(pool.tab_gate.available(), 10 - 1);
        assert_eq!(pool.instance_gate.available(), 1);
        assert!(pool.browser_status(&first.id).is_err());

        let missing = pool.close_browser(&first.id).await;
        assert!(matches!(missing, Err(OrchestratorError::ResourceNotFound { .. })));

        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_tab() {
        let pool = pool(1, 2);
        let cancel = CancellationToken::new();
        let browser = pool.launch_browser(&cancel, true).await.unwrap();
        let tab = pool.create_tab(&cancel, &browser.id, "https://example.com").await.unwrap();
        assert!(tab.cdp_url.ends_with(&tab.id));

        pool.close_tab(&browser.id, &tab.id).unwrap();
        assert!(pool.close_tab(&browser.id, &tab.id).is_err());
        assert_eq!(pool.browser_status(&browser.id).unwrap().active_tabs, 0);
        assert_eq!(pool.tab_gate.available(), 2);

        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_failure_tears_down() {
        let launcher = FakeLauncher::new(true);
        let pool = BrowserPool::with_launcher(1, 5, launcher.clone());

        let result = pool.launch_browser(&CancellationToken::new(), true).await;
        assert!(matches!(result, Err(OrchestratorError::LaunchFailure { .. })));
        assert_eq!(pool.instance_gate.available(), 1);

        let metrics = pool.metrics();
        assert_eq!(metrics.failed_launches, 1);
        assert_eq!(metrics.cdp_connection_errors, 1);
        assert_eq!(metrics.active_browsers, 0);

        let pid = *launcher.last_pid.lock();
        let pid = pid.unwrap();
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[tokio::test]
    async fn test_tab_on_unknown_browser() {
        let pool = pool(1, 5);
        let result = pool
            .create_tab(&CancellationToken::new(), "browser-missing", "about:blank")
            .await;
        assert!(matches!(result, Err(OrchestratorError::ResourceNotFound { .. })));
        assert_eq!(pool.tab_gate.available(), 5);
    }

    #[tokio::test]
    async fn test_load_extension() {
        let pool = pool(1, 5);
        let browser = pool.launch_browser(&CancellationToken::new(), true).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let ext_dir = dir.path().join("adblock");
        std::fs::create_dir(&ext_dir).unwrap();

        let id = pool.load_extension(&browser.id, &ext_dir).await.unwrap();
        assert_eq!(id, "adblock");
        assert_eq!(pool.extension_path("adblock"), Some(ext_dir));
        assert_eq!(pool.browser_status(&browser.id).unwrap().extensions, vec!["adblock"]);

        let missing = pool
            .load_extension(&browser.id, dir.path().join("nope"))
            .await;
        assert!(matches!(missing, Err(OrchestratorError::ValidationFailure(_))));

        let metrics = pool.metrics();
        assert_eq!(metrics.extensions_loaded, 1);
        assert_eq!(metrics.extensions_failed, 1);
        assert_eq!(metrics.extension_success_rate, 50.0);
        // extension failures never touch tab or instance slots
        assert_eq!(pool.tab_gate.available(), 5);

        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_pool() {
        let pool = pool(2, 5);
        let cancel = CancellationToken::new();
        let browser = pool.launch_browser(&cancel, true).await.unwrap();
        pool.create_tab(&cancel, &browser.id, "about:blank").await.unwrap();

        pool.close().await.unwrap();
        pool.close().await.unwrap();

        let metrics = pool.metrics();
        assert_eq!(metrics.active_browsers, 0);
        assert_eq!(metrics.active_tabs, 0);
        assert!(pool.list_browsers().is_empty());

        let result = pool.launch_browser(&cancel, true).await;
        assert!(matches!(result, Err(OrchestratorError::ManagerClosed(_))));
    }

    #[tokio::test]
    async fn test_close_during_launch_tears_down_browser() {
        let discovering = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let launcher = FakeLauncher::held(Arc::clone(&discovering), Arc::clone(&release));
        let pool = Arc::new(BrowserPool::with_launcher(1, 5, launcher.clone()));

        let launching = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.launch_browser(&CancellationToken::new(), true).await })
        };

        // the launch holds its instance slot and waits on discovery
        discovering.notified().await;
        pool.close().await.unwrap();
        release.notify_one();

        let result = launching.await.unwrap();
        assert!(matches!(result, Err(OrchestratorError::ManagerClosed(_))));

        assert!(pool.list_browsers().is_empty());
        let metrics = pool.metrics();
        assert_eq!(metrics.active_browsers, 0);
        assert_eq!(metrics.successful_launches, 0);
        assert_eq!(metrics.failed_launches, 1);

        let pid = *launcher.last_pid.lock();
        let pid = pid.unwrap();
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[tokio::test]
    async fn test_chrome_launcher_discovers_endpoint() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Browser": "Chrome/120.0",
                "webSocketDebuggerUrl": "ws://127.0.0.1/devtools/browser/abc"
            })))
            .mount(&server)
            .await;

        let launcher = ChromeLauncher::new(None, Duration::from_secs(2));
        let endpoint = launcher
            .websocket_endpoint(server.address().port())
            .await
            .unwrap();
        assert_eq!(endpoint, "ws://127.0.0.1/devtools/browser/abc");
    }

    #[tokio::test]
    async fn test_chrome_launcher_discovery_timeout() {
        let launcher = ChromeLauncher::new(None, Duration::from_millis(300));
        let port = free_port().unwrap();

        let result = launcher.websocket_endpoint(port).await;
        assert!(matches!(result, Err(OrchestratorError::LaunchFailure { .. })));
    }
}

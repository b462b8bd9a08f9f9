//! Keys file watcher.
//!
//! Watches the directory holding a keys file and reports debounced changes to
//! that one file, so callers can reload the registry when keys are rotated.

use crate::error::RegistryResult;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Change to the watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Created or rewritten.
    Changed(PathBuf),
    /// Deleted or moved away.
    Removed(PathBuf),
}

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct KeysWatcherConfig {
    /// File to watch.
    pub path: PathBuf,
    /// Quiet period before an event is emitted, in milliseconds.
    pub debounce_ms: u64,
    /// Longest an event may be held back, in milliseconds.
    pub max_wait_ms: u64,
}

impl KeysWatcherConfig {
    /// Defaults for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            debounce_ms: 500,
            max_wait_ms: 5000,
        }
    }
}

/// Debounced watcher for a single keys file.
pub struct KeysWatcher {
    config: KeysWatcherConfig,
    watch_dir: PathBuf,
    watcher: RecommendedWatcher,
    events: DebouncedEvents,
}

impl KeysWatcher {
    /// Start watching `config.path`.
    pub fn start(config: KeysWatcherConfig) -> RegistryResult<Self> {
        let (tx, rx) = mpsc::channel(64);
        let watch_dir = config
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = config.path.file_name().map(OsString::from);
        let target = config.path.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if let Some(event) = classify_event(&event, file_name.as_deref(), &target) {
                        // The consumer only needs the latest change.
                        let _ = tx.try_send(event);
                    }
                }
                Err(e) => warn!("Keys watcher error: {}", e),
            }
        })?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        debug!("Watching {} for key changes", config.path.display());

        let events = DebouncedEvents::new(rx, config.debounce_ms, config.max_wait_ms);
        Ok(Self {
            config,
            watch_dir,
            watcher,
            events,
        })
    }

    /// Watched file.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Next debounced change; `None` once the watcher is gone.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.events.next().await
    }

    /// Stop watching.
    pub fn stop(&mut self) -> RegistryResult<()> {
        self.watcher.unwatch(&self.watch_dir)?;
        Ok(())
    }
}

fn classify_event(event: &Event, file_name: Option<&std::ffi::OsStr>, target: &Path) -> Option<WatchEvent> {
    let touches_target = event
        .paths
        .iter()
        .any(|path| path.file_name().is_some() && path.file_name() == file_name);
    if !touches_target {
        return None;
    }

    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => {
            if target.exists() {
                Some(WatchEvent::Changed(target.to_path_buf()))
            } else {
                Some(WatchEvent::Removed(target.to_path_buf()))
            }
        }
        EventKind::Remove(_) => Some(WatchEvent::Removed(target.to_path_buf())),
        _ => None,
    }
}

/// Collapses bursts of events into the last one.
struct DebouncedEvents {
    inner: mpsc::Receiver<WatchEvent>,
    debounce: Duration,
    max_wait: Duration,
}

impl DebouncedEvents {
    fn new(inner: mpsc::Receiver<WatchEvent>, debounce_ms: u64, max_wait_ms: u64) -> Self {
        Self {
            inner,
            debounce: Duration::from_millis(debounce_ms),
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }

    async fn next(&mut self) -> Option<WatchEvent> {
        let mut pending = self.inner.recv().await?;
        let first = Instant::now();

        loop {
            let remaining = self.max_wait.saturating_sub(first.elapsed());
            if remaining.is_zero() {
                return Some(pending);
            }

            tokio::select! {
                event = self.inner.recv() => match event {
                    Some(event) => pending = event,
                    None => return Some(pending),
                },
                _ = tokio::time::sleep(self.debounce.min(remaining)) => return Some(pending),
            }
        }
    }
}

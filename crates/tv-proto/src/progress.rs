use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

/// On-disk layout: two independent records in one JSON file — the per-media
/// resume offsets and the last selected channel index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedProgress {
    #[serde(default)]
    progress: HashMap<String, f64>,
    #[serde(default)]
    last_channel_index: Option<usize>,
}

/// Persistent map of media id → last known playback offset, plus the last
/// selected channel index.
///
/// Loaded once at startup; every mutation rewrites the whole file
/// synchronously.  Persistence is strictly best-effort: a malformed file
/// loads as empty, and write failures are logged and swallowed — losing a
/// resume position must never interrupt surfing.
pub struct ProgressStore {
    record: PersistedProgress,
    path: PathBuf,
}

impl ProgressStore {
    pub fn open(path: PathBuf) -> Self {
        let record = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("progress file {:?} is malformed ({}), starting empty", path, e);
                PersistedProgress::default()
            }),
            Err(_) => PersistedProgress::default(),
        };
        Self { record, path }
    }

    /// Resume offset for a media id.  0.0 means "start from the top" — used
    /// both for never-played and for previously-ran-to-completion.
    pub fn offset(&self, media: &str) -> f64 {
        self.record.progress.get(media).copied().unwrap_or(0.0)
    }

    pub fn set_offset(&mut self, media: &str, secs: f64) {
        self.record.progress.insert(media.to_string(), secs.max(0.0));
        self.save();
    }

    pub fn last_channel_index(&self) -> Option<usize> {
        self.record.last_channel_index
    }

    pub fn set_last_channel_index(&mut self, index: usize) {
        self.record.last_channel_index = Some(index);
        self.save();
    }

    fn save(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&self.record) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!("failed to write progress file {:?}: {}", self.path, e);
                }
            }
            Err(e) => warn!("failed to serialise progress record: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tv-progress-test-{}-{}.json",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let store = ProgressStore::open(temp_path("missing"));
        assert_eq!(store.offset("anything"), 0.0);
        assert_eq!(store.last_channel_index(), None);
    }

    #[test]
    fn test_malformed_file_loads_empty() {
        let path = temp_path("malformed");
        std::fs::write(&path, "{ this is not json").unwrap();
        let store = ProgressStore::open(path);
        assert_eq!(store.offset("x"), 0.0);
    }

    #[test]
    fn test_offsets_survive_reload() {
        let path = temp_path("reload");
        let mut store = ProgressStore::open(path.clone());
        store.set_offset("movie", 42.7);
        store.set_last_channel_index(2);
        drop(store);

        let store = ProgressStore::open(path);
        assert_eq!(store.offset("movie"), 42.7);
        assert_eq!(store.last_channel_index(), Some(2));
    }

    #[test]
    fn test_set_overwrites_and_clamps() {
        let path = temp_path("overwrite");
        let mut store = ProgressStore::open(path);
        store.set_offset("movie", 10.0);
        store.set_offset("movie", 0.0);
        assert_eq!(store.offset("movie"), 0.0);
        store.set_offset("movie", -5.0);
        assert_eq!(store.offset("movie"), 0.0);
    }
}

use anyhow::Context;
use chanorm_accelerate_api::{AccelError, AccelResult};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Tuning results keyed by launch configuration, optionally mirrored to
/// `<base>/tuning/<kernel>/<device_tag>.json`.
pub struct TuningStore<K, V> {
    cache: Mutex<HashMap<K, V>>,
    json_path: Option<PathBuf>,
}

impl<K, V> TuningStore<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Copy + Serialize + DeserializeOwned + PartialEq,
{
    pub fn in_memory() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            json_path: None,
        }
    }

    /// Opens the store for `device_tag`; existing results are loaded.
    pub fn persistent(base_dir: &Path, kernel: &str, device_tag: &str) -> Self {
        let mut path = base_dir.to_path_buf();
        path.push("tuning");
        path.push(kernel);
        path.push(format!("{}.json", file_safe(device_tag)));
        let store = Self {
            cache: Mutex::new(HashMap::new()),
            json_path: Some(path),
        };
        if let Err(err) = store.load_from_disk() {
            log::warn!("tuning cache not loaded: {err:#}");
        }
        store
    }

    pub fn json_path(&self) -> Option<&Path> {
        self.json_path.as_deref()
    }

    pub fn get(&self, key: &K) -> AccelResult<Option<V>> {
        Ok(self.entries()?.get(key).copied())
    }

    /// Stores `value`; the file is rewritten only when the entry changed.
    /// Disk failures are logged, the in-memory entry is kept.
    pub fn insert(&self, key: K, value: V) -> AccelResult<()> {
        let mut guard = self.entries()?;
        if guard.get(&key) == Some(&value) {
            return Ok(());
        }
        guard.insert(key, value);
        if let Err(err) = self.save_to_disk(&guard) {
            log::warn!("tuning cache not saved: {err:#}");
        }
        Ok(())
    }

    pub fn len(&self) -> AccelResult<usize> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> AccelResult<bool> {
        Ok(self.len()? == 0)
    }

    fn entries(&self) -> AccelResult<MutexGuard<'_, HashMap<K, V>>> {
        self.cache
            .lock()
            .map_err(|_| AccelError::Runtime(anyhow::anyhow!("tuning store lock poisoned")))
    }

    fn load_from_disk(&self) -> anyhow::Result<()> {
        let Some(path) = &self.json_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let entries: Vec<(K, V)> = match serde_json::from_str(&data) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("discarding malformed tuning cache {}: {err}", path.display());
                Vec::new()
            }
        };
        let mut guard = self.entries()?;
        guard.clear();
        guard.extend(entries);
        log::info!("loaded {} tuning entries from {}", guard.len(), path.display());
        Ok(())
    }

    fn save_to_disk(&self, guard: &HashMap<K, V>) -> anyhow::Result<()> {
        let Some(path) = &self.json_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let entries: Vec<(&K, &V)> = guard.iter().collect();
        let payload = serde_json::to_string_pretty(&entries)?;
        std::fs::write(path, payload).with_context(|| format!("writing {}", path.display()))?;
        log::info!("tuning cache saved to {}", path.display());
        Ok(())
    }
}

fn file_safe(tag: &str) -> String {
    tag.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

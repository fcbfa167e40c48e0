//! Viewer-side persistence.
//!
//! The engine remembers two things about the viewer: which source was last
//! chosen for a given movie (so the next resolution can prefer it) and the
//! per-movie playback choice blob (season, voice track, view positions).
//! Both sit behind the [`Storage`] trait so the host application can plug in
//! its own backing store; [`MemoryStorage`] is the default and what tests use.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Minimal key-value persistence contract. Values are JSON.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn remove(&self, key: &str);
}

/// In-process store. Contents are lost on shutdown.
#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<Value> {
        self.items.lock().expect("storage lock").get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.items
            .lock()
            .expect("storage lock")
            .insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.items.lock().expect("storage lock").remove(key);
    }
}

/// Playback choices remembered for one movie.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episodes_view: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movie_view: Option<Value>,
}

const CHOICE_KEY: &str = "online_choice";
const LAST_SOURCE_KEY: &str = "online_last_balanser";
const WATCHED_KEY: &str = "online_watched_last";
const DEFAULT_SOURCE_KEY: &str = "online_balanser";
const ACTIVE_SOURCE_KEY: &str = "online_balanser_active";

/// Typed facade over [`Storage`] for the keys the engine owns.
pub struct ChoiceStore<'a> {
    storage: &'a dyn Storage,
}

impl<'a> ChoiceStore<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    /// The source key the viewer last played this movie from, if any.
    pub fn last_source(&self, movie_id: &str) -> Option<String> {
        let map = self.storage.get(LAST_SOURCE_KEY)?;
        map.get(movie_id)?.as_str().map(str::to_string)
    }

    /// Record the source key chosen for a movie.
    pub fn set_last_source(&self, movie_id: &str, source_key: &str) {
        let mut map = self
            .storage
            .get(LAST_SOURCE_KEY)
            .unwrap_or_else(|| Value::Object(Default::default()));
        if !map.is_object() {
            warn!("Discarding malformed last-source record");
            map = Value::Object(Default::default());
        }
        if let Some(obj) = map.as_object_mut() {
            obj.insert(movie_id.to_string(), Value::String(source_key.to_string()));
        }
        self.storage.set(LAST_SOURCE_KEY, map);
    }

    /// The viewer's preferred source across all movies, if they set one.
    pub fn default_source(&self) -> Option<String> {
        self.storage
            .get(DEFAULT_SOURCE_KEY)?
            .as_str()
            .map(str::to_string)
    }

    pub fn set_default_source(&self, source_key: &str) {
        self.storage
            .set(DEFAULT_SOURCE_KEY, Value::String(source_key.to_string()));
    }

    /// The source currently driving playback.
    pub fn active_source(&self) -> Option<String> {
        self.storage
            .get(ACTIVE_SOURCE_KEY)?
            .as_str()
            .map(str::to_string)
    }

    pub fn set_active_source(&self, source_key: &str) {
        self.storage
            .set(ACTIVE_SOURCE_KEY, Value::String(source_key.to_string()));
    }

    /// The remembered playback choice for a movie. Malformed records are
    /// treated as absent.
    pub fn choice(&self, movie_id: &str) -> Choice {
        self.storage
            .get(CHOICE_KEY)
            .and_then(|map| map.get(movie_id).cloned())
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Merge updated fields into the remembered choice for a movie.
    pub fn save_choice(&self, movie_id: &str, choice: &Choice) {
        let mut map = self
            .storage
            .get(CHOICE_KEY)
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let (Some(obj), Ok(encoded)) = (map.as_object_mut(), serde_json::to_value(choice)) {
            obj.insert(movie_id.to_string(), encoded);
        }
        self.storage.set(CHOICE_KEY, map);
    }

    /// Drop the remembered choice for a movie.
    pub fn clear_choice(&self, movie_id: &str) {
        if let Some(mut map) = self.storage.get(CHOICE_KEY) {
            if let Some(obj) = map.as_object_mut() {
                obj.remove(movie_id);
            }
            self.storage.set(CHOICE_KEY, map);
        }
    }

    /// Append a watch-history marker, most recent first, deduplicated.
    pub fn push_watched(&self, movie_id: &str, marker: Value) {
        let mut list = self
            .storage
            .get(WATCHED_KEY)
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let Some(obj) = list.as_object_mut() {
            let entries = obj
                .entry(movie_id.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(arr) = entries.as_array_mut() {
                arr.retain(|e| *e != marker);
                arr.insert(0, marker);
            }
        }
        self.storage.set(WATCHED_KEY, list);
    }

    /// Watch-history markers for a movie, most recent first.
    pub fn watched(&self, movie_id: &str) -> Vec<Value> {
        self.storage
            .get(WATCHED_KEY)
            .and_then(|map| map.get(movie_id).cloned())
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_source_round_trips_per_movie() {
        let storage = MemoryStorage::new();
        let store = ChoiceStore::new(&storage);
        assert_eq!(store.last_source("42"), None);
        store.set_last_source("42", "rezka");
        store.set_last_source("7", "filmix");
        assert_eq!(store.last_source("42").as_deref(), Some("rezka"));
        assert_eq!(store.last_source("7").as_deref(), Some("filmix"));
    }

    #[test]
    fn choice_survives_save_and_clear() {
        let storage = MemoryStorage::new();
        let store = ChoiceStore::new(&storage);
        let choice = Choice {
            season: Some(2),
            voice_name: Some("dub".into()),
            ..Default::default()
        };
        store.save_choice("42", &choice);
        assert_eq!(store.choice("42"), choice);
        store.clear_choice("42");
        assert_eq!(store.choice("42"), Choice::default());
    }

    #[test]
    fn malformed_choice_record_reads_as_default() {
        let storage = MemoryStorage::new();
        storage.set("online_choice", json!({"42": [1, 2, 3]}));
        let store = ChoiceStore::new(&storage);
        assert_eq!(store.choice("42"), Choice::default());
    }

    #[test]
    fn watched_markers_dedupe_and_order_newest_first() {
        let storage = MemoryStorage::new();
        let store = ChoiceStore::new(&storage);
        store.push_watched("42", json!({"ep": 1}));
        store.push_watched("42", json!({"ep": 2}));
        store.push_watched("42", json!({"ep": 1}));
        assert_eq!(store.watched("42"), vec![json!({"ep": 1}), json!({"ep": 2})]);
    }
}

// Layered application settings
//
// Lookup order, highest precedence first:
//   changes layer -> default layers (last added first) -> built-in schema.
// Pending default sources are merged once, on first read.

pub mod cmdline;
pub mod schema;
pub mod sources;

pub use cmdline::parse_cmdline;
pub use schema::{canonical_key, strtobool, OptionType};
pub use sources::{is_public_setting, public_settings, DefaultsSource};

use crate::errors::ConfigError;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError, RwLock};
use tracing::{debug, instrument};

#[derive(Debug, Default)]
struct Layers {
    defaults: Vec<Map<String, Value>>,
    changes: Map<String, Value>,
}

/// Layered, lazily materialized configuration of one application
#[derive(Debug, Default)]
pub struct Settings {
    configured: AtomicBool,
    pending: Mutex<Vec<DefaultsSource>>,
    layers: RwLock<Layers>,
}

impl Settings {
    /// Create unconfigured settings with no pending sources
    pub fn new() -> Self {
        Self::default()
    }

    /// Create unconfigured settings whose changes layer is `changes`
    pub fn with_changes(changes: Map<String, Value>) -> Self {
        let settings = Self::new();
        settings.write_layers().changes = canonicalize(changes);
        settings
    }

    /// Create unconfigured settings with `sources` already queued
    pub fn with_sources(changes: Map<String, Value>, sources: Vec<DefaultsSource>) -> Self {
        let settings = Self::with_changes(changes);
        *settings.lock_pending() = sources;
        settings
    }

    /// Whether the pending default sources have been merged
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    /// Number of default sources waiting to be merged
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Add a default layer.
    ///
    /// Before configuration the source is queued. Afterwards it is evaluated
    /// right away and placed above every earlier default layer, still below
    /// the changes layer.
    pub fn add_defaults(&self, source: DefaultsSource) -> Result<(), ConfigError> {
        {
            let mut pending = self.lock_pending();
            if !self.is_configured() {
                debug!(source = ?source, "Queued default settings source");
                pending.push(source);
                return Ok(());
            }
        }

        let layer = canonicalize(source.materialize()?);
        debug!(keys = layer.len(), "Merged default settings layer");
        self.write_layers().defaults.push(layer);
        Ok(())
    }

    /// Merge every pending default source, exactly once.
    ///
    /// If any source fails nothing is merged and all sources stay pending,
    /// so the next read retries from the same state.
    #[instrument(skip(self))]
    pub fn ensure_configured(&self) -> Result<(), ConfigError> {
        if self.is_configured() {
            return Ok(());
        }

        let mut pending = self.lock_pending();
        if self.is_configured() {
            return Ok(());
        }

        let layers = pending
            .iter()
            .map(|source| source.materialize().map(canonicalize))
            .collect::<Result<Vec<_>, _>>()?;
        pending.clear();

        let count = layers.len();
        self.write_layers().defaults.extend(layers);
        self.configured.store(true, Ordering::Release);

        debug!(default_layers = count, "Settings configured");
        Ok(())
    }

    /// Read a setting from the merged view
    pub fn get(&self, key: &str) -> Result<Value, ConfigError> {
        self.ensure_configured()?;
        let key = canonical_key(key);
        let layers = self.read_layers();

        if let Some(value) = layers.changes.get(key) {
            return Ok(value.clone());
        }
        if let Some(value) = layers.defaults.iter().rev().find_map(|layer| layer.get(key)) {
            return Ok(value.clone());
        }
        schema::schema()
            .get(key)
            .map(|option| option.default.clone())
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
    }

    /// Whether the merged view defines `key`
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }

    /// Read a string setting; null reads as `None`
    pub fn get_str(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    /// Read a boolean setting; strings go through [`strtobool`]
    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        match self.get(key)? {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(b),
            Value::String(s) => strtobool(&s),
            Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            Value::Array(items) => Ok(!items.is_empty()),
            Value::Object(map) => Ok(!map.is_empty()),
        }
    }

    /// Read an unsigned integer setting; null reads as `None`
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.get(key)? {
            Value::Null => Ok(None),
            Value::Number(n) => n.as_u64().map(Some).ok_or_else(|| type_error(key, "an unsigned integer")),
            Value::String(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| type_error(key, "an unsigned integer")),
            _ => Err(type_error(key, "an unsigned integer")),
        }
    }

    /// Read a float setting; null reads as `None`
    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        match self.get(key)? {
            Value::Null => Ok(None),
            Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| type_error(key, "a number")),
            Value::String(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| type_error(key, "a number")),
            _ => Err(type_error(key, "a number")),
        }
    }

    /// Deserialize a setting into `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        serde_json::from_value(self.get(key)?).map_err(|e| {
            ConfigError::Configuration(format!("setting {} has an unexpected shape: {}", key, e))
        })
    }

    /// Set a single value in the changes layer
    pub fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        self.ensure_configured()?;
        self.write_layers()
            .changes
            .insert(canonical_key(key).to_string(), value);
        Ok(())
    }

    /// Merge `changes` into the changes layer
    pub fn update(&self, changes: Map<String, Value>) -> Result<(), ConfigError> {
        self.ensure_configured()?;
        let mut layers = self.write_layers();
        for (key, value) in changes {
            layers.changes.insert(canonical_key(&key).to_string(), value);
        }
        Ok(())
    }

    /// Copy of the changes layer
    pub fn changes(&self) -> Map<String, Value> {
        self.read_layers().changes.clone()
    }

    /// Copy of the merged default layers, in the order they were added
    pub fn defaults(&self) -> Vec<Map<String, Value>> {
        self.read_layers().defaults.clone()
    }

    /// Fully merged view of every layer
    pub fn merged(&self) -> Result<Map<String, Value>, ConfigError> {
        self.ensure_configured()?;
        let layers = self.read_layers();
        let mut merged = schema::default_values();
        for layer in &layers.defaults {
            merged.extend(layer.clone());
        }
        merged.extend(layers.changes.clone());
        Ok(merged)
    }

    /// Render the changes layer as `KEY: value` lines with secrets masked
    pub fn humanize(&self) -> String {
        let mut lines: Vec<String> = self
            .read_layers()
            .changes
            .iter()
            .map(|(key, value)| format!("{}: {}", key, masked(key, value)))
            .collect();
        lines.sort();
        lines.join("\n")
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<DefaultsSource>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_layers(&self) -> std::sync::RwLockReadGuard<'_, Layers> {
        self.layers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_layers(&self) -> std::sync::RwLockWriteGuard<'_, Layers> {
        self.layers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn canonicalize(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| (canonical_key(&key).to_string(), value))
        .collect()
}

fn type_error(key: &str, expected: &str) -> ConfigError {
    ConfigError::Configuration(format!("setting {} must be {}", key, expected))
}

fn hidden_settings() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)API|TOKEN|KEY|SECRET|PASS|SIGNATURE|DATABASE")
            .expect("Invalid regex pattern")
    })
}

fn masked(key: &str, value: &Value) -> String {
    if hidden_settings().is_match(key) {
        "********".to_string()
    } else {
        value.to_string()
    }
}

// Default-layer configuration sources

use crate::errors::ConfigError;
use config::{Config, Environment, File};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Lazily evaluated settings provider
pub type DeferredSource = Arc<dyn Fn() -> Result<Map<String, Value>, ConfigError> + Send + Sync>;

/// A default layer waiting to be merged into the settings.
///
/// Sources are evaluated in the order they were added, once, when the settings
/// are first read (or immediately when added to already configured settings).
#[derive(Clone)]
pub enum DefaultsSource {
    /// Literal mapping; only public settings are kept
    Dict(Map<String, Value>),
    /// Serialized configuration object; only public settings are kept
    Object(Value),
    /// Configuration file read through the `config` crate
    File(PathBuf),
    /// Environment variables with the given prefix
    Environment { prefix: String },
    /// Arbitrary provider
    Deferred(DeferredSource),
}

impl fmt::Debug for DefaultsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultsSource::Dict(map) => f.debug_tuple("Dict").field(map).finish(),
            DefaultsSource::Object(value) => f.debug_tuple("Object").field(value).finish(),
            DefaultsSource::File(path) => f.debug_tuple("File").field(path).finish(),
            DefaultsSource::Environment { prefix } => f
                .debug_struct("Environment")
                .field("prefix", prefix)
                .finish(),
            DefaultsSource::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl DefaultsSource {
    /// Capture a configuration object
    pub fn from_object<T: Serialize + ?Sized>(object: &T) -> Result<Self, ConfigError> {
        let value = serde_json::to_value(object).map_err(|e| {
            ConfigError::Configuration(format!("configuration object is not serializable: {}", e))
        })?;
        if !value.is_object() {
            return Err(ConfigError::Configuration(format!(
                "configuration object must serialize to a mapping, got {}",
                value
            )));
        }
        Ok(DefaultsSource::Object(value))
    }

    /// Wrap a closure returning a mapping
    pub fn deferred<F>(provider: F) -> Self
    where
        F: Fn() -> Result<Map<String, Value>, ConfigError> + Send + Sync + 'static,
    {
        DefaultsSource::Deferred(Arc::new(provider))
    }

    /// Evaluate the source into a mapping
    pub fn materialize(&self) -> Result<Map<String, Value>, ConfigError> {
        match self {
            DefaultsSource::Dict(map) => Ok(public_settings(map.clone())),
            DefaultsSource::Object(Value::Object(map)) => Ok(public_settings(map.clone())),
            DefaultsSource::Object(other) => Err(ConfigError::Configuration(format!(
                "configuration object must be a mapping, got {}",
                other
            ))),
            DefaultsSource::File(path) => {
                let map: Map<String, Value> = Config::builder()
                    .add_source(File::from(path.as_path()))
                    .build()?
                    .try_deserialize()?;
                Ok(upper_keys(map))
            }
            DefaultsSource::Environment { prefix } => {
                let map: Map<String, Value> = Config::builder()
                    .add_source(Environment::with_prefix(prefix).try_parsing(true))
                    .build()?
                    .try_deserialize()?;
                Ok(upper_keys(map))
            }
            DefaultsSource::Deferred(provider) => provider(),
        }
    }
}

impl From<Map<String, Value>> for DefaultsSource {
    fn from(map: Map<String, Value>) -> Self {
        DefaultsSource::Dict(map)
    }
}

/// True for names like `BROKER_URL`: upper-case and not underscore-prefixed
pub fn is_public_setting(key: &str) -> bool {
    !key.starts_with('_')
        && key.chars().any(char::is_alphabetic)
        && !key.chars().any(char::is_lowercase)
}

/// Keep only public settings from a mapping
pub fn public_settings(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .filter(|(key, _)| is_public_setting(key))
        .collect()
}

// The config crate lower-cases keys; settings names are upper-case.
fn upper_keys(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| (key.to_uppercase(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_public_setting_filter() {
        assert!(is_public_setting("FOO"));
        assert!(is_public_setting("BROKER_URL"));
        assert!(!is_public_setting("_FOO"));
        assert!(!is_public_setting("Foo"));
        assert!(!is_public_setting("foo"));
        assert!(!is_public_setting("__"));
    }

    #[test]
    fn test_object_source_keeps_public_settings() {
        let source =
            DefaultsSource::from_object(&json!({"FOO": 1, "bar": 2, "_BAZ": 3})).unwrap();
        let map = source.materialize().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("FOO"), Some(&json!(1)));
    }

    #[test]
    fn test_object_source_rejects_scalars() {
        assert!(DefaultsSource::from_object(&"not a mapping").is_err());
    }

    #[test]
    fn test_dict_source_keeps_public_settings() {
        let mut map = Map::new();
        map.insert("FOO".to_string(), json!(1));
        map.insert("lower_key".to_string(), json!(2));
        map.insert("_HIDDEN".to_string(), json!(3));
        let source = DefaultsSource::from(map);

        let merged = source.materialize().unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get("FOO"), Some(&json!(1)));
    }

    #[test]
    fn test_deferred_source() {
        let source = DefaultsSource::deferred(|| {
            let mut map = Map::new();
            map.insert("FOO".to_string(), json!(300));
            Ok(map)
        });
        assert_eq!(source.materialize().unwrap().get("FOO"), Some(&json!(300)));
        assert_eq!(format!("{:?}", source), "Deferred(..)");
    }

    #[test]
    fn test_file_source_upper_cases_keys() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "broker_url = \"memory://\"\nworker_concurrency = 3").unwrap();

        let source = DefaultsSource::File(file.path().to_path_buf());
        let map = source.materialize().unwrap();
        assert_eq!(map.get("BROKER_URL"), Some(&json!("memory://")));
        assert_eq!(map.get("WORKER_CONCURRENCY"), Some(&json!(3)));
    }

    #[test]
    fn test_missing_file_is_a_source_error() {
        let source = DefaultsSource::File(PathBuf::from("/nonexistent/relay-config.toml"));
        assert!(matches!(source.materialize(), Err(ConfigError::Source(_))));
    }

    #[test]
    fn test_environment_source() {
        std::env::set_var("RELAYSRCTEST_PREFETCH", "12");
        let source = DefaultsSource::Environment {
            prefix: "RELAYSRCTEST".to_string(),
        };
        let map = source.materialize().unwrap();
        assert_eq!(map.get("PREFETCH"), Some(&json!(12)));
    }
}

// Per-task routing table (RELAY_ROUTES)

use crate::broker::ExchangeKind;
use crate::errors::ConfigError;
use crate::settings::Settings;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Where messages for one task go
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub exchange_type: Option<ExchangeKind>,
    #[serde(default)]
    pub routing_key: Option<String>,
}

/// Routing table keyed by task name.
///
/// An entry is either a queue name or a mapping with any of `queue`,
/// `exchange`, `exchange_type` and `routing_key`.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        match settings.get("RELAY_ROUTES")? {
            Value::Null => Ok(Self::default()),
            Value::Object(entries) => entries
                .into_iter()
                .map(|(task, entry)| parse_route(&task, entry).map(|route| (task, route)))
                .collect::<Result<HashMap<_, _>, _>>()
                .map(|routes| Self { routes }),
            other => Err(ConfigError::Configuration(format!(
                "RELAY_ROUTES must be a mapping, got {}",
                other
            ))),
        }
    }

    pub fn route(&self, task: &str) -> Option<&Route> {
        self.routes.get(task)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn parse_route(task: &str, entry: Value) -> Result<Route, ConfigError> {
    match entry {
        Value::String(queue) => Ok(Route {
            queue: Some(queue),
            ..Route::default()
        }),
        other => serde_json::from_value(other).map_err(|e| {
            ConfigError::Configuration(format!("invalid route for task {}: {}", task, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routes_from_settings() {
        let settings = Settings::new();
        settings
            .set(
                "RELAY_ROUTES",
                json!({
                    "proj.add": "math",
                    "proj.mail": {"exchange": "mail", "exchange_type": "topic", "routing_key": "mail.send"}
                }),
            )
            .unwrap();

        let router = Router::from_settings(&settings).unwrap();
        assert_eq!(router.route("proj.add").unwrap().queue.as_deref(), Some("math"));
        let mail = router.route("proj.mail").unwrap();
        assert_eq!(mail.exchange_type, Some(ExchangeKind::Topic));
        assert_eq!(mail.routing_key.as_deref(), Some("mail.send"));
        assert!(router.route("proj.other").is_none());
    }

    #[test]
    fn test_empty_by_default() {
        assert!(Router::from_settings(&Settings::new()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_routes_rejected() {
        let settings = Settings::new();
        settings.set("RELAY_ROUTES", json!(["a"])).unwrap();
        assert!(Router::from_settings(&settings).is_err());

        settings.set("RELAY_ROUTES", json!({"t": 42})).unwrap();
        assert!(Router::from_settings(&settings).is_err());
    }
}

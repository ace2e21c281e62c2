// Built-in setting definitions, value types and legacy aliases

use crate::errors::ConfigError;
use base64::Engine;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Type of a built-in setting, used to convert untyped command-line values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    String,
    Int,
    Float,
    Bool,
    Dict,
    Tuple,
    Any,
}

impl OptionType {
    /// Convert a raw string into a value of this type
    pub fn parse(self, raw: &str) -> Result<Value, ConfigError> {
        match self {
            OptionType::String | OptionType::Any => Ok(Value::String(raw.to_string())),
            OptionType::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| ConfigError::Configuration(format!("{:?} is not an int: {}", raw, e))),
            OptionType::Float => {
                let parsed = raw.trim().parse::<f64>().map_err(|e| {
                    ConfigError::Configuration(format!("{:?} is not a float: {}", raw, e))
                })?;
                serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .ok_or_else(|| ConfigError::Configuration(format!("{:?} is not finite", raw)))
            }
            OptionType::Bool => strtobool(raw).map(Value::Bool),
            OptionType::Dict | OptionType::Tuple => parse_json(raw),
        }
    }

    /// Resolve a command-line type tag such as `int` or `dict`
    pub fn from_tag(tag: &str) -> Option<TypeTag> {
        let tag = match tag {
            "string" | "str" => TypeTag::Option(OptionType::String),
            "int" => TypeTag::Option(OptionType::Int),
            "float" => TypeTag::Option(OptionType::Float),
            "bool" => TypeTag::Option(OptionType::Bool),
            "any" => TypeTag::Option(OptionType::Any),
            "dict" | "tuple" | "list" | "json" => TypeTag::Json,
            "base64" => TypeTag::Base64,
            _ => return None,
        };
        Some(tag)
    }
}

/// A parsed command-line type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Option(OptionType),
    Json,
    Base64,
}

impl TypeTag {
    pub fn parse(self, raw: &str) -> Result<Value, ConfigError> {
        match self {
            TypeTag::Option(kind) => kind.parse(raw),
            TypeTag::Json => parse_json(raw),
            TypeTag::Base64 => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(raw.trim())
                    .map_err(|e| ConfigError::Configuration(format!("invalid base64: {}", e)))?;
                String::from_utf8(bytes)
                    .map(Value::String)
                    .map_err(|e| ConfigError::Configuration(format!("base64 value is not utf-8: {}", e)))
            }
        }
    }
}

fn parse_json(raw: &str) -> Result<Value, ConfigError> {
    serde_json::from_str(raw)
        .map_err(|e| ConfigError::Configuration(format!("invalid json {:?}: {}", raw, e)))
}

/// Convert a human boolean string into a bool
pub fn strtobool(raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        other => Err(ConfigError::Configuration(format!(
            "{:?} cannot be converted to a boolean",
            other
        ))),
    }
}

/// A built-in setting definition
#[derive(Debug, Clone)]
pub struct SchemaOption {
    pub default: Value,
    pub kind: OptionType,
}

/// Legacy setting names and the current names they read and write through
const ALIASES: &[(&str, &str)] = &[
    ("BROKER_BACKEND", "BROKER_TRANSPORT"),
    ("CARROT_BACKEND", "BROKER_TRANSPORT"),
    ("RELAY_BACKEND", "RELAY_RESULT_BACKEND"),
];

/// Map a setting name to the name its value is stored under
pub fn canonical_key(key: &str) -> &str {
    ALIASES
        .iter()
        .find(|(legacy, _)| *legacy == key)
        .map(|(_, current)| *current)
        .unwrap_or(key)
}

fn option(default: Value, kind: OptionType) -> SchemaOption {
    SchemaOption { default, kind }
}

/// All built-in settings keyed by their full upper-case name
pub fn schema() -> &'static BTreeMap<&'static str, SchemaOption> {
    static SCHEMA: OnceLock<BTreeMap<&'static str, SchemaOption>> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        use OptionType::*;
        BTreeMap::from([
            // Broker
            ("BROKER_URL", option(Value::Null, String)),
            ("BROKER_TRANSPORT", option(Value::Null, String)),
            ("BROKER_HOST", option(Value::Null, String)),
            ("BROKER_PORT", option(Value::Null, Int)),
            ("BROKER_USER", option(Value::Null, String)),
            ("BROKER_PASSWORD", option(Value::Null, String)),
            ("BROKER_VHOST", option(Value::Null, String)),
            ("BROKER_POOL_LIMIT", option(json!(10), Int)),
            ("BROKER_CONNECTION_TIMEOUT", option(json!(4.0), Float)),
            ("BROKER_TRANSPORT_OPTIONS", option(json!({}), Dict)),
            ("BROKER_USE_SSL", option(json!(false), Bool)),
            // Core
            ("RELAY_ALWAYS_EAGER", option(json!(false), Bool)),
            ("RELAY_EAGER_PROPAGATES_EXCEPTIONS", option(json!(false), Bool)),
            ("RELAY_RESULT_BACKEND", option(Value::Null, String)),
            ("RELAY_RESULT_ENGINE_OPTIONS", option(Value::Null, Dict)),
            ("RELAY_DEFAULT_QUEUE", option(json!("relay"), String)),
            ("RELAY_DEFAULT_EXCHANGE", option(json!("relay"), String)),
            ("RELAY_DEFAULT_EXCHANGE_TYPE", option(json!("direct"), String)),
            ("RELAY_DEFAULT_ROUTING_KEY", option(json!("relay"), String)),
            ("RELAY_DEFAULT_DELIVERY_MODE", option(json!(2), Int)),
            ("RELAY_CREATE_MISSING_QUEUES", option(json!(true), Bool)),
            ("RELAY_ROUTES", option(json!({}), Dict)),
            ("RELAY_SEND_TASK_SENT_EVENT", option(json!(false), Bool)),
            ("RELAY_TASK_SERIALIZER", option(json!("json"), String)),
            ("RELAY_ENABLE_UTC", option(json!(true), Bool)),
            ("RELAY_IMPORTS", option(json!([]), Tuple)),
            ("RELAY_INCLUDE", option(json!([]), Tuple)),
            ("RELAY_ANNOTATIONS", option(Value::Null, Any)),
            ("RELAY_FORCE_PROCESS_AWARE_LOGGING", option(json!(true), Bool)),
            // Worker
            ("WORKER_CONCURRENCY", option(json!(0), Int)),
            ("WORKER_PREFETCH_MULTIPLIER", option(json!(4), Int)),
            ("WORKER_MAX_TASKS_PER_CHILD", option(Value::Null, Int)),
            ("WORKER_HIJACK_ROOT_LOGGER", option(json!(true), Bool)),
            ("WORKER_LOG_LEVEL", option(json!("warn"), String)),
            // Mail
            ("ADMINS", option(json!([]), Tuple)),
            ("SERVER_EMAIL", option(json!("relay@localhost"), String)),
            ("EMAIL_HOST", option(json!("localhost"), String)),
            ("EMAIL_PORT", option(json!(25), Int)),
            ("EMAIL_HOST_USER", option(Value::Null, String)),
            ("EMAIL_HOST_PASSWORD", option(Value::Null, String)),
            ("EMAIL_TIMEOUT", option(json!(2), Float)),
            ("EMAIL_USE_SSL", option(json!(false), Bool)),
            ("EMAIL_USE_TLS", option(json!(false), Bool)),
        ])
    })
}

/// Built-in defaults as a plain mapping
pub fn default_values() -> Map<String, Value> {
    schema()
        .iter()
        .map(|(key, opt)| (key.to_string(), opt.default.clone()))
        .collect()
}

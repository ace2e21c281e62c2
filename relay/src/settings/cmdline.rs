// Command-line setting overrides: `ns.key=value`, `.key=value`, `(type)value`

use super::schema::{schema, OptionType};
use crate::errors::ConfigError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn type_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\((\w+)\)").expect("Invalid regex pattern"))
}

/// Parse command-line definitions into setting names and typed values.
///
/// `.key=value` expands to `NAMESPACE_KEY`; `ns.key=value` expands to
/// `NS_KEY`. A leading `(type)` tag forces the value type; untagged values
/// are converted with the built-in setting type when the key is known and
/// kept as strings otherwise.
pub fn parse_cmdline<S: AsRef<str>>(
    tokens: &[S],
    namespace: &str,
) -> Result<Map<String, Value>, ConfigError> {
    let namespace = namespace.to_uppercase().replace('.', "_");
    tokens
        .iter()
        .map(|token| parse_token(token.as_ref(), &namespace))
        .collect()
}

fn parse_token(token: &str, namespace: &str) -> Result<(String, Value), ConfigError> {
    let (key, raw) = token.split_once('=').ok_or_else(|| {
        ConfigError::Configuration(format!("{:?} is not of the form key=value", token))
    })?;
    let key = key.trim().to_uppercase().replace('.', "_");
    if key.is_empty() {
        return Err(ConfigError::Configuration(format!(
            "{:?} is missing a setting name",
            token
        )));
    }

    let name = match key.strip_prefix('_') {
        Some(rest) => join_name(namespace, rest),
        None => match key.split_once('_') {
            Some((ns, rest)) => join_name(ns, rest),
            None => key.clone(),
        },
    };

    let value = match type_tag_pattern().captures(raw) {
        Some(caps) => {
            let tag = &caps[1];
            let kind = OptionType::from_tag(tag).ok_or_else(|| {
                ConfigError::Configuration(format!("{:?}: unknown type tag ({})", name, tag))
            })?;
            kind.parse(&raw[caps[0].len()..])
        }
        None => match schema().get(name.as_str()) {
            Some(option) => option.kind.parse(raw),
            None => Ok(Value::String(raw.to_string())),
        },
    }
    .map_err(|e| ConfigError::Configuration(format!("{:?}: {}", name, e)))?;

    Ok((name, value))
}

fn join_name(namespace: &str, key: &str) -> String {
    if namespace.is_empty() {
        key.to_string()
    } else {
        format!("{}_{}", namespace, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespace_expansion() {
        let parsed = parse_cmdline(
            &[".always_eager=no", "worker.prefetch_multiplier=368"],
            "relay",
        )
        .unwrap();
        assert_eq!(parsed.get("RELAY_ALWAYS_EAGER"), Some(&json!(false)));
        assert_eq!(parsed.get("WORKER_PREFETCH_MULTIPLIER"), Some(&json!(368)));
    }

    #[test]
    fn test_type_tags() {
        let parsed = parse_cmdline(
            &[
                ".foobarstring=(string)300",
                ".foobarint=(int)300",
                r#".result_engine_options=(dict){"foo": "bar"}"#,
                ".ratio=(float)0.5",
                ".flag=(bool)yes",
                ".secret=(base64)aGVsbG8=",
                ".items=(list)[1, 2]",
            ],
            "relay",
        )
        .unwrap();
        assert_eq!(parsed.get("RELAY_FOOBARSTRING"), Some(&json!("300")));
        assert_eq!(parsed.get("RELAY_FOOBARINT"), Some(&json!(300)));
        assert_eq!(
            parsed.get("RELAY_RESULT_ENGINE_OPTIONS"),
            Some(&json!({"foo": "bar"}))
        );
        assert_eq!(parsed.get("RELAY_RATIO"), Some(&json!(0.5)));
        assert_eq!(parsed.get("RELAY_FLAG"), Some(&json!(true)));
        assert_eq!(parsed.get("RELAY_SECRET"), Some(&json!("hello")));
        assert_eq!(parsed.get("RELAY_ITEMS"), Some(&json!([1, 2])));
    }

    #[test]
    fn test_untagged_unknown_key_stays_string() {
        let parsed = parse_cmdline(&[".result_backend=/dev/null", ".custom=42"], "relay").unwrap();
        assert_eq!(parsed.get("RELAY_RESULT_BACKEND"), Some(&json!("/dev/null")));
        assert_eq!(parsed.get("RELAY_CUSTOM"), Some(&json!("42")));
    }

    #[test]
    fn test_dotted_namespace() {
        let parsed = parse_cmdline(&[".foo=bar"], "my.app").unwrap();
        assert_eq!(parsed.get("MY_APP_FOO"), Some(&json!("bar")));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let parsed = parse_cmdline(&[".broker_url=redis://h/0?a=b"], "relay").unwrap();
        assert_eq!(parsed.get("RELAY_BROKER_URL"), Some(&json!("redis://h/0?a=b")));
    }

    #[test]
    fn test_invalid_tag_is_configuration_error() {
        let result = parse_cmdline(&[".foo=(complex)1j"], "relay");
        assert!(matches!(result, Err(ConfigError::Configuration(_))));
    }

    #[test]
    fn test_invalid_typed_value_is_configuration_error() {
        let result = parse_cmdline(&[".foo=(int)abc"], "relay");
        assert!(matches!(result, Err(ConfigError::Configuration(_))));
        let result = parse_cmdline(&["worker.prefetch_multiplier=many"], "relay");
        assert!(matches!(result, Err(ConfigError::Configuration(_))));
    }

    #[test]
    fn test_missing_equals_sign() {
        assert!(parse_cmdline(&[".foo"], "relay").is_err());
    }
}

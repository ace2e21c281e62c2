// Property-based tests for layered settings and command-line overrides

use proptest::prelude::*;
use relay::settings::{parse_cmdline, strtobool, DefaultsSource, Settings};
use relay::ConfigError;
use serde_json::{json, Map, Value};

fn layer(key: &str, value: i64) -> DefaultsSource {
    let mut map = Map::new();
    map.insert(key.to_string(), json!(value));
    DefaultsSource::Dict(map)
}

// Layer precedence: changes > later default layer > earlier default layer > schema
proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn property_layer_precedence(
        defaults in prop::collection::vec(any::<i64>(), 1..6),
        change in prop::option::of(any::<i64>()),
    ) {
        let settings = Settings::new();
        for value in &defaults {
            settings.add_defaults(layer("PROP_KEY", *value)).unwrap();
        }
        if let Some(value) = change {
            settings.set("PROP_KEY", json!(value)).unwrap();
        }

        let expected = change.unwrap_or(*defaults.last().unwrap());
        prop_assert_eq!(settings.get("PROP_KEY").unwrap(), json!(expected));
    }

    #[test]
    fn property_late_defaults_shadow_earlier_ones(
        before in any::<i64>(),
        after in any::<i64>(),
    ) {
        let settings = Settings::new();
        settings.add_defaults(layer("PROP_LATE", before)).unwrap();
        prop_assert_eq!(settings.get("PROP_LATE").unwrap(), json!(before));
        prop_assert!(settings.is_configured());

        settings.add_defaults(layer("PROP_LATE", after)).unwrap();
        prop_assert!(settings.is_configured());
        prop_assert_eq!(settings.pending_count(), 0);
        prop_assert_eq!(settings.get("PROP_LATE").unwrap(), json!(after));
    }

    #[test]
    fn property_configure_once(layers in 0usize..5) {
        let settings = Settings::new();
        for i in 0..layers {
            settings.add_defaults(layer(&format!("PROP_ONCE_{}", i), i as i64)).unwrap();
        }
        prop_assert!(!settings.is_configured());
        prop_assert_eq!(settings.pending_count(), layers);

        let _ = settings.get("BROKER_POOL_LIMIT");
        prop_assert!(settings.is_configured());
        prop_assert_eq!(settings.pending_count(), 0);
    }

    #[test]
    fn property_cmdline_int_and_string_tags(n in any::<i64>()) {
        let parsed = parse_cmdline(
            &[format!(".propint=(int){}", n), format!(".propstr=(string){}", n)],
            "relay",
        )
        .unwrap();
        prop_assert_eq!(parsed.get("RELAY_PROPINT"), Some(&json!(n)));
        prop_assert_eq!(parsed.get("RELAY_PROPSTR"), Some(&Value::String(n.to_string())));
    }

    #[test]
    fn property_cmdline_json_tag(key in "[a-z]{1,8}", value in "[a-z0-9 ]{0,12}") {
        let mut expected = Map::new();
        expected.insert(key.clone(), json!(value));
        let raw = serde_json::to_string(&expected).unwrap();

        let parsed = parse_cmdline(&[format!(".options=(dict){}", raw)], "relay").unwrap();
        prop_assert_eq!(parsed.get("RELAY_OPTIONS"), Some(&Value::Object(expected)));
    }

    #[test]
    fn property_unknown_type_tag_rejected(tag in "[a-z]{3,8}") {
        prop_assume!(!["string", "str", "int", "float", "bool", "any", "dict", "tuple", "list", "json", "base64"]
            .contains(&tag.as_str()));
        let result = parse_cmdline(&[format!(".x=({})1", tag)], "relay");
        prop_assert!(matches!(result, Err(ConfigError::Configuration(_))));
    }

    #[test]
    fn property_strtobool_ignores_case(
        word in prop::sample::select(vec!["true", "yes", "1", "on", "false", "no", "0", "off"]),
        upper in any::<bool>(),
    ) {
        let raw = if upper { word.to_uppercase() } else { word.to_string() };
        let expected = matches!(word, "true" | "yes" | "1" | "on");
        prop_assert_eq!(strtobool(&raw).unwrap(), expected);
    }

    #[test]
    fn property_alias_symmetry(value in "[a-z]{1,10}", write_legacy in any::<bool>()) {
        let settings = Settings::new();
        let (written, read) = if write_legacy {
            ("BROKER_BACKEND", "BROKER_TRANSPORT")
        } else {
            ("BROKER_TRANSPORT", "CARROT_BACKEND")
        };
        settings.set(written, json!(value)).unwrap();
        prop_assert_eq!(settings.get(read).unwrap(), json!(value));
    }
}

#[test]
fn test_strtobool_rejects_unsure() {
    assert!(matches!(strtobool("unsure"), Err(ConfigError::Configuration(_))));
}

#[test]
fn test_unknown_key_is_not_found() {
    let settings = Settings::new();
    assert_eq!(
        settings.get("PROP_NEVER_SET").unwrap_err(),
        ConfigError::NotFound("PROP_NEVER_SET".to_string())
    );
}

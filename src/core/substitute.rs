//! `%key%` placeholder substitution in processor arguments.
//!
//! A string that is exactly one placeholder takes the referenced value with
//! its type intact. Placeholders embedded in longer text are replaced by the
//! value's plain rendering; lists and mappings cannot be embedded.

use super::types::{Environment, Value};
use indexmap::IndexMap;
use regex::Regex;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%(\w+)%").expect("valid regex"));

/// Substitute every placeholder in a step's arguments, recursively.
pub fn substitute_arguments(
    arguments: &IndexMap<String, Value>,
    env: &Environment,
) -> Result<IndexMap<String, Value>, String> {
    let mut out = IndexMap::with_capacity(arguments.len());
    for (key, value) in arguments {
        let resolved =
            substitute_value(value, env).map_err(|e| format!("argument '{}': {}", key, e))?;
        out.insert(key.clone(), resolved);
    }
    Ok(out)
}

/// Substitute placeholders inside a single value.
pub fn substitute_value(value: &Value, env: &Environment) -> Result<Value, String> {
    match value {
        Value::String(s) => substitute_str(s, env),
        Value::List(items) => items
            .iter()
            .map(|v| substitute_value(v, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Value::Map(map) => {
            let mut out = IndexMap::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_value(v, env)?);
            }
            Ok(Value::Map(out))
        }
        other => Ok(other.clone()),
    }
}

/// Keys referenced by placeholders in `s`, in order of appearance.
pub fn referenced_keys(s: &str) -> Vec<&str> {
    PLACEHOLDER
        .captures_iter(s)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

fn substitute_str(s: &str, env: &Environment) -> Result<Value, String> {
    if let Some(caps) = PLACEHOLDER.captures(s) {
        if let Some(whole) = caps.get(0) {
            if whole.start() == 0 && whole.end() == s.len() {
                let key = &caps[1];
                return env
                    .get(key)
                    .cloned()
                    .ok_or_else(|| format!("unresolved variable reference %{}%", key));
            }
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut result = String::with_capacity(s.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(s) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let key = key.as_str();
        let value = env
            .get(key)
            .ok_or_else(|| format!("unresolved variable reference %{}%", key))?;
        let text = value.scalar_string().ok_or_else(|| {
            format!(
                "cannot embed {} value of %{}% inside a string",
                value.type_name(),
                key
            )
        })?;
        result.push_str(&s[last..whole.start()]);
        result.push_str(&text);
        last = whole.end();
    }
    result.push_str(&s[last..]);
    Ok(Value::String(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn env() -> Environment {
        let mut env = Environment::new();
        env.insert("NAME", "Foo");
        env.insert("version", "1.2.3");
        env.insert("count", 3i64);
        env.insert("flags", Value::List(vec![Value::from("a"), Value::from("b")]));
        env
    }

    #[test]
    fn test_embedded_placeholders() {
        let out = substitute_value(&Value::from("%NAME%-%version%.pkg"), &env()).unwrap();
        assert_eq!(out, Value::from("Foo-1.2.3.pkg"));
    }

    #[test]
    fn test_undefined_key_fails() {
        let err = substitute_value(&Value::from("%MISSING%.pkg"), &env()).unwrap_err();
        assert!(err.contains("%MISSING%"));
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        assert_eq!(
            substitute_value(&Value::from("%count%"), &env()).unwrap(),
            Value::Integer(3)
        );
        assert_eq!(
            substitute_value(&Value::from("%flags%"), &env())
                .unwrap()
                .as_list()
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_embedded_list_rejected() {
        let err = substitute_value(&Value::from("x-%flags%"), &env()).unwrap_err();
        assert!(err.contains("list"));
    }

    #[test]
    fn test_embedded_integer_stringified() {
        assert_eq!(
            substitute_value(&Value::from("n=%count%"), &env()).unwrap(),
            Value::from("n=3")
        );
    }

    #[test]
    fn test_nested_structures() {
        let mut inner = IndexMap::new();
        inner.insert("path".to_string(), Value::from("/tmp/%NAME%"));
        let mut args = IndexMap::new();
        args.insert("request".to_string(), Value::Map(inner));
        args.insert(
            "list".to_string(),
            Value::List(vec![Value::from("%version%"), Value::Bool(true)]),
        );
        let out = substitute_arguments(&args, &env()).unwrap();
        assert_eq!(
            out["request"].as_map().unwrap()["path"],
            Value::from("/tmp/Foo")
        );
        assert_eq!(out["list"].as_list().unwrap()[0], Value::from("1.2.3"));
        assert_eq!(out["list"].as_list().unwrap()[1], Value::Bool(true));
    }

    #[test]
    fn test_argument_error_names_argument() {
        let mut args = IndexMap::new();
        args.insert("file_path".to_string(), Value::from("%NOPE%"));
        let err = substitute_arguments(&args, &env()).unwrap_err();
        assert!(err.contains("file_path"));
    }

    #[test]
    fn test_lone_percent_untouched() {
        assert_eq!(
            substitute_value(&Value::from("100% of %NAME%"), &env()).unwrap(),
            Value::from("100% of Foo")
        );
    }

    #[test]
    fn test_referenced_keys() {
        assert_eq!(referenced_keys("%a%/%b_c%.x"), vec!["a", "b_c"]);
        assert!(referenced_keys("plain").is_empty());
    }

    proptest! {
        #[test]
        fn prop_text_without_placeholders_unchanged(s in "[a-zA-Z0-9 ./_-]{0,40}") {
            let out = substitute_value(&Value::from(s.as_str()), &Environment::new()).unwrap();
            prop_assert_eq!(out, Value::from(s.as_str()));
        }

        #[test]
        fn prop_embedded_value_appears(key in "[A-Za-z][A-Za-z0-9_]{0,10}", val in "[a-z0-9.]{0,12}") {
            let mut env = Environment::new();
            env.insert(key.as_str(), val.as_str());
            let template = format!("pre-%{}%-post", key);
            let out = substitute_value(&Value::from(template.as_str()), &env).unwrap();
            prop_assert_eq!(out, Value::String(format!("pre-{}-post", val)));
        }
    }
}

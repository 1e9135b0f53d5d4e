// src/util.rs
//! Small helpers shared across the engine: id generation, string casing for
//! the `$stringify` pick option and `{{path}}` template rendering.

use serde_json::Value;
use uuid::Uuid;

use crate::document::get_dot_value;
use crate::error::{DbError, Result};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Random alphanumeric identifier of the requested length.
///
/// Draws entropy from v4 UUIDs, mapping each random byte onto the 62-character
/// alphabet. Used for `_id` generation and for hook round-trip probes.
pub fn uid(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        for byte in Uuid::new_v4().as_bytes() {
            if out.len() == len {
                break;
            }
            out.push(ALPHANUMERIC[*byte as usize % ALPHANUMERIC.len()] as char);
        }
    }
    out
}

/// Split an identifier into lowercase words on `_`, `-`, spaces, dots and
/// camel-case humps.
fn split_words(s: &str) -> Vec<String> {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in s.chars() {
        if matches!(ch, '_' | '-' | ' ' | '.') {
            if !current.is_empty() {
                words.push(current.to_lowercase());
                current = String::new();
            }
        } else if ch.is_uppercase() && !current.is_empty() {
            words.push(current.to_lowercase());
            current = ch.to_string();
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        words.push(current.to_lowercase());
    }
    words
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Re-case a string according to a named convention.
pub fn string_case(name: &str, s: &str) -> Result<String> {
    let words = split_words(s);
    let out = match name {
        "camelCase" => {
            let mut it = words.into_iter();
            let first = it.next().unwrap_or_default();
            first + &it.map(|w| capitalize(&w)).collect::<String>()
        }
        "PascalCase" | "pascalCase" => words.iter().map(|w| capitalize(w)).collect(),
        "snake_case" | "snakeCase" => words.join("_"),
        "kebab-case" | "kebabCase" => words.join("-"),
        "UPPERCASE" | "upperCase" => s.to_uppercase(),
        "lowercase" | "lowerCase" => s.to_lowercase(),
        "capitalize" => capitalize(s),
        other => {
            return Err(DbError::Aggregation(format!(
                "invalid stringCase {:?}",
                other
            )))
        }
    };
    Ok(out)
}

/// Render a value for string concatenation: null becomes empty, strings stay
/// bare, everything else uses its JSON form.
pub fn stringify_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a `{{path}}` template against a document.
///
/// Paths resolve first against `value` (the stage's scoped value), then fall
/// back to `doc`. The reserved paths `$doc` and `$val` name the whole document
/// and the scoped value. Missing paths render as the empty string.
pub fn render_template(template: &str, doc: &Value, value: &Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            DbError::Aggregation(format!("unterminated {{{{ in template {:?}", template))
        })?;
        let path = after[..end].trim();
        let resolved = match path {
            "$doc" => Some(doc.clone()),
            "$val" => Some(value.clone()),
            _ => get_dot_value(value, path).or_else(|| get_dot_value(doc, path)),
        };
        if let Some(v) = resolved {
            out.push_str(&stringify_scalar(&v));
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_uid_length_and_charset() {
        for len in [1, 8, 16, 30] {
            let id = uid(len);
            assert_eq!(id.len(), len);
            assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_uid_uniqueness() {
        let ids: HashSet<String> = (0..1000).map(|_| uid(16)).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_string_case_variants() {
        assert_eq!(string_case("camelCase", "hello_big world").unwrap(), "helloBigWorld");
        assert_eq!(string_case("PascalCase", "hello_world").unwrap(), "HelloWorld");
        assert_eq!(string_case("snake_case", "helloWorld").unwrap(), "hello_world");
        assert_eq!(string_case("kebab-case", "helloWorld").unwrap(), "hello-world");
        assert_eq!(string_case("UPPERCASE", "hello").unwrap(), "HELLO");
        assert_eq!(string_case("lowercase", "HeLLo").unwrap(), "hello");
        assert_eq!(string_case("capitalize", "hello world").unwrap(), "Hello world");
    }

    #[test]
    fn test_string_case_unknown() {
        assert!(string_case("shoutyCase", "x").is_err());
    }

    #[test]
    fn test_render_template() {
        let doc = json!({"name": "Antonio", "address": {"city": "Lisbon"}});
        let s = render_template("{{ name }} of {{address.city}}", &doc, &doc).unwrap();
        assert_eq!(s, "Antonio of Lisbon");
    }

    #[test]
    fn test_render_template_missing_is_empty() {
        let doc = json!({"a": 1});
        assert_eq!(render_template("x{{ b }}y", &doc, &doc).unwrap(), "xy");
    }

    #[test]
    fn test_render_template_unterminated() {
        let doc = json!({});
        assert!(render_template("{{ oops", &doc, &doc).is_err());
    }
}

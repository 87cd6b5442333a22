use crate::error::{ParamsError, ParamsResult};
use serde_json::{Map, Value};
use std::path::Path;

/// Interpret an override source.
///
/// Tried in order: a nested CSV string (`a.b=1,c='x'`), an inline YAML/JSON
/// mapping, and finally a path to a YAML, JSON or TOML file. An empty source
/// yields an empty mapping.
pub fn parse_override_source(source: &str) -> ParamsResult<Value> {
    let source = source.trim();
    if source.is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    if let Some(value) = parse_nested_csv(source) {
        return value;
    }

    if let Ok(value) = serde_yaml::from_str::<Value>(source) {
        if value.is_object() {
            return Ok(value);
        }
    }

    load_file(Path::new(source))
}

/// Load an override file, choosing the format by extension (YAML by default).
pub fn load_file(path: &Path) -> ParamsResult<Value> {
    if !path.is_file() {
        return Err(ParamsError::Source(format!(
            "not a mapping and not a readable file: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_lowercase);
    let value: Value = match ext.as_deref() {
        Some("json") => serde_json::from_str(&content)?,
        Some("toml") => toml::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };

    match value {
        Value::Object(_) => Ok(value),
        // An empty YAML document is an empty override.
        Value::Null => Ok(Value::Object(Map::new())),
        other => Err(ParamsError::Source(format!(
            "{} does not contain a mapping (found {})",
            path.display(),
            kind_name(&other)
        ))),
    }
}

/// Parse `a.b=1,c.d='x',e=[1,2]` into a nested mapping.
///
/// Returns `None` when the string is not in that form so the caller can try
/// the other interpretations. Values are typed as YAML scalars.
pub fn parse_nested_csv(source: &str) -> Option<ParamsResult<Value>> {
    let mut root = Map::new();

    for segment in split_top_level(source) {
        let (key, raw) = segment.split_once('=')?;
        let key = key.trim();
        if !is_dotted_key(key) {
            return None;
        }

        let raw = raw.trim();
        let value = if raw.is_empty() {
            Value::String(String::new())
        } else {
            match serde_yaml::from_str::<Value>(raw) {
                Ok(v) => v,
                Err(e) => return Some(Err(e.into())),
            }
        };

        if let Err(e) = insert_dotted(&mut root, key, value) {
            return Some(Err(e));
        }
    }

    Some(Ok(Value::Object(root)))
}

fn is_dotted_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !key.ends_with('.')
        && !key.contains("..")
}

fn insert_dotted(root: &mut Map<String, Value>, key: &str, value: Value) -> ParamsResult<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let leaf = parts.pop().unwrap_or(key);

    let mut node = root;
    for part in parts {
        let entry = node.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
        node = entry.as_object_mut().ok_or_else(|| {
            ParamsError::Source(format!("`{part}` is assigned both a value and nested keys in `{key}`"))
        })?;
    }
    node.insert(leaf.to_string(), value);
    Ok(())
}

// Split on commas that are not inside brackets or quotes.
fn split_top_level(source: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (idx, ch) in source.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, '[' | '{') => depth += 1,
            (None, ']' | '}') => depth -= 1,
            (None, ',') if depth == 0 => {
                segments.push(&source[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    segments.push(&source[start..]);
    segments.into_iter().filter(|s| !s.trim().is_empty()).collect()
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_nested_csv_types_values() {
        let value = parse_nested_csv("train.batch_size=8,eval.type='box',anchor.aspect_ratios=[1.0, 2.0],x=true")
            .unwrap()
            .unwrap();
        assert_eq!(
            value,
            json!({
                "train": {"batch_size": 8},
                "eval": {"type": "box"},
                "anchor": {"aspect_ratios": [1.0, 2.0]},
                "x": true,
            })
        );
    }

    #[test]
    fn test_nested_csv_rejects_non_csv() {
        assert!(parse_nested_csv("{train: {batch_size: 8}}").is_none());
        assert!(parse_nested_csv("configs/retinanet.yaml").is_none());
    }

    #[test]
    fn test_nested_csv_conflicting_keys() {
        let result = parse_nested_csv("a=1,a.b=2").unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_inline_yaml_and_json() {
        let v = parse_override_source("train: {batch_size: 4}").unwrap();
        assert_eq!(v, json!({"train": {"batch_size": 4}}));

        let v = parse_override_source(r#"{"eval": {"eval_samples": 10}}"#).unwrap();
        assert_eq!(v, json!({"eval": {"eval_samples": 10}}));

        assert_eq!(parse_override_source("  ").unwrap(), json!({}));
    }

    #[test]
    fn test_file_sources_by_extension() {
        let temp = TempDir::new().unwrap();

        let yaml = temp.path().join("override.yaml");
        std::fs::write(&yaml, "train:\n  total_steps: 10\n").unwrap();
        assert_eq!(
            parse_override_source(yaml.to_str().unwrap()).unwrap(),
            json!({"train": {"total_steps": 10}})
        );

        let toml_path = temp.path().join("override.toml");
        std::fs::write(&toml_path, "[train]\ntotal_steps = 12\n").unwrap();
        assert_eq!(load_file(&toml_path).unwrap(), json!({"train": {"total_steps": 12}}));

        let empty = temp.path().join("empty.yaml");
        std::fs::write(&empty, "").unwrap();
        assert_eq!(load_file(&empty).unwrap(), json!({}));
    }

    #[test]
    fn test_missing_file_is_source_error() {
        let err = parse_override_source("does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, ParamsError::Source(_)));
    }
}

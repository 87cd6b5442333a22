use crate::error::{ParamsError, ParamsResult};
use crate::restrictions::{lookup, Restriction};
use crate::source::parse_override_source;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// A nested parameter mapping with layered overrides.
///
/// Overrides are applied in caller order. A strict override rejects any key
/// the dictionary does not already have; a non-strict one inserts it. Once
/// [`ParamsDict::lock`] has been called every further override fails.
#[derive(Debug, Clone)]
pub struct ParamsDict {
    tree: Map<String, Value>,
    restrictions: Vec<Restriction>,
    locked: bool,
}

impl ParamsDict {
    /// Build from a default mapping and its restriction expressions.
    pub fn new(defaults: Value, restrictions: &[&str]) -> ParamsResult<Self> {
        let Value::Object(tree) = defaults else {
            return Err(ParamsError::Source("default parameters must be a mapping".to_string()));
        };
        let restrictions = restrictions
            .iter()
            .map(|r| r.parse::<Restriction>())
            .collect::<ParamsResult<Vec<_>>>()?;
        Ok(Self { tree, restrictions, locked: false })
    }

    /// Build from any serializable defaults struct.
    pub fn from_serializable<T: Serialize>(defaults: &T, restrictions: &[&str]) -> ParamsResult<Self> {
        Self::new(serde_json::to_value(defaults)?, restrictions)
    }

    pub fn override_params(&mut self, overrides: &Value, is_strict: bool) -> ParamsResult<()> {
        if self.locked {
            return Err(ParamsError::Locked);
        }
        let Value::Object(overrides) = overrides else {
            return Err(ParamsError::Source("override must be a mapping".to_string()));
        };

        // Merge into a copy so a rejected strict override leaves us untouched.
        let mut merged = self.tree.clone();
        merge_into(&mut merged, overrides, is_strict, "")?;
        self.tree = merged;
        Ok(())
    }

    /// Apply an override given as a string (nested CSV, inline YAML/JSON, or a
    /// file path). `None` and empty strings are a no-op.
    pub fn override_from_source(&mut self, source: Option<&str>, is_strict: bool) -> ParamsResult<()> {
        if self.locked {
            return Err(ParamsError::Locked);
        }
        let Some(source) = source.filter(|s| !s.trim().is_empty()) else {
            return Ok(());
        };
        let overrides = parse_override_source(source)?;
        tracing::debug!(source, strict = is_strict, "applying parameter override");
        self.override_params(&overrides, is_strict)
    }

    /// Check every restriction against the current tree.
    pub fn validate(&self) -> ParamsResult<()> {
        let tree = self.as_dict();
        for restriction in &self.restrictions {
            restriction.check(&tree)?;
        }
        Ok(())
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[must_use]
    pub fn restrictions(&self) -> &[Restriction] {
        &self.restrictions
    }

    #[must_use]
    pub fn as_dict(&self) -> Value {
        Value::Object(self.tree.clone())
    }

    /// Look up a dotted path, e.g. `train.batch_size`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let node = self.tree.get(head)?;
        match rest {
            Some(rest) => lookup(node, rest),
            None => Some(node),
        }
    }

    /// Deserialize the tree into a typed view.
    pub fn to_typed<T: DeserializeOwned>(&self) -> ParamsResult<T> {
        serde_json::from_value(self.as_dict())
            .map_err(|e| ParamsError::Validation(format!("parameters do not match the expected schema: {e}")))
    }

    pub fn to_yaml(&self) -> ParamsResult<String> {
        Ok(serde_yaml::to_string(&self.tree)?)
    }

    /// Multi-line rendering for logs.
    #[must_use]
    pub fn pretty(&self) -> String {
        serde_json::to_string_pretty(&self.tree).unwrap_or_else(|_| format!("{:?}", self.tree))
    }
}

fn merge_into(
    base: &mut Map<String, Value>,
    overrides: &Map<String, Value>,
    is_strict: bool,
    prefix: &str,
) -> ParamsResult<()> {
    for (key, value) in overrides {
        let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };

        match base.get_mut(key) {
            None if is_strict => return Err(ParamsError::UnknownKey { key: path }),
            None => {
                base.insert(key.clone(), value.clone());
            }
            Some(Value::Object(existing)) if value.is_object() => {
                if let Value::Object(nested) = value {
                    merge_into(existing, nested, is_strict, &path)?;
                }
            }
            Some(slot) => *slot = value.clone(),
        }
    }
    Ok(())
}

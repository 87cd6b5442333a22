use crate::error::{ParamsError, ParamsResult};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A cross-field rule of the form `<path> <op> <path>`, e.g.
/// `anchor.min_level == retinanet_head.min_level`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restriction {
    pub left: String,
    pub op: Comparison,
    pub right: String,
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.op.symbol(), self.right)
    }
}

impl FromStr for Restriction {
    type Err = ParamsError;

    fn from_str(s: &str) -> ParamsResult<Self> {
        // Two-character operators first so `<=` is not read as `<`.
        const OPS: [(&str, Comparison); 6] = [
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ];

        for (symbol, op) in OPS {
            if let Some((left, right)) = s.split_once(symbol) {
                let left = left.trim();
                let right = right.trim();
                if left.is_empty() || right.is_empty() {
                    break;
                }
                return Ok(Self { left: left.to_string(), op, right: right.to_string() });
            }
        }

        Err(ParamsError::Validation(format!("malformed restriction: `{s}`")))
    }
}

impl Restriction {
    /// Check the rule against a parameter tree.
    pub fn check(&self, tree: &Value) -> ParamsResult<()> {
        let left = lookup(tree, &self.left).ok_or_else(|| {
            ParamsError::Validation(format!("restriction `{self}`: `{}` not found", self.left))
        })?;
        let right = lookup(tree, &self.right).ok_or_else(|| {
            ParamsError::Validation(format!("restriction `{self}`: `{}` not found", self.right))
        })?;

        let holds = match self.op {
            Comparison::Eq => values_equal(left, right),
            Comparison::Ne => !values_equal(left, right),
            op => {
                let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                    return Err(ParamsError::Validation(format!(
                        "restriction `{self}`: ordering requires numeric values, got {left} and {right}"
                    )));
                };
                match op {
                    Comparison::Lt => l < r,
                    Comparison::Le => l <= r,
                    Comparison::Gt => l > r,
                    _ => l >= r,
                }
            }
        };

        if holds {
            Ok(())
        } else {
            Err(ParamsError::Validation(format!(
                "restriction `{self}` violated ({left} vs {right})"
            )))
        }
    }
}

/// Resolve a dotted path inside a nested mapping.
pub(crate) fn lookup<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(tree, |node, key| node.as_object()?.get(key))
}

// 1 and 1.0 compare equal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_restriction_operators() {
        let r: Restriction = "a.b <= c".parse().unwrap();
        assert_eq!(r.op, Comparison::Le);
        assert_eq!(r.left, "a.b");
        assert_eq!(r.right, "c");

        let r: Restriction = "x != y.z".parse().unwrap();
        assert_eq!(r.op, Comparison::Ne);

        assert!("no operator here".parse::<Restriction>().is_err());
        assert!("== b".parse::<Restriction>().is_err());
    }

    #[test]
    fn test_check_equality_across_int_and_float() {
        let tree = json!({"a": {"level": 3}, "b": {"level": 3.0}});
        let r: Restriction = "a.level == b.level".parse().unwrap();
        assert!(r.check(&tree).is_ok());
    }

    #[test]
    fn test_check_reports_violation_and_missing_path() {
        let tree = json!({"a": 1, "b": 2});
        assert!("a == b".parse::<Restriction>().unwrap().check(&tree).is_err());
        assert!("a < b".parse::<Restriction>().unwrap().check(&tree).is_ok());
        let err = "a == missing.key".parse::<Restriction>().unwrap().check(&tree).unwrap_err();
        assert!(err.to_string().contains("missing.key"));
    }

    #[test]
    fn test_ordering_rejects_non_numeric() {
        let tree = json!({"a": "x", "b": 2});
        assert!("a > b".parse::<Restriction>().unwrap().check(&tree).is_err());
    }
}

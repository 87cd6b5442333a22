//! Argus Params
//!
//! Nested hyper-parameter dictionaries for detection runs:
//! - Layered overrides, strict (unknown keys rejected) or non-strict
//! - Override sources: nested CSV strings, inline YAML/JSON, config files
//! - Cross-field restrictions checked at validation time
//! - Locking, after which the dictionary is read-only

pub mod dict;
pub mod error;
pub mod restrictions;
pub mod source;

pub use dict::ParamsDict;
pub use error::{ParamsError, ParamsResult};
pub use restrictions::{Comparison, Restriction};
pub use source::{load_file, parse_nested_csv, parse_override_source};

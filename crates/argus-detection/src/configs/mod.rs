//! Default parameters per model type and the locked, validated run config.

pub mod params;
pub mod retinanet;
pub mod shapemask;

pub use params::DetectionConfig;

use crate::error::{DetectionError, DetectionResult};
use argus_params::ParamsDict;

pub const SUPPORTED_MODELS: &[&str] = &["retinanet", "shapemask"];

/// Default parameter dictionary for `model`.
pub fn config_generator(model: &str) -> DetectionResult<ParamsDict> {
    let params = match model {
        "retinanet" => ParamsDict::from_serializable(&retinanet::retinanet_config(), retinanet::RETINANET_RESTRICTIONS)?,
        "shapemask" => {
            ParamsDict::from_serializable(&shapemask::shapemask_config(), &shapemask::shapemask_restrictions())?
        }
        other => {
            return Err(DetectionError::Config(format!(
                "model `{other}` is not supported (expected one of: {})",
                SUPPORTED_MODELS.join(", ")
            )));
        }
    };
    Ok(params)
}

/// Parameters after validation and locking.
///
/// Holds both the raw dictionary (for persisting alongside the run) and its
/// typed view. Nothing here can be mutated.
#[derive(Debug, Clone)]
pub struct LockedParams {
    dict: ParamsDict,
    config: DetectionConfig,
}

impl LockedParams {
    /// Validate `dict` (restrictions, schema, semantic checks) and lock it.
    pub fn lock(mut dict: ParamsDict) -> DetectionResult<Self> {
        dict.validate().map_err(|e| DetectionError::Validation(e.to_string()))?;
        let config: DetectionConfig = dict.to_typed().map_err(|e| DetectionError::Validation(e.to_string()))?;
        config.validate()?;
        dict.lock();
        Ok(Self { dict, config })
    }

    #[must_use]
    pub fn dict(&self) -> &ParamsDict {
        &self.dict
    }

    #[must_use]
    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_generator_defaults_validate() {
        for model in SUPPORTED_MODELS {
            let mut params = config_generator(model).unwrap();
            params.override_params(&json!({"model_dir": "/tmp/run"}), true).unwrap();
            let locked = LockedParams::lock(params).unwrap();
            assert_eq!(locked.config().model_type, *model);
            assert!(locked.dict().is_locked());
        }
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        assert!(matches!(config_generator("maskrcnn"), Err(DetectionError::Config(_))));
    }

    #[test]
    fn test_retinanet_has_no_shapemask_sections() {
        let params = config_generator("retinanet").unwrap();
        assert!(params.get("shapemask_head").is_none());
        let params = config_generator("shapemask").unwrap();
        assert_eq!(params.get("shapemask_head.mask_size"), Some(&json!(16)));
    }

    #[test]
    fn test_lock_requires_model_dir() {
        let params = config_generator("retinanet").unwrap();
        let err = LockedParams::lock(params).unwrap_err();
        assert!(matches!(err, DetectionError::Validation(msg) if msg.contains("model_dir")));
    }

    #[test]
    fn test_restriction_violation_is_validation_error() {
        let mut params = config_generator("retinanet").unwrap();
        params
            .override_params(&json!({"model_dir": "/tmp/run", "postprocess": {"num_classes": 3}}), true)
            .unwrap();
        assert!(matches!(LockedParams::lock(params), Err(DetectionError::Validation(_))));
    }

    #[test]
    fn test_anchor_mismatch_is_validation_error() {
        let mut params = config_generator("retinanet").unwrap();
        params
            .override_params(&json!({"model_dir": "/tmp/run", "anchor": {"aspect_ratios": [1.0]}}), true)
            .unwrap();
        assert!(matches!(LockedParams::lock(params), Err(DetectionError::Validation(_))));
    }
}

use crate::error::{DetectionError, DetectionResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Replicas a single host contributes before a strategy counts as multi-host.
pub const REPLICAS_PER_HOST: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    OneDevice,
    Mirrored,
    MultiWorkerMirrored,
    Tpu,
}

impl StrategyType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneDevice => "one_device",
            Self::Mirrored => "mirrored",
            Self::MultiWorkerMirrored => "multi_worker_mirrored",
            Self::Tpu => "tpu",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyType {
    type Err = DetectionError;

    fn from_str(s: &str) -> DetectionResult<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "one_device" => Ok(Self::OneDevice),
            "mirrored" => Ok(Self::Mirrored),
            "multi_worker_mirrored" => Ok(Self::MultiWorkerMirrored),
            "tpu" => Ok(Self::Tpu),
            _ => Err(DetectionError::Config(format!(
                "unknown strategy type `{s}` (expected one_device, mirrored, multi_worker_mirrored or tpu)"
            ))),
        }
    }
}

/// Strategy settings injected from the command line under `strategy_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub num_gpus: u32,
    #[serde(default)]
    pub all_reduce_alg: Option<String>,
    /// Comma-separated `host:port` list for multi-worker runs.
    #[serde(default)]
    pub worker_hosts: Option<String>,
    #[serde(default)]
    pub task_index: u32,
    #[serde(default)]
    pub tpu: Option<String>,
    #[serde(default = "default_tpu_cores")]
    pub tpu_cores: u32,
}

fn default_tpu_cores() -> u32 {
    REPLICAS_PER_HOST
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            num_gpus: 0,
            all_reduce_alg: None,
            worker_hosts: None,
            task_index: 0,
            tpu: None,
            tpu_cores: default_tpu_cores(),
        }
    }
}

impl StrategyConfig {
    #[must_use]
    pub fn worker_host_list(&self) -> Vec<String> {
        self.worker_hosts
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// A resolved distribution strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionStrategy {
    pub kind: StrategyType,
    pub num_replicas_in_sync: u32,
    pub num_input_pipelines: u32,
    pub input_pipeline_id: u32,
    pub all_reduce_alg: Option<String>,
}

impl DistributionStrategy {
    pub fn resolve(kind: StrategyType, config: &StrategyConfig) -> DetectionResult<Self> {
        let gpus = config.num_gpus.max(1);
        let (replicas, pipelines) = match kind {
            StrategyType::OneDevice => (1, 1),
            StrategyType::Mirrored => (gpus, 1),
            StrategyType::MultiWorkerMirrored => {
                let workers = (config.worker_host_list().len() as u32).max(1);
                if config.task_index >= workers {
                    return Err(DetectionError::Config(format!(
                        "task_index {} out of range for {} worker host(s)",
                        config.task_index, workers
                    )));
                }
                (workers * gpus, workers)
            }
            StrategyType::Tpu => {
                if config.tpu.as_deref().is_none_or(|t| t.trim().is_empty()) {
                    return Err(DetectionError::Config(
                        "tpu strategy requires a tpu address".to_string(),
                    ));
                }
                if config.tpu_cores == 0 {
                    return Err(DetectionError::Config("tpu_cores must be >= 1".to_string()));
                }
                (config.tpu_cores, config.tpu_cores.div_ceil(REPLICAS_PER_HOST))
            }
        };

        let input_pipeline_id = if kind == StrategyType::MultiWorkerMirrored { config.task_index } else { 0 };

        Ok(Self {
            kind,
            num_replicas_in_sync: replicas,
            num_input_pipelines: pipelines,
            input_pipeline_id,
            all_reduce_alg: config.all_reduce_alg.clone(),
        })
    }

    /// Hosts spanned by the strategy, assuming `REPLICAS_PER_HOST` replicas each.
    #[must_use]
    pub fn num_workers(&self) -> u32 {
        num_workers(self.num_replicas_in_sync)
    }

    #[must_use]
    pub fn is_multi_host(&self) -> bool {
        self.num_workers() > 1
    }
}

/// Integer ceiling of `replicas / REPLICAS_PER_HOST`.
#[must_use]
pub fn num_workers(num_replicas_in_sync: u32) -> u32 {
    num_replicas_in_sync.div_ceil(REPLICAS_PER_HOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strategy_type() {
        assert_eq!("Mirrored".parse::<StrategyType>().unwrap(), StrategyType::Mirrored);
        assert_eq!("multi-worker-mirrored".parse::<StrategyType>().unwrap(), StrategyType::MultiWorkerMirrored);
        assert!("parameter_server".parse::<StrategyType>().is_err());
    }

    #[test]
    fn test_num_workers_uses_integer_ceiling() {
        assert_eq!(num_workers(1), 1);
        assert_eq!(num_workers(2), 1);
        assert_eq!(num_workers(8), 1);
        assert_eq!(num_workers(9), 2);
        assert_eq!(num_workers(16), 2);
        assert_eq!(num_workers(17), 3);
    }

    #[test]
    fn test_mirrored_replicas_follow_gpu_count() {
        let config = StrategyConfig { num_gpus: 4, ..Default::default() };
        let strategy = DistributionStrategy::resolve(StrategyType::Mirrored, &config).unwrap();
        assert_eq!(strategy.num_replicas_in_sync, 4);
        assert!(!strategy.is_multi_host());

        let one = DistributionStrategy::resolve(StrategyType::Mirrored, &StrategyConfig::default()).unwrap();
        assert_eq!(one.num_replicas_in_sync, 1);
    }

    #[test]
    fn test_multi_worker_counts_hosts() {
        let config = StrategyConfig {
            num_gpus: 8,
            worker_hosts: Some("a:1, b:2".to_string()),
            task_index: 1,
            ..Default::default()
        };
        let strategy = DistributionStrategy::resolve(StrategyType::MultiWorkerMirrored, &config).unwrap();
        assert_eq!(strategy.num_replicas_in_sync, 16);
        assert_eq!(strategy.num_input_pipelines, 2);
        assert_eq!(strategy.input_pipeline_id, 1);
        assert!(strategy.is_multi_host());

        let bad = StrategyConfig { task_index: 2, ..config };
        assert!(DistributionStrategy::resolve(StrategyType::MultiWorkerMirrored, &bad).is_err());
    }

    #[test]
    fn test_tpu_requires_address() {
        assert!(DistributionStrategy::resolve(StrategyType::Tpu, &StrategyConfig::default()).is_err());

        let config = StrategyConfig { tpu: Some("grpc://10.0.0.2:8470".to_string()), tpu_cores: 32, ..Default::default() };
        let strategy = DistributionStrategy::resolve(StrategyType::Tpu, &config).unwrap();
        assert_eq!(strategy.num_replicas_in_sync, 32);
        assert_eq!(strategy.num_workers(), 4);
    }
}

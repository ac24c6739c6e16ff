use facesort_core::{default_data_dir, default_model_dir, Metric};
use facesort_store::DbScope;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Scan configuration.
///
/// Layered lowest to highest: built-in defaults, the TOML config file,
/// `FACESORT_*` environment variables, then whatever the caller (the CLI)
/// overrides on the loaded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Clustering threshold τ; a face joins a cluster only when closer than this.
    pub threshold: f32,
    pub metric: Metric,
    /// Detections below this confidence are dropped before clustering.
    pub min_confidence: f32,
    /// Number of detection worker threads.
    pub workers: usize,
    /// Image file extensions, matched case-insensitively.
    pub extensions: Vec<String>,
    pub db_scope: DbScope,
    /// Root for centrally placed databases.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4);
        Self {
            model_dir: default_model_dir(),
            threshold: 0.6,
            metric: Metric::Cosine,
            min_confidence: 0.5,
            workers,
            extensions: vec!["jpg".into(), "jpeg".into(), "png".into()],
            db_scope: DbScope::Folder,
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Defaults, then the config file, then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let mut config = match lookup("FACESORT_CONFIG") {
            // An explicitly named file must exist.
            Some(path) => Self::from_file(Path::new(&path))?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Overlay `FACESORT_*` variables resolved through `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACESORT_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FACESORT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        env_parse(&lookup, "FACESORT_THRESHOLD", &mut self.threshold);
        env_parse(&lookup, "FACESORT_METRIC", &mut self.metric);
        env_parse(&lookup, "FACESORT_MIN_CONFIDENCE", &mut self.min_confidence);
        env_parse(&lookup, "FACESORT_WORKERS", &mut self.workers);
        env_parse(&lookup, "FACESORT_DB_SCOPE", &mut self.db_scope);
        if let Some(list) = lookup("FACESORT_EXTENSIONS") {
            self.extensions = list
                .split(',')
                .map(|ext| ext.trim().trim_start_matches('.').to_string())
                .filter(|ext| !ext.is_empty())
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "threshold must be a positive number, got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.extensions.is_empty() {
            return Err(ConfigError::Invalid("extensions must not be empty".into()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .ok()?;
    Some(base.join("facesort").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.threshold, 0.6);
        assert_eq!(config.metric, Metric::Cosine);
        assert_eq!(config.min_confidence, 0.5);
        assert!((1..=4).contains(&config.workers));
        assert_eq!(config.extensions, ["jpg", "jpeg", "png"]);
        assert_eq!(config.db_scope, DbScope::Folder);
        config.validate().unwrap();
    }

    #[test]
    fn test_file_then_env_layering() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "threshold = 0.45\nmetric = \"euclidean\"\nworkers = 2\n").unwrap();

        let mut config = Config::from_file(&path).unwrap();
        assert_eq!(config.threshold, 0.45);
        assert_eq!(config.metric, Metric::Euclidean);
        // Unset keys keep their defaults.
        assert_eq!(config.min_confidence, 0.5);

        config.apply_env(env(&[
            ("FACESORT_WORKERS", "3"),
            ("FACESORT_DB_SCOPE", "central"),
            ("FACESORT_EXTENSIONS", "JPG, .webp"),
        ]));
        assert_eq!(config.threshold, 0.45);
        assert_eq!(config.workers, 3);
        assert_eq!(config.db_scope, DbScope::Central);
        assert_eq!(config.extensions, ["JPG", "webp"]);
    }

    #[test]
    fn test_bad_env_value_is_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("FACESORT_THRESHOLD", "lots"), ("FACESORT_METRIC", "manhattan")]));
        assert_eq!(config.threshold, 0.6);
        assert_eq!(config.metric, Metric::Cosine);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "treshold = 0.4\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let mut config = Config::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.threshold = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }
}

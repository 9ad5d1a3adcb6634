use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strata_log::{Level, LogConfig};
use strata_receiver::ReceiverConfig;
use strata_statsd::MetricsClientConfig;

/// Defines the source of a config error.
#[derive(Debug)]
enum ConfigErrorSource {
    /// An error occurring independently.
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: Some(Box::new(inner)),
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => write!(f, "{}", self.kind),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The number of receiver workers.
    pub workers: Option<String>,
    /// The log level.
    pub log_level: Option<String>,
    /// Hostname and port of the statsd server.
    pub statsd: Option<String>,
    /// "true" if the receiver's own statistics are fed back into the pipeline.
    pub report_stats: Option<String>,
}

/// Controls internal reporting to statsd.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`.
    statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to `"strata"`.
    prefix: String,
    /// Default tags to apply to all metrics.
    default_tags: BTreeMap<String, String>,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    ///
    /// Defaults to `1.0` (100%).
    sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "strata".into(),
            default_tags: BTreeMap::new(),
            sample_rate: 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ConfigValues {
    #[serde(default)]
    logging: LogConfig,
    #[serde(default)]
    metrics: Metrics,
    #[serde(default)]
    receiver: ReceiverConfig,
}

impl ConfigValues {
    /// The basename of the config file, including the file extension.
    const FILE_NAME: &'static str = "config.yml";

    /// Loads the config file from within the given directory, or defaults if there is none.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = base.join(Self::FILE_NAME);

        let f = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path));
            }
        };

        from_reader(io::BufReader::new(f)).map_err(|e| e.file(&path))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.receiver
            .validate()
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidValue))
    }
}

fn from_reader<T: DeserializeOwned>(reader: impl io::Read) -> Result<T, ConfigError> {
    serde_yaml::from_reader(reader).map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// A missing `config.yml` yields the default configuration.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let values = ConfigValues::load(&path)?;
        values.validate().map_err(|e| e.file(&path))?;

        Ok(Config { values, path })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        let values: ConfigValues = serde_json::from_value(value)
            .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?;
        values.validate()?;

        Ok(Config {
            values,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(workers) = overrides.workers {
            let receiver = &mut self.values.receiver;
            receiver.workers = workers
                .parse()
                .map_err(|err| ConfigError::for_field(err, "workers"))?;

            if receiver.workers == 0 {
                return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("workers"));
            }
        }

        if let Some(log_level) = overrides.log_level {
            self.values.logging.level =
                serde_json::from_value::<Level>(serde_json::Value::String(log_level))
                    .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        if let Some(statsd) = overrides.statsd {
            self.values.metrics.statsd = Some(statsd).filter(|s| !s.is_empty());
        }

        if let Some(report_stats) = overrides.report_stats {
            self.values.receiver.report_stats = report_stats
                .parse()
                .map_err(|err| ConfigError::for_field(err, "report_stats"))?;
        }

        Ok(self)
    }

    /// Serializes the current configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidValue))
    }

    /// Returns the path of the config folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the receiver configuration.
    pub fn receiver(&self) -> &ReceiverConfig {
        &self.values.receiver
    }

    /// Returns the address of the statsd server, if configured.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Return the prefix for statsd metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags for statsd metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the global sample rate for all metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }

    /// Returns the statsd client configuration, or `None` if no statsd server is configured.
    pub fn metrics_client_config(&self) -> Option<MetricsClientConfig<'_, &str>> {
        let host = self.statsd_addr()?;

        Some(MetricsClientConfig {
            prefix: self.metrics_prefix(),
            host,
            default_tags: self.metrics_default_tags().clone(),
            default_sample_rate: self.metrics_sample_rate().into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use strata_log::LogFormat;

    use super::*;

    fn write_config(yaml: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("config.yml")).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        dir
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_path(dir.path()).unwrap();

        assert_eq!(config.receiver(), &ReceiverConfig::default());
        assert_eq!(config.logging().level, Level::Info);
        assert_eq!(config.metrics_prefix(), "strata");
        assert!(config.metrics_client_config().is_none());
    }

    #[test]
    fn test_load_yaml() {
        let dir = write_config(
            r#"
logging:
  level: debug
  format: json
metrics:
  statsd: "127.0.0.1:8125"
  default_tags:
    region: eu
receiver:
  workers: 8
  max_cached_points: 64
  ds_rules:
    - pattern: "^cpu\\."
      spec:
        step: 60
        heartbeat: 600
"#,
        );

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.logging().level, Level::Debug);
        assert_eq!(config.logging().format, LogFormat::Json);
        assert_eq!(config.receiver().workers, 8);
        assert_eq!(config.receiver().max_cached_points, 64);
        assert_eq!(config.receiver().max_cache_duration, 5000);
        assert_eq!(config.receiver().ds_rules.len(), 1);

        let client = config.metrics_client_config().unwrap();
        assert_eq!(client.host, "127.0.0.1:8125");
        assert_eq!(client.default_tags["region"], "eu");
    }

    #[test]
    fn test_bad_yaml() {
        let dir = write_config("receiver: [");
        let error = Config::from_path(dir.path()).unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
        assert!(error.source().is_some());
        assert!(error.to_string().contains("config.yml"));
    }

    #[test]
    fn test_invalid_receiver() {
        let error = Config::from_json_value(serde_json::json!({
            "receiver": {"workers": 0},
        }))
        .unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        insta::assert_snapshot!(
            error.source().unwrap().to_string(),
            @"invalid configuration: workers must be positive"
        );
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::from_json_value(serde_json::json!({})).unwrap();

        config
            .apply_override(OverridableConfig {
                workers: Some("2".to_owned()),
                log_level: Some("trace".to_owned()),
                statsd: Some("localhost:8125".to_owned()),
                report_stats: Some("true".to_owned()),
            })
            .unwrap();

        assert_eq!(config.receiver().workers, 2);
        assert!(config.receiver().report_stats);
        assert_eq!(config.logging().level, Level::Trace);
        assert_eq!(config.statsd_addr(), Some("localhost:8125"));
    }

    #[test]
    fn test_invalid_overrides() {
        let mut config = Config::from_json_value(serde_json::json!({})).unwrap();

        let error = config
            .apply_override(OverridableConfig {
                workers: Some("many".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        insta::assert_snapshot!(error.to_string(), @"invalid config value (field workers)");

        let error = config
            .apply_override(OverridableConfig {
                workers: Some("0".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);

        let error = config
            .apply_override(OverridableConfig {
                log_level: Some("loud".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        insta::assert_snapshot!(error.to_string(), @"invalid config value (field log_level)");
    }
}

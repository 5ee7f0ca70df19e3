use std::{collections::HashSet, fs, time::Duration};

use log::{debug, trace, LevelFilter};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use validator::{Validate, ValidationError};

use crate::{
    config_error,
    core::{ErrorContext, PipelineResult},
};

static STAGE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

#[derive(Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_stage_names"))]
pub struct Config {
    #[validate(nested)]
    pub log: Option<Log>,

    #[serde(default)]
    #[validate(nested)]
    pub system: SystemConfig,

    #[validate(nested)]
    pub providers: Providers,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub layers: Vec<LayerConfig>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> PipelineResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .map_err(|e| config_error!("Unable to read conf file from {}: {}", path, e))?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> PipelineResult<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str)
            .map_err(|e| config_error!("Unable to parse yaml conf: {}", e))?;

        trace!("Loaded conf: {conf:?}");

        // use validator to validate conf file
        conf.validate()?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> PipelineResult<String> {
        serde_yaml::to_string(self).with_context("Unable to serialize conf")
    }

    // Submodule outputs are keyed "module.submodule", so module names must
    // be unique across the whole pipeline, not only within their layer.
    fn validate_stage_names(&self) -> Result<(), ValidationError> {
        let mut layers = HashSet::new();
        let mut modules = HashSet::new();

        for layer in &self.layers {
            if !layers.insert(layer.name.as_str()) {
                return Err(duplicate("duplicate_layer_name", &layer.name));
            }
            for module in &layer.modules {
                if !modules.insert(module.name.as_str()) {
                    return Err(duplicate("duplicate_module_name", &module.name));
                }
            }
        }

        Ok(())
    }
}

fn duplicate(code: &'static str, name: &str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.add_param("name".into(), &name.to_string());
    err
}

fn validate_stage_name(name: &str) -> Result<(), ValidationError> {
    if STAGE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        let mut err = ValidationError::new("invalid_stage_name");
        err.add_param("name".into(), &name.to_string());
        Err(err)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Log {
    #[validate(length(min = 1))]
    pub path: String,
    #[serde(default = "Log::default_level")]
    #[validate(custom(function = "Log::validate_level"))]
    pub level: String,
}

impl Log {
    fn default_level() -> String {
        "info".to_string()
    }

    fn validate_level(level: &str) -> Result<(), ValidationError> {
        level
            .parse::<LevelFilter>()
            .map(|_| ())
            .map_err(|_| ValidationError::new("invalid_log_level"))
    }

    pub fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::Info)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct SystemConfig {
    /// Capacity of the information-flow ring buffer
    #[serde(default = "SystemConfig::default_flow_capacity")]
    #[validate(range(min = 1))]
    pub flow_capacity: usize,

    /// Deadline applied to every request
    #[serde(default = "SystemConfig::default_request_timeout_secs")]
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,

    /// Capacity of the background persistence queue
    #[serde(default = "SystemConfig::default_persistence_queue")]
    #[validate(range(min = 1))]
    pub persistence_queue: usize,

    /// Store each query and response as episodic memories
    #[serde(default = "default_enabled")]
    pub persist_results: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            flow_capacity: Self::default_flow_capacity(),
            request_timeout_secs: Self::default_request_timeout_secs(),
            persistence_queue: Self::default_persistence_queue(),
            persist_results: true,
        }
    }
}

impl SystemConfig {
    fn default_flow_capacity() -> usize {
        1000
    }

    fn default_request_timeout_secs() -> u64 {
        120
    }

    fn default_persistence_queue() -> usize {
        256
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Providers {
    #[validate(nested)]
    pub llm: ProviderConfig,
    #[validate(nested)]
    pub memory: Option<ProviderConfig>,
}

/// Backend selection and connection settings for one provider
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ProviderConfig {
    #[validate(length(min = 1))]
    pub provider: String,
    #[serde(default)]
    pub model_name: String,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f64>,
    #[validate(range(min = 1))]
    pub max_tokens: Option<u32>,
    #[validate(range(min = 1))]
    pub timeout_seconds: Option<u64>,
}

impl ProviderConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_name: String::new(),
            api_base: None,
            api_key: None,
            temperature: None,
            max_tokens: None,
            timeout_seconds: None,
        }
    }

    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "LayerConfig::validate_unique_modules"))]
pub struct LayerConfig {
    #[validate(custom(function = "validate_stage_name"))]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "LayerConfig::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub config: YamlValue,
    #[serde(default)]
    #[validate(nested)]
    pub modules: Vec<ModuleConfig>,
}

impl LayerConfig {
    fn default_kind() -> String {
        "sequential".to_string()
    }

    fn validate_unique_modules(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for module in &self.modules {
            if !seen.insert(module.name.as_str()) {
                return Err(duplicate("duplicate_module_name", &module.name));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "ModuleConfig::validate_unique_submodules"))]
pub struct ModuleConfig {
    #[validate(custom(function = "validate_stage_name"))]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    #[validate(nested)]
    pub submodules: Vec<SubModuleConfig>,
}

impl ModuleConfig {
    fn validate_unique_submodules(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for submodule in &self.submodules {
            if !seen.insert(submodule.name.as_str()) {
                return Err(duplicate("duplicate_submodule_name", &submodule.name));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct SubModuleConfig {
    #[validate(custom(function = "validate_stage_name"))]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: String,
    #[serde(default)]
    pub config: YamlValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineError;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    const PIPELINE: &str = r#"
---
log:
  path: /tmp/tierflow/tierflow.log
  level: debug

system:
  flow_capacity: 50
  request_timeout_secs: 30

providers:
  llm:
    provider: echo
    model_name: echo-1
    temperature: 0.7
  memory:
    provider: in_memory

layers:
  - name: perception
    modules:
      - name: context
        parallel: true
        submodules:
          - name: query
            kind: passthrough
          - name: history
            kind: memory_search
            config:
              limit: 5
  - name: response
    kind: respond
    config:
      system_prompt: "Answer briefly."
"#;

    fn expect_invalid(conf_str: &str) {
        match Config::from_yaml(conf_str) {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => {
                eprintln!("Error: {e}");
                assert!(matches!(
                    e,
                    PipelineError::Validation(_) | PipelineError::Configuration(_)
                ));
            }
        }
    }

    #[test]
    fn test_load_pipeline() {
        init_log();
        let conf = Config::from_yaml(PIPELINE).unwrap();

        assert_eq!(conf.system.flow_capacity, 50);
        assert_eq!(conf.system.persistence_queue, 256);
        assert!(conf.system.persist_results);
        assert_eq!(conf.providers.llm.provider, "echo");
        assert_eq!(conf.layers.len(), 2);
        assert_eq!(conf.layers[0].kind, "sequential");
        assert!(conf.layers[0].modules[0].parallel);
        assert_eq!(conf.layers[0].modules[0].submodules.len(), 2);
        assert!(conf.layers[1].enabled);
        assert_eq!(conf.log.as_ref().unwrap().level_filter(), LevelFilter::Debug);
        print!("{}", conf.to_yaml().unwrap());
    }

    #[test]
    fn test_valid_layers_length() {
        init_log();
        expect_invalid(
            r#"
providers:
  llm:
    provider: echo
layers: []
"#,
        );
    }

    #[test]
    fn test_valid_stage_name_without_dot() {
        init_log();
        expect_invalid(
            r#"
providers:
  llm:
    provider: echo
layers:
  - name: bad.name
"#,
        );
    }

    #[test]
    fn test_valid_duplicate_sibling_names() {
        init_log();
        expect_invalid(
            r#"
providers:
  llm:
    provider: echo
layers:
  - name: one
    modules:
      - name: m
        submodules:
          - name: a
            kind: passthrough
          - name: a
            kind: chat
"#,
        );
        expect_invalid(
            r#"
providers:
  llm:
    provider: echo
layers:
  - name: one
  - name: one
"#,
        );
    }

    #[test]
    fn test_valid_module_names_across_layers() {
        init_log();
        expect_invalid(
            r#"
providers:
  llm:
    provider: echo
layers:
  - name: one
    modules:
      - name: shared
  - name: two
    modules:
      - name: shared
"#,
        );
    }

    #[test]
    fn test_valid_provider_ranges() {
        init_log();
        expect_invalid(
            r#"
providers:
  llm:
    provider: echo
    temperature: 3.5
layers:
  - name: one
"#,
        );
        expect_invalid(
            r#"
providers:
  llm:
    provider: echo
    timeout_seconds: 0
layers:
  - name: one
"#,
        );
    }

    #[test]
    fn test_valid_flow_capacity() {
        init_log();
        expect_invalid(
            r#"
system:
  flow_capacity: 0
providers:
  llm:
    provider: echo
layers:
  - name: one
"#,
        );
    }

    #[test]
    fn test_unparsable_yaml() {
        init_log();
        let err = Config::from_yaml("layers: [").unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}

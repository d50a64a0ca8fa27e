use eyre::{Context, Result};
use rlm_engine::ipc::IpcServerConfig;
use rlm_engine::llm::{AnthropicConfig, RetryPolicy};
use rlm_engine::query::QueryConfig;
use rlm_engine::sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub query: QueryConfig,
    pub sandbox: SandboxConfig,
    pub ipc: IpcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_url: String,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let defaults = AnthropicConfig::default();
        Self {
            api_url: defaults.api_url,
            timeout_ms: defaults.timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter_ms: policy.jitter.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> Result<RetryPolicy> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            eyre::bail!("retry.multiplier must be a finite number >= 1, got {}", self.multiplier);
        }
        Ok(RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            ..RetryPolicy::default()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub max_frame_length: usize,
    pub read_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        let defaults = IpcServerConfig::default();
        Self {
            max_frame_length: defaults.max_frame_length,
            read_timeout_ms: defaults.read_timeout.as_millis() as u64,
        }
    }
}

impl IpcConfig {
    pub fn server_config(&self) -> IpcServerConfig {
        IpcServerConfig::default()
            .with_max_frame_length(self.max_frame_length)
            .with_read_timeout(Duration::from_millis(self.read_timeout_ms))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            query: QueryConfig::default(),
            sandbox: SandboxConfig::default(),
            ipc: IpcConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Root-model client settings; the root model and token limit live under `query`
    pub fn anthropic_config(&self) -> AnthropicConfig {
        AnthropicConfig {
            model: self.query.root_model.clone(),
            max_tokens: self.query.root_max_tokens,
            timeout: Duration::from_millis(self.llm.timeout_ms),
            api_url: self.llm.api_url.clone(),
        }
    }
}

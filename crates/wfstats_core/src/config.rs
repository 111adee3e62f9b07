use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::client::{
    ClientConfig, DEFAULT_API_URL, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_CAP_MS,
    DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS, DEFAULT_SEARCH_LIMIT, DEFAULT_TIMEOUT_MS,
    DEFAULT_USELANG, DEFAULT_USER_AGENT, RetryPolicy,
};
use crate::download::DEFAULT_DUMP_BASE_URL;
use crate::dump::ConvertOptions;
use crate::entity_map::{DEFAULT_PROGRESS_INTERVAL, MapOptions};
use crate::pipeline::PipelineOptions;

pub const DEFAULT_CONFIG_FILE: &str = "wfstats.toml";
pub const DEFAULT_OUTPUT_PREFIX: &str = "output/wikitable-z8-stats";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_MIN_MAP_ENTRIES: usize = 1;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StatsConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub dump: DumpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ApiSection {
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub uselang: Option<String>,
    pub concurrency: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<usize>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub search_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PipelineSection {
    pub progress_interval: Option<usize>,
    pub min_map_entries: Option<usize>,
    pub max_functions: Option<usize>,
    pub check_connectivity: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct OutputSection {
    pub prefix: Option<String>,
    pub status_map: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DumpSection {
    pub base_url: Option<String>,
    pub data_dir: Option<String>,
    pub output_dir: Option<String>,
    pub strict: Option<bool>,
}

/// Everything a run needs, with every layer applied.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub client: ClientConfig,
    pub pipeline: PipelineOptions,
    pub output_prefix: PathBuf,
    pub status_map: Option<PathBuf>,
    pub dump_base_url: String,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub convert: ConvertOptions,
}

impl ResolvedConfig {
    /// `key = value` lines for display.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        let retry = self.client.retry;
        vec![
            ("api.url", self.client.api_url.clone()),
            ("api.user_agent", self.client.user_agent.clone()),
            ("api.uselang", self.client.uselang.clone()),
            ("api.concurrency", self.client.concurrency.to_string()),
            ("api.timeout_ms", self.client.timeout_ms.to_string()),
            ("api.max_attempts", retry.max_attempts.to_string()),
            ("api.backoff_base_ms", retry.base_delay_ms.to_string()),
            ("api.backoff_cap_ms", retry.cap_delay_ms.to_string()),
            ("api.search_limit", self.client.search_limit.to_string()),
            (
                "pipeline.progress_interval",
                self.pipeline.map.progress_interval.to_string(),
            ),
            (
                "pipeline.min_map_entries",
                self.pipeline.map.min_entries.to_string(),
            ),
            (
                "pipeline.max_functions",
                self.pipeline
                    .max_functions
                    .map_or_else(|| "unlimited".to_string(), |limit| limit.to_string()),
            ),
            (
                "pipeline.check_connectivity",
                self.pipeline.check_connectivity.to_string(),
            ),
            ("output.prefix", self.output_prefix.display().to_string()),
            (
                "output.status_map",
                self.status_map
                    .as_ref()
                    .map_or_else(|| "(none)".to_string(), |path| path.display().to_string()),
            ),
            ("dump.base_url", self.dump_base_url.clone()),
            ("dump.data_dir", self.data_dir.display().to_string()),
            ("dump.output_dir", self.output_dir.display().to_string()),
            ("dump.strict", self.convert.strict.to_string()),
        ]
    }
}

impl StatsConfig {
    /// Resolve against the process environment: env > config > default.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        self.resolve_with(|key| env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<ResolvedConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvLayer { lookup: &lookup };
        let api = &self.api;
        let pipeline = &self.pipeline;

        let concurrency = env
            .parsed("WF_CONCURRENCY")?
            .or(api.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            bail!("api.concurrency must be at least 1");
        }
        let max_attempts = env
            .parsed("WF_HTTP_MAX_ATTEMPTS")?
            .or(api.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            bail!("api.max_attempts must be at least 1");
        }
        let base_delay_ms = env
            .parsed("WF_HTTP_BACKOFF_BASE_MS")?
            .or(api.backoff_base_ms)
            .unwrap_or(DEFAULT_BACKOFF_BASE_MS);
        let cap_delay_ms = env
            .parsed("WF_HTTP_BACKOFF_CAP_MS")?
            .or(api.backoff_cap_ms)
            .unwrap_or(DEFAULT_BACKOFF_CAP_MS);
        if cap_delay_ms < base_delay_ms {
            bail!("api.backoff_cap_ms ({cap_delay_ms}) is below api.backoff_base_ms ({base_delay_ms})");
        }

        let client = ClientConfig {
            api_url: env
                .string("WF_API_URL")
                .or_else(|| api.url.clone())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            user_agent: env
                .string("WF_USER_AGENT")
                .or_else(|| api.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            uselang: env
                .string("WF_USELANG")
                .or_else(|| api.uselang.clone())
                .unwrap_or_else(|| DEFAULT_USELANG.to_string()),
            concurrency,
            timeout_ms: env
                .parsed("WF_HTTP_TIMEOUT_MS")?
                .or(api.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            retry: RetryPolicy {
                max_attempts,
                base_delay_ms,
                cap_delay_ms,
            },
            search_limit: env
                .parsed("WF_SEARCH_LIMIT")?
                .or(api.search_limit)
                .unwrap_or(DEFAULT_SEARCH_LIMIT),
        };

        let progress_interval = env
            .parsed("WF_PROGRESS_INTERVAL")?
            .or(pipeline.progress_interval)
            .unwrap_or(DEFAULT_PROGRESS_INTERVAL)
            .max(1);
        let pipeline_options = PipelineOptions {
            map: MapOptions {
                progress_interval,
                min_entries: env
                    .parsed("WF_MIN_MAP_ENTRIES")?
                    .or(pipeline.min_map_entries)
                    .unwrap_or(DEFAULT_MIN_MAP_ENTRIES),
            },
            max_functions: env
                .parsed("WF_MAX_FUNCTIONS")?
                .or(pipeline.max_functions)
                .filter(|limit| *limit > 0),
            check_connectivity: env
                .flag("WF_CHECK_CONNECTIVITY")?
                .or(pipeline.check_connectivity)
                .unwrap_or(false),
        };

        Ok(ResolvedConfig {
            client,
            pipeline: pipeline_options,
            output_prefix: PathBuf::from(
                env.string("WF_OUTPUT_PREFIX")
                    .or_else(|| self.output.prefix.clone())
                    .unwrap_or_else(|| DEFAULT_OUTPUT_PREFIX.to_string()),
            ),
            status_map: self.output.status_map.as_ref().map(PathBuf::from),
            dump_base_url: env
                .string("WF_DUMP_BASE_URL")
                .or_else(|| self.dump.base_url.clone())
                .unwrap_or_else(|| DEFAULT_DUMP_BASE_URL.to_string()),
            data_dir: PathBuf::from(
                self.dump
                    .data_dir
                    .as_deref()
                    .unwrap_or(DEFAULT_DATA_DIR),
            ),
            output_dir: PathBuf::from(
                self.dump
                    .output_dir
                    .as_deref()
                    .unwrap_or(DEFAULT_OUTPUT_DIR),
            ),
            convert: ConvertOptions {
                progress_interval,
                strict: env
                    .flag("WF_DUMP_STRICT")?
                    .or(self.dump.strict)
                    .unwrap_or(false),
            },
        })
    }
}

struct EnvLayer<'a, F> {
    lookup: &'a F,
}

impl<F> EnvLayer<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value of `key`.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        match raw.parse::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(error) => bail!("invalid value for {key}: `{raw}` ({error})"),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => bail!("invalid value for {key}: `{raw}` (expected true/false)"),
        }
    }
}

/// Load and parse a StatsConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<StatsConfig> {
    if !config_path.exists() {
        return Ok(StatsConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: StatsConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

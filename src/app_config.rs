//! File configuration for CLI defaults.
//!
//! The file is a flat `key = value` list (a TOML subset): integers, booleans
//! and double-quoted strings, `#` comments. CLI flags override every value.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

const APP_DIR: &str = "manuscript-downloader";

/// Values read from `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Directory new documents are written to.
    pub output_dir: Option<PathBuf>,
    /// Default output format label (`pdf` or `cbz`).
    pub format: Option<String>,
    /// Pages fetched concurrently per job.
    pub concurrency: Option<usize>,
    /// Simultaneous requests to one host.
    pub per_host_limit: Option<usize>,
    /// Attempts per page including the first.
    pub max_attempts: Option<u32>,
    /// Minimum spacing between requests to one host, in milliseconds.
    pub rate_limit_ms: Option<u64>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Per-request timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Job state database path.
    pub state_db: Option<PathBuf>,
    /// Directory holding downloaded page bytes.
    pub work_dir: Option<PathBuf>,
    /// Reuse cached manifests.
    pub manifest_cache: Option<bool>,
}

impl FileConfig {
    /// Validates ranges.
    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.concurrency
            && !(1..=manuscript_core::config::MAX_CONCURRENCY).contains(&concurrency)
        {
            bail!("Invalid config value for `concurrency`: {concurrency}. Expected range: 1..=32");
        }
        if let Some(limit) = self.per_host_limit
            && !(1..=64).contains(&limit)
        {
            bail!("Invalid config value for `per_host_limit`: {limit}. Expected range: 1..=64");
        }
        if let Some(attempts) = self.max_attempts
            && !(1..=10).contains(&attempts)
        {
            bail!("Invalid config value for `max_attempts`: {attempts}. Expected range: 1..=10");
        }
        if let Some(rate_limit) = self.rate_limit_ms
            && rate_limit > 60_000
        {
            bail!("Invalid config value for `rate_limit_ms`: {rate_limit}. Expected range: 0..=60000");
        }
        if let Some(format) = &self.format
            && manuscript_core::OutputFormat::parse(format).is_none()
        {
            bail!("Invalid config value for `format`: '{format}'. Expected one of: pdf, cbz");
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Resolves the config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/manuscript-downloader/config.toml`
/// 2. `$HOME/.config/manuscript-downloader/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join(APP_DIR).join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"),
    )
}

/// Directory for the state database and page store when nothing is
/// configured: `$XDG_DATA_HOME/manuscript-downloader`, then
/// `$HOME/.local/share/manuscript-downloader`, then `./.manuscript-downloader`.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    if let Some(xdg) = env_var_non_empty_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join(APP_DIR);
    }
    match env_var_non_empty_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local").join("share").join(APP_DIR),
        None => PathBuf::from(".").join(".manuscript-downloader"),
    }
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the default config file, or defaults when it does not exist.
pub fn load_default_file_config() -> Result<FileConfig> {
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path),
        _ => Ok(FileConfig::default()),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "output_dir" => cfg.output_dir = Some(parse_string_literal(value).with_context(invalid)?.into()),
            "format" => cfg.format = Some(parse_string_literal(value).with_context(invalid)?),
            "state_db" => cfg.state_db = Some(parse_string_literal(value).with_context(invalid)?.into()),
            "work_dir" => cfg.work_dir = Some(parse_string_literal(value).with_context(invalid)?.into()),
            "concurrency" => {
                cfg.concurrency = Some(usize::try_from(parse_integer_u64(value).with_context(invalid)?)?);
            }
            "per_host_limit" => {
                cfg.per_host_limit = Some(usize::try_from(parse_integer_u64(value).with_context(invalid)?)?);
            }
            "max_attempts" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                cfg.max_attempts = Some(
                    u32::try_from(parsed)
                        .map_err(|_| anyhow::anyhow!("max_attempts out of range for u32"))
                        .with_context(invalid)?,
                );
            }
            "rate_limit_ms" => cfg.rate_limit_ms = Some(parse_integer_u64(value).with_context(invalid)?),
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "manifest_cache" => cfg.manifest_cache = Some(parse_boolean(value).with_context(invalid)?),
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

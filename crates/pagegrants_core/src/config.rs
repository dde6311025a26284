use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SETTINGS_FILENAME: &str = "pagegrants.toml";
pub const DEFAULT_USER_AGENT: &str = "pagegrants/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRIES: usize = 2;
pub const DEFAULT_WRITE_RETRIES: usize = 1;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const API_ROOT_SUFFIX: &str = "@api/deki";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    File,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::File => "file",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SettingsFile {
    #[serde(default)]
    pub site: SiteSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

/// Values given on the command line; these win over everything else.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub site: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_root: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub site: String,
    pub client: ClientSettings,
    pub site_source: ValueSource,
    pub username_source: ValueSource,
    pub password_source: ValueSource,
    pub user_agent_source: ValueSource,
    pub timeout_source: ValueSource,
}

impl ResolvedSettings {
    pub fn diagnostics(&self) -> String {
        format!(
            "site={} ({})\napi_root={}\nusername={} ({})\npassword=<redacted> ({})\nuser_agent={} ({})\ntimeout_ms={} ({})\nretries={}\nwrite_retries={}\nretry_delay_ms={}",
            self.site,
            self.site_source.as_str(),
            self.client.api_root,
            self.client.username,
            self.username_source.as_str(),
            self.password_source.as_str(),
            self.client.user_agent,
            self.user_agent_source.as_str(),
            self.client.timeout_ms,
            self.timeout_source.as_str(),
            self.client.max_retries,
            self.client.max_write_retries,
            self.client.retry_delay_ms,
        )
    }
}

/// Load and parse the TOML settings file. Returns default if file doesn't exist.
pub fn load_settings(settings_path: &Path) -> Result<SettingsFile> {
    if !settings_path.exists() {
        return Ok(SettingsFile::default());
    }
    let content = fs::read_to_string(settings_path)
        .with_context(|| format!("failed to read {}", settings_path.display()))?;
    let parsed: SettingsFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", settings_path.display()))?;
    Ok(parsed)
}

/// Resolve settings against the process environment: flag > env > file > default.
pub fn resolve_settings(
    file: &SettingsFile,
    overrides: &SettingsOverrides,
) -> Result<ResolvedSettings> {
    resolve_settings_with_env(file, overrides, |key| env::var(key).ok())
}

pub fn resolve_settings_with_env<F>(
    file: &SettingsFile,
    overrides: &SettingsOverrides,
    lookup: F,
) -> Result<ResolvedSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let env_value = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let (site, site_source) = pick(
        overrides.site.as_deref(),
        env_value("PAGEGRANTS_SITE"),
        file.site.url.as_deref(),
    )
    .ok_or_else(|| anyhow::anyhow!("no site was specified"))?;
    let (username, username_source) = pick(
        overrides.username.as_deref(),
        env_value("PAGEGRANTS_USERNAME"),
        file.site.username.as_deref(),
    )
    .ok_or_else(|| anyhow::anyhow!("no username was specified"))?;
    let (password, password_source) = pick(
        overrides.password.as_deref(),
        env_value("PAGEGRANTS_PASSWORD"),
        file.site.password.as_deref(),
    )
    .ok_or_else(|| anyhow::anyhow!("no password was specified"))?;

    let site = normalize_site(&site)?;
    let (user_agent, user_agent_source) = layered(
        env_value("PAGEGRANTS_USER_AGENT"),
        non_blank(file.site.user_agent.as_deref()),
        DEFAULT_USER_AGENT.to_string(),
    );
    let (timeout_ms, timeout_source) = layered(
        parse_env_number("PAGEGRANTS_HTTP_TIMEOUT_MS", &env_value)?,
        file.site.timeout_ms,
        DEFAULT_TIMEOUT_MS,
    );
    let max_retries = parse_env_number("PAGEGRANTS_HTTP_RETRIES", &env_value)?
        .or(file.site.retries)
        .unwrap_or(DEFAULT_RETRIES);
    let retry_delay_ms = parse_env_number("PAGEGRANTS_HTTP_RETRY_DELAY_MS", &env_value)?
        .or(file.site.retry_delay_ms)
        .unwrap_or(DEFAULT_RETRY_DELAY_MS);

    Ok(ResolvedSettings {
        client: ClientSettings {
            api_root: api_root(&site),
            username,
            password,
            user_agent,
            timeout_ms,
            max_retries,
            max_write_retries: DEFAULT_WRITE_RETRIES.min(max_retries),
            retry_delay_ms,
        },
        site,
        site_source,
        username_source,
        password_source,
        user_agent_source,
        timeout_source,
    })
}

/// Prefix a bare host with `http://` and drop trailing slashes.
pub fn normalize_site(site: &str) -> Result<String> {
    let trimmed = site.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        bail!("no site was specified");
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("http://{trimmed}"))
    }
}

pub fn api_root(site: &str) -> String {
    format!("{}/{API_ROOT_SUFFIX}", site.trim_end_matches('/'))
}

fn pick(
    flag: Option<&str>,
    env: Option<String>,
    file: Option<&str>,
) -> Option<(String, ValueSource)> {
    if let Some(value) = flag.map(str::trim).filter(|value| !value.is_empty()) {
        return Some((value.to_string(), ValueSource::Flag));
    }
    if let Some(value) = env {
        return Some((value, ValueSource::Env));
    }
    file.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| (value.to_string(), ValueSource::File))
}

fn layered<T>(env: Option<T>, file: Option<T>, default: T) -> (T, ValueSource) {
    match (env, file) {
        (Some(value), _) => (value, ValueSource::Env),
        (None, Some(value)) => (value, ValueSource::File),
        (None, None) => (default, ValueSource::Default),
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn parse_env_number<T, F>(key: &str, env_value: &F) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match env_value(key) {
        None => Ok(None),
        Some(raw) => match raw.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => bail!("{key} must be a non-negative integer, got `{raw}`"),
        },
    }
}

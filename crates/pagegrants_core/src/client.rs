use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode, Url};

use crate::config::ClientSettings;
use crate::manifest::CascadeMode;

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";
const ERROR_EXCERPT_CHARS: usize = 200;

/// Remote operations needed to update page security.
pub trait SecurityApi {
    fn check_status(&mut self) -> Result<()>;
    fn get_page_security(&mut self, page_path: &str) -> Result<String>;
    fn post_page_security(
        &mut self,
        page_path: &str,
        cascade: CascadeMode,
        document: &str,
    ) -> Result<()>;
    fn put_page_security(
        &mut self,
        page_path: &str,
        cascade: CascadeMode,
        document: &str,
    ) -> Result<()>;
    fn request_count(&self) -> usize;
}

pub struct DekiClient {
    client: Client,
    settings: ClientSettings,
    request_count: usize,
}

impl DekiClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .user_agent(settings.user_agent.clone())
            .build()
            .context("failed to build Deki HTTP client")?;

        Ok(Self {
            client,
            settings,
            request_count: 0,
        })
    }

    fn send(
        &mut self,
        method: Method,
        url: Url,
        cascade: Option<CascadeMode>,
        body: Option<&str>,
    ) -> Result<String> {
        let is_write = body.is_some();
        let max_retries = if is_write {
            self.settings.max_write_retries
        } else {
            self.settings.max_retries
        };

        for attempt in 0..=max_retries {
            self.request_count += 1;
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .basic_auth(&self.settings.username, Some(&self.settings.password));
            if let Some(cascade) = cascade {
                request = request.query(&[("cascade", cascade.as_str())]);
            }
            if let Some(body) = body {
                request = request
                    .header(CONTENT_TYPE, XML_CONTENT_TYPE)
                    .body(body.to_string());
            }

            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .text()
                            .context("failed to read Deki API response body");
                    }
                    if attempt < max_retries && is_retryable_status(status) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    let excerpt = response
                        .text()
                        .map(|text| excerpt(&text))
                        .unwrap_or_default();
                    bail!(
                        "Deki API {method} {} failed with HTTP {status}{}",
                        url.path(),
                        if excerpt.is_empty() {
                            String::new()
                        } else {
                            format!(": {excerpt}")
                        }
                    );
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context(format!("failed to call Deki API {}", url.path()));
                }
            }
        }

        bail!("Deki API request exhausted retry budget")
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .settings
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        if base == 0 {
            return;
        }
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        let delay = base.saturating_mul(multiplier).saturating_add(jitter);
        tracing::debug!(attempt, delay_ms = delay, "retrying Deki API request");
        sleep(Duration::from_millis(delay));
    }
}

impl SecurityApi for DekiClient {
    fn check_status(&mut self) -> Result<()> {
        let url = api_url(&self.settings.api_root, "site/status")?;
        self.send(Method::GET, url, None, None).map(|_| ())
    }

    fn get_page_security(&mut self, page_path: &str) -> Result<String> {
        let url = page_security_url(&self.settings.api_root, page_path)?;
        self.send(Method::GET, url, None, None)
    }

    fn post_page_security(
        &mut self,
        page_path: &str,
        cascade: CascadeMode,
        document: &str,
    ) -> Result<()> {
        let url = page_security_url(&self.settings.api_root, page_path)?;
        self.send(Method::POST, url, Some(cascade), Some(document))
            .map(|_| ())
    }

    fn put_page_security(
        &mut self,
        page_path: &str,
        cascade: CascadeMode,
        document: &str,
    ) -> Result<()> {
        let url = page_security_url(&self.settings.api_root, page_path)?;
        self.send(Method::PUT, url, Some(cascade), Some(document))
            .map(|_| ())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

pub fn page_security_url(api_root: &str, page_path: &str) -> Result<Url> {
    api_url(
        api_root,
        &format!("pages/={}/security", encode_page_path(page_path)),
    )
}

/// Page paths travel as a single URI segment encoded twice, so `/` reaches the
/// server as `%252F`.
pub fn encode_page_path(page_path: &str) -> String {
    encode_segment(&encode_segment(page_path))
}

fn api_url(api_root: &str, relative: &str) -> Result<Url> {
    let raw = format!("{}/{relative}", api_root.trim_end_matches('/'));
    Url::parse(&raw).with_context(|| format!("invalid Deki API URL: {raw}"))
}

fn encode_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"-_.~!$'()*,;:@".contains(&byte) {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn excerpt(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= ERROR_EXCERPT_CHARS {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(ERROR_EXCERPT_CHARS).collect();
    out.push_str("...");
    out
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

//! Shared HTTP plumbing for the remote collaborators.
//!
//! Each remote store (ledger, results, jobs) reuses:
//! - `RemoteClient`: blocking HTTP client with retry / backoff / error
//!   classification and bearer auth
//! - `resolve_token`: flag > env > error
//!
//! # Error classification
//!
//! | Status            | Result                         |
//! |-------------------|--------------------------------|
//! | 2xx               | body returned                  |
//! | 404               | `Ok(None)`, caller decides     |
//! | 401 / 403         | `HttpError::Auth`, no retry    |
//! | other 4xx         | `HttpError::Rejected`, no retry|
//! | 429 / 5xx / I/O   | retried, then `Unavailable`    |

use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::exit_codes;
use crate::CliError;

pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const USER_AGENT: &str = concat!("tillmatch/", env!("CARGO_PKG_VERSION"));
pub(crate) const TOKEN_ENV: &str = "TILLMATCH_TOKEN";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{service} auth failed ({status}): {message}")]
    Auth {
        service: String,
        status: u16,
        message: String,
    },
    #[error("{service} rejected request ({status}): {message}")]
    Rejected {
        service: String,
        status: u16,
        message: String,
    },
    #[error("{service} unavailable after {attempts} attempt(s): {message}")]
    Unavailable {
        service: String,
        attempts: u32,
        message: String,
    },
    #[error("{service} returned an unreadable body: {message}")]
    Decode { service: String, message: String },
}

impl HttpError {
    /// Worth another try at a higher layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. } | Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// HTTP client bound to one remote service's base URL and token.
pub struct RemoteClient {
    http: Client,
    service: String,
    base: Url,
    token: String,
    max_retries: u32,
    initial_backoff: Duration,
}

impl RemoteClient {
    pub fn new(service: &str, base_url: &str, token: String) -> Result<Self, CliError> {
        let base = Url::parse(base_url).map_err(|e| CliError {
            code: exit_codes::EXIT_USAGE,
            message: format!("invalid {service} URL '{base_url}': {e}"),
            hint: None,
        })?;
        if base.cannot_be_a_base() {
            return Err(CliError {
                code: exit_codes::EXIT_USAGE,
                message: format!("invalid {service} URL '{base_url}': not an http(s) base"),
                hint: None,
            });
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CliError {
                code: exit_codes::EXIT_REMOTE_CLIENT,
                message: format!("failed to build HTTP client: {e}"),
                hint: None,
            })?;

        Ok(Self {
            http,
            service: service.to_string(),
            base,
            token,
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Base URL with `segments` appended, each percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Send with retry + exponential backoff. `Ok(None)` means 404.
    ///
    /// `build_request` is called once per attempt; auth is added here.
    pub fn execute(
        &self,
        build_request: impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Option<String>, HttpError> {
        self.execute_with_retries(build_request, self.max_retries)
    }

    fn execute_with_retries(
        &self,
        build_request: impl Fn(&Client) -> RequestBuilder,
        max_retries: u32,
    ) -> Result<Option<String>, HttpError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = build_request(&self.http).bearer_auth(&self.token).send();

            let (reason, wait) = match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if resp.status().is_success() {
                        let text = resp.text().map_err(|e| HttpError::Decode {
                            service: self.service.clone(),
                            message: e.to_string(),
                        })?;
                        return Ok(Some(text.trim_start_matches('\u{feff}').to_string()));
                    }
                    if status == 404 {
                        return Ok(None);
                    }
                    if status == 401 || status == 403 {
                        return Err(HttpError::Auth {
                            service: self.service.clone(),
                            status,
                            message: error_message(resp),
                        });
                    }
                    if status != 429 && status < 500 {
                        return Err(HttpError::Rejected {
                            service: self.service.clone(),
                            status,
                            message: error_message(resp),
                        });
                    }

                    let wait = if status == 429 {
                        retry_after(&resp).unwrap_or(backoff)
                    } else {
                        backoff
                    };
                    (format!("HTTP {status}"), wait)
                }
                Err(e) => (e.to_string(), backoff),
            };

            if attempt > max_retries {
                return Err(HttpError::Unavailable {
                    service: self.service.clone(),
                    attempts: attempt,
                    message: reason,
                });
            }

            warn!(
                service = %self.service,
                attempt,
                max_retries,
                wait_ms = wait.as_millis() as u64,
                reason = %reason,
                "remote call failed, retrying"
            );
            thread::sleep(wait);
            backoff *= 2;
        }
    }

    /// GET and decode a JSON body. `Ok(None)` means 404.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        query: &[(&str, String)],
    ) -> Result<Option<T>, HttpError> {
        let Some(body) = self.execute(|http| http.get(url.clone()).query(query))? else {
            return Ok(None);
        };
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| HttpError::Decode {
                service: self.service.clone(),
                message: format!("{e} (body: {})", truncate(&body, 200)),
            })
    }

    /// Send a JSON body; the response body is ignored. `Ok(false)` means 404.
    pub fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &Url,
        body: &B,
    ) -> Result<bool, HttpError> {
        Ok(self
            .execute(|http| http.request(method.clone(), url.clone()).json(body))?
            .is_some())
    }

    /// Like `send_json`, but a single attempt. For requests the server does
    /// not dedupe, where a retry after a lost response would apply twice.
    pub fn send_json_once<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &Url,
        body: &B,
    ) -> Result<bool, HttpError> {
        Ok(self
            .execute_with_retries(|http| http.request(method.clone(), url.clone()).json(body), 0)?
            .is_some())
    }
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Pull a readable message out of an error response: `error` or `message`
/// from a JSON body, otherwise the start of the raw text.
fn error_message(resp: Response) -> String {
    let text = resp.text().unwrap_or_default();
    if let Ok(body) = serde_json::from_str::<serde_json::Value>(&text) {
        for field in ["error", "message"] {
            if let Some(msg) = body.get(field).and_then(|v| v.as_str()) {
                return msg.to_string();
            }
        }
    }
    if text.trim().is_empty() {
        "no response body".to_string()
    } else {
        truncate(text.trim(), 200)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Resolve a bearer token: flag value > `TILLMATCH_TOKEN` > error.
pub fn resolve_token(flag: Option<String>) -> Result<String, CliError> {
    if let Some(token) = flag {
        let trimmed = token.trim().to_string();
        if trimmed.is_empty() {
            return Err(CliError {
                code: exit_codes::EXIT_REMOTE_NOT_AUTH,
                message: "--token is empty".to_string(),
                hint: None,
            });
        }
        return Ok(trimmed);
    }

    match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => Err(CliError {
            code: exit_codes::EXIT_REMOTE_NOT_AUTH,
            message: "missing remote store token".to_string(),
            hint: Some(format!("Provide --token or set {TOKEN_ENV}")),
        }),
    }
}

use std::fmt;
use std::io::{Read, Write};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{StatusCode, Url, redirect};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::dom::{Document, Selector, attr};

pub const NONCE_FIELD: &str = "blackboard.platform.security.NonceUtil.nonce";
const LOGIN_PAGE: &str = "/webapps/portal/execute/defaultTab";
const LOGIN_ENDPOINT: &str = "/webapps/login/";
const LOGIN_SUCCESS_MARKER: &str = "webapps/portal/execute/tabs";

/// A response after all redirects were followed.
pub struct FetchedResponse {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    /// Raw `Content-Type` header, empty when absent.
    pub content_type: String,
    /// Every URL that answered with a redirect, in request order.
    pub redirects: Vec<String>,
    pub body: Box<dyn Read>,
}

impl FetchedResponse {
    pub fn text(self) -> Result<String> {
        let url = self.url.clone();
        let mut body = self.body;
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes)
            .with_context(|| format!("failed to read response body from {url}"))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn json<T: DeserializeOwned>(self) -> Result<T> {
        let url = self.url.clone();
        serde_json::from_reader(self.body)
            .with_context(|| format!("failed to decode JSON response from {url}"))
    }

    pub fn copy_to<W: Write>(self, writer: &mut W) -> Result<u64> {
        let url = self.url.clone();
        let mut body = self.body;
        std::io::copy(&mut body, writer)
            .with_context(|| format!("failed to download body from {url}"))
    }
}

impl fmt::Debug for FetchedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedResponse")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("redirects", &self.redirects)
            .finish_non_exhaustive()
    }
}

/// Network seam between the archiver and the portal.
pub trait Transport {
    fn get(&mut self, url: &str) -> Result<FetchedResponse>;
    fn post_form(&mut self, url: &str, form: &[(String, String)]) -> Result<FetchedResponse>;
    fn request_count(&self) -> usize;
}

pub struct HttpSession {
    client: Client,
    config: SessionConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl HttpSession {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .redirect(redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build portal HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn fetch(&mut self, url: &str, form: Option<&[(String, String)]>) -> Result<FetchedResponse> {
        let mut current = Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
        let mut form = form.map(<[(String, String)]>::to_vec);
        let mut redirects = Vec::new();

        loop {
            let response = self.send_with_retry(&current, form.as_deref())?;
            let status = response.status();
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            let Some(location) = location.filter(|_| status.is_redirection()) else {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                return Ok(FetchedResponse {
                    url: current.to_string(),
                    status: status.as_u16(),
                    content_type,
                    redirects,
                    body: Box::new(response),
                });
            };

            if redirects.len() >= self.config.max_redirects {
                bail!("too many redirects starting at {url}");
            }
            let next = current
                .join(&location)
                .with_context(|| format!("invalid redirect target {location} from {current}"))?;
            debug!("redirect {status} {current} -> {next}");
            redirects.push(current.to_string());
            if !matches!(
                status,
                StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
            ) {
                form = None;
            }
            current = next;
        }
    }

    fn send_with_retry(&mut self, url: &Url, form: Option<&[(String, String)]>) -> Result<Response> {
        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            let request: RequestBuilder = match form {
                Some(form) => self.client.post(url.clone()).form(form),
                None => self.client.get(url.clone()),
            };

            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if attempt < self.config.max_retries && is_retryable_status(status) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Ok(response);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to request {url}"));
                }
            }
        }

        bail!("request to {url} exhausted retry budget")
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl Transport for HttpSession {
    fn get(&mut self, url: &str) -> Result<FetchedResponse> {
        self.fetch(url, None)
    }

    fn post_form(&mut self, url: &str, form: &[(String, String)]) -> Result<FetchedResponse> {
        self.fetch(url, Some(form))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Sign in with the portal's nonce-protected login form.
pub fn login<T: Transport>(
    transport: &mut T,
    base_url: &str,
    username: &str,
    password: &str,
) -> Result<()> {
    let page = transport
        .get(&format!("{base_url}{LOGIN_PAGE}"))?
        .text()?;
    let doc = Document::parse(&page);
    let nonce = doc
        .find_first(&Selector::tag("input").with_attr_value("name", NONCE_FIELD))
        .and_then(|input| attr(&input, "value"))
        .ok_or_else(|| anyhow::anyhow!("login page at {base_url} did not contain a nonce"))?;

    let form = vec![
        ("user_id".to_string(), username.to_string()),
        ("password".to_string(), password.to_string()),
        ("login".to_string(), "Login".to_string()),
        ("action".to_string(), "login".to_string()),
        ("new_loc".to_string(), String::new()),
        (NONCE_FIELD.to_string(), nonce),
    ];
    let body = transport
        .post_form(&format!("{base_url}{LOGIN_ENDPOINT}"), &form)?
        .text()?;
    if !body.contains(LOGIN_SUCCESS_MARKER) {
        bail!("login failed for user {username}: the portal did not return the tabs page");
    }
    info!("logged in to {base_url} as {username}");
    Ok(())
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
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::io::Cursor;

    use anyhow::{Result, bail};

    use super::{FetchedResponse, Transport};

    #[derive(Debug, Clone)]
    pub(crate) struct MockResponse {
        pub status: u16,
        pub content_type: String,
        pub body: Vec<u8>,
        pub final_url: Option<String>,
        pub redirects: Vec<String>,
    }

    impl MockResponse {
        pub fn html(body: &str) -> Self {
            Self::with_type("text/html; charset=UTF-8", body.as_bytes())
        }

        pub fn with_type(content_type: &str, body: &[u8]) -> Self {
            Self {
                status: 200,
                content_type: content_type.to_string(),
                body: body.to_vec(),
                final_url: None,
                redirects: Vec::new(),
            }
        }

        pub fn status(mut self, status: u16) -> Self {
            self.status = status;
            self
        }

        pub fn redirected(mut self, from: &[&str], to: &str) -> Self {
            self.redirects = from.iter().map(|url| url.to_string()).collect();
            self.final_url = Some(to.to_string());
            self
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct RecordedRequest {
        pub method: &'static str,
        pub url: String,
        pub form: Vec<(String, String)>,
    }

    /// Scripted transport: each URL answers from a queue whose last entry repeats.
    #[derive(Debug, Default)]
    pub(crate) struct MockTransport {
        routes: HashMap<String, VecDeque<MockResponse>>,
        pub requests: Vec<RecordedRequest>,
    }

    impl MockTransport {
        pub fn route(&mut self, url: &str, response: MockResponse) -> &mut Self {
            self.routes
                .entry(url.to_string())
                .or_default()
                .push_back(response);
            self
        }

        pub fn requested(&self, url: &str) -> usize {
            self.requests
                .iter()
                .filter(|request| request.url == url)
                .count()
        }

        fn respond(&mut self, url: &str) -> Result<FetchedResponse> {
            let Some(queue) = self.routes.get_mut(url) else {
                bail!("unexpected request to {url}");
            };
            let response = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            let Some(response) = response else {
                bail!("no response scripted for {url}");
            };
            Ok(FetchedResponse {
                url: response.final_url.unwrap_or_else(|| url.to_string()),
                status: response.status,
                content_type: response.content_type,
                redirects: response.redirects,
                body: Box::new(Cursor::new(response.body)),
            })
        }
    }

    impl Transport for MockTransport {
        fn get(&mut self, url: &str) -> Result<FetchedResponse> {
            self.requests.push(RecordedRequest {
                method: "GET",
                url: url.to_string(),
                form: Vec::new(),
            });
            self.respond(url)
        }

        fn post_form(&mut self, url: &str, form: &[(String, String)]) -> Result<FetchedResponse> {
            self.requests.push(RecordedRequest {
                method: "POST",
                url: url.to_string(),
                form: form.to_vec(),
            });
            self.respond(url)
        }

        fn request_count(&self) -> usize {
            self.requests.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockResponse, MockTransport};
    use super::*;

    const BASE: &str = "https://bb.example.edu";

    fn login_page() -> MockResponse {
        MockResponse::html(&format!(
            r#"<html><body><form><input type="hidden" name="{NONCE_FIELD}" value="n-123"></form></body></html>"#
        ))
    }

    #[test]
    fn login_posts_credentials_with_nonce() {
        let mut transport = MockTransport::default();
        transport
            .route(&format!("{BASE}/webapps/portal/execute/defaultTab"), login_page())
            .route(
                &format!("{BASE}/webapps/login/"),
                MockResponse::html(r#"<a href="/webapps/portal/execute/tabs/tabAction">home</a>"#),
            );

        login(&mut transport, BASE, "s123", "secret").expect("login");

        let post = transport
            .requests
            .iter()
            .find(|request| request.method == "POST")
            .expect("login post");
        assert!(post.form.contains(&("user_id".to_string(), "s123".to_string())));
        assert!(post.form.contains(&("new_loc".to_string(), String::new())));
        assert!(post.form.contains(&(NONCE_FIELD.to_string(), "n-123".to_string())));
        assert_eq!(transport.request_count(), 2);
    }

    #[test]
    fn login_fails_without_tabs_marker() {
        let mut transport = MockTransport::default();
        transport
            .route(&format!("{BASE}/webapps/portal/execute/defaultTab"), login_page())
            .route(
                &format!("{BASE}/webapps/login/"),
                MockResponse::html("<p>Invalid password</p>"),
            );

        let error = login(&mut transport, BASE, "s123", "wrong").expect_err("must fail");
        assert!(error.to_string().contains("login failed"));
    }

    #[test]
    fn login_requires_nonce() {
        let mut transport = MockTransport::default();
        transport.route(
            &format!("{BASE}/webapps/portal/execute/defaultTab"),
            MockResponse::html("<html><body>maintenance</body></html>"),
        );

        let error = login(&mut transport, BASE, "s123", "secret").expect_err("must fail");
        assert!(error.to_string().contains("nonce"));
        assert_eq!(transport.requested(&format!("{BASE}/webapps/login/")), 0);
    }

    #[test]
    fn fetched_response_helpers_read_the_body() {
        let mut transport = MockTransport::default();
        transport.route(
            "https://h/data",
            MockResponse::with_type("application/json", br#"{"a": [1, 2]}"#),
        );
        let value: serde_json::Value = transport.get("https://h/data").expect("get").json().expect("json");
        assert_eq!(value["a"][1], 2);

        let mut sink = Vec::new();
        let copied = transport
            .get("https://h/data")
            .expect("get")
            .copy_to(&mut sink)
            .expect("copy");
        assert_eq!(copied, 13);
        assert_eq!(sink, br#"{"a": [1, 2]}"#);
    }

    #[test]
    fn retryable_statuses_match_transient_failures() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::FOUND));
    }
}

/*
 * Access to the external image recognition service.
 *
 * The service works in two steps: credentials are exchanged for an access token,
 * then each image is posted together with that token and the service answers with
 * a list of keywords. `RecognitionOperations` is the narrow contract the
 * classification pipeline depends on; `HttpRecognitionService` talks to the real
 * HTTP endpoints with a bounded timeout and a small retry budget for transient
 * failures.
 */
use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

pub const DEFAULT_TOKEN_URL: &str = "https://aip.baidubce.com/oauth/2.0/token";
pub const DEFAULT_CLASSIFY_URL: &str =
    "https://aip.baidubce.com/rest/2.0/image-classify/v2/advanced_general";
const KEYWORD_SEPARATOR: &str = "，";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    pub token_url: String,
    pub classify_url: String,
    pub api_key: String,
    pub secret_key: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_keywords: usize,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        RecognitionSettings {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            classify_url: DEFAULT_CLASSIFY_URL.to_string(),
            api_key: String::new(),
            secret_key: String::new(),
            timeout_secs: 15,
            max_retries: 2,
            retry_backoff_ms: 500,
            max_keywords: 1,
        }
    }
}

impl RecognitionSettings {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_key: self.api_key.clone(),
            secret_key: self.secret_key.clone(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.secret_key.trim().is_empty()
    }
}

// Keeps the secret out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    value: String,
    obtained_at: Instant,
    expires_in: Option<Duration>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_in: Option<Duration>) -> Self {
        AccessToken {
            value: value.into(),
            obtained_at: Instant::now(),
            expires_in,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_expired(&self) -> bool {
        self.expires_in
            .is_some_and(|lifetime| self.obtained_at.elapsed() >= lifetime)
    }
}

#[derive(Debug)]
pub enum RecognitionError {
    Http(reqwest::Error),
    Status(u16),
    MissingCredentials,
    Rejected(String),
    Service { code: i64, message: String },
    InvalidResponse(String),
}

impl From<reqwest::Error> for RecognitionError {
    fn from(err: reqwest::Error) -> Self {
        RecognitionError::Http(err)
    }
}

impl std::fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecognitionError::Http(e) => write!(f, "Recognition request failed: {e}"),
            RecognitionError::Status(code) => {
                write!(f, "Recognition service answered with HTTP {code}")
            }
            RecognitionError::MissingCredentials => {
                write!(f, "No API key/secret key configured for the recognition service")
            }
            RecognitionError::Rejected(reason) => {
                write!(f, "Recognition service refused the credentials: {reason}")
            }
            RecognitionError::Service { code, message } => {
                write!(f, "Recognition service error {code}: {message}")
            }
            RecognitionError::InvalidResponse(detail) => {
                write!(f, "Unexpected recognition response: {detail}")
            }
        }
    }
}

impl std::error::Error for RecognitionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecognitionError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl RecognitionError {
    /// Transport problems and server-side errors are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            RecognitionError::Http(e) => !e.is_builder() && !e.is_decode(),
            RecognitionError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RecognitionError>;

pub trait RecognitionOperations: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<AccessToken>;
    /*
     * Labels one encoded image. The label is free text; an empty string means the
     * service recognised nothing.
     */
    fn classify(&self, image: &[u8], token: &AccessToken) -> Result<String>;
}

pub fn join_keywords<'a>(keywords: impl IntoIterator<Item = &'a str>, limit: usize) -> String {
    keywords
        .into_iter()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .take(limit)
        .collect::<Vec<_>>()
        .join(KEYWORD_SEPARATOR)
}

pub fn parse_token_response(json: &Value) -> Result<AccessToken> {
    if let Some(token) = json.get("access_token").and_then(Value::as_str) {
        let expires_in = json
            .get("expires_in")
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        return Ok(AccessToken::new(token, expires_in));
    }
    let reason = json
        .get("error_description")
        .or_else(|| json.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("no access_token in response");
    Err(RecognitionError::Rejected(reason.to_string()))
}

pub fn parse_classify_response(json: &Value, max_keywords: usize) -> Result<String> {
    if let Some(code) = json.get("error_code").and_then(Value::as_i64) {
        let message = json
            .get("error_msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(RecognitionError::Service { code, message });
    }
    let Some(results) = json.get("result") else {
        return Ok(String::new());
    };
    let Some(results) = results.as_array() else {
        return Err(RecognitionError::InvalidResponse(
            "'result' is not a list".to_string(),
        ));
    };
    let keywords = results
        .iter()
        .filter_map(|entry| entry.get("keyword").and_then(Value::as_str));
    Ok(join_keywords(keywords, max_keywords.max(1)))
}

pub struct HttpRecognitionService {
    client: reqwest::blocking::Client,
    settings: RecognitionSettings,
}

impl HttpRecognitionService {
    pub fn new(settings: RecognitionSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()?;
        Ok(HttpRecognitionService { client, settings })
    }

    /*
     * Runs `request` up to `1 + max_retries` times. Only transient failures are
     * retried, with a fixed pause in between.
     */
    fn with_retries(&self, what: &str, request: impl Fn() -> Result<Value>) -> Result<Value> {
        let mut attempt = 0;
        loop {
            match request() {
                Ok(json) => return Ok(json),
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "RecognitionClient: {what} failed ({e}), retry {attempt}/{}",
                        self.settings.max_retries
                    );
                    std::thread::sleep(Duration::from_millis(self.settings.retry_backoff_ms));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_json(response: reqwest::blocking::Response) -> Result<Value> {
        let status = response.status();
        // The token endpoint reports bad credentials with 4xx and a JSON body.
        if status.is_server_error() {
            return Err(RecognitionError::Status(status.as_u16()));
        }
        match response.json::<Value>() {
            Ok(json) => Ok(json),
            Err(_) if !status.is_success() => Err(RecognitionError::Status(status.as_u16())),
            Err(e) => Err(RecognitionError::InvalidResponse(e.to_string())),
        }
    }
}

impl RecognitionOperations for HttpRecognitionService {
    fn authenticate(&self, credentials: &Credentials) -> Result<AccessToken> {
        if !credentials.is_complete() {
            return Err(RecognitionError::MissingCredentials);
        }
        log::debug!("RecognitionClient: Requesting access token from {}", self.settings.token_url);
        let json = self.with_retries("token request", || {
            let response = self
                .client
                .post(&self.settings.token_url)
                .query(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", credentials.api_key.as_str()),
                    ("client_secret", credentials.secret_key.as_str()),
                ])
                .send()?;
            Self::read_json(response)
        })?;
        let token = parse_token_response(&json)?;
        log::info!("RecognitionClient: Access token obtained.");
        Ok(token)
    }

    fn classify(&self, image: &[u8], token: &AccessToken) -> Result<String> {
        let encoded = Base64::encode_string(image);
        let json = self.with_retries("classify request", || {
            let response = self
                .client
                .post(&self.settings.classify_url)
                .query(&[("access_token", token.value())])
                .form(&[("image", encoded.as_str()), ("baike_num", "0")])
                .send()?;
            Self::read_json(response)
        })?;
        let label = parse_classify_response(&json, self.settings.max_keywords)?;
        log::debug!("RecognitionClient: Recognised '{label}' ({} bytes)", image.len());
        Ok(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    // Reads one request including its body so the client is never cut off mid-write.
    fn read_request(stream: &mut TcpStream) {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let Ok(n) = stream.read(&mut chunk) else { return };
            if n == 0 {
                return;
            }
            data.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&data);
            let Some(header_end) = text.find("\r\n\r\n") else { continue };
            let body_len = text[..header_end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= header_end + 4 + body_len {
                return;
            }
        }
    }

    /*
     * A local HTTP endpoint answering one connection per canned response, in order.
     * Returns its base URL and the number of requests it has seen.
     */
    fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&requests);
        std::thread::spawn(move || {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else { return };
                read_request(&mut stream);
                seen.fetch_add(1, Ordering::SeqCst);
                let reply = format!(
                    "HTTP/1.1 {status} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        (base, requests)
    }

    fn local_settings(base: &str, max_retries: u32) -> RecognitionSettings {
        RecognitionSettings {
            token_url: format!("{base}/oauth/2.0/token"),
            classify_url: format!("{base}/classify"),
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            timeout_secs: 1,
            max_retries,
            retry_backoff_ms: 10,
            ..RecognitionSettings::default()
        }
    }

    #[test]
    fn test_join_keywords_limits_and_skips_blanks() {
        assert_eq!(join_keywords(["文字", " ", "背景", "图标"], 2), "文字，背景");
        assert_eq!(join_keywords(["logo"], 3), "logo");
        assert_eq!(join_keywords(Vec::<&str>::new(), 3), "");
    }

    #[test]
    fn test_parse_token_response() {
        let ok = parse_token_response(&json!({"access_token": "abc", "expires_in": 2592000})).unwrap();
        assert_eq!(ok.value(), "abc");
        assert!(!ok.is_expired());

        let rejected = parse_token_response(&json!({
            "error": "invalid_client",
            "error_description": "unknown client id"
        }));
        assert!(matches!(rejected, Err(RecognitionError::Rejected(r)) if r == "unknown client id"));
    }

    #[test]
    fn test_token_expiry() {
        let token = AccessToken::new("t", Some(Duration::ZERO));
        assert!(token.is_expired());
        assert!(!AccessToken::new("t", None).is_expired());
    }

    #[test]
    fn test_parse_classify_response() {
        let body = json!({
            "result_num": 2,
            "result": [
                {"keyword": "文字", "score": 0.9, "root": "商品-文字"},
                {"keyword": "标题", "score": 0.4, "root": "商品-文字"}
            ]
        });
        assert_eq!(parse_classify_response(&body, 1).unwrap(), "文字");
        assert_eq!(parse_classify_response(&body, 3).unwrap(), "文字，标题");
        assert_eq!(parse_classify_response(&json!({"result": []}), 1).unwrap(), "");
        assert_eq!(parse_classify_response(&json!({}), 1).unwrap(), "");

        let failed = parse_classify_response(&json!({"error_code": 110, "error_msg": "Access token invalid"}), 1);
        assert!(matches!(failed, Err(RecognitionError::Service { code: 110, .. })));
        assert!(matches!(
            parse_classify_response(&json!({"result": "oops"}), 1),
            Err(RecognitionError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_authenticate_requires_credentials() {
        let service = HttpRecognitionService::new(RecognitionSettings::default()).unwrap();
        let empty = RecognitionSettings::default().credentials();
        assert!(matches!(
            service.authenticate(&empty),
            Err(RecognitionError::MissingCredentials)
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(RecognitionError::Status(503).is_transient());
        assert!(!RecognitionError::Status(404).is_transient());
        assert!(!RecognitionError::MissingCredentials.is_transient());
    }

    #[test]
    fn test_server_error_is_retried_until_success() {
        let (base, requests) = serve(vec![
            (503, "{}"),
            (200, r#"{"access_token": "fresh", "expires_in": 3600}"#),
        ]);
        let settings = local_settings(&base, 2);
        let service = HttpRecognitionService::new(settings.clone()).unwrap();

        let token = service.authenticate(&settings.credentials()).unwrap();

        assert_eq!(token.value(), "fresh");
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retries_stop_after_budget() {
        let (base, requests) = serve(vec![(502, "{}"), (503, "{}"), (504, "{}")]);
        let service = HttpRecognitionService::new(local_settings(&base, 2)).unwrap();

        let result = service.classify(b"png", &AccessToken::new("t", None));

        assert!(matches!(result, Err(RecognitionError::Status(504))));
        assert_eq!(requests.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        let (base, requests) = serve(vec![(400, "bad request")]);
        let service = HttpRecognitionService::new(local_settings(&base, 2)).unwrap();
        let result = service.classify(b"png", &AccessToken::new("t", None));
        assert!(matches!(result, Err(RecognitionError::Status(400))));
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        // Bad credentials come back as 4xx with a JSON explanation.
        let (base, requests) = serve(vec![(
            401,
            r#"{"error": "invalid_client", "error_description": "unknown client id"}"#,
        )]);
        let settings = local_settings(&base, 2);
        let service = HttpRecognitionService::new(settings.clone()).unwrap();
        let result = service.authenticate(&settings.credentials());
        assert!(matches!(result, Err(RecognitionError::Rejected(r)) if r == "unknown client id"));
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unanswered_request_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (release, held) = mpsc::channel::<()>();
        std::thread::spawn(move || {
            // Keep the connection open without ever answering.
            if let Ok((_stream, _)) = listener.accept() {
                let _ = held.recv_timeout(Duration::from_secs(10));
            }
        });
        let service = HttpRecognitionService::new(local_settings(&base, 0)).unwrap();

        let started = Instant::now();
        let result = service.classify(b"png", &AccessToken::new("t", None));
        let elapsed = started.elapsed();
        let _ = release.send(());

        assert!(matches!(&result, Err(RecognitionError::Http(e)) if e.is_timeout()));
        assert!(elapsed >= Duration::from_millis(900), "gave up after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials {
            api_key: "key".to_string(),
            secret_key: "hunter2".to_string(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}

use reqwest::blocking::Client as HttpClient;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, service_error};
use crate::util::{http_client, jitter, urljoin};

/// Header carrying the session key once logged in.
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Endpoint that legitimately answers with `data: null`.
const LOGOUT_ENDPOINT: &str = "logout";

/// Raw HTTP answer: status code and body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Failure below the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout(String),
    Connect(String),
    Other(String),
}

impl TransportError {
    /// Connection-level failures are retried; anything else surfaces at once.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Connect(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout(m) => write!(f, "timeout: {}", m),
            TransportError::Connect(m) => write!(f, "connection failed: {}", m),
            TransportError::Other(m) => f.write_str(m),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// One JSON POST round trip.
pub trait Transport: Send + Sync {
    fn post(
        &self,
        url: &str,
        body: &str,
        token: Option<&str>,
    ) -> std::result::Result<HttpReply, TransportError>;
}

/// [`Transport`] over a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new(timeout: Duration, verify: bool) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = http_client(Some(timeout), verify, headers)?;
        Ok(Self { http })
    }
}

impl Transport for HttpTransport {
    fn post(
        &self,
        url: &str,
        body: &str,
        token: Option<&str>,
    ) -> std::result::Result<HttpReply, TransportError> {
        let mut req = self.http.post(url).body(body.to_string());
        if let Some(token) = token {
            req = req.header(AUTH_HEADER, token);
        }
        let resp = req.send()?;
        let status = resp.status().as_u16();
        let body = resp.text()?;
        Ok(HttpReply { status, body })
    }
}

#[derive(Debug, serde::Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
    #[serde(default, rename = "errorCode")]
    error_code: Option<String>,
    #[serde(default, rename = "errorMessage")]
    error_message: Option<String>,
}

/// Executes M2M requests: retries connection failures, attaches the session
/// key and unwraps the `{data, errorCode, errorMessage}` envelope.
pub struct Gateway {
    base_url: String,
    transport: Box<dyn Transport>,
    token: Option<String>,
    retry_max: usize,
    sleep_max: Duration,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("base_url", &self.base_url)
            .field("logged_in", &self.token.is_some())
            .field("retry_max", &self.retry_max)
            .field("sleep_max", &self.sleep_max)
            .finish()
    }
}

impl Gateway {
    pub fn new(base_url: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
            token: None,
            retry_max: 5,
            sleep_max: Duration::from_secs(1),
        }
    }

    pub fn with_retry_max(mut self, retry_max: usize) -> Self {
        self.retry_max = retry_max.max(1);
        self
    }

    /// Ceiling of the random sleep between connection retries.
    pub fn with_sleep_max(mut self, sleep_max: Duration) -> Self {
        self.sleep_max = sleep_max;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    pub fn clear_token(&mut self) {
        self.token = None;
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.is_some()
    }

    /// Posts `payload` to `endpoint` and decodes the envelope's `data`.
    pub fn execute<Req, Resp>(&self, endpoint: &str, payload: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = self.execute_value(endpoint, payload)?;
        serde_json::from_value(data).map_err(|e| Error::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    /// Like [`Gateway::execute`] but returns `data` untouched.
    pub fn execute_value<Req>(&self, endpoint: &str, payload: &Req) -> Result<Value>
    where
        Req: Serialize + ?Sized,
    {
        let url = urljoin(&self.base_url, endpoint);
        let body = serde_json::to_string(payload)?;
        debug!(url = %url, "sending request");

        let reply = self.post_with_retry(&url, &body)?;
        self.validate(endpoint, reply)
    }

    fn post_with_retry(&self, url: &str, body: &str) -> Result<HttpReply> {
        let mut tries = 0usize;
        loop {
            match self.transport.post(url, body, self.token.as_deref()) {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_retriable() => {
                    tries += 1;
                    if tries >= self.retry_max {
                        return Err(Error::MaxRetriesExceeded {
                            url: url.to_string(),
                            attempts: tries,
                            last: err.to_string(),
                        });
                    }
                    let sleep = jitter(self.sleep_max);
                    info!(
                        url = %url,
                        "connection failure ({}), retry {} of {} in {:?}",
                        err,
                        tries,
                        self.retry_max,
                        sleep
                    );
                    thread::sleep(sleep);
                }
                Err(err) => {
                    return Err(Error::Transport {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    fn validate(&self, endpoint: &str, reply: HttpReply) -> Result<Value> {
        if !(200..300).contains(&reply.status) {
            warn!(endpoint, status = reply.status, "request rejected");
            return Err(service_error(reply.status, &reply.body));
        }

        let envelope: Envelope = serde_json::from_str(&reply.body).map_err(|e| Error::Decode {
            endpoint: endpoint.to_string(),
            reason: format!("{} (status {}): {}", e, reply.status, reply.body.trim()),
        })?;

        if let Some(code) = envelope.error_code {
            return Err(Error::Service {
                status: reply.status,
                code,
                message: envelope.error_message.unwrap_or_default(),
            });
        }

        if envelope.data.is_null() && endpoint != LOGOUT_ENDPOINT {
            return Err(Error::EmptyResponse {
                endpoint: endpoint.to_string(),
            });
        }

        Ok(envelope.data)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;
    use serde_json::json;

    fn gateway(transport: &ScriptedTransport) -> Gateway {
        Gateway::new("https://m2m.test/api/api/json/stable/", Box::new(transport.clone()))
            .with_sleep_max(Duration::from_millis(1))
    }

    #[test]
    fn returns_data_and_attaches_token() {
        let transport = ScriptedTransport::default();
        transport.push_data(json!("session-key"));
        transport.push_data(json!({"results": []}));

        let mut gw = gateway(&transport);
        let key: String = gw
            .execute("login-token", &json!({"username": "u", "token": "t"}))
            .unwrap();
        gw.set_token(key);
        let data = gw.execute_value("scene-search", &json!({})).unwrap();

        assert_eq!(data, json!({"results": []}));
        let seen = transport.seen();
        assert_eq!(seen[0].url, "https://m2m.test/api/api/json/stable/login-token");
        assert_eq!(seen[0].token, None);
        assert_eq!(seen[1].token.as_deref(), Some("session-key"));
    }

    #[test]
    fn retries_timeouts_then_succeeds() {
        let transport = ScriptedTransport::default();
        transport.push_err(TransportError::Timeout("read timed out".into()));
        transport.push_err(TransportError::Connect("refused".into()));
        transport.push_data(json!([]));

        let data = gateway(&transport).execute_value("permissions", &json!({})).unwrap();
        assert_eq!(data, json!([]));
        assert_eq!(transport.seen().len(), 3);
    }

    #[test]
    fn exhausted_retries_are_a_distinct_error() {
        let transport = ScriptedTransport::default();
        for _ in 0..3 {
            transport.push_err(TransportError::Timeout("read timed out".into()));
        }

        let err = gateway(&transport)
            .with_retry_max(3)
            .execute_value("scene-search", &json!({}))
            .unwrap_err();

        assert!(matches!(err, Error::MaxRetriesExceeded { attempts: 3, .. }));
        assert_eq!(transport.seen().len(), 3);
    }

    #[test]
    fn application_errors_are_not_retried() {
        let transport = ScriptedTransport::default();
        transport.push_reply(
            400,
            json!({"data": null, "errorCode": "DOWNLOAD_ERROR", "errorMessage": "bad label"}),
        );
        transport.push_data(json!([]));

        let err = gateway(&transport)
            .execute_value("download-search", &json!({"label": "x"}))
            .unwrap_err();

        assert_eq!(err.to_string(), "400 - DOWNLOAD_ERROR - bad label");
        assert_eq!(transport.seen().len(), 1);
    }

    #[test]
    fn error_code_with_success_status_is_service_error() {
        let transport = ScriptedTransport::default();
        transport.push_reply(
            200,
            json!({"data": null, "errorCode": "UNKNOWN_DATASET", "errorMessage": "Invalid dataset"}),
        );

        let err = gateway(&transport)
            .execute_value("dataset-filters", &json!({"datasetName": "nope"}))
            .unwrap_err();
        assert!(matches!(err, Error::Service { status: 200, ref code, .. } if code == "UNKNOWN_DATASET"));
    }

    #[test]
    fn null_data_is_an_error_except_for_logout() {
        let transport = ScriptedTransport::default();
        transport.push_data(Value::Null);
        transport.push_data(Value::Null);

        let gw = gateway(&transport);
        let err = gw.execute_value("download-search", &json!({})).unwrap_err();
        assert!(matches!(err, Error::EmptyResponse { .. }));

        let data = gw.execute_value("logout", &json!({})).unwrap();
        assert!(data.is_null());
    }

    #[test]
    fn other_transport_errors_surface_immediately() {
        let transport = ScriptedTransport::default();
        transport.push_err(TransportError::Other("invalid certificate".into()));

        let err = gateway(&transport).execute_value("login", &json!({})).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(transport.seen().len(), 1);
    }
}

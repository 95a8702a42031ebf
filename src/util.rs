use rand::Rng;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Uniformly random duration in `[0, max)`.
pub(crate) fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let factor: f64 = rand::rng().random();
    max.mul_f64(factor)
}

/// Blocking HTTP client with the crate's User-Agent and the given extra headers.
///
/// `timeout: None` disables the per-request timeout.
pub(crate) fn http_client(
    timeout: Option<Duration>,
    verify: bool,
    headers: HeaderMap,
) -> crate::error::Result<HttpClient> {
    let mut default_headers = headers;
    default_headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("m2mapi-rs/{}", env!("CARGO_PKG_VERSION")))
            .unwrap_or(HeaderValue::from_static("m2mapi-rs")),
    );

    let mut builder = HttpClient::builder()
        .default_headers(default_headers)
        .timeout(timeout);
    if !verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(|e| crate::error::Error::Transport {
        url: String::new(),
        message: format!("failed to build HTTP client: {}", e),
    })
}

pub(crate) fn urljoin(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// `<path>.size`, the sidecar holding a payload's expected byte count.
pub(crate) fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".size");
    PathBuf::from(os)
}

pub(crate) fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// M2M returns ids as numbers on some endpoints and strings on others.
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_string(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid id: {}", value)))
}

pub(crate) fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_string))
}

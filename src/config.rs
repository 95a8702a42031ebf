use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use crate::client::ClientConfig;

/// Public M2M endpoint.
pub(crate) const DEFAULT_URL: &str = "https://m2m.cr.usgs.gov/api/api/json/stable";

#[derive(Debug, Default, PartialEq)]
struct RcConfig {
    url: Option<String>,
    username: Option<String>,
    token: Option<String>,
    verify: Option<bool>,
}

pub(crate) fn load_config(
    url: Option<String>,
    username: Option<String>,
    token: Option<String>,
    verify: Option<bool>,
) -> Result<ClientConfig> {
    let url = url.or_else(|| std::env::var("M2M_URL").ok());
    let username = username.or_else(|| std::env::var("M2M_USERNAME").ok());
    let token = token.or_else(|| std::env::var("M2M_TOKEN").ok());

    let rc = if url.is_none() || username.is_none() || token.is_none() || verify.is_none() {
        find_rc()?
    } else {
        RcConfig::default()
    };

    resolve(url, username, token, verify, rc, &rc_candidates())
}

fn resolve(
    url: Option<String>,
    username: Option<String>,
    token: Option<String>,
    verify: Option<bool>,
    rc: RcConfig,
    searched: &[PathBuf],
) -> Result<ClientConfig> {
    let url = url.or(rc.url).unwrap_or_else(|| DEFAULT_URL.to_string());

    let Some(username) = username.or(rc.username) else {
        bail!(
            "Missing configuration: username (set M2M_USERNAME or put `username:` in one of: {})",
            describe(searched)
        );
    };
    let Some(token) = token.or(rc.token) else {
        bail!(
            "Missing configuration: token (set M2M_TOKEN or put `token:` in one of: {})",
            describe(searched)
        );
    };

    let verify = verify.or(rc.verify).unwrap_or(true);

    Ok(ClientConfig {
        url,
        username,
        token,
        verify,
    })
}

fn describe(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return ".m2mrc".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn find_rc() -> Result<RcConfig> {
    for rc_path in rc_candidates() {
        if rc_path.exists() {
            return read_rc(&rc_path).with_context(|| {
                format!("failed to read configuration file {}", rc_path.display())
            });
        }
    }
    Ok(RcConfig::default())
}

fn read_rc(path: &Path) -> Result<RcConfig> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_rc(&text))
}

fn parse_rc(text: &str) -> RcConfig {
    let mut cfg = RcConfig::default();

    // `token:` may be alone on its line with the value on the next one.
    let mut pending_key: Option<&str> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(pk) = pending_key.take() {
            if !line.contains(':') {
                set_value(&mut cfg, pk, strip_quotes(line));
                continue;
            }
        }

        if let Some((k, v)) = line.split_once(':') {
            let k = k.trim();
            let v = strip_quotes(v.trim());
            match k {
                "url" | "username" | "token" if v.is_empty() => pending_key = Some(k),
                "url" | "username" | "token" | "verify" => set_value(&mut cfg, k, v),
                _ => {}
            }
        }
    }

    cfg
}

fn set_value(cfg: &mut RcConfig, key: &str, value: &str) {
    match key {
        "url" => cfg.url = Some(value.to_string()),
        "username" => cfg.username = Some(value.to_string()),
        "token" => cfg.token = Some(value.to_string()),
        "verify" if !value.is_empty() => cfg.verify = Some(value != "0"),
        _ => {}
    }
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn rc_candidates() -> Vec<PathBuf> {
    // 1) M2M_RC (explicit)
    // 2) ./.m2mrc
    // 3) ~/.m2mrc
    if let Ok(p) = std::env::var("M2M_RC") {
        return vec![PathBuf::from(p)];
    }

    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(".m2mrc"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".m2mrc"));
    }
    v
}

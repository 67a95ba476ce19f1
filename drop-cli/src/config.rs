//! Relay address and download location.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable naming the relay.
pub const RELAY_ENV: &str = "SHAREDROP_RELAY";

/// Relay used when neither `--relay` nor `SHAREDROP_RELAY` is set.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:5050/ws";

/// Pick the relay address: flag, then environment, then default.
pub fn resolve_relay(flag: Option<String>) -> String {
    let raw = flag
        .or_else(|| std::env::var(RELAY_ENV).ok())
        .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
    normalize_relay_url(&raw)
}

/// Accept `http(s)://` and bare `host:port` forms and point them at `/ws`.
pub fn normalize_relay_url(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    let (scheme, rest) = match raw.split_once("://") {
        Some(("http", rest)) | Some(("ws", rest)) => ("ws", rest),
        Some(("https", rest)) | Some(("wss", rest)) => ("wss", rest),
        Some((other, rest)) => (other, rest),
        None => ("ws", raw),
    };
    if rest.contains('/') {
        format!("{scheme}://{rest}")
    } else {
        format!("{scheme}://{rest}/ws")
    }
}

/// Where received files go when `--out` is not given.
pub fn default_download_dir() -> Result<PathBuf> {
    if let Some(dir) = directories::UserDirs::new().and_then(|u| u.download_dir().map(Path::to_path_buf)) {
        return Ok(dir);
    }
    let dirs = directories::ProjectDirs::from("io", "sharedrop", "sharedrop")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().join("downloads"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_become_websocket_urls() {
        assert_eq!(normalize_relay_url("http://relay.example:5050"), "ws://relay.example:5050/ws");
        assert_eq!(normalize_relay_url("https://relay.example/"), "wss://relay.example/ws");
    }

    #[test]
    fn bare_host_gets_scheme_and_path() {
        assert_eq!(normalize_relay_url("10.0.0.2:5050"), "ws://10.0.0.2:5050/ws");
    }

    #[test]
    fn explicit_path_is_kept() {
        assert_eq!(normalize_relay_url("wss://relay.example/drop/ws"), "wss://relay.example/drop/ws");
    }

    #[test]
    fn flag_wins() {
        assert_eq!(resolve_relay(Some("ws://a:1/ws".into())), "ws://a:1/ws");
    }
}

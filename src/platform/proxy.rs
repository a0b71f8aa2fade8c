//! Per-account HTTP proxy dispatchers, memoized process-wide.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::domain::account::ProxyProtocol;
use crate::platform::error::PlatformError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProxyKey {
    protocol: &'static str,
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

fn dispatcher_cache() -> &'static Mutex<HashMap<ProxyKey, reqwest::Client>> {
    static CACHE: OnceLock<Mutex<HashMap<ProxyKey, reqwest::Client>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Percent-encodes proxy credentials the way the Platform's dispatcher construction expects:
/// a regular URL-encoding pass with `%20` rewritten to `+`.
fn urlencode_credential(value: &str) -> String {
    urlencoding::encode(value).replace("%20", "+")
}

/// Resolved proxy identity for one schedule's publish/refresh call.
pub struct ProxySpec {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Returns a `reqwest::Client` configured to tunnel through the given proxy, reusing a
/// previously built client for the same `(protocol,host,port,user,pw)` identity.
pub fn client_for(spec: &ProxySpec) -> Result<reqwest::Client, PlatformError> {
    let protocol = match spec.protocol {
        ProxyProtocol::Http => "http",
        ProxyProtocol::Https => "https",
    };
    let key = ProxyKey {
        protocol,
        host: spec.host.clone(),
        port: spec.port,
        username: spec.username.clone(),
        password: spec.password.clone(),
    };

    let mut cache = dispatcher_cache().lock().expect("proxy dispatcher cache poisoned");
    if let Some(client) = cache.get(&key) {
        return Ok(client.clone());
    }

    let mut proxy_url = format!("{protocol}://");
    if let Some(username) = &spec.username {
        proxy_url.push_str(&urlencode_credential(username));
        if let Some(password) = &spec.password {
            proxy_url.push(':');
            proxy_url.push_str(&urlencode_credential(password));
        }
        proxy_url.push('@');
    }
    proxy_url.push_str(&spec.host);
    proxy_url.push(':');
    proxy_url.push_str(&spec.port.to_string());

    let proxy = reqwest::Proxy::all(&proxy_url)
        .map_err(|e| PlatformError::InvalidProxy(e.to_string()))?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .build()
        .map_err(PlatformError::Transport)?;

    cache.insert(key, client.clone());
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencodes_spaces_as_plus() {
        assert_eq!(urlencode_credential("a b"), "a+b");
        assert_eq!(urlencode_credential("p@ss/word"), "p%40ss%2Fword");
    }

    #[test]
    fn memoizes_clients_for_identical_identity() {
        let make_spec = || ProxySpec {
            protocol: ProxyProtocol::Http,
            host: "proxy.example.com".into(),
            port: 8080,
            username: Some("u".into()),
            password: Some("p".into()),
        };
        let before = dispatcher_cache().lock().unwrap().len();
        client_for(&make_spec()).unwrap();
        client_for(&make_spec()).unwrap();
        let after = dispatcher_cache().lock().unwrap().len();
        assert_eq!(after, before + 1, "a repeated identity must not grow the cache");
    }
}

use axum::http::HeaderMap;
use std::collections::HashMap;

use crate::config::IdentityConfig;

pub const ANONYMOUS: &str = "anonymous";

/// Who issued a request, plus the billing credentials their browser carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub uid: String,
    pub access_key: Option<String>,
    pub client_name: Option<String>,
}

impl Default for Caller {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl Caller {
    pub fn anonymous() -> Self {
        Self {
            uid: ANONYMOUS.to_string(),
            access_key: None,
            client_name: None,
        }
    }

    /// Resolve the caller from the proxy identity header and the request cookies
    pub fn from_headers(headers: &HeaderMap, identity: &IdentityConfig) -> Self {
        let uid = headers
            .get(identity.user_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS)
            .to_string();

        let cookies = headers
            .get_all(axum::http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_cookies)
            .collect::<HashMap<_, _>>();

        Self {
            uid,
            access_key: cookies.get("appAccessKey").cloned().filter(|v| !v.is_empty()),
            client_name: cookies.get("clientName").cloned().filter(|v| !v.is_empty()),
        }
    }
}

/// Parse a Cookie header into decoded name/value pairs
pub fn parse_cookies(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim();
            let decoded = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            Some((name.to_string(), decoded))
        })
        .collect()
}

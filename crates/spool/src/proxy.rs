//! Outbound proxy settings for the shared HTTP client.

use reqwest::Proxy;
use url::Url;

use crate::error::DownloadError;

const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Protocol spoken to the proxy itself. Every request, plain or TLS, is
/// routed through it.
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
}

impl ProxyType {
    fn default_scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }

    fn accepts_scheme(&self, scheme: &str) -> bool {
        match self {
            Self::Socks5 => matches!(scheme, "socks5" | "socks5h"),
            _ => scheme == self.default_scheme(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// `host:port`, or a full URL whose scheme matches `proxy_type`.
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// The proxy address as a URL, with the scheme implied by the proxy type
    /// filled in when missing.
    pub fn endpoint(&self) -> Result<Url, DownloadError> {
        let raw = self.url.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("{}://{raw}", self.proxy_type.default_scheme())
        };
        let mut url = Url::parse(&with_scheme)
            .map_err(|e| invalid(format!("cannot parse proxy address `{raw}`: {e}")))?;

        if !self.proxy_type.accepts_scheme(url.scheme()) {
            return Err(invalid(format!(
                "scheme `{}` does not match proxy type {:?}",
                url.scheme(),
                self.proxy_type
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid(format!("proxy address `{raw}` has no host")));
        }
        if url.port_or_known_default().is_none() {
            // socks URLs have no registered default port
            url.set_port(Some(DEFAULT_SOCKS_PORT))
                .map_err(|_| invalid(format!("cannot set port on `{raw}`")))?;
        }
        if !matches!(url.path(), "" | "/") || url.query().is_some() {
            return Err(invalid(format!("proxy address `{raw}` must not have a path or query")));
        }

        if let Some(auth) = &self.auth {
            if auth.username.is_empty() {
                return Err(invalid("proxy username is empty".to_string()));
            }
            if !url.username().is_empty() {
                return Err(invalid(
                    "proxy credentials are given both in the address and separately".to_string(),
                ));
            }
        }
        Ok(url)
    }
}

fn invalid(reason: String) -> DownloadError {
    DownloadError::ProxyConfiguration { reason }
}

/// Validate `config` and turn it into a proxy that covers all requests.
pub fn build_proxy(config: &ProxyConfig) -> Result<Proxy, DownloadError> {
    let endpoint = config.endpoint()?;
    let mut proxy = Proxy::all(endpoint.as_str())
        .map_err(|e| invalid(format!("proxy `{endpoint}` rejected: {e}")))?;
    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }
    Ok(proxy)
}

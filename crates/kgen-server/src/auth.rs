use std::net::IpAddr;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::resolver::ReverseResolver;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Why a caller was refused a join command. The `Display` text is the
/// response body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenialReason {
    #[error("userip: {0:?} is not IP:port")]
    MalformedPeerAddress(String),

    #[error("Missing header {0}")]
    MissingHeader(String),

    #[error("Invalid IP from http header {header}: {value}")]
    InvalidHeaderIp { header: String, value: String },

    /// `addr` is the address as the client presented it, before
    /// canonicalisation.
    #[error("Host FQDN found for {addr} didn't match validation condition ({pattern}).")]
    NoMatchingHost { addr: String, pattern: String },
}

/// Rejected at startup, before the listener is bound.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid validation pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("invalid source IP header name {0:?}")]
    InvalidHeader(String),
}

// ── Policy ───────────────────────────────────────────────────────────────────

/// Immutable authorization settings, built once from configuration.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    use_header: bool,
    header: HeaderName,
    /// Header name as the operator spelled it, for messages.
    header_label: String,
    pattern: Regex,
}

impl AuthPolicy {
    pub fn new(use_header: bool, header: &str, pattern: &str) -> Result<Self, ConfigError> {
        let pattern = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })?;
        let header_name = HeaderName::from_bytes(header.as_bytes())
            .map_err(|_| ConfigError::InvalidHeader(header.to_owned()))?;

        Ok(Self {
            use_header,
            header: header_name,
            header_label: header.to_owned(),
            pattern,
        })
    }

    pub fn uses_header(&self) -> bool {
        self.use_header
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Picks the address to verify: the transport peer, or the configured
    /// proxy header when header mode is on.
    pub fn source_ip(&self, peer: &str, headers: &HeaderMap) -> Result<IpAddr, DenialReason> {
        self.source(peer, headers).map(|(ip, _)| ip)
    }

    /// Parsed source address plus its raw text.
    fn source<'a>(
        &self,
        peer: &'a str,
        headers: &'a HeaderMap,
    ) -> Result<(IpAddr, &'a str), DenialReason> {
        if !self.use_header {
            return split_host_port(peer)
                .and_then(|(host, _)| Some((host.parse().ok()?, host)))
                .ok_or_else(|| DenialReason::MalformedPeerAddress(peer.to_owned()));
        }

        let value = match headers.get(&self.header) {
            Some(v) if !v.is_empty() => v,
            _ => return Err(DenialReason::MissingHeader(self.header_label.clone())),
        };

        value
            .to_str()
            .ok()
            .and_then(|v| Some((v.parse().ok()?, v)))
            .ok_or_else(|| DenialReason::InvalidHeaderIp {
                header: self.header_label.clone(),
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            })
    }

    /// First candidate, in the order given, that satisfies the pattern.
    pub fn matching_host<'a>(&self, candidates: &'a [String]) -> Option<&'a str> {
        candidates.iter().map(String::as_str).find(|host| {
            let matched = self.pattern.is_match(host);
            debug!(host, matched, pattern = %self.pattern, "checking PTR candidate");
            matched
        })
    }
}

/// Splits `host:port` or `[v6-host]:port`. A missing port, a stray colon in
/// an unbracketed host, or unbalanced brackets yield `None`.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        if port.contains([':', '[', ']']) {
            return None;
        }
        return Some((host, port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    if host.contains([':', '[', ']']) || port.contains([']', '[']) {
        return None;
    }
    Some((host, port))
}

// ── Authorizer ───────────────────────────────────────────────────────────────

/// Decides whether a caller may receive a join command.
#[derive(Clone)]
pub struct Authorizer {
    policy: Arc<AuthPolicy>,
    resolver: Arc<dyn ReverseResolver>,
}

impl Authorizer {
    pub fn new(policy: AuthPolicy, resolver: Arc<dyn ReverseResolver>) -> Self {
        Self {
            policy: Arc::new(policy),
            resolver,
        }
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    /// Returns the verified source address on success.
    ///
    /// Resolver failures count as "no hostnames": the request is denied
    /// with [`DenialReason::NoMatchingHost`] rather than erroring out.
    pub async fn authorize(&self, peer: &str, headers: &HeaderMap) -> Result<IpAddr, DenialReason> {
        let (ip, raw) = self.policy.source(peer, headers).inspect_err(|reason| {
            warn!(peer, %reason, "rejected client address");
        })?;

        let candidates = match self.resolver.reverse_lookup(ip).await {
            Ok(names) => names,
            Err(e) => {
                debug!(%ip, error = %e, "reverse lookup failed; treating as no hostnames");
                Vec::new()
            }
        };

        match self.policy.matching_host(&candidates) {
            Some(host) => {
                debug!(%ip, host, "client authorized");
                Ok(ip)
            }
            None => {
                warn!(%ip, candidates = ?candidates, pattern = %self.policy.pattern, "no PTR record matched");
                Err(DenialReason::NoMatchingHost {
                    addr: raw.to_owned(),
                    pattern: self.policy.pattern().to_owned(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::http::HeaderValue;

    use super::*;

    struct StaticResolver(HashMap<IpAddr, Vec<String>>);

    impl StaticResolver {
        fn with(ip: &str, names: &[&str]) -> Arc<Self> {
            let mut map = HashMap::new();
            map.insert(
                ip.parse().unwrap(),
                names.iter().map(|n| n.to_string()).collect(),
            );
            Arc::new(Self(map))
        }
    }

    #[async_trait::async_trait]
    impl ReverseResolver for StaticResolver {
        async fn reverse_lookup(&self, ip: IpAddr) -> anyhow::Result<Vec<String>> {
            Ok(self.0.get(&ip).cloned().unwrap_or_default())
        }
    }

    struct FailingResolver;

    #[async_trait::async_trait]
    impl ReverseResolver for FailingResolver {
        async fn reverse_lookup(&self, _ip: IpAddr) -> anyhow::Result<Vec<String>> {
            anyhow::bail!("SERVFAIL")
        }
    }

    fn peer_policy(pattern: &str) -> AuthPolicy {
        AuthPolicy::new(false, "X-Forwarding-for", pattern).unwrap()
    }

    fn header_policy() -> AuthPolicy {
        AuthPolicy::new(true, "X-Forwarding-for", "^.*$").unwrap()
    }

    // ── split_host_port ──────────────────────────────────────────────────

    #[test]
    fn splits_ipv4_and_bracketed_ipv6() {
        assert_eq!(split_host_port("10.0.0.1:80"), Some(("10.0.0.1", "80")));
        assert_eq!(split_host_port("[::1]:8080"), Some(("::1", "8080")));
        assert_eq!(split_host_port("node-1:22"), Some(("node-1", "22")));
    }

    #[test]
    fn rejects_addresses_without_port() {
        for addr in ["10.0.0.1", "::1", "[::1]", "node-1", "", "[::1]:80:90"] {
            assert_eq!(split_host_port(addr), None, "{addr}");
        }
    }

    // ── source_ip ────────────────────────────────────────────────────────

    #[test]
    fn peer_without_port_is_malformed() {
        let policy = peer_policy("^.*$");
        for peer in ["10.0.0.1", "::1", "localhost", ""] {
            let err = policy.source_ip(peer, &HeaderMap::new()).unwrap_err();
            assert_eq!(err, DenialReason::MalformedPeerAddress(peer.to_owned()));
        }
    }

    #[test]
    fn peer_host_must_be_an_ip() {
        let err = peer_policy("^.*$")
            .source_ip("example.com:443", &HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, DenialReason::MalformedPeerAddress(_)));
        assert_eq!(err.to_string(), r#"userip: "example.com:443" is not IP:port"#);
    }

    #[test]
    fn peer_mode_ignores_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarding-for", HeaderValue::from_static("192.0.2.9"));
        let ip = peer_policy("^.*$")
            .source_ip("[2001:db8::7]:5000", &headers)
            .unwrap();
        assert_eq!(ip, "2001:db8::7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn header_mode_missing_header_regardless_of_peer() {
        let policy = header_policy();
        for peer in ["10.0.0.1:1234", "garbage", ""] {
            let err = policy.source_ip(peer, &HeaderMap::new()).unwrap_err();
            assert_eq!(err, DenialReason::MissingHeader("X-Forwarding-for".into()));
        }
    }

    #[test]
    fn header_mode_empty_header_is_missing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarding-for", HeaderValue::from_static(""));
        let err = header_policy().source_ip("10.0.0.1:1", &headers).unwrap_err();
        assert!(matches!(err, DenialReason::MissingHeader(_)));
    }

    #[test]
    fn header_mode_invalid_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarding-for",
            HeaderValue::from_static("10.0.0.1, 10.0.0.2"),
        );
        let err = header_policy().source_ip("10.0.0.1:1", &headers).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid IP from http header X-Forwarding-for: 10.0.0.1, 10.0.0.2"
        );
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(b"X-FORWARDING-FOR").unwrap(),
            HeaderValue::from_static("198.51.100.4"),
        );
        let ip = header_policy().source_ip("bogus", &headers).unwrap();
        assert_eq!(ip, "198.51.100.4".parse::<IpAddr>().unwrap());
    }

    // ── configuration ────────────────────────────────────────────────────

    #[test]
    fn invalid_pattern_rejected_at_construction() {
        let err = AuthPolicy::new(false, "X-Forwarding-for", "(unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn invalid_header_name_rejected_at_construction() {
        let err = AuthPolicy::new(true, "bad header", "^.*$").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHeader(_)));
    }

    #[test]
    fn matching_host_returns_first_match_in_order() {
        let policy = peer_policy(r"\.example\.com$");
        let names = vec![
            "a.other.net".to_string(),
            "b.example.com".to_string(),
            "c.example.com".to_string(),
        ];
        assert_eq!(policy.matching_host(&names), Some("b.example.com"));
    }

    // ── authorize ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn second_candidate_can_match() {
        let resolver = StaticResolver::with("10.1.2.3", &["a.example.com", "b.test.org"]);
        let authorizer = Authorizer::new(peer_policy(r"^.*\.test\.org$"), resolver);

        let ip = authorizer
            .authorize("10.1.2.3:40000", &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn no_ptr_records_never_matches() {
        let resolver = StaticResolver::with("10.1.2.3", &[]);
        let authorizer = Authorizer::new(peer_policy("^.*$"), resolver);

        let err = authorizer
            .authorize("10.1.2.3:40000", &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DenialReason::NoMatchingHost {
                addr: "10.1.2.3".into(),
                pattern: "^.*$".into(),
            }
        );
    }

    #[tokio::test]
    async fn resolver_failure_is_a_denial_not_an_error() {
        let authorizer = Authorizer::new(peer_policy("^.*$"), Arc::new(FailingResolver));

        let err = authorizer
            .authorize("10.1.2.3:40000", &HeaderMap::new())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("10.1.2.3"), "{msg}");
        assert!(msg.contains("^.*$"), "{msg}");
    }

    #[tokio::test]
    async fn header_mode_resolves_the_header_address() {
        let resolver = StaticResolver::with("192.0.2.50", &["worker-7.k8s.lan."]);
        let policy = AuthPolicy::new(true, "X-Real-IP", r"^worker-\d+\.k8s\.lan\.$").unwrap();
        let authorizer = Authorizer::new(policy, resolver);

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.50"));

        let ip = authorizer.authorize("127.0.0.1:9000", &headers).await.unwrap();
        assert_eq!(ip, "192.0.2.50".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn denial_echoes_the_header_text_as_sent() {
        let resolver = StaticResolver::with("::ffff:192.0.2.1", &["laptop.example.com."]);
        let policy = AuthPolicy::new(true, "X-Forwarding-for", r"\.k8s\.lan\.$").unwrap();
        let authorizer = Authorizer::new(policy, resolver);

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarding-for", HeaderValue::from_static("::FFFF:192.0.2.1"));

        let err = authorizer.authorize("10.0.0.1:1", &headers).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            r"Host FQDN found for ::FFFF:192.0.2.1 didn't match validation condition (\.k8s\.lan\.$)."
        );
    }
}

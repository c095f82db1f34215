use std::collections::HashMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::Value;

use crate::scope::ScopeKind;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Principal {
    #[default]
    Anonymous,
    Authenticated {
        subject: String,
        /// Raw scope key the principal belongs to, if any.
        affiliation: Option<String>,
    },
}

impl Principal {
    pub fn authenticated(subject: impl Into<String>) -> Self {
        Principal::Authenticated {
            subject: subject.into(),
            affiliation: None,
        }
    }

    pub fn affiliated(subject: impl Into<String>, scope: impl Into<String>) -> Self {
        Principal::Authenticated {
            subject: subject.into(),
            affiliation: Some(scope.into()),
        }
    }

    pub fn affiliation(&self) -> Option<&str> {
        match self {
            Principal::Anonymous => None,
            Principal::Authenticated { affiliation, .. } => affiliation.as_deref(),
        }
    }
}

/// Everything the extractor may look at.
#[derive(Clone, Debug, Default)]
pub struct RequestParts {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
    pub host: Option<String>,
    pub session_value: Option<String>,
    pub principal: Principal,
}

impl RequestParts {
    pub fn builder() -> RequestPartsBuilder {
        RequestPartsBuilder::default()
    }

    fn is_write(&self) -> bool {
        matches!(self.method, Method::POST | Method::PUT | Method::PATCH)
    }
}

#[derive(Default)]
pub struct RequestPartsBuilder {
    parts: RequestParts,
}

impl RequestPartsBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.parts.method = method;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.parts.path = path.into();
        self
    }

    /// Invalid header names or values are skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.parts.headers.insert(name, value);
        }
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.parts.headers = headers;
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.query.insert(key.into(), value.into());
        self
    }

    pub fn query_map(mut self, query: HashMap<String, String>) -> Self {
        self.parts.query = query;
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.parts.body = Some(body);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.parts.host = Some(host.into());
        self
    }

    pub fn session_value(mut self, value: impl Into<String>) -> Self {
        self.parts.session_value = Some(value.into());
        self
    }

    pub fn principal(mut self, principal: Principal) -> Self {
        self.parts.principal = principal;
        self
    }

    pub fn build(self) -> RequestParts {
        self.parts
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateSource {
    Header,
    Query,
    Body,
    /// Value is a catalog slug rather than a key.
    Host,
    Session,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub source: CandidateSource,
    pub value: String,
}

impl Candidate {
    pub fn new(source: CandidateSource, value: impl Into<String>) -> Self {
        Self {
            source,
            value: value.into(),
        }
    }
}

/// Maps `<slug>.<base domain>` host names onto catalog slugs.
#[derive(Clone, Debug, Default)]
pub struct HostMapping {
    base_domain: Option<String>,
}

impl HostMapping {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn base_domain(domain: impl Into<String>) -> Self {
        let domain = domain.into().trim().trim_matches('.').to_ascii_lowercase();
        Self {
            base_domain: (!domain.is_empty()).then_some(domain),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.base_domain.is_some()
    }

    pub fn subdomain(&self, host: &str) -> Option<String> {
        let base = self.base_domain.as_deref()?;
        let host = host.trim().to_ascii_lowercase();
        let host = match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
            _ => host,
        };
        let host = host.trim_end_matches('.');
        let label = host.strip_suffix(base)?.strip_suffix('.')?;
        if label.is_empty() || label.contains('.') || label == "www" {
            return None;
        }
        Some(label.to_string())
    }
}

/// Picks the request's candidate identity for scope `K`.
///
/// Sources in priority order: header, query parameter, JSON body field (write
/// requests only), host-derived slug, stored session value. The first
/// non-empty value wins. A header that is not visible ASCII still wins; its
/// escaped bytes never parse as an id.
pub fn extract_candidate<K: ScopeKind>(
    parts: &RequestParts,
    hosts: &HostMapping,
) -> Option<Candidate> {
    if let Some(raw) = parts.headers.get(K::HEADER) {
        match raw.to_str() {
            Ok(value) => {
                if let Some(value) = non_empty(Some(value)) {
                    return Some(Candidate::new(CandidateSource::Header, value));
                }
            }
            Err(_) => {
                let escaped = raw.as_bytes().escape_ascii().to_string();
                return Some(Candidate::new(CandidateSource::Header, escaped));
            }
        }
    }

    if let Some(value) = non_empty(parts.query.get(K::PARAM).map(String::as_str)) {
        return Some(Candidate::new(CandidateSource::Query, value));
    }

    if parts.is_write() {
        if let Some(value) = body_field(parts.body.as_ref(), K::PARAM) {
            return Some(Candidate::new(CandidateSource::Body, value));
        }
    }

    if let Some(slug) = parts
        .host
        .as_deref()
        .and_then(|host| hosts.subdomain(host))
    {
        return Some(Candidate::new(CandidateSource::Host, slug));
    }

    non_empty(parts.session_value.as_deref())
        .map(|value| Candidate::new(CandidateSource::Session, value))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn body_field(body: Option<&Value>, field: &str) -> Option<String> {
    match body?.as_object()?.get(field)? {
        Value::String(s) => non_empty(Some(s)).map(str::to_string),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

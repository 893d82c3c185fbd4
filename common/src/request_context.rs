use std::future::Future;

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, StatusCode, request::Parts};
use serde::{Deserialize, Serialize};

/// Caller identity attached to every request. The transport in front of the
/// engine is expected to have authenticated the caller already; here we only
/// carry the resolved identity through the façade and into action records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestContext {
    pub user: String,
    pub project: String,
    pub domain: String,
    pub is_admin: bool,
    /// Delegated credential identifier, when the caller acts through a trust.
    pub trusts: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };
        let is_admin = matches!(
            get("x-auth-is-admin").to_lowercase().as_str(),
            "1" | "t" | "true" | "yes"
        );
        let trusts = {
            let t = get("x-auth-trust");
            if t.is_empty() { None } else { Some(t) }
        };
        RequestContext {
            user: get("x-auth-user"),
            project: get("x-auth-project"),
            domain: get("x-auth-domain"),
            is_admin,
            trusts,
        }
    }

    /// Context for work the engine performs on its own behalf (recovery,
    /// derived actions replayed after restart).
    pub fn service_context() -> Self {
        RequestContext {
            user: "drover-engine".into(),
            project: "service".into(),
            domain: String::new(),
            is_admin: true,
            trusts: None,
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let ctx = RequestContext::from_headers(&parts.headers);
        async move { Ok(ctx) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_auth_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-auth-user", "alice".parse().unwrap());
        headers.insert("x-auth-project", "p1".parse().unwrap());
        headers.insert("x-auth-is-admin", "true".parse().unwrap());
        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.user, "alice");
        assert_eq!(ctx.project, "p1");
        assert!(ctx.is_admin);
        assert!(ctx.trusts.is_none());
    }

    #[test]
    fn missing_headers_default_to_anonymous() {
        let ctx = RequestContext::from_headers(&HeaderMap::new());
        assert_eq!(ctx.user, "");
        assert!(!ctx.is_admin);
    }
}

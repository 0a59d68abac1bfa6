//! API-key authentication and CORS policy.
//!
//! Configuration problems are reported as warnings when the guard is built
//! and never block startup. The API-key check itself runs on every request
//! except CORS preflights.

use std::{fmt, sync::Arc};

use axum::{
    extract::{Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::{
    error::TransportError,
    http::{LAST_EVENT_ID_HEADER, SESSION_ID_HEADER},
};

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Keys shorter than this draw a warning.
pub const MIN_API_KEY_LENGTH: usize = 32;

const PLACEHOLDER_PATTERNS: &[&str] = &[
    "changeme",
    "change-me",
    "your-api-key",
    "your_api_key",
    "placeholder",
    "example",
    "secret",
    "password",
    "test",
    "default",
    "xxx",
];

const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "[::1]"];

/// Allowed CORS origins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CorsOrigins {
    #[default]
    Any,
    List(Vec<String>),
}

impl CorsOrigins {
    /// Build from configured values. A lone `"*"` means any origin.
    #[must_use]
    pub fn from_values(values: Vec<String>) -> Self {
        match values.as_slice() {
            [only] if only == "*" => Self::Any,
            _ => Self::List(values),
        }
    }
}

/// Security settings.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    /// Expected API key. `None` or empty disables authentication.
    pub api_key: Option<String>,
    pub cors_origins: CorsOrigins,
    pub cors_credentials: bool,
    /// Enables the HTTPS-origin check.
    pub production: bool,
}

/// A configuration problem found at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityWarning {
    MissingApiKey,
    ShortApiKey { length: usize },
    PlaceholderApiKey { pattern: &'static str },
    WildcardOrigin,
    WildcardInOriginList,
    InsecureOrigin { origin: String },
    CredentialsWithWildcard,
}

impl SecurityWarning {
    /// Whether the warning means the endpoint is effectively unprotected.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::MissingApiKey)
    }
}

impl fmt::Display for SecurityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingApiKey => {
                f.write_str("No API key configured, authentication is DISABLED")
            }
            Self::ShortApiKey { length } => write!(
                f,
                "API key is {length} characters, at least {MIN_API_KEY_LENGTH} recommended"
            ),
            Self::PlaceholderApiKey { pattern } => {
                write!(f, "API key looks like a placeholder (contains \"{pattern}\")")
            }
            Self::WildcardOrigin => f.write_str("CORS allows any origin (\"*\")"),
            Self::WildcardInOriginList => f.write_str("CORS origin list contains a wildcard"),
            Self::InsecureOrigin { origin } => {
                write!(f, "CORS origin {origin} is neither HTTPS nor local")
            }
            Self::CredentialsWithWildcard => f.write_str(
                "CORS credentials cannot be combined with a wildcard origin, credentials disabled",
            ),
        }
    }
}

/// Validates configuration and enforces the API key.
#[derive(Debug)]
pub struct SecurityGuard {
    api_key: Option<String>,
    config: SecurityConfig,
    warnings: Vec<SecurityWarning>,
}

impl SecurityGuard {
    /// Build the guard, logging every configuration warning.
    #[must_use]
    pub fn new(config: SecurityConfig) -> Self {
        let warnings = validate(&config);
        for warning in &warnings {
            if warning.is_critical() {
                tracing::error!("SECURITY: {warning}");
            } else {
                tracing::warn!("SECURITY: {warning}");
            }
        }

        let api_key = config.api_key.clone().filter(|k| !k.is_empty());
        Self {
            api_key,
            config,
            warnings,
        }
    }

    /// Warnings found at construction.
    #[must_use]
    pub fn warnings(&self) -> &[SecurityWarning] {
        &self.warnings
    }

    /// Whether requests must carry the API key.
    #[must_use]
    pub const fn auth_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Check the API key header of a request.
    ///
    /// # Errors
    /// Returns `Unauthorized` when the key is missing or wrong.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), TransportError> {
        let Some(expected) = &self.api_key else {
            return Ok(());
        };
        let provided = headers
            .get(API_KEY_HEADER)
            .ok_or(TransportError::Unauthorized("missing API key"))?;

        if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(TransportError::Unauthorized("invalid API key"))
        }
    }

    /// CORS layer for the configured origins.
    #[must_use]
    pub fn cors_layer(&self) -> CorsLayer {
        let layer = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                CONTENT_TYPE,
                ACCEPT,
                AUTHORIZATION,
                HeaderName::from_static(API_KEY_HEADER),
                HeaderName::from_static(SESSION_ID_HEADER),
                HeaderName::from_static(LAST_EVENT_ID_HEADER),
            ])
            .expose_headers([HeaderName::from_static(SESSION_ID_HEADER)]);

        let origins = match &self.config.cors_origins {
            CorsOrigins::List(list) if !list.iter().any(|o| o == "*") => list,
            _ => return layer.allow_origin(AllowOrigin::any()),
        };

        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();

        layer
            .allow_origin(AllowOrigin::list(values))
            .allow_credentials(self.config.cors_credentials)
    }
}

/// Reject requests without a valid API key. Preflights pass through.
pub async fn require_api_key(
    State(guard): State<Arc<SecurityGuard>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if let Err(e) = guard.check(request.headers()) {
        tracing::warn!(uri = %request.uri(), error = %e, "Rejected unauthenticated request");
        return e.into_response();
    }
    next.run(request).await
}

fn validate(config: &SecurityConfig) -> Vec<SecurityWarning> {
    let mut warnings = Vec::new();

    match config.api_key.as_deref() {
        None | Some("") => warnings.push(SecurityWarning::MissingApiKey),
        Some(key) => {
            if key.len() < MIN_API_KEY_LENGTH {
                warnings.push(SecurityWarning::ShortApiKey { length: key.len() });
            }
            let lowered = key.to_ascii_lowercase();
            let placeholder = PLACEHOLDER_PATTERNS
                .iter()
                .copied()
                .find(|p| lowered.contains(p));
            if let Some(pattern) = placeholder {
                warnings.push(SecurityWarning::PlaceholderApiKey { pattern });
            }
        }
    }

    let wildcard = match &config.cors_origins {
        CorsOrigins::Any => {
            warnings.push(SecurityWarning::WildcardOrigin);
            true
        }
        CorsOrigins::List(list) => {
            let wildcard = list.iter().any(|o| o.contains('*'));
            if wildcard {
                warnings.push(SecurityWarning::WildcardInOriginList);
            }
            if config.production {
                warnings.extend(
                    list.iter()
                        .filter(|o| !o.contains('*') && !is_secure_origin(o))
                        .map(|o| SecurityWarning::InsecureOrigin { origin: o.clone() }),
                );
            }
            list.iter().any(|o| o == "*")
        }
    };
    if wildcard && config.cors_credentials {
        warnings.push(SecurityWarning::CredentialsWithWildcard);
    }

    warnings
}

fn is_secure_origin(origin: &str) -> bool {
    if origin.starts_with("https://") {
        return true;
    }
    let Some(rest) = origin.strip_prefix("http://") else {
        return false;
    };
    let host = if rest.starts_with('[') {
        rest.find(']').map_or(rest, |end| &rest[..=end])
    } else {
        rest.split(|c| c == ':' || c == '/').next().unwrap_or(rest)
    };
    LOCAL_HOSTS.contains(&host)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

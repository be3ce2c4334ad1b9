//! Authentication providers.
//!
//! An [`AuthProvider`] decorates an outgoing [`WireRequest`] in place, by
//! adding headers or query parameters. It never touches the body.
//!
//! ```rust
//! use httpc::auth::{ApiKeyAuth, ApiKeyLocation, AuthProvider, BasicAuth};
//!
//! let api_key = ApiKeyAuth::new("sekret", ApiKeyLocation::Query, "api_key");
//! assert_eq!(api_key.name(), "api-key-query:api_key");
//!
//! let basic = BasicAuth::new("demo", "hunter2");
//! assert_eq!(basic.name(), "basic");
//! ```

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use http::header::AUTHORIZATION;
use http::{HeaderName, HeaderValue};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AuthError;
use crate::request::WireRequest;

/// Prefix marking key material that should be read from a file.
pub const FILE_PREFIX: &str = "file:";

/// Capability to authenticate an outgoing request.
pub trait AuthProvider: Send + Sync {
    /// Add credentials to the request.
    fn apply(&self, request: &mut WireRequest) -> Result<(), AuthError>;

    /// Short identifier of the provider, for logs.
    fn name(&self) -> String;
}

impl<F> AuthProvider for F
where
    F: Fn(&mut WireRequest) -> Result<(), AuthError> + Send + Sync,
{
    fn apply(&self, request: &mut WireRequest) -> Result<(), AuthError> {
        self(request)
    }

    fn name(&self) -> String {
        "provider-func".to_string()
    }
}

fn set_header(request: &mut WireRequest, name: HeaderName, value: &str) -> Result<(), AuthError> {
    let mut value =
        HeaderValue::from_str(value).map_err(|e| AuthError::InvalidHeader(e.to_string()))?;
    value.set_sensitive(true);
    request.headers_mut().insert(name, value);
    Ok(())
}

// ============================================================================
// API key
// ============================================================================

/// Where an API key is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    /// As a request header.
    #[default]
    Header,
    /// As a query parameter.
    Query,
}

impl FromStr for ApiKeyLocation {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "header" | "" => Ok(Self::Header),
            "query" => Ok(Self::Query),
            other => Err(AuthError::UnsupportedLocation(other.to_string())),
        }
    }
}

/// Default API key header name.
pub const DEFAULT_API_KEY_NAME: &str = "X-API-Key";

/// Injects a fixed secret as a header or query parameter.
#[derive(Clone)]
pub struct ApiKeyAuth {
    key: String,
    location: ApiKeyLocation,
    name: String,
}

impl ApiKeyAuth {
    /// Create an API key provider. An empty `name` falls back to `X-API-Key`.
    pub fn new(key: impl Into<String>, location: ApiKeyLocation, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: key.into(),
            location,
            name: if name.is_empty() {
                DEFAULT_API_KEY_NAME.to_string()
            } else {
                name
            },
        }
    }

    /// Header-placed key under `X-API-Key`.
    pub fn header(key: impl Into<String>) -> Self {
        Self::new(key, ApiKeyLocation::Header, DEFAULT_API_KEY_NAME)
    }
}

impl AuthProvider for ApiKeyAuth {
    fn apply(&self, request: &mut WireRequest) -> Result<(), AuthError> {
        if self.key.is_empty() {
            return Err(AuthError::EmptyApiKey);
        }

        match self.location {
            ApiKeyLocation::Query => {
                let url = request.url_mut();
                let retained: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| k != self.name.as_str())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                url.query_pairs_mut()
                    .clear()
                    .extend_pairs(retained)
                    .append_pair(&self.name, &self.key);
            }
            ApiKeyLocation::Header => {
                let name = HeaderName::from_bytes(self.name.as_bytes())
                    .map_err(|e| AuthError::InvalidHeader(e.to_string()))?;
                set_header(request, name, &self.key)?;
            }
        }

        Ok(())
    }

    fn name(&self) -> String {
        match self.location {
            ApiKeyLocation::Query => format!("api-key-query:{}", self.name),
            ApiKeyLocation::Header => format!("api-key-header:{}", self.name),
        }
    }
}

impl fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("location", &self.location)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Basic
// ============================================================================

/// HTTP Basic credentials.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    /// Create a basic auth provider.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl AuthProvider for BasicAuth {
    fn apply(&self, request: &mut WireRequest) -> Result<(), AuthError> {
        if self.username.is_empty() {
            return Err(AuthError::MissingUsername);
        }
        let credentials = STANDARD.encode(format!("{}:{}", self.username, self.password));
        set_header(request, AUTHORIZATION, &format!("Basic {credentials}"))
    }

    fn name(&self) -> String {
        "basic".to_string()
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// JWT
// ============================================================================

/// Signing algorithms supported by [`JwtAuth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JwtAlgorithm {
    /// HMAC with SHA-256, shared secret.
    HS256,
    /// RSASSA-PKCS1-v1_5 with SHA-256, private key.
    #[default]
    RS256,
}

impl JwtAlgorithm {
    /// Algorithm name as it appears in the token header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HS256 => "HS256",
            Self::RS256 => "RS256",
        }
    }

    fn algorithm(&self) -> Algorithm {
        match self {
            Self::HS256 => Algorithm::HS256,
            Self::RS256 => Algorithm::RS256,
        }
    }
}

impl FromStr for JwtAlgorithm {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HS256" => Ok(Self::HS256),
            "RS256" | "" => Ok(Self::RS256),
            other => Err(AuthError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for JwtAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JWT provider options.
#[derive(Clone, Default)]
pub struct JwtOptions {
    /// Signing algorithm.
    pub algorithm: JwtAlgorithm,
    /// `iss` claim.
    pub issuer: Option<String>,
    /// `aud` claim.
    pub audience: Option<String>,
    /// `kid` header.
    pub key_id: Option<String>,
    /// Token lifetime; zero falls back to 60 seconds.
    pub ttl: Duration,
    /// Shared secret for HS256.
    pub hmac_secret: Option<Vec<u8>>,
    /// PEM-encoded RSA private key for RS256.
    pub private_key_pem: Option<Vec<u8>>,
}

impl fmt::Debug for JwtOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtOptions")
            .field("algorithm", &self.algorithm)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("key_id", &self.key_id)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Default JWT lifetime.
pub const DEFAULT_JWT_TTL: Duration = Duration::from_secs(60);

/// Callback mutating claims before signing.
pub type ClaimsMutator = Arc<dyn Fn(&mut Map<String, Value>) + Send + Sync>;

/// Time source for token timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Mints a fresh short-lived bearer token for every request.
#[derive(Clone)]
pub struct JwtAuth {
    algorithm: JwtAlgorithm,
    issuer: Option<String>,
    audience: Option<String>,
    key_id: Option<String>,
    ttl: Duration,
    key: EncodingKey,
    mutators: Vec<ClaimsMutator>,
    clock: Clock,
}

impl JwtAuth {
    /// Create a JWT provider; fails when the algorithm's key material is
    /// missing or unparsable.
    pub fn new(options: JwtOptions) -> Result<Self, AuthError> {
        let key = match options.algorithm {
            JwtAlgorithm::HS256 => {
                let secret = options
                    .hmac_secret
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| AuthError::MissingKeyMaterial("hs256 requires hmac secret".into()))?;
                EncodingKey::from_secret(secret)
            }
            JwtAlgorithm::RS256 => {
                let pem = options
                    .private_key_pem
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| AuthError::MissingKeyMaterial("rs256 requires private key".into()))?;
                EncodingKey::from_rsa_pem(pem).map_err(|e| AuthError::InvalidKey(e.to_string()))?
            }
        };

        Ok(Self {
            algorithm: options.algorithm,
            issuer: options.issuer.filter(|s| !s.is_empty()),
            audience: options.audience.filter(|s| !s.is_empty()),
            key_id: options.key_id.filter(|s| !s.is_empty()),
            ttl: if options.ttl.is_zero() {
                DEFAULT_JWT_TTL
            } else {
                options.ttl
            },
            key,
            mutators: Vec::new(),
            clock: Arc::new(Utc::now),
        })
    }

    /// Register a callback mutating claims prior to signing.
    pub fn with_claims<F>(mut self, mutate: F) -> Self
    where
        F: Fn(&mut Map<String, Value>) + Send + Sync + 'static,
    {
        self.mutators.push(Arc::new(mutate));
        self
    }

    /// Override the time source.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Mint and sign a token.
    pub fn token(&self) -> Result<String, AuthError> {
        let now = (self.clock)();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AuthError::Signing(format!("ttl out of range: {e}")))?;

        let mut claims = Map::new();
        claims.insert("iat".into(), now.timestamp().into());
        claims.insert("exp".into(), (now + ttl).timestamp().into());
        claims.insert("nbf".into(), now.timestamp().into());
        if let Some(issuer) = &self.issuer {
            claims.insert("iss".into(), issuer.clone().into());
        }
        if let Some(audience) = &self.audience {
            claims.insert("aud".into(), audience.clone().into());
        }

        for mutate in &self.mutators {
            mutate(&mut claims);
        }

        if !claims.contains_key("jti") {
            claims.insert("jti".into(), random_jti().into());
        }

        let mut header = Header::new(self.algorithm.algorithm());
        header.kid = self.key_id.clone();

        jsonwebtoken::encode(&header, &claims, &self.key).map_err(|e| AuthError::Signing(e.to_string()))
    }
}

impl AuthProvider for JwtAuth {
    fn apply(&self, request: &mut WireRequest) -> Result<(), AuthError> {
        let token = self.token()?;
        set_header(request, AUTHORIZATION, &format!("Bearer {token}"))
    }

    fn name(&self) -> String {
        format!("jwt:{}", self.algorithm)
    }
}

impl fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuth")
            .field("algorithm", &self.algorithm)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("key_id", &self.key_id)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn random_jti() -> String {
    let mut bytes = [0u8; 18];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Load key material from a literal or a `file:<path>` reference.
pub fn load_key_material(source: &str) -> Result<Vec<u8>, AuthError> {
    match source.strip_prefix(FILE_PREFIX) {
        Some(path) => std::fs::read(path)
            .map_err(|e| AuthError::InvalidKey(format!("read {path}: {e}"))),
        None => Ok(source.as_bytes().to_vec()),
    }
}

// ============================================================================
// Selection from settings
// ============================================================================

/// API key credentials as configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApiKeySettings {
    /// Secret.
    pub key: String,
    /// `header` or `query`.
    #[serde(rename = "in")]
    pub location: String,
    /// Header or query parameter name.
    pub name: String,
}

/// Basic credentials as configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BasicSettings {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

/// JWT settings as configured.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JwtSettings {
    /// `HS256` or `RS256`.
    pub alg: String,
    /// `iss` claim.
    pub issuer: String,
    /// `aud` claim.
    pub audience: String,
    /// `kid` header.
    pub kid: String,
    /// Token lifetime.
    #[serde(deserialize_with = "crate::settings::deserialize_duration")]
    pub ttl: Duration,
    /// HMAC secret, literal or `file:<path>`.
    pub hmac_secret: String,
    /// RSA private key PEM, literal or `file:<path>`.
    pub private_pem: String,
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            alg: "RS256".to_string(),
            issuer: String::new(),
            audience: String::new(),
            kid: String::new(),
            ttl: DEFAULT_JWT_TTL,
            hmac_secret: String::new(),
            private_pem: String::new(),
        }
    }
}

/// Credentials from which a default provider may be selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// API key settings.
    pub api_key: ApiKeySettings,
    /// Basic settings.
    pub basic: BasicSettings,
    /// JWT settings.
    pub jwt: JwtSettings,
}

impl Credentials {
    /// Select a provider: API key, then basic, then JWT; `None` when no
    /// credential is configured.
    pub fn provider(&self) -> Result<Option<Arc<dyn AuthProvider>>, AuthError> {
        if !self.api_key.key.is_empty() {
            let location = self.api_key.location.parse::<ApiKeyLocation>()?;
            return Ok(Some(Arc::new(ApiKeyAuth::new(
                self.api_key.key.clone(),
                location,
                self.api_key.name.clone(),
            ))));
        }

        if !self.basic.username.is_empty() {
            return Ok(Some(Arc::new(BasicAuth::new(
                self.basic.username.clone(),
                self.basic.password.clone(),
            ))));
        }

        let jwt = &self.jwt;
        if !jwt.alg.is_empty() && (!jwt.hmac_secret.is_empty() || !jwt.private_pem.is_empty()) {
            let algorithm = jwt.alg.parse::<JwtAlgorithm>()?;
            let mut options = JwtOptions {
                algorithm,
                issuer: Some(jwt.issuer.clone()),
                audience: Some(jwt.audience.clone()),
                key_id: Some(jwt.kid.clone()),
                ttl: jwt.ttl,
                ..Default::default()
            };
            match algorithm {
                JwtAlgorithm::HS256 => {
                    options.hmac_secret = Some(load_key_material(&jwt.hmac_secret)?);
                }
                JwtAlgorithm::RS256 => {
                    if jwt.private_pem.is_empty() {
                        return Err(AuthError::MissingKeyMaterial(
                            "jwt private_pem is required for rs256".into(),
                        ));
                    }
                    options.private_key_pem = Some(load_key_material(&jwt.private_pem)?);
                }
            }
            return Ok(Some(Arc::new(JwtAuth::new(options)?)));
        }

        Ok(None)
    }
}

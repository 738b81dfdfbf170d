// Session management: login, token refresh and endpoint dispatch
use crate::auth::{
    pkce, Authenticator, BrowserAuthenticator, CacheEntry, SsoClient, TokenCache,
};
use crate::auth::sso::{self, Callback, SSO_BASE_URL};
use crate::endpoints::{substitute_path_vars, Content, EndpointTable};
use crate::error::{Result, TeslaError};
use crate::models::{OwnerApiToken, SsoToken};
use crate::products::{Battery, SolarPanel, Vehicle};
use reqwest::blocking::{Client, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};
use url::Url;

pub const API_BASE_URL: &str = "https://owner-api.teslamotors.com/";

/// Token state guarded by one mutex so check-expiry, refresh and bearer
/// attachment form a single critical section.
struct AuthState {
    sso_base: Url,
    sso_token: Option<SsoToken>,
    owner_token: Option<OwnerApiToken>,
}

/// Session manager for the Owner API.
///
/// Construction loads any cached tokens for the identity before any network
/// activity. `fetch_token` runs the interactive SSO login when needed, and
/// every authenticated `api` call transparently refreshes an expired bearer
/// first. All calls block the calling thread.
pub struct Tesla {
    email: String,
    api_base: Url,
    authenticator: Box<dyn Authenticator>,
    endpoints: EndpointTable,
    cache: TokenCache,
    sso: SsoClient,
    http: Client,
    option_codes: OnceLock<HashMap<String, String>>,
    state: Mutex<AuthState>,
}

impl std::fmt::Debug for Tesla {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tesla")
            .field("email", &self.email)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

pub struct TeslaBuilder {
    email: String,
    authenticator: Option<Box<dyn Authenticator>>,
    cache_file: Option<PathBuf>,
    endpoints: Option<EndpointTable>,
    proxy: Option<String>,
    verify_tls: bool,
}

impl TeslaBuilder {
    /// Install a custom authenticator (embedded web view, browser
    /// automation). The default opens the system browser and prompts the
    /// terminal.
    pub fn authenticator(mut self, authenticator: Box<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn cache_file(mut self, path: PathBuf) -> Self {
        self.cache_file = Some(path);
        self
    }

    /// Replace the bundled endpoint table, e.g. for test isolation.
    pub fn endpoints(mut self, endpoints: EndpointTable) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn proxy(mut self, proxy: &str) -> Self {
        self.proxy = Some(proxy.to_string());
        self
    }

    /// Disable TLS certificate verification, e.g. behind an intercepting
    /// proxy.
    pub fn danger_accept_invalid_certs(mut self) -> Self {
        self.verify_tls = false;
        self
    }

    pub fn build(self) -> Result<Tesla> {
        if self.email.is_empty() {
            return Err(TeslaError::Config("`email` is not set".to_string()));
        }
        let endpoints = match self.endpoints {
            Some(endpoints) => endpoints,
            None => EndpointTable::bundled()?,
        };
        let mut http = Client::builder().danger_accept_invalid_certs(!self.verify_tls);
        if let Some(proxy) = &self.proxy {
            http = http.proxy(reqwest::Proxy::https(proxy)?);
        }
        let cache = TokenCache::new(
            self.cache_file.unwrap_or_else(TokenCache::default_path),
        );

        let mut state = AuthState {
            sso_base: Url::parse(SSO_BASE_URL)?,
            sso_token: None,
            owner_token: None,
        };
        // Cache load happens once, before any network call.
        if let Some(entry) = cache.load(&self.email) {
            if let Some(url) = entry.url.as_deref() {
                state.sso_base = Url::parse(url)?;
            }
            state.sso_token = entry.sso;
            state.owner_token = entry.ownerapi;
            match &state.owner_token {
                Some(token) if token.is_expired() => {
                    tracing::debug!("Cached JWT bearer expired")
                }
                Some(token) => {
                    tracing::debug!("Cached JWT bearer, expires at {}", token.expiration_display())
                }
                None => {}
            }
        }

        Ok(Tesla {
            email: self.email,
            api_base: Url::parse(API_BASE_URL)?,
            authenticator: self
                .authenticator
                .unwrap_or_else(|| Box::new(BrowserAuthenticator)),
            endpoints,
            cache,
            sso: SsoClient::new(self.proxy.as_deref(), self.verify_tls)?,
            http: http.build()?,
            option_codes: OnceLock::new(),
            state: Mutex::new(state),
        })
    }
}

impl Tesla {
    /// Session with default configuration for an identity.
    pub fn new(email: &str) -> Result<Self> {
        Self::builder(email).build()
    }

    pub fn builder(email: &str) -> TeslaBuilder {
        TeslaBuilder {
            email: email.to_string(),
            authenticator: None,
            cache_file: None,
            endpoints: None,
            proxy: None,
            verify_tls: true,
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Whether a backend bearer token is held. Derived state, never set
    /// independently.
    pub fn authorized(&self) -> bool {
        self.state().owner_token.is_some()
    }

    fn state(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sign in through the SSO service and obtain a JWT bearer. A no-op when
    /// already authorized. Blocks on the authenticator while the user
    /// completes the login page.
    pub fn fetch_token(&self) -> Result<()> {
        let mut state = self.state();
        if state.owner_token.is_some() {
            tracing::debug!("Already authorized");
            return Ok(());
        }

        // One verifier per authorization attempt, discarded afterwards.
        let code_verifier = pkce::new_code_verifier();
        let code_challenge = pkce::code_challenge(&code_verifier);
        let csrf_state = uuid::Uuid::new_v4().simple().to_string();

        let mut authorize_url =
            self.sso
                .authorize_url(&state.sso_base, &code_challenge, &csrf_state, &self.email)?;
        // The account may live on a regional mirror; adopt it for the whole
        // flow and all future refreshes.
        if let Some(origin) = self.sso.discover_region(&authorize_url)? {
            state.sso_base = origin;
            authorize_url = self.sso.authorize_url(
                &state.sso_base,
                &code_challenge,
                &csrf_state,
                &self.email,
            )?;
        }

        let callback_url = self.authenticator.get_redirect_url(authorize_url.as_str())?;
        let code = match sso::parse_callback(&callback_url)? {
            Callback::Code(code) => code,
            Callback::MfaTransaction(transaction_id) => {
                self.sso
                    .run_mfa(&state.sso_base, &transaction_id, self.authenticator.as_ref())?
            }
        };

        let sso_token = self
            .sso
            .exchange_code(&state.sso_base, &code, &code_verifier)?;
        let owner_token = self.sso.exchange_jwt(&self.api_base, &sso_token.access_token)?;
        state.sso_token = Some(sso_token);
        state.owner_token = Some(owner_token);
        self.persist(&state);
        Ok(())
    }

    /// Refresh the SSO token and re-run the JWT-bearer exchange. Requires a
    /// previously authorized session holding a refresh token; on any failure
    /// the session is left unauthorized so a stale bearer is never reused.
    pub fn refresh_token(&self) -> Result<()> {
        let mut state = self.state();
        self.refresh_locked(&mut state)
    }

    fn refresh_locked(&self, state: &mut AuthState) -> Result<()> {
        // Drop the old bearer before the round-trip; it only comes back
        // fresh on success.
        state.owner_token = None;
        let refresh_token = state
            .sso_token
            .as_ref()
            .and_then(|token| token.refresh_token.clone())
            .ok_or_else(|| {
                TeslaError::Auth(
                    "Not authenticated and cannot authenticate automatically: \
                     no refresh token held"
                        .to_string(),
                )
            })?;

        let sso_token = self.sso.refresh(&state.sso_base, &refresh_token)?;
        let owner_token = self.sso.exchange_jwt(&self.api_base, &sso_token.access_token)?;
        state.sso_token = Some(sso_token);
        state.owner_token = Some(owner_token);
        self.persist(state);
        Ok(())
    }

    /// Persist this identity's entry. A cache write failure is logged, not
    /// fatal: the session itself is authorized either way.
    fn persist(&self, state: &AuthState) {
        let entry = CacheEntry {
            url: Some(state.sso_base.to_string()),
            sso: state.sso_token.clone(),
            ownerapi: state.owner_token.clone(),
        };
        if let Err(e) = self.cache.store(&self.email, &entry) {
            tracing::error!("Cache not updated: {}", e);
        }
    }

    /// Forget the held tokens and this identity's cache entry. With
    /// `sign_out` the provider's global sign-out page is opened as well.
    pub fn logout(&self, sign_out: bool) -> Result<()> {
        let mut state = self.state();
        if sign_out {
            let url = state.sso_base.join("oauth2/v3/logout")?;
            webbrowser::open(url.as_str())
                .map_err(|e| TeslaError::BrowserLaunchFailed(e.to_string()))?;
        }
        state.sso_token = None;
        state.owner_token = None;
        self.cache.remove(&self.email)
    }

    /// Perform a request against the backend, attaching (and refreshing,
    /// when expired) the bearer token.
    fn request(&self, method: &str, uri: &str, params: Option<&Value>) -> Result<Value> {
        let bearer = {
            let mut state = self.state();
            let expired = state
                .owner_token
                .as_ref()
                .map(|token| token.is_expired())
                .unwrap_or(false);
            if expired {
                tracing::debug!("JWT bearer expired, refreshing");
                self.refresh_locked(&mut state)?;
            }
            state.owner_token.as_ref().map(|t| t.access_token.clone())
        };

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| TeslaError::Config(format!("Invalid HTTP method {}", method)))?;
        let url = self.api_base.join(uri.trim_matches('/'))?;
        tracing::debug!("Requesting url {} using method {}", url, method);

        let mut request = self.http.request(method.clone(), url);
        if let Some(bearer) = bearer {
            request = request.bearer_auth(bearer);
        }
        if let Some(params) = params {
            if method == reqwest::Method::GET {
                request = request.query(&query_pairs(params));
            } else {
                request = request.json(params);
            }
        }
        let response = error_for_status(request.send()?)?;
        Ok(response.json()?)
    }

    /// Perform an API request for a named endpoint, substituting
    /// `{placeholder}` path variables. For GET endpoints `params` become
    /// query parameters, otherwise the JSON request body.
    pub fn api(&self, name: &str, path_vars: &[(&str, &str)], params: Option<Value>) -> Result<Value> {
        let endpoint = self.endpoints.get(name)?;
        if endpoint.content != Content::Json {
            return Err(TeslaError::EndpointNotImplemented(name.to_string()));
        }
        // Lazy, on-demand login.
        if endpoint.auth && !self.authorized() {
            self.fetch_token()?;
        }
        let uri = substitute_path_vars(name, &endpoint.uri, path_vars)?;
        self.request(&endpoint.method, &uri, params.as_ref())
    }

    /// Call a command endpoint and unwrap its `{response: {result, reason}}`
    /// envelope. A logical failure carries the backend's reason verbatim.
    pub fn command(&self, name: &str, path_vars: &[(&str, &str)], params: Option<Value>) -> Result<bool> {
        let data = self.api(name, path_vars, params)?;
        command_result(name, &data)
    }

    /// Raw GET outside the endpoint table, e.g. the image compositor.
    pub(crate) fn get_bytes(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>> {
        let response = self.http.get(url).query(query).send()?;
        let response = error_for_status(response)?;
        Ok(response.bytes()?.to_vec())
    }

    pub(crate) fn option_codes(&self) -> &HashMap<String, String> {
        self.option_codes.get_or_init(|| {
            match serde_json::from_str::<HashMap<String, String>>(include_str!(
                "../option_codes.json"
            )) {
                Ok(codes) => {
                    tracing::debug!("{} option codes loaded", codes.len());
                    codes
                }
                Err(e) => {
                    tracing::error!("No option codes loaded: {}", e);
                    HashMap::new()
                }
            }
        })
    }

    /// List the vehicles on the account.
    pub fn vehicle_list(&self) -> Result<Vec<Vehicle<'_>>> {
        let data = self.api("VEHICLE_LIST", &[], None)?;
        let raw: Vec<serde_json::Map<String, Value>> =
            serde_json::from_value(data.get("response").cloned().unwrap_or_default())?;
        raw.into_iter().map(|v| Vehicle::new(self, v)).collect()
    }

    /// List all products (vehicles, batteries, solar installations) raw.
    pub fn product_list(&self) -> Result<Vec<Value>> {
        let data = self.api("PRODUCT_LIST", &[], None)?;
        Ok(serde_json::from_value(
            data.get("response").cloned().unwrap_or_default(),
        )?)
    }

    /// Battery (powerwall) products on the account.
    pub fn battery_list(&self) -> Result<Vec<Battery<'_>>> {
        self.product_list()?
            .into_iter()
            .filter(|p| p["resource_type"] == "battery")
            .map(|p| match p {
                Value::Object(raw) => Battery::new(self, raw),
                _ => Err(TeslaError::Config("Product is not an object".to_string())),
            })
            .collect()
    }

    /// Solar installations on the account.
    pub fn solar_list(&self) -> Result<Vec<SolarPanel<'_>>> {
        self.product_list()?
            .into_iter()
            .filter(|p| p["resource_type"] == "solar")
            .map(|p| match p {
                Value::Object(raw) => SolarPanel::new(self, raw),
                _ => Err(TeslaError::Config("Product is not an object".to_string())),
            })
            .collect()
    }
}

/// Flatten a params object into query pairs for GET requests.
fn query_pairs(params: &Value) -> Vec<(String, String)> {
    match params {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Unwrap a command endpoint's response envelope.
fn command_result(name: &str, data: &Value) -> Result<bool> {
    let result = data
        .get("response")
        .and_then(|response| response.get("result"))
        .and_then(Value::as_bool);
    match result {
        Some(true) => Ok(true),
        Some(false) => {
            let reason = data["response"]["reason"].as_str().unwrap_or("").to_string();
            Err(TeslaError::Command(reason))
        }
        None => Err(TeslaError::Command(format!(
            "Response of {} doesn't look like a command endpoint",
            name
        ))),
    }
}

/// Raise an `Api` error for 4xx/5xx responses, joining all truthy values of
/// a structured JSON error body into one human-readable reason. Error bodies
/// are heterogeneous key/value documents, not a fixed schema, so this is
/// deliberately best-effort; a non-JSON body is passed through raw.
pub(crate) fn error_for_status(response: Response) -> Result<Response> {
    let status = response.status();
    if !status.is_client_error() && !status.is_server_error() {
        return Ok(response);
    }
    let text = response.text().unwrap_or_default();
    let reason = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => {
            let joined = join_reason(&map);
            if joined.is_empty() {
                text
            } else {
                joined
            }
        }
        _ => text,
    };
    Err(TeslaError::Api {
        status: status.as_u16(),
        reason,
    })
}

/// Join all truthy values of an error document, stripping trailing periods.
fn join_reason(map: &serde_json::Map<String, Value>) -> String {
    let mut parts = Vec::new();
    for value in map.values() {
        let part = match value {
            Value::Null | Value::Bool(false) => continue,
            Value::String(s) if s.is_empty() => continue,
            Value::String(s) => s.clone(),
            Value::Array(a) if a.is_empty() => continue,
            Value::Object(o) if o.is_empty() => continue,
            Value::Number(n) if n.as_f64() == Some(0.0) => continue,
            other => other.to_string(),
        };
        parts.push(part.trim_matches('.').to_string());
    }
    parts.join(". ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockAuthenticator;
    use crate::models::{OwnerApiToken, SsoToken};
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn cache_entry(expired: bool, with_refresh: bool) -> CacheEntry {
        let now = Utc::now().timestamp();
        CacheEntry {
            url: Some(SSO_BASE_URL.to_string()),
            sso: Some(SsoToken {
                access_token: "sso-access".to_string(),
                refresh_token: with_refresh.then(|| "sso-refresh".to_string()),
                id_token: None,
                token_type: "Bearer".to_string(),
                expires_at: now + 300,
            }),
            ownerapi: Some(OwnerApiToken {
                access_token: "api-access".to_string(),
                refresh_token: None,
                token_type: "bearer".to_string(),
                created_at: if expired { now - 3601 } else { now },
                expires_in: 3600,
            }),
        }
    }

    fn cached_session(dir: &TempDir, entry: &CacheEntry) -> Tesla {
        let cache_file = dir.path().join("cache.json");
        TokenCache::new(cache_file.clone())
            .store("owner@example.com", entry)
            .unwrap();
        Tesla::builder("owner@example.com")
            .cache_file(cache_file)
            .authenticator(Box::new(MockAuthenticator::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_empty_email_is_config_error() {
        let err = Tesla::builder("").build().unwrap_err();
        assert!(matches!(err, TeslaError::Config(_)));
    }

    #[test]
    fn test_fresh_session_is_not_authorized() {
        let dir = tempfile::tempdir().unwrap();
        let tesla = Tesla::builder("owner@example.com")
            .cache_file(dir.path().join("cache.json"))
            .authenticator(Box::new(MockAuthenticator::new()))
            .build()
            .unwrap();
        assert!(!tesla.authorized());
    }

    #[test]
    fn test_cached_token_authorizes_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let tesla = cached_session(&dir, &cache_entry(false, true));
        assert!(tesla.authorized());
    }

    #[test]
    fn test_fetch_token_is_idempotent_when_authorized() {
        let dir = tempfile::tempdir().unwrap();
        let tesla = cached_session(&dir, &cache_entry(false, true));
        // The mock authenticator would panic on any interaction; an
        // authorized session must not start a login flow.
        tesla.fetch_token().unwrap();
        assert!(tesla.authorized());
    }

    #[test]
    fn test_unknown_endpoint_name() {
        let dir = tempfile::tempdir().unwrap();
        let tesla = cached_session(&dir, &cache_entry(false, true));
        let err = tesla.api("DOES_NOT_EXIST", &[], None).unwrap_err();
        assert!(matches!(err, TeslaError::Config(_)));
        assert!(err.to_string().contains("DOES_NOT_EXIST"));
    }

    #[test]
    fn test_missing_path_variable() {
        let dir = tempfile::tempdir().unwrap();
        let tesla = cached_session(&dir, &cache_entry(false, true));
        let err = tesla.api("VEHICLE_DATA", &[], None).unwrap_err();
        assert!(matches!(err, TeslaError::Config(_)));
        assert!(err.to_string().contains("vehicle_id"));
    }

    #[test]
    fn test_html_endpoint_not_implemented() {
        let dir = tempfile::tempdir().unwrap();
        let tesla = cached_session(&dir, &cache_entry(false, true));
        let err = tesla.api("STATUS", &[], None).unwrap_err();
        assert!(matches!(err, TeslaError::EndpointNotImplemented(_)));
    }

    #[test]
    fn test_refresh_without_refresh_token_leaves_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let tesla = cached_session(&dir, &cache_entry(true, false));
        assert!(tesla.authorized());
        let err = tesla.refresh_token().unwrap_err();
        assert!(matches!(err, TeslaError::Auth(_)));
        // A failed refresh must never leave a falsely-valid bearer behind.
        assert!(!tesla.authorized());
    }

    #[test]
    fn test_logout_clears_memory_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let tesla = cached_session(&dir, &cache_entry(false, true));
        tesla.logout(false).unwrap();
        assert!(!tesla.authorized());
        assert!(TokenCache::new(dir.path().join("cache.json"))
            .load("owner@example.com")
            .is_none());
    }

    #[test]
    fn test_join_reason_includes_truthy_excludes_empty() {
        let body = json!({
            "error": "invalid_request",
            "error_description": "bad scope.",
            "hint": ""
        });
        let reason = join_reason(body.as_object().unwrap());
        assert!(reason.contains("invalid_request"));
        assert!(reason.contains("bad scope"));
        assert!(!reason.contains("hint"));
        assert!(!reason.contains('{'));
        assert_eq!(reason, "invalid_request. bad scope");
    }

    #[test]
    fn test_join_reason_skips_null_false_and_zero() {
        let body = json!({
            "a": null, "b": false, "c": 0, "d": "kept", "e": 503
        });
        assert_eq!(join_reason(body.as_object().unwrap()), "kept. 503");
    }

    #[test]
    fn test_command_result_failure_carries_reason() {
        let data = json!({"response": {"result": false, "reason": "vehicle_unavailable"}});
        let err = command_result("HONK_HORN", &data).unwrap_err();
        match err {
            TeslaError::Command(reason) => assert_eq!(reason, "vehicle_unavailable"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_command_result_success() {
        let data = json!({"response": {"result": true}});
        assert!(command_result("HONK_HORN", &data).unwrap());
    }

    #[test]
    fn test_command_result_missing_envelope() {
        let data = json!({"response": {"something": "else"}});
        let err = command_result("VEHICLE_DATA", &data).unwrap_err();
        assert!(matches!(err, TeslaError::Command(_)));
        assert!(err.to_string().contains("command endpoint"));
    }

    #[test]
    fn test_query_pairs_stringifies_values() {
        let params = json!({"on": true, "percent": 80, "label": "x"});
        let pairs = query_pairs(&params);
        assert!(pairs.contains(&("on".to_string(), "true".to_string())));
        assert!(pairs.contains(&("percent".to_string(), "80".to_string())));
        assert!(pairs.contains(&("label".to_string(), "x".to_string())));
    }
}

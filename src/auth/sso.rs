use crate::auth::{pkce, Authenticator};
use crate::error::{Result, TeslaError};
use crate::models::{MfaFactor, OwnerApiToken, SsoToken, TokenResponse};
use crate::session::error_for_status;
use chrono::Utc;
use reqwest::blocking::Client;
use reqwest::header::LOCATION;
use url::Url;

pub const SSO_BASE_URL: &str = "https://auth.tesla.com/";
pub const SSO_CLIENT_ID: &str = "ownerapi";
const SCOPE: &str = "openid email offline_access";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const OWNER_API_CLIENT_ID: &str =
    "e4a9949fcfa04068f59abb5a658f2bac0a3428e4652315490b659d5ab3f35a9e";
const MAX_REDIRECT_HOPS: usize = 10;

/// What the authenticator's callback URL resolved to.
#[derive(Debug, PartialEq, Eq)]
pub enum Callback {
    /// Login completed; the authorization code is ready for exchange.
    Code(String),
    /// The provider parked the login on a pending MFA transaction.
    MfaTransaction(String),
}

/// Client for the identity provider's OAuth2 authorization-code flow with
/// PKCE, including the TOTP multi-factor sub-flow and token refresh.
///
/// Redirects are never followed automatically: the initial authorize GET
/// follows them manually to detect regional mirrors, and the code-producing
/// authorize POST must not be followed at all so its `Location` header can
/// be read.
pub struct SsoClient {
    http: Client,
}

impl SsoClient {
    pub fn new(proxy: Option<&str>, verify_tls: bool) -> Result<Self> {
        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!verify_tls)
            .cookie_store(true);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
        })
    }

    /// Build the authorization URL for one login attempt. The redirect URI is
    /// the provider's fixed void callback on the primary domain, regardless
    /// of any regional mirror.
    pub fn authorize_url(
        &self,
        sso_base: &Url,
        code_challenge: &str,
        state: &str,
        login_hint: &str,
    ) -> Result<Url> {
        let mut url = sso_base.join("oauth2/v3/authorize")?;
        url.query_pairs_mut()
            .append_pair("client_id", SSO_CLIENT_ID)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("login_hint", login_hint)
            .append_pair("redirect_uri", &format!("{}void/callback", SSO_BASE_URL))
            .append_pair("response_type", "code")
            .append_pair("scope", SCOPE)
            .append_pair("state", state);
        Ok(url)
    }

    /// Retrieve the SSO page, following redirects by hand. Accounts
    /// registered in another region are redirected to a regional mirror;
    /// the mirror's origin is returned so the rest of the flow (and all
    /// future refreshes) target it.
    pub fn discover_region(&self, authorize_url: &Url) -> Result<Option<Url>> {
        let mut current = authorize_url.clone();
        for _ in 0..MAX_REDIRECT_HOPS {
            let response = self.http.get(current.clone()).send()?;
            if !response.status().is_redirection() {
                error_for_status(response)?;
                if current.origin() != authorize_url.origin() {
                    let origin = Url::parse(&current.origin().ascii_serialization())?;
                    tracing::debug!("SSO region redirect to {}", origin);
                    return Ok(Some(origin));
                }
                return Ok(None);
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| TeslaError::Auth("Redirect without location".to_string()))?;
            current = current.join(location)?;
        }
        Err(TeslaError::Auth("Authorization redirect loop".to_string()))
    }

    /// Exchange the authorization code plus the PKCE verifier for an
    /// SSO-scoped token pair.
    pub fn exchange_code(
        &self,
        sso_base: &Url,
        code: &str,
        code_verifier: &str,
    ) -> Result<SsoToken> {
        let redirect_uri = format!("{}void/callback", SSO_BASE_URL);
        let response = self
            .http
            .post(sso_base.join("oauth2/v3/token")?)
            .form(&[
                ("grant_type", "authorization_code"),
                ("client_id", SSO_CLIENT_ID),
                ("code", code),
                ("code_verifier", code_verifier),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .send()?;
        let response = error_for_status(response)?;
        let token: TokenResponse = response.json()?;
        tracing::debug!("Obtained SSO token, expires in {}s", token.expires_in);
        Ok(SsoToken::from_response(token, Utc::now().timestamp()))
    }

    /// Standard OAuth refresh-token grant against the (possibly
    /// region-adjusted) token endpoint.
    pub fn refresh(&self, sso_base: &Url, refresh_token: &str) -> Result<SsoToken> {
        let response = self
            .http
            .post(sso_base.join("oauth2/v3/token")?)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", SSO_CLIENT_ID),
                ("refresh_token", refresh_token),
                ("scope", SCOPE),
            ])
            .send()?;
        let response = error_for_status(response)?;
        let token: TokenResponse = response.json()?;
        tracing::debug!("Refreshed SSO token, expires in {}s", token.expires_in);
        Ok(SsoToken::from_response(token, Utc::now().timestamp()))
    }

    /// RFC 7523 JWT-bearer exchange: trade the SSO token for the bearer
    /// token the backend API actually accepts.
    pub fn exchange_jwt(&self, api_base: &Url, sso_access_token: &str) -> Result<OwnerApiToken> {
        let response = self
            .http
            .post(api_base.join("oauth/token")?)
            .bearer_auth(sso_access_token)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT),
                ("client_id", OWNER_API_CLIENT_ID),
            ])
            .send()?;
        let response = error_for_status(response)?;
        let token: OwnerApiToken = response.json()?;
        tracing::debug!("Got JWT bearer, expires at {}", token.expiration_display());
        Ok(token)
    }

    /// Drive the MFA sub-flow for a pending transaction and return the
    /// authorization code. Cancellation (by factor selection or empty
    /// passcode) submits a protocol-level cancel before failing.
    pub fn run_mfa(
        &self,
        sso_base: &Url,
        transaction_id: &str,
        authenticator: &dyn Authenticator,
    ) -> Result<String> {
        let factors = self.list_factors(sso_base, transaction_id)?;
        let factor = match resolve_factor(&factors, authenticator)? {
            Some(factor) => factor,
            None => {
                self.cancel_transaction(sso_base, transaction_id)?;
                return Err(TeslaError::Auth("MFA cancelled".to_string()));
            }
        };
        let passcode = authenticator.get_passcode()?;
        if passcode.is_empty() {
            self.cancel_transaction(sso_base, transaction_id)?;
            return Err(TeslaError::Auth("MFA cancelled".to_string()));
        }
        self.verify_passcode(sso_base, transaction_id, &factor.id, &passcode)?;
        self.finish_transaction(sso_base, transaction_id)
    }

    fn list_factors(&self, sso_base: &Url, transaction_id: &str) -> Result<Vec<MfaFactor>> {
        let response = self
            .http
            .get(sso_base.join("oauth2/v3/authorize/mfa/factors")?)
            .query(&[("transaction_id", transaction_id)])
            .send()?;
        let response = error_for_status(response)?;
        let body: serde_json::Value = response.json()?;
        let factors = serde_json::from_value(body["data"].clone())?;
        Ok(factors)
    }

    fn verify_passcode(
        &self,
        sso_base: &Url,
        transaction_id: &str,
        factor_id: &str,
        passcode: &str,
    ) -> Result<()> {
        let response = self
            .http
            .post(sso_base.join("oauth2/v3/authorize/mfa/verify")?)
            .json(&serde_json::json!({
                "transaction_id": transaction_id,
                "factor_id": factor_id,
                "passcode": passcode,
            }))
            .send()?;
        let response = error_for_status(response)?;
        let body: serde_json::Value = response.json()?;
        // The verification endpoint is authoritative, no automatic retry.
        if let Some(error) = body.get("error") {
            let message = error["message"].as_str().unwrap_or("MFA verification error");
            return Err(TeslaError::Auth(message.to_string()));
        }
        if !body["data"]["valid"].as_bool().unwrap_or(false) {
            return Err(TeslaError::Auth("Invalid passcode".to_string()));
        }
        Ok(())
    }

    fn cancel_transaction(&self, sso_base: &Url, transaction_id: &str) -> Result<()> {
        tracing::debug!("Cancelling MFA transaction");
        self.http
            .post(sso_base.join("oauth2/v3/authorize")?)
            .form(&[("transaction_id", transaction_id), ("cancel", "1")])
            .send()?;
        Ok(())
    }

    /// Submit the verified transaction; the authorization code comes back in
    /// the `Location` header of a redirect response.
    fn finish_transaction(&self, sso_base: &Url, transaction_id: &str) -> Result<String> {
        let response = self
            .http
            .post(sso_base.join("oauth2/v3/authorize")?)
            .form(&[("transaction_id", transaction_id)])
            .send()?;
        if !response.status().is_redirection() {
            return Err(TeslaError::Auth("Credentials rejected".to_string()));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TeslaError::Auth("Redirect without location".to_string()))?;
        match parse_callback(&sso_base.join(location)?.to_string())? {
            Callback::Code(code) => Ok(code),
            Callback::MfaTransaction(_) => {
                Err(TeslaError::Auth("MFA transaction not completed".to_string()))
            }
        }
    }
}

/// Classify the callback URL an authenticator hands back: a `code` query
/// parameter completes the flow, a bare `transaction_id` means the provider
/// is waiting on a second factor, anything else is rejected credentials.
pub fn parse_callback(callback_url: &str) -> Result<Callback> {
    let url = Url::parse(callback_url)
        .map_err(|e| TeslaError::Auth(format!("Invalid callback URL: {}", e)))?;
    let mut transaction_id = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" if !value.is_empty() => return Ok(Callback::Code(value.into_owned())),
            "transaction_id" if !value.is_empty() => {
                transaction_id = Some(value.into_owned());
            }
            _ => {}
        }
    }
    match transaction_id {
        Some(id) => Ok(Callback::MfaTransaction(id)),
        None => Err(TeslaError::Auth(
            "Credentials rejected: no authorization code in callback URL".to_string(),
        )),
    }
}

/// Pick the factor to verify. Exactly one registered factor auto-selects;
/// several defer to the authenticator, where `None` cancels the transaction.
/// Only TOTP software tokens can be verified.
pub fn resolve_factor(
    factors: &[MfaFactor],
    authenticator: &dyn Authenticator,
) -> Result<Option<MfaFactor>> {
    let factor = match factors {
        [] => return Err(TeslaError::Auth("No registered factors".to_string())),
        [only] => only.clone(),
        _ => {
            let name = match authenticator.select_factor(factors)? {
                Some(name) => name,
                None => return Ok(None),
            };
            factors
                .iter()
                .find(|f| f.name == name)
                .cloned()
                .ok_or_else(|| TeslaError::Auth(format!("No such factor name {}", name)))?
        }
    };
    if !factor.is_totp() {
        return Err(TeslaError::FactorNotImplemented(factor.factor_type));
    }
    Ok(Some(factor))
}

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Raw token endpoint response (RFC 6749 §5.1). `expires_in` is relative;
/// callers convert it to an absolute timestamp immediately.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
}

/// SSO-scoped OAuth token issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsoToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry in epoch seconds, derived from `expires_in` at fetch time.
    #[serde(default)]
    pub expires_at: i64,
}

impl SsoToken {
    /// Pin a relative token response to the moment it was received.
    pub fn from_response(response: TokenResponse, received_at: i64) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            id_token: response.id_token,
            token_type: response.token_type,
            expires_at: received_at + response.expires_in,
        }
    }

    pub fn is_expired(&self) -> bool {
        0 < self.expires_at && self.expires_at < Utc::now().timestamp()
    }
}

/// Owner API bearer token obtained through the RFC 7523 JWT-bearer exchange.
/// The backend reports `created_at` in epoch seconds alongside `expires_in`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerApiToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub created_at: i64,
    pub expires_in: i64,
}

impl OwnerApiToken {
    /// Absolute expiry in epoch seconds.
    pub fn expires_at(&self) -> i64 {
        self.created_at + self.expires_in
    }

    pub fn is_expired(&self) -> bool {
        let expires_at = self.expires_at();
        0 < expires_at && expires_at < Utc::now().timestamp()
    }

    /// Format expiration time as human-readable string for logging.
    pub fn expiration_display(&self) -> String {
        match Utc.timestamp_opt(self.expires_at(), 0).single() {
            Some(when) => when.to_rfc3339(),
            None => "invalid timestamp".to_string(),
        }
    }
}

/// A registered multi-factor authentication method. Only the TOTP software
/// token type (`token:software`) can be verified by this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MfaFactor {
    pub id: String,
    pub name: String,
    #[serde(rename = "factorType")]
    pub factor_type: String,
}

impl MfaFactor {
    pub const TOTP: &'static str = "token:software";

    pub fn is_totp(&self) -> bool {
        self.factor_type == Self::TOTP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_token_expiry_arithmetic() {
        let token = OwnerApiToken {
            access_token: "test".to_string(),
            refresh_token: None,
            token_type: "bearer".to_string(),
            created_at: 1_600_000_000,
            expires_in: 3888000,
        };
        assert_eq!(token.expires_at(), 1_600_000_000 + 3888000);
        assert!(token.is_expired());
    }

    #[test]
    fn test_owner_token_expired_boundary() {
        let now = Utc::now().timestamp();
        let stale = OwnerApiToken {
            access_token: "test".to_string(),
            refresh_token: None,
            token_type: "bearer".to_string(),
            created_at: now - 3600 - 1,
            expires_in: 3600,
        };
        assert!(stale.is_expired());

        let fresh = OwnerApiToken {
            access_token: "test".to_string(),
            refresh_token: None,
            token_type: "bearer".to_string(),
            created_at: now,
            expires_in: 3600,
        };
        assert!(!fresh.is_expired());
    }

    #[test]
    fn test_owner_token_zero_expiry_never_expires() {
        // A zero expiry means "unknown", not "expired in 1970".
        let token = OwnerApiToken {
            access_token: "test".to_string(),
            refresh_token: None,
            token_type: "bearer".to_string(),
            created_at: 0,
            expires_in: 0,
        };
        assert!(!token.is_expired());
    }

    #[test]
    fn test_sso_token_from_response() {
        let response = TokenResponse {
            access_token: "abc".to_string(),
            refresh_token: Some("def".to_string()),
            id_token: None,
            token_type: "Bearer".to_string(),
            expires_in: 300,
        };
        let token = SsoToken::from_response(response, 1_700_000_000);
        assert_eq!(token.expires_at, 1_700_000_300);
        assert_eq!(token.refresh_token.as_deref(), Some("def"));
    }

    #[test]
    fn test_mfa_factor_type() {
        let factor: MfaFactor = serde_json::from_value(serde_json::json!({
            "id": "f1", "name": "Pixel", "factorType": "token:software"
        }))
        .unwrap();
        assert!(factor.is_totp());
    }
}

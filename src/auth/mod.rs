// SSO authentication: PKCE, interactive login flow and token persistence
pub mod pkce;
pub mod sso;
mod token_cache;

pub use sso::SsoClient;
pub use token_cache::{CacheEntry, TokenCache};

use crate::error::{Result, TeslaError};
use crate::models::MfaFactor;
use std::io::{BufRead, Write};

/// Interactive capability the login flow depends on. The identity provider
/// requires a JavaScript-capable login page, so credential entry is always
/// delegated to an implementation of this trait; the flow itself only sees
/// the redirected callback URL that comes back.
///
/// Every method is a full suspension point and may block indefinitely on
/// user input.
#[cfg_attr(test, mockall::automock)]
pub trait Authenticator {
    /// Present the authorization URL to the user and return the final
    /// redirected callback URL after login completes.
    fn get_redirect_url(&self, authorize_url: &str) -> Result<String>;

    /// Supply the TOTP passcode. An empty string cancels the transaction.
    fn get_passcode(&self) -> Result<String>;

    /// Pick one of several registered factors by name. `None` cancels the
    /// transaction cleanly.
    fn select_factor(&self, factors: &[MfaFactor]) -> Result<Option<String>>;
}

/// Default authenticator: opens the login page in the system browser and
/// prompts on the terminal for the callback URL, factor name and passcode.
pub struct BrowserAuthenticator;

impl BrowserAuthenticator {
    fn prompt(&self, message: &str) -> Result<String> {
        let mut stderr = std::io::stderr();
        write!(stderr, "{}", message)?;
        stderr.flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl Authenticator for BrowserAuthenticator {
    fn get_redirect_url(&self, authorize_url: &str) -> Result<String> {
        eprintln!("Opening browser to: {}", authorize_url);
        eprintln!("If the browser doesn't open automatically, visit the URL manually.");
        if let Err(e) = webbrowser::open(authorize_url) {
            return Err(TeslaError::BrowserLaunchFailed(e.to_string()));
        }
        self.prompt("After signing in, paste the URL of the page you were redirected to: ")
    }

    fn get_passcode(&self) -> Result<String> {
        self.prompt("Passcode: ")
    }

    fn select_factor(&self, factors: &[MfaFactor]) -> Result<Option<String>> {
        eprintln!("Registered factors:");
        for factor in factors {
            eprintln!("  {} ({})", factor.name, factor.factor_type);
        }
        let name = self.prompt("Factor name (empty to cancel): ")?;
        Ok(if name.is_empty() { None } else { Some(name) })
    }
}

//! Client for the Tesla Owner API.
//!
//! Sign-in uses the RFC-compliant OAuth 2 single sign-on service with PKCE
//! and supports time-based one-time passcodes. Tokens are persisted to disk
//! for reuse and refreshed automatically, so only an email is needed after
//! the first login. API endpoints are loaded from a bundled routing table.
//!
//! The crate is fully synchronous: every call blocks until the network
//! round-trip (or the interactive authenticator) completes. Credential
//! entry is delegated to an [`auth::Authenticator`], because the identity
//! provider requires an interactive, JavaScript-capable login page.
//!
//! ```no_run
//! use teslars::Tesla;
//!
//! fn main() -> teslars::Result<()> {
//!     let tesla = Tesla::new("owner@example.com")?;
//!     tesla.fetch_token()?;
//!     for mut vehicle in tesla.vehicle_list()? {
//!         vehicle.get_vehicle_summary()?;
//!         println!("{}", vehicle.to_json_string());
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod endpoints;
pub mod error;
pub mod models;
pub mod products;
pub mod session;

pub use auth::{Authenticator, BrowserAuthenticator};
pub use endpoints::EndpointTable;
pub use error::{Result, TeslaError};
pub use products::{Battery, SolarPanel, Vehicle};
pub use session::Tesla;

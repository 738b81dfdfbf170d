use thiserror::Error;

#[derive(Error, Debug)]
pub enum TeslaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("{0} factor is not implemented")]
    FactorNotImplemented(String),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error {status}: {reason}")]
    Api { status: u16, reason: String },

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Endpoint {0} is not implemented")]
    EndpointNotImplemented(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),
}

pub type Result<T> = std::result::Result<T, TeslaError>;

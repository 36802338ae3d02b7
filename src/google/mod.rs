//! Google API plumbing: service-account auth, Calendar v3, Sheets v4.

pub mod auth;
pub mod calendar;
pub mod sheets;

use thiserror::Error;

pub use auth::{ServiceAccount, StaticToken, TokenProvider};
pub use calendar::GoogleCalendar;
pub use sheets::GoogleSheets;

pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";
pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

#[derive(Debug, Error)]
pub enum GoogleError {
    #[error("failed to read credentials '{path}': {source}")]
    Credentials { path: String, source: std::io::Error },
    #[error("invalid service account key: {0}")]
    InvalidKey(String),
    #[error("failed to sign token assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Google API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Parse(String),
}

impl GoogleError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GoogleError::Api { status: 404 | 410, .. })
    }
}

/// Turn a non-2xx response into `GoogleError::Api`, keeping the body for logs.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GoogleError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Could not read error response".to_string());
    Err(GoogleError::Api { status: status.as_u16(), body })
}

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors surfaced by the hold ledger itself. Business outcomes (insufficient
/// stock, missing holds) are plain return values and never pass through here.
#[derive(Debug, Error)]
pub(crate) enum LedgerError {
    #[error("reservation transaction for {sku} lost the version race {attempts} times")]
    Conflict { sku: String, attempts: u32 },
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) detail: String,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) detail: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, value.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(value: sqlx::Error) -> Self {
        error!(error = %value, "catalog query failed");
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "Storage unavailable")
    }
}

impl From<LedgerError> for ApiError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::Conflict { .. } => {
                Self::new(StatusCode::CONFLICT, "Reservation conflict, retry")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409() {
        let err = ApiError::from(LedgerError::Conflict { sku: "A1".into(), attempts: 8 });
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn anyhow_maps_to_500() {
        let err = ApiError::from(anyhow::anyhow!("boom"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.detail, "boom");
    }
}

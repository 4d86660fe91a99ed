use bigdecimal::BigDecimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::detector::Action;
use crate::device::DeviceError;
use crate::models::OrderStatus;
use crate::store::StoreError;

/// Machine-readable codes clients branch on to retry, wait or re-confirm.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    TableNotFound,
    InvalidSession,
    SessionExpired,
    SessionClosed,
    DeviceLimitExceeded,
    ItemUnavailable,
    PriceMismatch,
    TotalMismatch,
    OrderNotFound,
    IllegalTransition,
    StateChanged,
    RateLimitExceeded,
    SlowDown,
    BotDetected,
    DuplicateSuspected,
    ConfirmationRequired,
    InternalError,
}

/// A deliberate refusal of an order attempt, not a system failure.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub action: Action,
    pub reason: String,
    pub confidence: f64,
    pub wait_seconds: Option<u32>,
    pub retryable: bool,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("table {0} does not exist")]
    TableNotFound(i32),
    #[error("session {0} does not exist")]
    SessionNotFound(Uuid),
    #[error("session {session_id} belongs to table {actual}, not table {expected}")]
    SessionTableMismatch {
        session_id: Uuid,
        expected: i32,
        actual: i32,
    },
    #[error("session {0} has expired")]
    SessionExpired(Uuid),
    #[error("session {0} is already closed")]
    SessionClosed(Uuid),
    #[error("session already has the maximum of {0} devices")]
    DeviceLimit(usize),
    #[error("menu item {0} is unavailable")]
    ItemUnavailable(String),
    #[error("price of {menu_item_id} should be {expected}, got {actual}")]
    PriceMismatch {
        menu_item_id: String,
        expected: BigDecimal,
        actual: BigDecimal,
    },
    #[error("order total should be {expected}, got {actual}")]
    TotalMismatch {
        expected: BigDecimal,
        actual: BigDecimal,
    },
    #[error("order {0} does not exist")]
    OrderNotFound(Uuid),
    #[error("order cannot move from {from} to {to}")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },
    #[error("order {id} is {status} and can no longer be edited")]
    OrderFinalized { id: Uuid, status: OrderStatus },
    #[error("{0} was changed by someone else, refresh and retry")]
    StateChanged(Uuid),
    #[error("{}", .0.reason)]
    Rejected(Rejection),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::Validation(_) => ErrorCode::ValidationError,
            ServiceError::TableNotFound(_) => ErrorCode::TableNotFound,
            ServiceError::SessionNotFound(_) | ServiceError::SessionTableMismatch { .. } => {
                ErrorCode::InvalidSession
            }
            ServiceError::SessionExpired(_) => ErrorCode::SessionExpired,
            ServiceError::SessionClosed(_) => ErrorCode::SessionClosed,
            ServiceError::DeviceLimit(_) => ErrorCode::DeviceLimitExceeded,
            ServiceError::ItemUnavailable(_) => ErrorCode::ItemUnavailable,
            ServiceError::PriceMismatch { .. } => ErrorCode::PriceMismatch,
            ServiceError::TotalMismatch { .. } => ErrorCode::TotalMismatch,
            ServiceError::OrderNotFound(_) => ErrorCode::OrderNotFound,
            ServiceError::IllegalTransition { .. } | ServiceError::OrderFinalized { .. } => {
                ErrorCode::IllegalTransition
            }
            ServiceError::StateChanged(_) => ErrorCode::StateChanged,
            ServiceError::Rejected(rejection) => rejection.code,
            ServiceError::Store(_) => ErrorCode::InternalError,
        }
    }

    /// Whether resubmitting the same request can succeed later.
    pub fn retryable(&self) -> bool {
        match self {
            ServiceError::Rejected(rejection) => rejection.retryable,
            ServiceError::StateChanged(_) | ServiceError::Store(_) => true,
            _ => false,
        }
    }
}

impl From<DeviceError> for ServiceError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::LimitReached(limit) => ServiceError::DeviceLimit(limit),
            other => ServiceError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::DuplicateSuspected).unwrap(),
            "\"DUPLICATE_SUSPECTED\""
        );
        assert_eq!(
            ServiceError::SessionNotFound(Uuid::nil()).code(),
            ErrorCode::InvalidSession
        );
    }

    #[test]
    fn test_rejection_carries_its_own_code() {
        let err = ServiceError::Rejected(Rejection {
            code: ErrorCode::SlowDown,
            action: Action::Wait,
            reason: "too fast".to_string(),
            confidence: 0.75,
            wait_seconds: Some(10),
            retryable: true,
        });

        assert_eq!(err.code(), ErrorCode::SlowDown);
        assert!(err.retryable());
        assert_eq!(err.to_string(), "too fast");
    }

    #[test]
    fn test_device_limit_maps_to_its_code() {
        let err: ServiceError = DeviceError::LimitReached(12).into();
        assert_eq!(err.code(), ErrorCode::DeviceLimitExceeded);

        let err: ServiceError = DeviceError::MissingFingerprint.into();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }
}

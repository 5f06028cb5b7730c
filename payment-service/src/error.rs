use uuid::Uuid;

use crate::models::PaymentStatus;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),
    #[error("amount must be greater than zero")]
    InvalidAmount,
    #[error("unsupported payment method {0:?}")]
    InvalidMethod(String),
    #[error("payment {0} not found")]
    NotFound(Uuid),
    #[error("no payment for booking {0}")]
    BookingNotFound(Uuid),
    #[error("payment for booking {0} already exists")]
    AlreadyExists(Uuid),
    #[error("payment is {0}, only completed payments can be refunded")]
    NotCompleted(PaymentStatus),
    #[error("payment is {0} and cannot be confirmed")]
    CannotConfirm(PaymentStatus),
    #[error("refund of {requested} exceeds the refundable remainder of {available}")]
    RefundExceedsRemaining { requested: i64, available: i64 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<diesel::result::Error> for LedgerError {
    fn from(err: diesel::result::Error) -> Self {
        LedgerError::Storage(err.into())
    }
}

impl LedgerError {
    /// Retrying will not change the outcome.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, LedgerError::Storage(_))
    }
}

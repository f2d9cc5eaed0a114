use crate::models::DenialReason;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Exchange denial: expected operation, carried as an error so the API
    /// layer can map it to a status code, never a panic
    #[error("download denied: {reason}")]
    Denied { reason: DenialReason },

    #[error("store error: {0}")]
    Store(String),

    #[error("email provider error: {0}")]
    Email(#[from] crate::email::EmailError),

    #[error("audit error: {0}")]
    Audit(#[from] audit::AuditError),

    #[error("event bus error: {0}")]
    Bus(#[from] event_bus::BusError),
}

impl DeliveryError {
    pub fn denied(reason: DenialReason) -> Self {
        Self::Denied { reason }
    }

    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self {
            Self::Denied { reason } => Some(*reason),
            _ => None,
        }
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

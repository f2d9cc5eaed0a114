use crate::order::OrderStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("webhook signature verification failed: {0}")]
    SignatureInvalid(#[from] crate::signature::SignatureError),

    #[error("malformed webhook payload: {0}")]
    MalformedWebhook(String),

    #[error("no cached brief for id {0}")]
    BriefNotFound(String),

    #[error("no order for session {0}")]
    OrderNotFound(String),

    #[error("illegal order transition {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("checkout provider error: {0}")]
    Provider(#[from] crate::checkout::ProviderError),

    #[error("store error: {0}")]
    Store(String),

    #[error("audit error: {0}")]
    Audit(#[from] audit::AuditError),

    #[error("event bus error: {0}")]
    Bus(#[from] event_bus::BusError),
}

impl GatewayError {
    /// Errors worth retrying: transient infrastructure trouble, not bad input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_server_error(),
            Self::Store(_) | Self::Bus(_) | Self::Audit(_) => true,
            Self::SignatureInvalid(_)
            | Self::MalformedWebhook(_)
            | Self::BriefNotFound(_)
            | Self::OrderNotFound(_)
            | Self::InvalidTransition { .. } => false,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

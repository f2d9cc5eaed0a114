//! # Delivery Agent
//!
//! Owns everything after the money: customer notification emails, download
//! token minting when production completes, exchange of presented tokens for
//! short-lived signed URLs, and revocation on refund.
//!
//! Tokens are stored only as keyed hashes; the raw value exists once, in the
//! portal link emailed to the customer. Email provider status callbacks are
//! tracked per notification, and repeat bounces raise operational alerts.

pub mod agent;
pub mod email;
pub mod error;
pub mod models;
pub mod signer;
pub mod stores;
pub mod token;
pub mod tracking;

pub use agent::{AgentConfig, DeliveryAgent, ExchangeGrant};
pub use email::{
    EmailConfig, EmailError, EmailMessage, EmailSender, HttpEmailSender, MockEmailSender,
    TemplateBook,
};
pub use error::{DeliveryError, DeliveryResult};
pub use models::{
    AlertSeverity, DeliveryAlert, DeliveryToken, DenialReason, DownloadAttempt, EmailStatus,
    EmailStatusUpdate, NotificationKind, NotificationRecord, TierPolicy, TokenStatus,
};
pub use signer::{SignedUrl, SignedUrlGenerator, UrlSigner};
pub use stores::{
    AlertSink, DownloadAuditLog, InMemoryAlertSink, InMemoryDownloadAuditLog,
    InMemoryNotificationStore, InMemoryTokenStore, NotificationStore, TokenStore,
};
pub use token::{MintedToken, TokenMinter};
pub use tracking::NotificationTracker;

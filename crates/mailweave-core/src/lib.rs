//! # mailweave-core
//!
//! Synchronization engine of the `mailweave` terminal email client.
//!
//! This crate provides:
//! - Account configuration and credential lookup
//! - A correlation bus and the orchestrator control loop
//! - One IMAP/SMTP worker per account
//! - A persistence worker owning the `SQLite` store
//! - Conversation thread reconstruction

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod engine;
mod error;
pub mod message;
pub mod model;
pub mod orchestrator;
pub mod service;
pub mod status;
pub mod store;
pub mod worker;

pub use account::credentials;
pub use account::{Account, ImapConfig, PasswordSource, Security, SmtpAuth, SmtpConfig};
pub use account::{
    CredentialError, CredentialResult, ValidationError, ValidationResult, validate_account,
    validate_accounts,
};
pub use engine::{EngineConfig, start, start_with};
pub use error::{Error, Result};
pub use message::{CorrelationId, Envelope, Request, Response, Target};
pub use model::{
    BodyPart, BodyPath, Filters, FlagSet, FlagUpdate, Mail, Mailbox, Thread, ThreadNode,
};
pub use orchestrator::{Callback, Flow, Frontend, Orchestrator};
pub use service::{
    ImapTransport, MailSubmitter, MailTransport, ServiceError, SmtpSubmitter, Submission,
};
pub use status::{StatusLevel, StatusLog, StatusMessage};
pub use store::{MailStore, ReconcileSummary};

//! Account management module.
//!
//! Provides account configuration, password resolution, and validation.

pub mod credentials;
mod model;
mod validation;

pub use credentials::{
    CredentialError, CredentialResult, Protocol, resolve_password, store_password,
};
pub use model::{Account, ImapConfig, PasswordSource, Security, SmtpAuth, SmtpConfig};
pub use validation::{
    ValidationError, ValidationResult, is_valid_email, validate_account, validate_accounts,
};

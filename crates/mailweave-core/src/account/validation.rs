//! Account validation.

use std::collections::HashSet;

use super::model::{Account, PasswordSource, SmtpAuth};

/// Validation error for account configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// No account is configured at all.
    NoAccounts,
    /// Two accounts share a name.
    DuplicateName(String),
    /// Account name is empty.
    EmptyName,
    /// Email address is empty.
    EmptyEmail,
    /// Email address format is invalid.
    InvalidEmail,
    /// IMAP host is empty.
    EmptyImapHost,
    /// IMAP username is empty.
    EmptyImapUsername,
    /// IMAP password is empty.
    EmptyImapPassword,
    /// SMTP host is empty.
    EmptySmtpHost,
    /// SMTP username is empty.
    EmptySmtpUsername,
    /// SMTP password is empty.
    EmptySmtpPassword,
}

impl ValidationError {
    /// Get human-readable error message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::NoAccounts => "At least one account is required",
            Self::DuplicateName(_) => "Account names must be unique",
            Self::EmptyName => "Account name is required",
            Self::EmptyEmail => "Email address is required",
            Self::InvalidEmail => "Invalid email address format",
            Self::EmptyImapHost => "IMAP server is required",
            Self::EmptyImapUsername => "IMAP username is required",
            Self::EmptyImapPassword => "IMAP password is required",
            Self::EmptySmtpHost => "SMTP server is required",
            Self::EmptySmtpUsername => "SMTP username is required",
            Self::EmptySmtpPassword => "SMTP password is required",
        }
    }

    /// Get the field name this error relates to.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::NoAccounts => "accounts",
            Self::DuplicateName(_) | Self::EmptyName => "name",
            Self::EmptyEmail | Self::InvalidEmail => "email",
            Self::EmptyImapHost => "imap_host",
            Self::EmptyImapUsername => "imap_username",
            Self::EmptyImapPassword => "imap_password",
            Self::EmptySmtpHost => "smtp_host",
            Self::EmptySmtpUsername => "smtp_username",
            Self::EmptySmtpPassword => "smtp_password",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateName(name) => write!(f, "{} (`{name}`)", self.message()),
            _ => write!(f, "{}", self.message()),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Result of validating an account.
pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Validate a single account configuration.
///
/// Returns `Ok(())` if valid, or `Err(Vec<ValidationError>)` with all errors.
///
/// # Errors
///
/// Returns a vector of `ValidationError` if any fields are invalid.
pub fn validate_account(account: &Account) -> ValidationResult {
    let mut errors = Vec::new();
    check_account(account, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate the full list of configured accounts.
///
/// Requires at least one account and unique account names, on top of the
/// per-account checks.
///
/// # Errors
///
/// Returns every problem found across all accounts.
pub fn validate_accounts(accounts: &[Account]) -> ValidationResult {
    let mut errors = Vec::new();

    if accounts.is_empty() {
        errors.push(ValidationError::NoAccounts);
    }

    let mut seen = HashSet::new();
    for account in accounts {
        check_account(account, &mut errors);
        if !seen.insert(account.name.as_str()) {
            errors.push(ValidationError::DuplicateName(account.name.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_account(account: &Account, errors: &mut Vec<ValidationError>) {
    if account.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
    }

    if account.email.trim().is_empty() {
        errors.push(ValidationError::EmptyEmail);
    } else if !is_valid_email(&account.email) {
        errors.push(ValidationError::InvalidEmail);
    }

    // IMAP validation
    if account.imap.host.trim().is_empty() {
        errors.push(ValidationError::EmptyImapHost);
    }
    if account.imap.username.trim().is_empty() {
        errors.push(ValidationError::EmptyImapUsername);
    }
    if is_empty_source(&account.imap.password) {
        errors.push(ValidationError::EmptyImapPassword);
    }

    // SMTP validation
    if account.smtp.host.trim().is_empty() {
        errors.push(ValidationError::EmptySmtpHost);
    }
    if account.smtp.auth == SmtpAuth::Plain {
        if account.smtp.username.trim().is_empty() {
            errors.push(ValidationError::EmptySmtpUsername);
        }
        if is_empty_source(&account.smtp.password) {
            errors.push(ValidationError::EmptySmtpPassword);
        }
    }
}

fn is_empty_source(source: &PasswordSource) -> bool {
    match source {
        PasswordSource::Plain(value) | PasswordSource::Command(value) => value.trim().is_empty(),
        PasswordSource::Keyring => false,
    }
}

/// Basic email validation.
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();

    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    if local.is_empty() || domain.contains('@') {
        return false;
    }

    // Domain must contain at least one dot and no empty labels
    if domain.is_empty() || !domain.contains('.') {
        return false;
    }
    !domain.split('.').any(str::is_empty)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn complete_account(name: &str) -> Account {
        let mut account = Account::new();
        account.name = name.to_string();
        account.email = "test@example.com".to_string();
        account.imap.host = "imap.example.com".to_string();
        account.imap.username = "test".to_string();
        account.imap.password = PasswordSource::Plain("secret".to_string());
        account.smtp.host = "smtp.example.com".to_string();
        account.smtp.username = "test".to_string();
        account.smtp.password = PasswordSource::Command("pass show mail".to_string());
        account
    }

    #[test]
    fn test_valid_email() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("user.name@example.com"));
        assert!(is_valid_email("user@sub.example.com"));
    }

    #[test]
    fn test_invalid_email() {
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("user"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("user@example"));
        assert!(!is_valid_email("user@@example.com"));
        assert!(!is_valid_email("user@example..com"));
    }

    #[test]
    fn test_validate_empty_account() {
        let account = Account::new();
        let errors = validate_account(&account).unwrap_err();
        assert!(errors.contains(&ValidationError::EmptyName));
        assert!(errors.contains(&ValidationError::EmptyEmail));
        assert!(errors.contains(&ValidationError::EmptyImapHost));
        assert!(!errors.contains(&ValidationError::EmptyImapPassword));
    }

    #[test]
    fn test_validate_complete_account() {
        assert!(validate_account(&complete_account("work")).is_ok());
    }

    #[test]
    fn test_smtp_without_auth_needs_no_credentials() {
        let mut account = complete_account("work");
        account.smtp.auth = SmtpAuth::None;
        account.smtp.username.clear();
        account.smtp.password = PasswordSource::Plain(String::new());
        assert!(validate_account(&account).is_ok());
    }

    #[test]
    fn test_empty_plain_password() {
        let mut account = complete_account("work");
        account.imap.password = PasswordSource::Plain("  ".to_string());
        let errors = validate_account(&account).unwrap_err();
        assert_eq!(errors, vec![ValidationError::EmptyImapPassword]);
    }

    #[test]
    fn test_no_accounts() {
        let errors = validate_accounts(&[]).unwrap_err();
        assert_eq!(errors, vec![ValidationError::NoAccounts]);
    }

    #[test]
    fn test_duplicate_names() {
        let accounts = vec![
            complete_account("work"),
            complete_account("home"),
            complete_account("work"),
        ];
        let errors = validate_accounts(&accounts).unwrap_err();
        assert_eq!(errors, vec![ValidationError::DuplicateName("work".into())]);
        assert_eq!(errors[0].to_string(), "Account names must be unique (`work`)");
    }
}

//! Password resolution for configured accounts.
//!
//! A password is either stored inline, produced by a shell command, or
//! kept in the platform's native credential storage:
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - macOS: Keychain
//! - Windows: Credential Manager

use keyring::Entry;
use tokio::process::Command;
use tracing::debug;

use super::PasswordSource;

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "mailweave";

/// Which server of an account a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Incoming mail.
    Imap,
    /// Outgoing mail.
    Smtp,
}

impl Protocol {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Imap => "imap",
            Self::Smtp => "smtp",
        }
    }
}

/// Error type for credential operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Failed to access keyring.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// No keyring entry exists for the account.
    #[error("no {protocol} password stored in keyring for account `{account}`")]
    Missing {
        /// Account name.
        account: String,
        /// Protocol name.
        protocol: &'static str,
    },

    /// The password command could not be run or failed.
    #[error("password command failed: {0}")]
    Command(String),
}

/// Result type for credential operations.
pub type CredentialResult<T> = std::result::Result<T, CredentialError>;

/// Generates the keyring user for a credential.
fn credential_key(account: &str, protocol: Protocol) -> String {
    format!("{account}:{}", protocol.as_str())
}

/// Resolves the password for one server of an account.
///
/// # Errors
///
/// Returns an error if the command fails or the keyring has no entry.
pub async fn resolve_password(
    account: &str,
    protocol: Protocol,
    source: &PasswordSource,
) -> CredentialResult<String> {
    match source {
        PasswordSource::Plain(password) => Ok(password.clone()),
        PasswordSource::Command(command) => run_password_command(command).await,
        PasswordSource::Keyring => get_keyring_password(account, protocol),
    }
}

/// Runs `command` through `sh -c` and returns its output minus the trailing newline.
async fn run_password_command(command: &str) -> CredentialResult<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| CredentialError::Command(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CredentialError::Command(format!(
            "exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.trim_end_matches(['\r', '\n']).to_string())
}

/// Retrieves a password from the system keyring.
fn get_keyring_password(account: &str, protocol: Protocol) -> CredentialResult<String> {
    let key = credential_key(account, protocol);
    let entry = Entry::new(SERVICE_NAME, &key)?;
    match entry.get_password() {
        Ok(password) => Ok(password),
        Err(keyring::Error::NoEntry) => {
            debug!("No {} password found for account {account}", protocol.as_str());
            Err(CredentialError::Missing {
                account: account.to_string(),
                protocol: protocol.as_str(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Stores a password in the system keyring.
///
/// # Errors
///
/// Returns an error if the keyring operation fails.
pub fn store_password(account: &str, protocol: Protocol, password: &str) -> CredentialResult<()> {
    let key = credential_key(account, protocol);
    let entry = Entry::new(SERVICE_NAME, &key)?;
    entry.set_password(password)?;
    debug!("Stored {} password for account {account}", protocol.as_str());
    Ok(())
}

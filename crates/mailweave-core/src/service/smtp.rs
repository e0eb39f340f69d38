//! SMTP submission of outgoing mail.

use async_trait::async_trait;
use mailledger_smtp::connection::{connect, connect_tls};
use mailledger_smtp::{Address, Client};
use tracing::{debug, info};

use super::{MailSubmitter, ServiceError, Submission};
use crate::account::{Protocol, SmtpAuth, SmtpConfig, resolve_password};
use crate::{Result, Security};

/// Delivers messages through the account's SMTP server.
///
/// Every submission opens its own connection.
#[derive(Debug, Clone)]
pub struct SmtpSubmitter {
    account: String,
    config: SmtpConfig,
}

impl SmtpSubmitter {
    /// Creates a submitter for `account`.
    #[must_use]
    pub fn new(account: impl Into<String>, config: SmtpConfig) -> Self {
        Self {
            account: account.into(),
            config,
        }
    }
}

fn address(value: &str) -> Result<Address> {
    Address::new(value)
        .map_err(|e| ServiceError::Operation(format!("invalid address {value}: {e}")).into())
}

#[async_trait]
impl MailSubmitter for SmtpSubmitter {
    async fn submit(&self, submission: &Submission) -> Result<()> {
        let host = self.config.host.as_str();
        let port = self.config.effective_port();
        debug!("Submitting {} via {host}:{port}", submission.message_id);

        let stream = match self.config.security {
            Security::Tls => connect_tls(host, port).await,
            Security::StartTls | Security::None => connect(host, port).await,
        }
        .map_err(|e| ServiceError::Connection(e.to_string()))?;

        let client = Client::from_stream(stream)
            .await
            .map_err(|e| ServiceError::Connection(e.to_string()))?;

        let client = client
            .ehlo("localhost")
            .await
            .map_err(|e| ServiceError::Connection(e.to_string()))?;

        let client = if self.config.security == Security::StartTls {
            client
                .starttls(host)
                .await
                .map_err(|e| ServiceError::Connection(e.to_string()))?
        } else {
            client
        };

        let from = address(&submission.from)?;
        let client = match self.config.auth {
            SmtpAuth::Plain => {
                let password =
                    resolve_password(&self.account, Protocol::Smtp, &self.config.password).await?;
                client
                    .auth_plain(&self.config.username, &password)
                    .await
                    .map_err(|e| ServiceError::Authentication(e.to_string()))?
                    .mail_from(from)
                    .await
            }
            SmtpAuth::None => client.mail_from(from).await,
        }
        .map_err(|e| ServiceError::Operation(e.to_string()))?;

        let (first, rest) = submission
            .recipients
            .split_first()
            .ok_or_else(|| ServiceError::Operation("no recipients".into()))?;

        let mut client = client
            .rcpt_to(address(first)?)
            .await
            .map_err(|e| ServiceError::Operation(e.to_string()))?;
        for recipient in rest {
            client = client
                .rcpt_to(address(recipient)?)
                .await
                .map_err(|e| ServiceError::Operation(e.to_string()))?;
        }

        let client = client
            .data()
            .await
            .map_err(|e| ServiceError::Operation(e.to_string()))?;
        let client = client
            .send_message(&submission.data)
            .await
            .map_err(|e| ServiceError::Operation(e.to_string()))?;
        client
            .quit()
            .await
            .map_err(|e| ServiceError::Operation(e.to_string()))?;

        info!(
            "Sent {} to {} recipient(s)",
            submission.message_id,
            submission.recipients.len()
        );
        Ok(())
    }
}

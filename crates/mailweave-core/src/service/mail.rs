//! IMAP transport.
//!
//! Wraps the type-state IMAP client behind [`MailTransport`]. The client
//! consumes itself on SELECT, so a failed state transition drops the
//! session and the next call reconnects.

use async_trait::async_trait;
use mailledger_imap::command::{FetchAttribute, FetchItems};
use mailledger_imap::connection::{
    Authenticated, Client, ImapStream, NotAuthenticated, Selected, connect_plain, connect_tls,
};
use mailledger_imap::parser::{BodyStructure, FetchItem};
use mailledger_imap::types::{Flag, Flags, MailboxAttribute, Uid, UidSet};
use tracing::{debug, info, warn};

use super::{FetchedHeader, MailTransport, MailboxSnapshot, RemoteMailbox, ServiceError, UidRange};
use crate::account::{ImapConfig, Protocol, resolve_password};
use crate::model::{BodyPart, BodyPath, FlagSet, FlagUpdate};
use crate::{Result, Security};

/// Type alias for authenticated IMAP client.
pub type AuthClient = Client<ImapStream, Authenticated>;

/// Type alias for selected IMAP client.
pub type SelectedClient = Client<ImapStream, Selected>;

enum Session {
    Authenticated(AuthClient),
    Selected(SelectedClient),
}

/// [`MailTransport`] backed by an IMAP server.
pub struct ImapTransport {
    account: String,
    config: ImapConfig,
    session: Option<Session>,
}

impl std::fmt::Debug for ImapTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapTransport")
            .field("account", &self.account)
            .field("host", &self.config.host)
            .field("connected", &self.session.is_some())
            .finish()
    }
}

impl ImapTransport {
    /// Creates a disconnected transport for `account`.
    #[must_use]
    pub fn new(account: impl Into<String>, config: ImapConfig) -> Self {
        Self {
            account: account.into(),
            config,
            session: None,
        }
    }

    async fn login(&self) -> Result<AuthClient> {
        let host = self.config.host.as_str();
        let port = self.config.effective_port();

        let stream = match self.config.security {
            Security::Tls => connect_tls(host, port).await,
            Security::None => connect_plain(host, port).await,
            Security::StartTls => {
                return Err(ServiceError::UnsupportedSecurity(
                    "STARTTLS is not supported for IMAP",
                )
                .into());
            }
        }
        .map_err(|e| ServiceError::Connection(e.to_string()))?;

        let client: Client<ImapStream, NotAuthenticated> = Client::from_stream(stream)
            .await
            .map_err(|e| ServiceError::Connection(e.to_string()))?;

        let password =
            resolve_password(&self.account, Protocol::Imap, &self.config.password).await?;
        let client = client
            .login(&self.config.username, &password)
            .await
            .map_err(|e| ServiceError::Authentication(e.to_string()))?;

        info!("Logged in to {host}:{port} as {}", self.config.username);
        Ok(client)
    }

    fn selected(&mut self) -> Result<&mut SelectedClient> {
        match &mut self.session {
            Some(Session::Selected(client)) => Ok(client),
            _ => Err(ServiceError::Operation("no mailbox selected".into()).into()),
        }
    }

    async fn uid_fetch(
        &mut self,
        uids: &UidSet,
        items: Vec<FetchAttribute>,
    ) -> Result<Vec<Vec<FetchItem>>> {
        let responses = self
            .selected()?
            .uid_fetch(uids, FetchItems::Items(items))
            .await
            .map_err(|e| ServiceError::Operation(e.to_string()))?;
        Ok(responses.into_iter().map(|(_, items)| items).collect())
    }
}

fn to_uid_set(range: UidRange) -> Option<UidSet> {
    if range.is_empty() {
        return None;
    }
    let start = Uid::new(range.start)?;
    match range.end {
        None => Some(UidSet::RangeFrom(start)),
        Some(end) => Uid::new(end).map(|end| UidSet::Range(start, end)),
    }
}

fn to_flag_set(flags: &Flags) -> FlagSet {
    flags
        .iter()
        .filter(|flag| !matches!(flag, Flag::Recent))
        .map(Flag::as_str)
        .collect()
}

/// Flattens a BODYSTRUCTURE in pre-order. The children of an encapsulated
/// message hang below it as part 0.
#[must_use]
pub fn body_parts(structure: &BodyStructure) -> Vec<BodyPart> {
    let mut parts = Vec::new();
    flatten(structure, BodyPath::root(), &mut parts);
    parts
}

fn flatten(structure: &BodyStructure, path: BodyPath, parts: &mut Vec<BodyPart>) {
    let (mime_type, mime_subtype) = match structure {
        BodyStructure::Basic {
            media_type,
            media_subtype,
            ..
        } => (media_type.as_str(), media_subtype.as_str()),
        BodyStructure::Text { subtype, .. } => ("text", subtype.as_str()),
        BodyStructure::Message { .. } => ("message", "rfc822"),
        BodyStructure::Multipart { subtype, .. } => ("multipart", subtype.as_str()),
    };
    parts.push(BodyPart {
        path: path.clone(),
        mime_type: mime_type.to_ascii_lowercase(),
        mime_subtype: mime_subtype.to_ascii_lowercase(),
    });

    match structure {
        BodyStructure::Message { body, .. } => flatten(body, path.child(0), parts),
        BodyStructure::Multipart { bodies, .. } => {
            for (index, body) in bodies.iter().enumerate() {
                flatten(body, path.child(index), parts);
            }
        }
        BodyStructure::Basic { .. } | BodyStructure::Text { .. } => {}
    }
}

fn to_fetched_header(items: Vec<FetchItem>) -> Option<FetchedHeader> {
    let mut fetched = FetchedHeader::default();
    let mut uid = None;

    for item in items {
        match item {
            FetchItem::Uid(u) => uid = Some(u.get()),
            FetchItem::Flags(flags) => fetched.flags = to_flag_set(&flags),
            FetchItem::InternalDate(date) => fetched.internal_date = Some(date),
            FetchItem::Envelope(envelope) => {
                fetched.envelope_date = envelope.date;
                fetched.envelope_subject = envelope.subject;
            }
            FetchItem::BodyStructure(structure) => fetched.parts = body_parts(&structure),
            FetchItem::Body { data: Some(data), .. } => fetched.header = data,
            _ => {}
        }
    }

    fetched.uid = uid?;
    Some(fetched)
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn connect(&mut self) -> Result<()> {
        self.session = None;
        let client = self.login().await?;
        self.session = Some(Session::Authenticated(client));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn select(&mut self, mailbox: &str) -> Result<MailboxSnapshot> {
        let result = match self.session.take() {
            Some(Session::Authenticated(client)) => client.select(mailbox).await,
            Some(Session::Selected(client)) => client.select(mailbox).await,
            None => return Err(ServiceError::Connection("not connected".into()).into()),
        };
        let (client, status) = result.map_err(|e| ServiceError::Operation(e.to_string()))?;
        self.session = Some(Session::Selected(client));

        debug!("Selected {mailbox}: {} message(s)", status.exists);
        Ok(MailboxSnapshot {
            exists: status.exists,
            first_unseen: status.unseen.map(|seq| seq.get()),
            uid_next: status.uid_next.map(Uid::get),
            read_only: status.read_only,
        })
    }

    async fn list(&mut self) -> Result<Vec<RemoteMailbox>> {
        // CLOSE would expunge, so leave the selected state by logging in again.
        if let Some(Session::Selected(client)) = self.session.take() {
            if let Err(e) = client.logout().await {
                warn!("Logout before LIST failed: {e}");
            }
            self.connect().await?;
        }

        let Some(Session::Authenticated(client)) = &mut self.session else {
            return Err(ServiceError::Connection("not connected".into()).into());
        };
        let responses = client
            .list("", "*")
            .await
            .map_err(|e| ServiceError::Operation(e.to_string()))?;

        Ok(responses
            .into_iter()
            .map(|response| RemoteMailbox {
                name: response.mailbox.as_str().to_string(),
                delimiter: response.delimiter,
                selectable: !response
                    .attributes
                    .iter()
                    .any(|a| matches!(a, MailboxAttribute::NoSelect)),
            })
            .collect())
    }

    async fn fetch_headers(&mut self, range: UidRange) -> Result<Vec<FetchedHeader>> {
        let Some(uids) = to_uid_set(range) else {
            return Ok(Vec::new());
        };
        let responses = self
            .uid_fetch(
                &uids,
                vec![
                    FetchAttribute::Uid,
                    FetchAttribute::Flags,
                    FetchAttribute::InternalDate,
                    FetchAttribute::Envelope,
                    FetchAttribute::BodyStructure,
                    FetchAttribute::Body {
                        section: Some("HEADER".to_string()),
                        peek: true,
                        partial: None,
                    },
                ],
            )
            .await?;

        Ok(responses.into_iter().filter_map(to_fetched_header).collect())
    }

    async fn fetch_flags(&mut self, range: UidRange) -> Result<Vec<FlagUpdate>> {
        let Some(uids) = to_uid_set(range) else {
            return Ok(Vec::new());
        };
        let responses = self
            .uid_fetch(&uids, vec![FetchAttribute::Uid, FetchAttribute::Flags])
            .await?;

        Ok(responses
            .into_iter()
            .filter_map(|items| {
                let mut uid = None;
                let mut flags = FlagSet::new();
                for item in items {
                    match item {
                        FetchItem::Uid(u) => uid = Some(u.get()),
                        FetchItem::Flags(f) => flags = to_flag_set(&f),
                        _ => {}
                    }
                }
                uid.map(|uid| FlagUpdate { uid, flags })
            })
            .collect())
    }

    async fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>> {
        let target = Uid::new(uid).ok_or_else(|| ServiceError::Operation("uid 0".into()))?;
        let responses = self
            .uid_fetch(
                &UidSet::Single(target),
                vec![
                    FetchAttribute::Uid,
                    FetchAttribute::Body {
                        section: None,
                        peek: true,
                        partial: None,
                    },
                ],
            )
            .await?;

        responses
            .into_iter()
            .flatten()
            .find_map(|item| match item {
                FetchItem::Body { data: Some(data), .. } => Some(data),
                _ => None,
            })
            .ok_or_else(|| ServiceError::Operation(format!("message {uid} not found")).into())
    }

    async fn logout(&mut self) -> Result<()> {
        let result = match self.session.take() {
            Some(Session::Authenticated(client)) => client.logout().await,
            Some(Session::Selected(client)) => client.logout().await,
            None => return Ok(()),
        };
        result.map_err(|e| ServiceError::Connection(e.to_string()))?;
        debug!("Logged out of {}", self.config.host);
        Ok(())
    }
}

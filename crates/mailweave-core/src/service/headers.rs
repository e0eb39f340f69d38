//! Header interpretation for fetched and outgoing messages.

use chrono::{DateTime, Utc};
use mailledger_mime::Headers;
use tracing::warn;

use super::FetchedHeader;
use crate::model::Mail;
use crate::{Error, Result};

/// Format of the IMAP INTERNALDATE attribute.
const INTERNAL_DATE_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

/// A normalized outgoing message ready for SMTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipients: every address of To, Cc and Bcc.
    pub recipients: Vec<String>,
    /// Message-ID of the message, without brackets.
    pub message_id: String,
    /// Message bytes as transmitted, without Bcc.
    pub data: Vec<u8>,
}

/// Extracts the first `<id>` of a header value.
fn extract_msg_id(value: &str) -> std::result::Result<String, String> {
    let value = value.trim();
    let start = value
        .find('<')
        .ok_or_else(|| format!("`{value}` is not enclosed in angle brackets"))?;
    let rest = &value[start + 1..];
    let end = rest
        .find('>')
        .ok_or_else(|| format!("`{value}` has no closing bracket"))?;
    let id = &rest[..end];

    if id.trim().is_empty() {
        return Err(format!("`{value}` is empty"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(format!("`{value}` contains whitespace"));
    }
    Ok(id.to_string())
}

/// Parses a required Message-ID header.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the header is missing or malformed.
pub fn parse_message_id(value: Option<&str>) -> Result<String> {
    let value = value.ok_or_else(|| Error::Parse("missing Message-ID".into()))?;
    extract_msg_id(value).map_err(|e| Error::Parse(format!("bad Message-ID: {e}")))
}

/// Parses an optional In-Reply-To header.
///
/// A malformed value is logged and treated as absent.
#[must_use]
pub fn parse_in_reply_to(value: Option<&str>) -> Option<String> {
    let value = value?;
    if value.trim().is_empty() {
        return None;
    }
    match extract_msg_id(value) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("Ignoring malformed In-Reply-To: {e}");
            None
        }
    }
}

/// Decodes RFC 2047 encoded words in a header value.
///
/// Whitespace between two encoded words is dropped; other runs of
/// whitespace collapse to one space.
#[must_use]
pub fn decode_header_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_encoded = false;

    for (index, word) in raw.split_whitespace().enumerate() {
        let encoded = word.starts_with("=?") && word.ends_with("?=");
        if index > 0 && !(prev_encoded && encoded) {
            out.push(' ');
        }
        if encoded {
            match Headers::decode_value(word) {
                Ok(decoded) => out.push_str(&decoded),
                Err(_) => out.push_str(word),
            }
        } else {
            out.push_str(word);
        }
        prev_encoded = encoded;
    }
    out
}

/// Parses an RFC 2822 date, tolerating a trailing comment like `(UTC)`.
fn parse_rfc2822(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let value = match value.rfind('(') {
        Some(index) if value.ends_with(')') => value[..index].trim_end(),
        _ => value,
    };
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn parse_internal_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.trim(), INTERNAL_DATE_FORMAT)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Picks the message date: header, then envelope, then INTERNALDATE,
/// then `now`.
#[must_use]
pub fn resolve_date(
    header: Option<&str>,
    envelope: Option<&str>,
    internal: Option<&str>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    header
        .and_then(parse_rfc2822)
        .or_else(|| envelope.and_then(parse_rfc2822))
        .or_else(|| internal.and_then(parse_internal_date))
        .unwrap_or(now)
}

/// Builds a [`Mail`] from fetched header data.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the Message-ID is missing or malformed, or
/// a MIME error if the header section cannot be parsed.
pub fn build_mail(fetched: FetchedHeader, mailbox: &str) -> Result<Mail> {
    let text = String::from_utf8_lossy(&fetched.header);
    let headers = Headers::parse(&text)?;

    let message_id = parse_message_id(headers.get("message-id")).map_err(|e| match e {
        Error::Parse(msg) => Error::Parse(format!("uid {}: {msg}", fetched.uid)),
        other => other,
    })?;
    let in_reply_to = parse_in_reply_to(headers.get("in-reply-to"));

    let subject = headers
        .get("subject")
        .map(str::to_string)
        .or(fetched.envelope_subject)
        .map(|raw| decode_header_text(&raw))
        .unwrap_or_default();

    let date = resolve_date(
        headers.get("date"),
        fetched.envelope_date.as_deref(),
        fetched.internal_date.as_deref(),
        Utc::now(),
    );

    Ok(Mail {
        id: None,
        uid: fetched.uid,
        message_id,
        in_reply_to,
        thread_id: None,
        flags: fetched.flags,
        date,
        subject,
        parts: fetched.parts,
        mailbox: mailbox.to_string(),
    })
}

/// Splits an address list on top-level commas and returns the bare
/// addresses.
#[must_use]
pub fn parse_address_list(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut depth = 0u32;

    for c in value.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                entries.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    entries.push(current);

    entries
        .iter()
        .filter_map(|entry| bare_address(entry))
        .collect()
}

fn bare_address(entry: &str) -> Option<String> {
    let entry = entry.trim();
    let address = if let Some(start) = entry.rfind('<')
        && let Some(len) = entry[start..].find('>')
    {
        entry[start + 1..start + len].trim()
    } else {
        entry
    };
    address.contains('@').then(|| address.to_string())
}

/// Splits a raw message into its header block and body, returning the
/// line ending in use.
fn split_message(text: &str) -> (&str, &str, &'static str) {
    if let Some(index) = text.find("\r\n\r\n") {
        (&text[..index], &text[index + 4..], "\r\n")
    } else if let Some(index) = text.find("\n\n") {
        (&text[..index], &text[index + 2..], "\n")
    } else {
        let eol = if text.contains("\r\n") { "\r\n" } else { "\n" };
        (text.trim_end_matches(['\r', '\n']), "", eol)
    }
}

/// Returns the header lines without the fields named in `dropped`,
/// including their folded continuation lines.
fn strip_fields<'a>(header: &'a str, dropped: &[&str]) -> Vec<&'a str> {
    let mut kept = Vec::new();
    let mut skipping = false;
    for line in header.lines() {
        let continuation = line.starts_with(' ') || line.starts_with('\t');
        if !continuation {
            skipping = line.split_once(':').is_some_and(|(name, _)| {
                let name = name.trim();
                dropped.iter().any(|field| name.eq_ignore_ascii_case(field))
            });
        }
        if !skipping {
            kept.push(line);
        }
    }
    kept
}

/// Prepares a draft for submission.
///
/// Fills in `From` with `default_from`, synthesizes `Message-ID` and
/// `Date` when absent, collects the recipients of To, Cc and Bcc, and
/// removes the Bcc header from the transmitted data. A `From` or
/// `Message-ID` that cannot be parsed is replaced, not duplicated.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the message has no recipient, or a MIME
/// error if the header block cannot be parsed.
pub fn normalize_outgoing(
    raw: &[u8],
    default_from: &str,
    now: DateTime<Utc>,
) -> Result<Submission> {
    let text = String::from_utf8_lossy(raw);
    let (header, body, eol) = split_message(&text);
    let headers = Headers::parse(header)?;

    let recipients: Vec<String> = ["to", "cc", "bcc"]
        .iter()
        .flat_map(|name| headers.get_all(name))
        .flat_map(parse_address_list)
        .collect();
    if recipients.is_empty() {
        return Err(Error::Parse("message has no recipients".into()));
    }

    let mut added = Vec::new();
    let mut dropped = vec!["bcc"];

    let from = match headers
        .get("from")
        .and_then(|v| parse_address_list(v).into_iter().next())
    {
        Some(from) => from,
        None => {
            dropped.push("from");
            added.push(format!("From: {default_from}"));
            default_from.to_string()
        }
    };

    let message_id = match headers.get("message-id").map(extract_msg_id) {
        Some(Ok(id)) => id,
        _ => {
            let domain = from.rsplit_once('@').map_or("localhost", |(_, d)| d);
            let id = format!(
                "{}.{:016x}@{domain}",
                now.timestamp_millis(),
                rand::random::<u64>()
            );
            dropped.push("message-id");
            added.push(format!("Message-ID: <{id}>"));
            id
        }
    };

    if headers.get("date").is_none() {
        added.push(format!("Date: {}", now.to_rfc2822()));
    }

    let mut data = String::with_capacity(text.len() + 128);
    let kept = strip_fields(header, &dropped);
    for line in added.iter().map(String::as_str).chain(kept) {
        data.push_str(line);
        data.push_str(eol);
    }
    data.push_str(eol);
    data.push_str(body);

    Ok(Submission {
        from,
        recipients,
        message_id,
        data: data.into_bytes(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::FlagSet;

    mod message_id_tests {
        use super::*;

        #[test]
        fn strips_brackets() {
            assert_eq!(
                parse_message_id(Some(" <abc@example.com> ")).unwrap(),
                "abc@example.com"
            );
        }

        #[test]
        fn missing_is_error() {
            assert!(matches!(parse_message_id(None), Err(Error::Parse(_))));
        }

        #[test]
        fn malformed_is_error() {
            for value in ["abc@example.com", "<>", "<a b@example.com>", "<open@example.com"] {
                assert!(
                    matches!(parse_message_id(Some(value)), Err(Error::Parse(_))),
                    "{value}"
                );
            }
        }

        #[test]
        fn in_reply_to_is_lenient() {
            assert_eq!(parse_in_reply_to(None), None);
            assert_eq!(parse_in_reply_to(Some("")), None);
            assert_eq!(parse_in_reply_to(Some("garbage")), None);
            assert_eq!(
                parse_in_reply_to(Some("<a@x> <b@x>")).as_deref(),
                Some("a@x")
            );
        }
    }

    mod decode_tests {
        use super::*;

        #[test]
        fn subject_words() {
            assert_eq!(decode_header_text("Hello   world"), "Hello world");
            assert_eq!(decode_header_text("=?UTF-8?B?Y2Fmw6k=?= time"), "café time");
            assert_eq!(
                decode_header_text("=?UTF-8?B?Y2Fm?= =?UTF-8?B?w6k=?="),
                "café"
            );
        }

        #[test]
        fn date_fallbacks() {
            let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
            let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

            let header =
                resolve_date(Some("Fri, 1 Mar 2024 13:00:00 +0100 (CET)"), None, None, now);
            assert_eq!(header, expected);

            let internal =
                resolve_date(Some("yesterday"), None, Some(" 1-Mar-2024 12:00:00 +0000"), now);
            assert_eq!(internal, expected);

            assert_eq!(resolve_date(None, None, None, now), now);
        }

        #[test]
        fn build_mail_from_header() {
            let fetched = FetchedHeader {
                uid: 7,
                flags: ["\\Seen"].into_iter().collect::<FlagSet>(),
                header: b"Message-ID: <m1@example.com>\r\n\
                    In-Reply-To: <m0@example.com>\r\n\
                    Subject: =?UTF-8?B?Y2Fmw6k=?=\r\n\
                    Date: Fri, 1 Mar 2024 12:00:00 +0000\r\n\r\n"
                    .to_vec(),
                ..FetchedHeader::default()
            };
            let mail = build_mail(fetched, "INBOX").unwrap();
            assert_eq!(mail.uid, 7);
            assert_eq!(mail.message_id, "m1@example.com");
            assert_eq!(mail.in_reply_to.as_deref(), Some("m0@example.com"));
            assert_eq!(mail.subject, "café");
            assert!(mail.is_seen());
            assert_eq!(mail.mailbox, "INBOX");
        }

        #[test]
        fn build_mail_without_message_id() {
            let fetched = FetchedHeader {
                uid: 3,
                header: b"Subject: hi\r\n\r\n".to_vec(),
                ..FetchedHeader::default()
            };
            let err = build_mail(fetched, "INBOX").unwrap_err();
            assert!(err.to_string().contains("uid 3"));
        }
    }

    mod outgoing_tests {
        use super::*;

        fn now() -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        }

        #[test]
        fn addresses() {
            assert_eq!(
                parse_address_list(
                    r#""Doe, Jane" <jane@example.com>, bob@example.com, undisclosed-recipients:;"#
                ),
                vec!["jane@example.com", "bob@example.com"]
            );
        }

        #[test]
        fn synthesizes_missing_headers() {
            let raw = b"To: bob@example.com\nSubject: hi\n\nbody\n";
            let submission = normalize_outgoing(raw, "me@example.org", now()).unwrap();
            let data = String::from_utf8(submission.data).unwrap();

            assert_eq!(submission.from, "me@example.org");
            assert!(submission.message_id.ends_with("@example.org"));
            assert!(data.starts_with("From: me@example.org\n"));
            assert!(data.contains(&format!("Message-ID: <{}>\n", submission.message_id)));
            assert!(data.contains("Date: Fri, 1 Mar 2024 12:00:00 +0000\n"));
            assert!(data.ends_with("\n\nbody\n"));
        }

        #[test]
        fn keeps_existing_headers_and_strips_bcc() {
            let raw = b"From: Me <me@example.com>\r\n\
                To: a@example.com\r\n\
                Cc: b@example.com\r\n\
                Bcc: hidden1@example.net,\r\n hidden2@example.net\r\n\
                Message-ID: <fixed@example.com>\r\n\
                Date: Fri, 1 Mar 2024 10:00:00 +0000\r\n\
                Subject: hi\r\n\r\nbody";
            let submission = normalize_outgoing(raw, "other@example.com", now()).unwrap();
            let data = String::from_utf8(submission.data).unwrap();

            assert_eq!(submission.from, "me@example.com");
            assert_eq!(submission.message_id, "fixed@example.com");
            assert_eq!(
                submission.recipients,
                vec![
                    "a@example.com",
                    "b@example.com",
                    "hidden1@example.net",
                    "hidden2@example.net"
                ]
            );
            assert!(!data.lines().any(|line| line.to_lowercase().starts_with("bcc")));
            assert!(!data.contains("hidden1@example.net"));
            assert!(!data.contains("hidden2@example.net"));
            assert!(data.starts_with("From: Me <me@example.com>\r\n"));
            assert!(data.ends_with("Subject: hi\r\n\r\nbody"));
        }

        #[test]
        fn replaces_unparsable_from_and_message_id() {
            let raw = b"From: undisclosed\r\n\
                To: a@example.com\r\n\
                Message-ID: broken-id\r\n\
                \tcontinued\r\n\
                Subject: hi\r\n\r\nbody";
            let submission = normalize_outgoing(raw, "me@example.com", now()).unwrap();
            let data = String::from_utf8(submission.data).unwrap();

            let count = |field: &str| {
                data.lines()
                    .filter(|line| line.to_lowercase().starts_with(field))
                    .count()
            };
            assert_eq!(count("from:"), 1);
            assert_eq!(count("message-id:"), 1);
            assert!(data.starts_with("From: me@example.com\r\n"));
            assert!(data.contains(&format!("Message-ID: <{}>\r\n", submission.message_id)));
            assert!(!data.contains("undisclosed"));
            assert!(!data.contains("broken-id"));
            assert!(!data.contains("continued"));
        }

        #[test]
        fn no_recipients() {
            let raw = b"Subject: lonely\n\nbody";
            assert!(matches!(
                normalize_outgoing(raw, "me@example.com", now()),
                Err(Error::Parse(_))
            ));
        }
    }
}

//! Mail store repository.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};

use super::migrations::{MIGRATOR, migrate};
use super::threading::assign_threads;
use crate::model::{BodyPart, FlagSet, FlagUpdate, Mail, Mailbox, Thread, ThreadNode};
use crate::service::MailboxSnapshot;
use crate::{Error, Result};

/// Columns selected for every [`Mail`] read, with the mailbox name joined
/// in. Expects aliases `m` for mail and `mb` for mailbox.
const MAIL_COLUMNS: &str = r"
    m.id, m.uid, m.messageid, m.inreplyto, m.threadid, m.flags, m.date,
    m.subject, m.parts, mb.name AS mailboxname
";

/// Outcome of a flag reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Mails whose flags already matched.
    pub unchanged: usize,
    /// Mails whose flags were overwritten.
    pub updated: usize,
    /// Mails removed because the server no longer has them.
    pub deleted: usize,
}

/// Durable storage for mailboxes, mails and thread ids.
#[derive(Debug)]
pub struct MailStore {
    pool: SqlitePool,
}

impl MailStore {
    /// Opens (or creates) the store at `path` and applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or a migration
    /// fails or does not match the applied schema.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection or a migration fails.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        migrate(&self.pool, &MIGRATOR).await
    }

    /// Returns the mailbox hierarchy of an account, ordered by name.
    ///
    /// Registers the account on first use. A mailbox whose parent is not
    /// stored is treated as a root.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_mailboxes(&self, account: &str) -> Result<Vec<Mailbox>> {
        let mut tx = self.pool.begin().await?;
        let account_id = ensure_account(&mut tx, account).await?;

        let rows = sqlx::query(
            r"
            WITH RECURSIVE tree(id, name, shortname, parent, lastseenuid, readonly, uidnext, depth)
            AS (
                SELECT m.id, m.name, m.shortname, m.parent, m.lastseenuid, m.readonly, m.uidnext, 0
                FROM mailbox m
                WHERE m.account = ?1
                  AND (m.parent IS NULL OR NOT EXISTS (
                        SELECT 1 FROM mailbox p WHERE p.account = ?1 AND p.name = m.parent
                  ))
              UNION ALL
                SELECT c.id, c.name, c.shortname, c.parent, c.lastseenuid, c.readonly, c.uidnext,
                       tree.depth + 1
                FROM tree
                JOIN mailbox c ON c.account = ?1 AND c.parent = tree.name
            )
            SELECT
                tree.name, tree.shortname, tree.parent, tree.lastseenuid, tree.readonly,
                tree.uidnext, tree.depth,
                (SELECT count(*) FROM mail WHERE mail.mailbox = tree.id) AS total,
                (SELECT count(*) FROM mail
                    WHERE mail.mailbox = tree.id
                      AND instr(',' || mail.flags || ',', ',\Seen,') = 0) AS unseen
            FROM tree
            ORDER BY tree.name
            ",
        )
        .bind(account_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(rows.iter().map(row_to_mailbox).collect())
    }

    /// Stores newly discovered mailboxes; existing ones are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn upsert_mailboxes(&self, account: &str, mailboxes: &[Mailbox]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let account_id = ensure_account(&mut tx, account).await?;

        for mailbox in mailboxes {
            sqlx::query(
                r"
                INSERT INTO mailbox (name, shortname, parent, account)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(name, account) DO NOTHING
                ",
            )
            .bind(&mailbox.name)
            .bind(&mailbox.short_name)
            .bind(&mailbox.parent)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Upserted {} mailbox(es) for {account}", mailboxes.len());
        Ok(())
    }

    /// Records the state the server reported on the last SELECT of a
    /// mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn record_snapshot(
        &self,
        account: &str,
        mailbox: &str,
        snapshot: &MailboxSnapshot,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let account_id = ensure_account(&mut tx, account).await?;
        let mailbox_id = ensure_mailbox(&mut tx, account_id, mailbox).await?;

        sqlx::query("UPDATE mailbox SET readonly = ?, uidnext = ? WHERE id = ?")
            .bind(snapshot.read_only)
            .bind(snapshot.uid_next.map(i64::from))
            .bind(mailbox_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Stores a batch of fetched mails and assigns their thread ids.
    ///
    /// Runs as one transaction: the rows, the mailbox watermark, the thread
    /// ids and the thread counter are committed together or not at all.
    /// Returns the new watermark of the mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing is written then.
    pub async fn insert_new_messages(
        &self,
        account: &str,
        mailbox: &str,
        mails: &[Mail],
    ) -> Result<u32> {
        let mut tx = self.pool.begin().await?;
        let account_id = ensure_account(&mut tx, account).await?;
        let mailbox_id = ensure_mailbox(&mut tx, account_id, mailbox).await?;

        let mut inserted = Vec::with_capacity(mails.len());
        let mut copies = 0usize;
        let mut max_uid = 0u32;

        for mail in mails {
            max_uid = max_uid.max(mail.uid);

            let original = sqlx::query(
                "SELECT id, threadid FROM mail WHERE messageid = ? AND identicalas IS NULL",
            )
            .bind(&mail.message_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| (row.get::<i64, _>("id"), row.get::<Option<i64>, _>("threadid")));

            let (identical_as, thread_id) = original.map_or((None, None), |(id, t)| (Some(id), t));

            let id: Option<i64> = sqlx::query_scalar(
                r"
                INSERT INTO mail
                    (threadid, date, uid, flags, subject, messageid, inreplyto,
                     parts, identicalas, mailbox, account)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(uid, mailbox) DO NOTHING
                RETURNING id
                ",
            )
            .bind(thread_id)
            .bind(date_to_db(&mail.date))
            .bind(i64::from(mail.uid))
            .bind(mail.flags.to_db())
            .bind(&mail.subject)
            .bind(&mail.message_id)
            .bind(&mail.in_reply_to)
            .bind(serde_json::to_string(&mail.parts)?)
            .bind(identical_as)
            .bind(mailbox_id)
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .await?;

            match (id, identical_as) {
                (Some(id), None) => inserted.push(id),
                (Some(_), Some(_)) => copies += 1,
                (None, _) => {}
            }
        }

        let last_seen_uid: i64 = sqlx::query_scalar(
            r"
            UPDATE mailbox SET lastseenuid = max(lastseenuid, ?)
            WHERE id = ?
            RETURNING lastseenuid
            ",
        )
        .bind(i64::from(max_uid))
        .bind(mailbox_id)
        .fetch_one(&mut *tx)
        .await?;

        assign_threads(&mut tx, &inserted).await?;

        tx.commit().await?;

        info!(
            "Stored {} new mail(s) and {copies} copy(ies) in {account}/{mailbox}",
            inserted.len()
        );
        Ok(u32::try_from(last_seen_uid).unwrap_or_default())
    }

    /// Aligns stored flags with the server for every mail with a UID up to
    /// `last_seen_uid`.
    ///
    /// Unchanged flag sets are not written. Mails the server no longer
    /// lists are deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing is written then.
    pub async fn reconcile_messages(
        &self,
        account: &str,
        mailbox: &str,
        updates: &[FlagUpdate],
        last_seen_uid: u32,
    ) -> Result<ReconcileSummary> {
        let mut tx = self.pool.begin().await?;
        let mut summary = ReconcileSummary::default();

        let Some(mailbox_id) = find_mailbox(&mut tx, account, mailbox).await? else {
            return Ok(summary);
        };

        let server: HashMap<u32, &FlagSet> = updates.iter().map(|u| (u.uid, &u.flags)).collect();

        let rows = sqlx::query("SELECT id, uid, flags FROM mail WHERE mailbox = ? AND uid <= ?")
            .bind(mailbox_id)
            .bind(i64::from(last_seen_uid))
            .fetch_all(&mut *tx)
            .await?;

        for row in rows {
            let id: i64 = row.get("id");
            let uid = u32::try_from(row.get::<i64, _>("uid")).unwrap_or_default();
            let stored = FlagSet::from_db(row.get::<&str, _>("flags"));

            match server.get(&uid) {
                Some(flags) if **flags == stored => summary.unchanged += 1,
                Some(flags) => {
                    sqlx::query("UPDATE mail SET flags = ? WHERE id = ?")
                        .bind(flags.to_db())
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    summary.updated += 1;
                }
                None => {
                    delete_mail(&mut tx, id).await?;
                    summary.deleted += 1;
                }
            }
        }

        tx.commit().await?;

        info!(
            "Reconciled {account}/{mailbox}: {} unchanged, {} updated, {} deleted",
            summary.unchanged, summary.updated, summary.deleted
        );
        Ok(summary)
    }

    /// Returns the conversation subtree below `root_id` in depth-first
    /// order, children sorted by arrival.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn fetch_thread_mails(&self, root_id: i64) -> Result<Vec<ThreadNode>> {
        let query = format!(
            r"
            WITH RECURSIVE sub(id, messageid, depth, path) AS (
                SELECT id, messageid, 0, printf('/%010d', id)
                FROM mail WHERE id = ?
              UNION ALL
                SELECT c.id, c.messageid, sub.depth + 1, sub.path || printf('/%010d', c.id)
                FROM sub
                JOIN mail c ON c.inreplyto = sub.messageid AND c.identicalas IS NULL
                WHERE sub.messageid <> '' AND instr(sub.path, printf('/%010d', c.id)) = 0
            )
            SELECT {MAIL_COLUMNS}, sub.depth
            FROM sub
            JOIN mail m ON m.id = sub.id
            JOIN mailbox mb ON mb.id = m.mailbox
            ORDER BY sub.path
            "
        );

        let rows = sqlx::query(&query)
            .bind(root_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ThreadNode {
                    mail: row_to_mail(row)?,
                    depth: u32::try_from(row.get::<i64, _>("depth")).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Returns one summary per thread of a mailbox, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn list_threads(&self, account: &str, mailbox: &str) -> Result<Vec<Thread>> {
        let rows = sqlx::query(
            r"
            WITH base AS (
                SELECT
                    m.id, m.threadid, m.subject, m.date, m.flags,
                    CASE WHEN m.inreplyto IS NULL OR NOT EXISTS (
                        SELECT 1 FROM mail p WHERE p.messageid = m.inreplyto
                    ) THEN 0 ELSE 1 END AS hasparent
                FROM mail m
                JOIN mailbox mb ON mb.id = m.mailbox
                JOIN account a ON a.id = mb.account
                WHERE a.name = ? AND mb.name = ? AND m.threadid IS NOT NULL
            ),
            ranked AS (
                SELECT
                    id, threadid, subject,
                    count(*) OVER w AS total,
                    max(date) OVER w AS lastdate,
                    max(instr(',' || flags || ',', ',\Seen,') = 0) OVER w AS unread,
                    row_number() OVER (
                        PARTITION BY threadid ORDER BY hasparent, date, id
                    ) AS position
                FROM base
                WINDOW w AS (PARTITION BY threadid)
            )
            SELECT id, threadid, subject, total, lastdate, unread
            FROM ranked
            WHERE position = 1
            ORDER BY lastdate DESC, threadid DESC
            ",
        )
        .bind(account)
        .bind(mailbox)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Thread {
                    thread_id: row.get("threadid"),
                    root_id: row.get("id"),
                    subject: row.get("subject"),
                    count: u32::try_from(row.get::<i64, _>("total")).unwrap_or_default(),
                    last_date: date_from_db(row.get("lastdate"))?,
                    unread: row.get::<i64, _>("unread") != 0,
                })
            })
            .collect()
    }

    /// Returns the watermark of a mailbox, 0 when it is not stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn last_seen_uid(&self, account: &str, mailbox: &str) -> Result<u32> {
        let uid: Option<i64> = sqlx::query_scalar(
            r"
            SELECT mb.lastseenuid
            FROM mailbox mb
            JOIN account a ON a.id = mb.account
            WHERE a.name = ? AND mb.name = ?
            ",
        )
        .bind(account)
        .bind(mailbox)
        .fetch_optional(&self.pool)
        .await?;

        Ok(uid.and_then(|u| u32::try_from(u).ok()).unwrap_or_default())
    }

    /// Returns the stored mails of a mailbox ordered by UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn list_mails(&self, account: &str, mailbox: &str) -> Result<Vec<Mail>> {
        let query = format!(
            r"
            SELECT {MAIL_COLUMNS}
            FROM mail m
            JOIN mailbox mb ON mb.id = m.mailbox
            JOIN account a ON a.id = mb.account
            WHERE a.name = ? AND mb.name = ?
            ORDER BY m.uid
            "
        );

        let rows = sqlx::query(&query)
            .bind(account)
            .bind(mailbox)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_mail).collect()
    }

    /// Looks up a stored mail by account, mailbox and UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub async fn find_mail(&self, account: &str, mailbox: &str, uid: u32) -> Result<Option<Mail>> {
        let query = format!(
            r"
            SELECT {MAIL_COLUMNS}
            FROM mail m
            JOIN mailbox mb ON mb.id = m.mailbox
            JOIN account a ON a.id = mb.account
            WHERE a.name = ? AND mb.name = ? AND m.uid = ?
            "
        );

        let row = sqlx::query(&query)
            .bind(account)
            .bind(mailbox)
            .bind(i64::from(uid))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_mail).transpose()
    }

    /// Looks up the original (non-copy) mail carrying a Message-ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub async fn find_by_message_id(&self, message_id: &str) -> Result<Option<Mail>> {
        let query = format!(
            r"
            SELECT {MAIL_COLUMNS}
            FROM mail m
            JOIN mailbox mb ON mb.id = m.mailbox
            WHERE m.messageid = ? AND m.identicalas IS NULL
            "
        );

        let row = sqlx::query(&query)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_mail).transpose()
    }

    /// Returns the row id of the original a copy points at.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn identical_as(&self, mail_id: i64) -> Result<Option<i64>> {
        let original =
            sqlx::query_scalar::<_, Option<i64>>("SELECT identicalas FROM mail WHERE id = ?")
                .bind(mail_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();
        Ok(original)
    }
}

async fn ensure_account(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    sqlx::query("INSERT INTO account (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .execute(&mut *conn)
        .await?;

    let id = sqlx::query_scalar("SELECT id FROM account WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

async fn find_mailbox(
    conn: &mut SqliteConnection,
    account: &str,
    name: &str,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar(
        r"
        SELECT mb.id
        FROM mailbox mb
        JOIN account a ON a.id = mb.account
        WHERE a.name = ? AND mb.name = ?
        ",
    )
    .bind(account)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

/// Returns the id of a mailbox, registering it as a root if the hierarchy
/// was never listed.
async fn ensure_mailbox(conn: &mut SqliteConnection, account_id: i64, name: &str) -> Result<i64> {
    sqlx::query(
        r"
        INSERT INTO mailbox (name, shortname, account)
        VALUES (?1, ?1, ?2)
        ON CONFLICT(name, account) DO NOTHING
        ",
    )
    .bind(name)
    .bind(account_id)
    .execute(&mut *conn)
    .await?;

    let id = sqlx::query_scalar("SELECT id FROM mailbox WHERE name = ? AND account = ?")
        .bind(name)
        .bind(account_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

/// Deletes a mail, promoting its oldest copy to original first.
async fn delete_mail(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    let heir: Option<i64> =
        sqlx::query_scalar("SELECT id FROM mail WHERE identicalas = ? ORDER BY id LIMIT 1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

    if let Some(heir) = heir {
        // Demote `id` first so only one row per message id is an original.
        sqlx::query(
            "UPDATE mail SET identicalas = ?1 WHERE (identicalas = ?2 AND id <> ?1) OR id = ?2",
        )
        .bind(heir)
        .bind(id)
        .execute(&mut *conn)
        .await?;
        sqlx::query("UPDATE mail SET identicalas = NULL WHERE id = ?")
            .bind(heir)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("DELETE FROM mail WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn date_to_db(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn date_from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|e| Error::Parse(format!("stored date `{value}`: {e}")))
}

fn row_to_mailbox(row: &SqliteRow) -> Mailbox {
    Mailbox {
        name: row.get("name"),
        parent: row.get("parent"),
        short_name: row.get("shortname"),
        last_seen_uid: u32::try_from(row.get::<i64, _>("lastseenuid")).unwrap_or_default(),
        read_only: row.get::<i64, _>("readonly") != 0,
        uid_next: row
            .get::<Option<i64>, _>("uidnext")
            .and_then(|uid| u32::try_from(uid).ok()),
        count: u32::try_from(row.get::<i64, _>("total")).unwrap_or_default(),
        unseen: u32::try_from(row.get::<i64, _>("unseen")).unwrap_or_default(),
        depth: u32::try_from(row.get::<i64, _>("depth")).unwrap_or_default(),
    }
}

fn row_to_mail(row: &SqliteRow) -> Result<Mail> {
    let parts: Vec<BodyPart> = serde_json::from_str(row.get("parts"))?;
    Ok(Mail {
        id: Some(row.get("id")),
        uid: u32::try_from(row.get::<i64, _>("uid")).unwrap_or_default(),
        message_id: row.get("messageid"),
        in_reply_to: row.get("inreplyto"),
        thread_id: row.get("threadid"),
        flags: FlagSet::from_db(row.get("flags")),
        date: date_from_db(row.get("date"))?,
        subject: row.get("subject"),
        parts,
        mailbox: row.get("mailboxname"),
    })
}

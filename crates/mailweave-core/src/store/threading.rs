//! Thread id assignment.
//!
//! Mails are linked by their In-Reply-To header. A thread is the tree
//! hanging below a root, the first ancestor whose parent is not stored.
//! Every insert batch finds the roots of the new mails, settles on one id
//! per root and pushes it down the whole tree, so mails converge on a
//! single thread id whatever order they arrive in.

use std::collections::HashSet;

use sqlx::SqliteConnection;
use tracing::trace;

use crate::Result;

/// The persisted source of fresh thread ids.
///
/// Loaded once per batch, advanced in memory and saved in the same
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadCounter {
    value: i64,
}

impl ThreadCounter {
    /// Reads the current counter value.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter row cannot be read.
    pub async fn load(conn: &mut SqliteConnection) -> Result<Self> {
        let value: i64 = sqlx::query_scalar("SELECT value FROM counter WHERE name = 'threadid'")
            .fetch_one(&mut *conn)
            .await?;
        Ok(Self { value })
    }

    /// Allocates the next thread id.
    pub const fn next(&mut self) -> i64 {
        self.value += 1;
        self.value
    }

    /// Last allocated id.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.value
    }

    /// Writes the counter back.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn save(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("UPDATE counter SET value = ? WHERE name = 'threadid'")
            .bind(self.value)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

/// Walks In-Reply-To links upward from `mail_id` and returns the first
/// ancestor without a stored parent.
///
/// A mail without parent, or caught in a reply cycle, is its own root.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn find_root(conn: &mut SqliteConnection, mail_id: i64) -> Result<i64> {
    let root: Option<i64> = sqlx::query_scalar(
        r"
        WITH RECURSIVE up(id, messageid, inreplyto) AS (
            SELECT id, messageid, inreplyto FROM mail WHERE id = ?1 AND messageid <> ''
          UNION
            SELECT parent.id, parent.messageid, parent.inreplyto
            FROM up
            JOIN mail parent
              ON parent.messageid = up.inreplyto AND parent.identicalas IS NULL
        )
        SELECT up.id FROM up
        WHERE up.inreplyto IS NULL
           OR NOT EXISTS (
                SELECT 1 FROM mail p
                WHERE p.messageid = up.inreplyto AND p.identicalas IS NULL
           )
        LIMIT 1
        ",
    )
    .bind(mail_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(root.unwrap_or(mail_id))
}

/// Picks the thread id of the tree rooted at `root_id`.
///
/// Prefers the root's own id, then the id of its first direct child that
/// has one, and finally allocates a fresh one.
///
/// # Errors
///
/// Returns an error if a query fails.
pub async fn resolve_thread_id(
    conn: &mut SqliteConnection,
    root_id: i64,
    counter: &mut ThreadCounter,
) -> Result<i64> {
    let own = sqlx::query_scalar::<_, Option<i64>>("SELECT threadid FROM mail WHERE id = ?")
        .bind(root_id)
        .fetch_optional(&mut *conn)
        .await?
        .flatten();
    if let Some(thread_id) = own {
        return Ok(thread_id);
    }

    let from_child: Option<i64> = sqlx::query_scalar(
        r"
        SELECT child.threadid
        FROM mail root
        JOIN mail child ON child.inreplyto = root.messageid
        WHERE root.id = ? AND root.messageid <> '' AND child.threadid IS NOT NULL
        ORDER BY child.id
        LIMIT 1
        ",
    )
    .bind(root_id)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(thread_id) = from_child {
        return Ok(thread_id);
    }

    Ok(counter.next())
}

/// Sets `thread_id` on the tree below `root_id` and on the duplicate
/// copies of its members.
///
/// # Errors
///
/// Returns an error if the update fails.
pub async fn propagate(conn: &mut SqliteConnection, root_id: i64, thread_id: i64) -> Result<u64> {
    let result = sqlx::query(
        r"
        WITH RECURSIVE down(id, messageid) AS (
            SELECT id, messageid FROM mail WHERE id = ?1
          UNION
            SELECT child.id, child.messageid
            FROM down
            JOIN mail child ON child.inreplyto = down.messageid
            WHERE down.messageid <> ''
        )
        UPDATE mail SET threadid = ?2
        WHERE id IN (SELECT id FROM down) OR identicalas IN (SELECT id FROM down)
        ",
    )
    .bind(root_id)
    .bind(thread_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Assigns thread ids for a batch of freshly inserted mails.
///
/// Each distinct root is processed once. The counter is read and written
/// exactly once.
///
/// # Errors
///
/// Returns an error if any query fails; the caller's transaction must then
/// be rolled back.
pub async fn assign_threads(conn: &mut SqliteConnection, mail_ids: &[i64]) -> Result<()> {
    if mail_ids.is_empty() {
        return Ok(());
    }

    let mut counter = ThreadCounter::load(conn).await?;
    let mut seen_roots = HashSet::new();

    for &mail_id in mail_ids {
        let root = find_root(conn, mail_id).await?;
        if !seen_roots.insert(root) {
            continue;
        }
        let thread_id = resolve_thread_id(conn, root, &mut counter).await?;
        let updated = propagate(conn, root, thread_id).await?;
        trace!("Thread {thread_id} rooted at mail {root} covers {updated} row(s)");
    }

    counter.save(conn).await
}

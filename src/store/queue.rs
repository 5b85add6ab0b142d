//! Durable polling job queue.
//!
//! Claims are leases: a claimant owns an entry until `lease_expires_at`, and
//! after that the entry is claimable again by anyone. Every ownership-checked
//! write is one `UPDATE ... WHERE lease_owner = ?` whose affected-row count
//! is the only authority on success. A `false` return means the lease was
//! lost and the caller must abandon the unit of work.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::{Enqueued, QueueEntry, QueueStatus};
use super::{Store, parse_json, parse_status};
use crate::clock::{from_millis, to_millis};

const ENTRY_COLUMNS: &str = "id, job_type, payload, scheduled_for, dedupe_key, status, attempts, \
                             lease_owner, lease_expires_at, last_error, created_at, updated_at";

/// Eligibility shared by candidate selection and the claiming update:
/// due, and either pending or holding an expired lease. `?1` is now.
const ELIGIBLE: &str = "scheduled_for <= ?1 \
                        AND (status = 'pending' OR (status = 'leased' AND lease_expires_at <= ?1))";

pub struct JobQueue<'a> {
    store: &'a Store,
}

struct QueueEntryRow {
    id: i64,
    job_type: String,
    payload: String,
    scheduled_for: i64,
    dedupe_key: Option<String>,
    status: String,
    attempts: i64,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl QueueEntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_type: row.get(1)?,
            payload: row.get(2)?,
            scheduled_for: row.get(3)?,
            dedupe_key: row.get(4)?,
            status: row.get(5)?,
            attempts: row.get(6)?,
            lease_owner: row.get(7)?,
            lease_expires_at: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_entry(self) -> Result<QueueEntry> {
        Ok(QueueEntry {
            id: self.id,
            job_type: self.job_type,
            payload: parse_json(&self.payload, "queue_entries.payload")?,
            scheduled_for: from_millis(self.scheduled_for),
            dedupe_key: self.dedupe_key,
            status: parse_status(&self.status)?,
            attempts: u32::try_from(self.attempts).context("Negative attempts counter")?,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at.map(from_millis),
            last_error: self.last_error,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

/// Insert a pending entry unless the dedupe key is already taken.
/// Shared with barrier registration, which enqueues inside its transaction.
pub(crate) fn insert_entry(
    conn: &Connection,
    now: DateTime<Utc>,
    job_type: &str,
    payload: &serde_json::Value,
    scheduled_for: DateTime<Utc>,
    dedupe_key: Option<&str>,
) -> Result<Enqueued> {
    let payload = serde_json::to_string(payload).context("Failed to serialize payload")?;
    let now = to_millis(now);
    let inserted = conn
        .execute(
            "INSERT INTO queue_entries
                 (job_type, payload, scheduled_for, dedupe_key, status, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)
             ON CONFLICT(dedupe_key) DO NOTHING",
            params![job_type, payload, to_millis(scheduled_for), dedupe_key, now],
        )
        .context("Failed to insert queue entry")?;
    if inserted == 0 {
        return Ok(Enqueued::Duplicate);
    }
    Ok(Enqueued::Inserted(conn.last_insert_rowid()))
}

impl<'a> JobQueue<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Add a pending entry. A dedupe-key collision with any existing entry,
    /// whatever its status, returns `Enqueued::Duplicate` and writes nothing.
    pub fn enqueue(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
        scheduled_for: DateTime<Utc>,
        dedupe_key: Option<&str>,
    ) -> Result<Enqueued> {
        let enqueued = insert_entry(
            self.store.conn(),
            self.store.now(),
            job_type,
            payload,
            scheduled_for,
            dedupe_key,
        )?;
        match enqueued {
            Enqueued::Inserted(id) => {
                tracing::debug!(entry_id = id, job_type, "Enqueued job");
            }
            Enqueued::Duplicate => {
                tracing::debug!(job_type, dedupe_key, "Skipped duplicate enqueue");
            }
        }
        Ok(enqueued)
    }

    /// Lease the earliest eligible entry of any type.
    pub fn claim_next_job(&self, owner: &str) -> Result<Option<QueueEntry>> {
        self.claim_next(owner, None)
    }

    /// Lease the earliest eligible entry whose type is in `job_types`.
    pub fn claim_next_job_of_types(
        &self,
        owner: &str,
        job_types: &[String],
    ) -> Result<Option<QueueEntry>> {
        let filter = serde_json::to_string(job_types).context("Failed to encode type filter")?;
        self.claim_next(owner, Some(filter))
    }

    fn claim_next(&self, owner: &str, type_filter: Option<String>) -> Result<Option<QueueEntry>> {
        let sql = format!(
            "SELECT id FROM queue_entries
             WHERE {ELIGIBLE}
               AND (?2 IS NULL OR job_type IN (SELECT value FROM json_each(?2)))
             ORDER BY scheduled_for, id
             LIMIT 1"
        );
        // Each lost race means another claimant made progress, so this terminates.
        loop {
            let now = self.store.now();
            let candidate: Option<i64> = self
                .store
                .conn()
                .query_row(&sql, params![to_millis(now), type_filter], |row| row.get(0))
                .optional()
                .context("Failed to select claim candidate")?;
            let Some(id) = candidate else {
                return Ok(None);
            };
            if let Some(entry) = self.try_claim(id, owner, now)? {
                return Ok(Some(entry));
            }
            tracing::trace!(entry_id = id, owner, "Lost claim race, trying next candidate");
        }
    }

    /// Lease one specific entry if it is eligible.
    pub fn claim_job_by_id(&self, id: i64, owner: &str) -> Result<Option<QueueEntry>> {
        self.try_claim(id, owner, self.store.now())
    }

    fn try_claim(&self, id: i64, owner: &str, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let expires_at = now + self.store.lease_ttl();
        let sql = format!(
            "UPDATE queue_entries
             SET status = 'leased', lease_owner = ?3, lease_expires_at = ?4,
                 attempts = attempts + 1, updated_at = ?1
             WHERE id = ?2 AND {ELIGIBLE}
             RETURNING {ENTRY_COLUMNS}"
        );
        let row = self
            .store
            .conn()
            .query_row(
                &sql,
                params![to_millis(now), id, owner, to_millis(expires_at)],
                QueueEntryRow::from_row,
            )
            .optional()
            .context("Failed to claim queue entry")?;
        match row {
            Some(row) => {
                let entry = row.into_entry()?;
                tracing::debug!(
                    entry_id = entry.id,
                    job_type = %entry.job_type,
                    owner,
                    attempts = entry.attempts,
                    "Claimed job"
                );
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Push the lease expiry `seconds` past now. `false` means the caller no
    /// longer holds the lease.
    pub fn extend_lease(&self, id: i64, owner: &str, seconds: i64) -> Result<bool> {
        let now = self.store.now();
        let expires_at = now + chrono::Duration::seconds(seconds);
        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE queue_entries SET lease_expires_at = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = 'leased' AND lease_owner = ?2",
                params![id, owner, to_millis(expires_at), to_millis(now)],
            )
            .context("Failed to extend lease")?;
        if changed == 0 {
            tracing::warn!(entry_id = id, owner, "Lease extension refused: lease lost");
        }
        Ok(changed == 1)
    }

    /// Finish a leased entry as `done` or `failed`. `false` means the lease
    /// was lost and the completion was not recorded.
    pub fn complete_job(&self, id: i64, status: QueueStatus, owner: &str) -> Result<bool> {
        if !status.is_terminal() {
            anyhow::bail!("complete_job requires done or failed, got {}", status);
        }
        self.finish(id, status, owner, None)
    }

    /// Finish a leased entry as `failed`, recording the error.
    pub fn fail_job(&self, id: i64, owner: &str, error: &str) -> Result<bool> {
        self.finish(id, QueueStatus::Failed, owner, Some(error))
    }

    fn finish(
        &self,
        id: i64,
        status: QueueStatus,
        owner: &str,
        error: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE queue_entries
                 SET status = ?3, lease_expires_at = NULL,
                     last_error = COALESCE(?4, last_error), updated_at = ?5
                 WHERE id = ?1 AND status = 'leased' AND lease_owner = ?2",
                params![id, owner, status.as_str(), error, to_millis(self.store.now())],
            )
            .context("Failed to complete queue entry")?;
        if changed == 0 {
            tracing::warn!(entry_id = id, owner, %status, "Completion refused: lease lost");
        }
        Ok(changed == 1)
    }

    /// Return a leased entry to `pending` at `retry_at`. Attempts are kept:
    /// they were counted at claim time.
    pub fn reschedule_job(
        &self,
        id: i64,
        retry_at: DateTime<Utc>,
        error: Option<&str>,
        owner: &str,
    ) -> Result<bool> {
        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE queue_entries
                 SET status = 'pending', scheduled_for = ?3, lease_owner = NULL,
                     lease_expires_at = NULL, last_error = COALESCE(?4, last_error),
                     updated_at = ?5
                 WHERE id = ?1 AND status = 'leased' AND lease_owner = ?2",
                params![
                    id,
                    owner,
                    to_millis(retry_at),
                    error,
                    to_millis(self.store.now())
                ],
            )
            .context("Failed to reschedule queue entry")?;
        if changed == 0 {
            tracing::warn!(entry_id = id, owner, "Reschedule refused: lease lost");
        }
        Ok(changed == 1)
    }

    pub fn get(&self, id: i64) -> Result<Option<QueueEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1");
        let row = self
            .store
            .conn()
            .query_row(&sql, params![id], QueueEntryRow::from_row)
            .optional()
            .context("Failed to query queue entry")?;
        row.map(QueueEntryRow::into_entry).transpose()
    }

    pub fn find_by_dedupe_key(&self, dedupe_key: &str) -> Result<Option<QueueEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE dedupe_key = ?1");
        let row = self
            .store
            .conn()
            .query_row(&sql, params![dedupe_key], QueueEntryRow::from_row)
            .optional()
            .context("Failed to query queue entry by dedupe key")?;
        row.map(QueueEntryRow::into_entry).transpose()
    }

    /// Total number of entries, in any status.
    pub fn len(&self) -> Result<u64> {
        let count: i64 = self
            .store
            .conn()
            .query_row("SELECT COUNT(*) FROM queue_entries", [], |row| row.get(0))
            .context("Failed to count queue entries")?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entry counts per status, in lifecycle order. Statuses with no entries
    /// are included with a zero count.
    pub fn count_by_status(&self) -> Result<Vec<(QueueStatus, u64)>> {
        let mut stmt = self
            .store
            .conn()
            .prepare("SELECT status, COUNT(*) FROM queue_entries GROUP BY status")
            .context("Failed to prepare count_by_status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to count queue entries by status")?;
        let mut counts = vec![
            (QueueStatus::Pending, 0),
            (QueueStatus::Leased, 0),
            (QueueStatus::Done, 0),
            (QueueStatus::Failed, 0),
        ];
        for row in rows {
            let (status, count) = row.context("Failed to read status count")?;
            let status: QueueStatus = parse_status(&status)?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = count as u64;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn store_with_clock() -> Result<(Store, ManualClock)> {
        let clock = ManualClock::new(from_millis(1_700_000_000_000));
        let store = Store::open_in_memory()?
            .with_clock(Arc::new(clock.clone()))
            .with_lease_ttl(Duration::seconds(60));
        Ok((store, clock))
    }

    #[test]
    fn test_enqueue_with_dedupe_key_is_signalled_duplicate() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();

        let first = queue.enqueue("job-x", &json!({}), clock.now(), Some("k1"))?;
        assert!(first.id().is_some());
        assert_eq!(queue.len()?, 1);

        let second = queue.enqueue("job-x", &json!({}), clock.now(), Some("k1"))?;
        assert_eq!(second, Enqueued::Duplicate);
        assert_eq!(second.id(), None);
        assert_eq!(queue.len()?, 1);
        Ok(())
    }

    #[test]
    fn test_dedupe_key_blocks_even_after_completion() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        queue.enqueue("job-x", &json!({}), clock.now(), Some("k1"))?;
        let entry = queue.claim_next_job("w1")?.expect("claimable");
        assert!(queue.complete_job(entry.id, QueueStatus::Done, "w1")?);

        let again = queue.enqueue("job-x", &json!({}), clock.now(), Some("k1"))?;
        assert_eq!(again, Enqueued::Duplicate);
        Ok(())
    }

    #[test]
    fn test_entries_without_dedupe_key_never_collide() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        queue.enqueue("job-x", &json!({}), clock.now(), None)?;
        queue.enqueue("job-x", &json!({}), clock.now(), None)?;
        assert_eq!(queue.len()?, 2);
        Ok(())
    }

    #[test]
    fn test_basic_claim_complete_drains_queue() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        queue.enqueue(
            "job-basic",
            &json!({"n": 1}),
            clock.now() - Duration::seconds(5),
            None,
        )?;

        let entry = queue.claim_next_job("worker-a")?.expect("entry should be claimable");
        assert_eq!(entry.job_type, "job-basic");
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.status, QueueStatus::Leased);
        assert_eq!(entry.lease_owner.as_deref(), Some("worker-a"));
        assert_eq!(entry.lease_expires_at, Some(clock.now() + Duration::seconds(60)));
        assert_eq!(entry.payload["n"], 1);

        assert!(queue.complete_job(entry.id, QueueStatus::Done, "worker-a")?);
        assert!(queue.claim_next_job("worker-a")?.is_none());

        let done = queue.get(entry.id)?.unwrap();
        assert_eq!(done.status, QueueStatus::Done);
        assert!(done.lease_expires_at.is_none());
        Ok(())
    }

    #[test]
    fn test_future_entries_are_not_claimable() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        queue.enqueue("later", &json!(null), clock.now() + Duration::seconds(30), None)?;

        assert!(queue.claim_next_job("w")?.is_none());
        clock.advance(Duration::seconds(30));
        assert!(queue.claim_next_job("w")?.is_some());
        Ok(())
    }

    #[test]
    fn test_claim_order_is_earliest_scheduled_first() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        let late = queue
            .enqueue("j", &json!(null), clock.now() - Duration::seconds(1), None)?
            .id()
            .unwrap();
        let early = queue
            .enqueue("j", &json!(null), clock.now() - Duration::seconds(10), None)?
            .id()
            .unwrap();

        assert_eq!(queue.claim_next_job("w")?.unwrap().id, early);
        assert_eq!(queue.claim_next_job("w")?.unwrap().id, late);
        Ok(())
    }

    #[test]
    fn test_expired_lease_is_reclaimed_with_more_attempts() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        queue.enqueue("j", &json!(null), clock.now(), None)?;

        let first = queue.claim_next_job("crashed")?.unwrap();
        assert_eq!(first.attempts, 1);
        // Live lease blocks everyone else.
        assert!(queue.claim_next_job("rescuer")?.is_none());

        clock.advance(Duration::seconds(61));
        let second = queue.claim_next_job("rescuer")?.expect("expired lease reclaimable");
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 2);
        assert_eq!(second.lease_owner.as_deref(), Some("rescuer"));

        // The original owner has lost every ownership-checked operation.
        assert!(!queue.extend_lease(first.id, "crashed", 60)?);
        assert!(!queue.complete_job(first.id, QueueStatus::Done, "crashed")?);
        assert!(!queue.reschedule_job(first.id, clock.now(), None, "crashed")?);
        assert!(queue.complete_job(first.id, QueueStatus::Done, "rescuer")?);
        Ok(())
    }

    #[test]
    fn test_extend_lease_keeps_entry_owned() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        queue.enqueue("j", &json!(null), clock.now(), None)?;
        let entry = queue.claim_next_job("w1")?.unwrap();

        clock.advance(Duration::seconds(50));
        assert!(queue.extend_lease(entry.id, "w1", 120)?);
        clock.advance(Duration::seconds(50));
        assert!(queue.claim_next_job("w2")?.is_none());

        let current = queue.get(entry.id)?.unwrap();
        assert_eq!(
            current.lease_expires_at,
            Some(from_millis(1_700_000_000_000) + Duration::seconds(170))
        );
        Ok(())
    }

    #[test]
    fn test_reschedule_preserves_attempts_and_records_error() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        queue.enqueue("j", &json!(null), clock.now(), None)?;
        let entry = queue.claim_next_job("w1")?.unwrap();

        let retry_at = clock.now() + Duration::seconds(10);
        assert!(queue.reschedule_job(entry.id, retry_at, Some("flaky"), "w1")?);

        let pending = queue.get(entry.id)?.unwrap();
        assert_eq!(pending.status, QueueStatus::Pending);
        assert_eq!(pending.attempts, 1);
        assert_eq!(pending.scheduled_for, retry_at);
        assert_eq!(pending.last_error.as_deref(), Some("flaky"));
        assert!(pending.lease_owner.is_none());

        assert!(queue.claim_next_job("w2")?.is_none());
        clock.advance(Duration::seconds(10));
        let again = queue.claim_next_job("w2")?.unwrap();
        assert_eq!(again.attempts, 2);
        Ok(())
    }

    #[test]
    fn test_fail_job_records_error() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        queue.enqueue("j", &json!(null), clock.now(), None)?;
        let entry = queue.claim_next_job("w1")?.unwrap();
        assert!(!queue.fail_job(entry.id, "other", "nope")?);
        assert!(queue.fail_job(entry.id, "w1", "exhausted")?);

        let failed = queue.get(entry.id)?.unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("exhausted"));
        Ok(())
    }

    #[test]
    fn test_complete_job_rejects_non_terminal_status() -> Result<()> {
        let (store, _clock) = store_with_clock()?;
        assert!(store.queue().complete_job(1, QueueStatus::Leased, "w").is_err());
        Ok(())
    }

    #[test]
    fn test_claim_job_by_id_respects_leases() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        let a = queue.enqueue("j", &json!(null), clock.now(), None)?.id().unwrap();
        let b = queue.enqueue("j", &json!(null), clock.now(), None)?.id().unwrap();

        let claimed = queue.claim_job_by_id(b, "direct")?.expect("b claimable");
        assert_eq!(claimed.id, b);
        assert!(queue.claim_job_by_id(b, "other")?.is_none());
        assert!(queue.claim_job_by_id(999, "other")?.is_none());

        assert_eq!(queue.claim_next_job("poller")?.unwrap().id, a);
        Ok(())
    }

    #[test]
    fn test_claim_filtered_by_job_type() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        queue.enqueue("supervisor", &json!(null), clock.now() - Duration::seconds(5), None)?;
        let worker = queue
            .enqueue("worker", &json!(null), clock.now(), None)?
            .id()
            .unwrap();

        let claimed = queue
            .claim_next_job_of_types("w", &["worker".to_string()])?
            .expect("worker entry");
        assert_eq!(claimed.id, worker);
        assert!(queue
            .claim_next_job_of_types("w", &["worker".to_string()])?
            .is_none());
        Ok(())
    }

    #[test]
    fn test_count_by_status() -> Result<()> {
        let (store, clock) = store_with_clock()?;
        let queue = store.queue();
        queue.enqueue("j", &json!(null), clock.now(), None)?;
        queue.enqueue("j", &json!(null), clock.now(), None)?;
        queue.claim_next_job("w")?;

        let counts = queue.count_by_status()?;
        assert_eq!(
            counts,
            vec![
                (QueueStatus::Pending, 1),
                (QueueStatus::Leased, 1),
                (QueueStatus::Done, 0),
                (QueueStatus::Failed, 0),
            ]
        );
        Ok(())
    }
}

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior,
};
use shipyard_core::types::{JobId, Paginated};
use tracing::{debug, info, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{Job, JobPolicy, MessageFilter, NewJob},
};

/// Backoff applied to a failed or delayed job before it becomes claimable again.
pub const RETRY_DELAY_SECS: i64 = 15;

/// Page size of [`JobStore::list`].
pub const JOBS_PER_PAGE: u32 = 10;

const MICROS_PER_SEC: i64 = 1_000_000;

const COLUMNS: &str = "id, resource_id, [group], message_name, message_data, \
                       queued_at, not_before, error_code, policy, retrieved";

/// Durable job queue backed by SQLite.
///
/// Every state transition is a single statement (or a transaction for
/// merges), so two stores opened on the same file never hand out two jobs of
/// one group at once.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA journal_mode=WAL;")?;
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Connection::open_in_memory()?))
    }

    /// Apply the schema only. Safe while a worker pool runs elsewhere.
    pub fn migrate(&self) -> Result<()> {
        init_db(&*self.lock()?)
    }

    /// Apply the schema and release jobs left claimed by a previous process.
    ///
    /// Returns the number of jobs released. Must run before any worker pool
    /// is started on this database.
    pub fn setup(&self) -> Result<usize> {
        let conn = self.lock()?;
        init_db(&conn)?;
        let released = conn.execute(
            "UPDATE scheduled_jobs SET retrieved = 0 WHERE retrieved = 1",
            [],
        )?;
        if released > 0 {
            warn!(released, "released jobs left running by a previous process");
        }
        info!("job store ready");
        Ok(released)
    }

    /// Persist a job, or fold it into a pending one when the policy asks to merge.
    pub fn create(&self, new: NewJob) -> Result<JobId> {
        let mut conn = self.lock()?;
        // Take the write lock up front so the merge lookup cannot go stale.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if new.policy.contains(JobPolicy::MERGE) {
            let pending: Option<String> = tx
                .query_row(
                    "SELECT id FROM scheduled_jobs
                     WHERE resource_id = ?1 AND message_name = ?2 AND retrieved = 0
                     ORDER BY not_before, rowid
                     LIMIT 1",
                    params![new.resource_id, new.message_name],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = pending {
                tx.execute(
                    "UPDATE scheduled_jobs SET message_data = ?2 WHERE id = ?1",
                    params![id, new.message_data],
                )?;
                tx.commit()?;
                debug!(job_id = %id, message_name = %new.message_name, "job merged into pending one");
                return Ok(JobId(id));
            }
        }

        let id = JobId::new();
        let group = new.group.unwrap_or_else(|| id.to_string());
        let now = now_micros();
        tx.execute(
            "INSERT INTO scheduled_jobs
             (id, resource_id, [group], message_name, message_data,
              queued_at, not_before, error_code, policy, retrieved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, NULL, ?7, 0)",
            params![
                id.as_str(),
                new.resource_id,
                group,
                new.message_name,
                new.message_data,
                now,
                new.policy.bits(),
            ],
        )?;
        tx.commit()?;
        debug!(job_id = %id, message_name = %new.message_name, %group, policy = %new.policy, "job queued");
        Ok(id)
    }

    /// Atomically claim up to `limit` jobs, at most one per group.
    ///
    /// A group is served from its earliest eligible job, and never while one
    /// of its jobs is already claimed. The filter is applied to that head job
    /// only, so a worker restricted to other messages cannot jump the queue.
    pub fn claim(&self, filter: &MessageFilter, limit: Option<usize>) -> Result<Vec<Job>> {
        let (clause, names): (String, &[String]) = match filter {
            MessageFilter::All => (String::new(), &[]),
            MessageFilter::Only(names) if names.is_empty() => return Ok(Vec::new()),
            MessageFilter::Only(names) => (
                format!("AND message_name IN ({})", placeholders(names.len())),
                names,
            ),
            MessageFilter::Except(names) if names.is_empty() => (String::new(), &[]),
            MessageFilter::Except(names) => (
                format!("AND message_name NOT IN ({})", placeholders(names.len())),
                names,
            ),
        };

        let sql = format!(
            "UPDATE scheduled_jobs SET retrieved = 1
             WHERE id IN (
                 SELECT id FROM (
                     SELECT sj.id, sj.message_name, sj.not_before, sj.rowid AS seq,
                            ROW_NUMBER() OVER (
                                PARTITION BY sj.[group] ORDER BY sj.not_before, sj.rowid
                            ) AS position
                     FROM scheduled_jobs sj
                     WHERE sj.retrieved = 0
                       AND sj.not_before <= ?
                       AND sj.[group] NOT IN (
                           SELECT [group] FROM scheduled_jobs WHERE retrieved = 1
                       )
                       AND ((sj.policy & ?) = 0
                            OR (SELECT COUNT(*) FROM scheduled_jobs o
                                WHERE o.resource_id = sj.resource_id) <= 1)
                 )
                 WHERE position = 1 {clause}
                 ORDER BY not_before, seq
                 LIMIT ?
             )
             RETURNING {COLUMNS}"
        );

        let mut values = vec![
            Value::Integer(now_micros()),
            Value::Integer(i64::from(JobPolicy::WAIT_FOR_OTHERS_RESOURCE_ID.bits())),
        ];
        values.extend(names.iter().cloned().map(Value::Text));
        values.push(Value::Integer(
            limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX)),
        ));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut jobs = stmt
            .query_map(params_from_iter(values), job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        jobs.sort_by(|a, b| a.not_before.cmp(&b.not_before));

        for job in &jobs {
            debug!(job_id = %job.id, message_name = %job.message_name, group = %job.group, "job claimed");
        }
        Ok(jobs)
    }

    /// Record a failure and schedule the job again after the backoff.
    pub fn retry(&self, job: &Job, error: &str) -> Result<()> {
        self.reschedule(job, Some(error))?;
        warn!(job_id = %job.id, message_name = %job.message_name, %error, "job failed, retry scheduled");
        Ok(())
    }

    /// Like [`JobStore::retry`], but the job is not considered failed.
    pub fn delay(&self, job: &Job) -> Result<()> {
        self.reschedule(job, None)?;
        debug!(job_id = %job.id, message_name = %job.message_name, "job delayed");
        Ok(())
    }

    /// Remove a job after successful processing.
    pub fn done(&self, job: &Job) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM scheduled_jobs WHERE id = ?1", [job.id.as_str()])?;
        if n == 0 {
            return Err(not_found(job.id.as_str()));
        }
        info!(job_id = %job.id, message_name = %job.message_name, "job done");
        Ok(())
    }

    /// Cancel a pending job. Only jobs queued as cancellable and not
    /// currently running can be deleted; the removed job is returned.
    pub fn delete(&self, id: &str) -> Result<Job> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!(
                    "DELETE FROM scheduled_jobs
                     WHERE id = ?1 AND (policy & ?2) != 0 AND retrieved = 0
                     RETURNING {COLUMNS}"
                ),
                params![id, JobPolicy::CANCELLABLE.bits()],
                job_from_row,
            )
            .optional()?
            .ok_or_else(|| not_found(id))?;
        info!(job_id = %id, message_name = %job.message_name, "job deleted");
        Ok(job)
    }

    /// Put back a job removed by [`JobStore::delete`], exactly as it was.
    pub fn restore(&self, job: &Job) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO scheduled_jobs ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                job.id.as_str(),
                job.resource_id,
                job.group,
                job.message_name,
                job.message_data,
                job.queued_at.timestamp_micros(),
                job.not_before.timestamp_micros(),
                job.error_code,
                job.policy.bits(),
                job.retrieved,
            ],
        )?;
        warn!(job_id = %job.id, message_name = %job.message_name, "deleted job restored");
        Ok(())
    }

    /// Forget the last failure of a pending job and make it claimable right away.
    pub fn clear_error(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE scheduled_jobs SET error_code = NULL, not_before = ?2
             WHERE id = ?1 AND error_code IS NOT NULL AND retrieved = 0",
            params![id, now_micros()],
        )?;
        if n == 0 {
            return Err(not_found(id));
        }
        info!(job_id = %id, "job error cleared, retrying now");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM scheduled_jobs WHERE id = ?1"),
                [id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// One page of jobs in queue order. `page` is 1-based; 0 is read as 1.
    pub fn list(&self, page: u32) -> Result<Paginated<Job>> {
        let page = page.max(1);
        let offset = i64::from(page - 1) * i64::from(JOBS_PER_PAGE);

        let conn = self.lock()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM scheduled_jobs", [], |row| {
            row.get(0)
        })?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM scheduled_jobs
             ORDER BY queued_at, rowid
             LIMIT ?1 OFFSET ?2"
        ))?;
        let jobs = stmt
            .query_map(params![JOBS_PER_PAGE, offset], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Paginated::new(
            jobs,
            page,
            JOBS_PER_PAGE,
            u64::try_from(total).unwrap_or_default(),
        ))
    }

    // --- private helpers ---------------------------------------------------

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::LockPoisoned)
    }

    /// Release a claimed job with a backoff. With `RETRY_PRESERVE_ORDER` the
    /// whole group is pushed back, one second apart, the job first.
    fn reschedule(&self, job: &Job, error: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        let now = now_micros();

        let n = if job.policy.contains(JobPolicy::RETRY_PRESERVE_ORDER) {
            conn.execute(
                "UPDATE scheduled_jobs
                 SET not_before = ?3 + (?4 + v.position) * ?5,
                     error_code = CASE WHEN scheduled_jobs.id = ?1
                                       THEN ?2 ELSE scheduled_jobs.error_code END,
                     retrieved = 0
                 FROM (
                     SELECT id,
                            ROW_NUMBER() OVER (
                                ORDER BY CASE WHEN id = ?1 THEN 0 ELSE 1 END, not_before, rowid
                            ) - 1 AS position
                     FROM scheduled_jobs
                     WHERE [group] = (SELECT [group] FROM scheduled_jobs WHERE id = ?1)
                 ) AS v
                 WHERE scheduled_jobs.id = v.id",
                params![job.id.as_str(), error, now, RETRY_DELAY_SECS, MICROS_PER_SEC],
            )?
        } else {
            conn.execute(
                "UPDATE scheduled_jobs SET error_code = ?2, not_before = ?3, retrieved = 0
                 WHERE id = ?1",
                params![
                    job.id.as_str(),
                    error,
                    now + RETRY_DELAY_SECS * MICROS_PER_SEC
                ],
            )?
        };

        if n == 0 {
            return Err(not_found(job.id.as_str()));
        }
        Ok(())
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: JobId(row.get(0)?),
        resource_id: row.get(1)?,
        group: row.get(2)?,
        message_name: row.get(3)?,
        message_data: row.get(4)?,
        queued_at: from_micros(5, row.get(5)?)?,
        not_before: from_micros(6, row.get(6)?)?,
        error_code: row.get(7)?,
        policy: JobPolicy::from_bits_truncate(row.get(8)?),
        retrieved: row.get(9)?,
    })
}

fn from_micros(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn not_found(id: &str) -> SchedulerError {
    SchedulerError::JobNotFound { id: id.to_string() }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use chrono::Duration;

    use super::*;

    fn store() -> JobStore {
        let store = JobStore::open_in_memory().unwrap();
        store.setup().unwrap();
        store
    }

    fn new_job(resource: &str, message: &str, group: Option<&str>, policy: JobPolicy) -> NewJob {
        NewJob {
            resource_id: resource.to_string(),
            message_name: message.to_string(),
            message_data: format!(r#"{{"resource":"{resource}"}}"#),
            group: group.map(str::to_string),
            policy,
        }
    }

    fn queue(store: &JobStore, resource: &str, group: &str) -> JobId {
        store
            .create(new_job(resource, "deploy", Some(group), JobPolicy::NONE))
            .unwrap()
    }

    fn claim_all(store: &JobStore) -> Vec<Job> {
        store.claim(&MessageFilter::All, None).unwrap()
    }

    fn ids(jobs: &[Job]) -> Vec<JobId> {
        jobs.iter().map(|j| j.id.clone()).collect()
    }

    fn fetch(store: &JobStore, id: &JobId) -> Job {
        store.get(id.as_str()).unwrap().expect("job exists")
    }

    #[test]
    fn group_defaults_to_job_id() {
        let store = store();
        let id = store
            .create(new_job("app-1", "deploy", None, JobPolicy::NONE))
            .unwrap();
        let job = fetch(&store, &id);
        assert_eq!(job.group, id.to_string());
        assert!(!job.retrieved);
        assert_eq!(job.error_code, None);
        assert_eq!(job.queued_at, job.not_before);
    }

    #[test]
    fn merge_replaces_pending_payload() {
        let store = store();
        let mut first = new_job("app-1", "deploy", None, JobPolicy::MERGE);
        first.message_data = r#"{"v":1}"#.into();
        let mut second = first.clone();
        second.message_data = r#"{"v":2}"#.into();

        let a = store.create(first).unwrap();
        let b = store.create(second).unwrap();

        assert_eq!(a, b);
        let page = store.list(1).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.data[0].message_data, r#"{"v":2}"#);
    }

    #[test]
    fn merge_skips_claimed_jobs() {
        let store = store();
        let a = store
            .create(new_job("app-1", "deploy", None, JobPolicy::MERGE))
            .unwrap();
        assert_eq!(ids(&claim_all(&store)), vec![a.clone()]);

        let b = store
            .create(new_job("app-1", "deploy", None, JobPolicy::MERGE))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(store.list(1).unwrap().total, 2);
    }

    #[test]
    fn without_merge_duplicates_are_kept() {
        let store = store();
        store
            .create(new_job("app-1", "deploy", None, JobPolicy::NONE))
            .unwrap();
        store
            .create(new_job("app-1", "deploy", None, JobPolicy::NONE))
            .unwrap();
        assert_eq!(store.list(1).unwrap().total, 2);
    }

    #[test]
    fn claims_one_job_per_group_in_order() {
        let store = store();
        let a = queue(&store, "app-1", "g1");
        let b = queue(&store, "app-1", "g1");
        let c = queue(&store, "app-2", "g2");

        let claimed = claim_all(&store);
        let claimed_ids: HashSet<_> = ids(&claimed).into_iter().collect();
        assert_eq!(claimed_ids, HashSet::from([a.clone(), c.clone()]));
        assert!(claimed.iter().all(|j| j.retrieved));

        // Groups with a running job are skipped entirely.
        assert!(claim_all(&store).is_empty());

        let a_job = claimed.iter().find(|j| j.id == a).unwrap();
        store.done(a_job).unwrap();
        assert_eq!(ids(&claim_all(&store)), vec![b]);
        assert!(store.get(a.as_str()).unwrap().is_none());
    }

    #[test]
    fn claim_honours_limit() {
        let store = store();
        queue(&store, "app-1", "g1");
        queue(&store, "app-2", "g2");
        queue(&store, "app-3", "g3");

        assert_eq!(store.claim(&MessageFilter::All, Some(2)).unwrap().len(), 2);
        assert_eq!(store.claim(&MessageFilter::All, Some(2)).unwrap().len(), 1);
        assert!(store.claim(&MessageFilter::All, Some(2)).unwrap().is_empty());
    }

    #[test]
    fn claim_filters_on_group_head_only() {
        let store = store();
        let deploy = queue(&store, "app-1", "g1");
        let cleanup = store
            .create(new_job("app-1", "cleanup", Some("g1"), JobPolicy::NONE))
            .unwrap();
        let other = store
            .create(new_job("app-2", "cleanup", Some("g2"), JobPolicy::NONE))
            .unwrap();

        let only_cleanup = MessageFilter::Only(vec!["cleanup".into()]);
        // g1's head is a deploy, so its cleanup must wait.
        assert_eq!(ids(&store.claim(&only_cleanup, None).unwrap()), vec![other]);

        let except_cleanup = MessageFilter::Except(vec!["cleanup".into()]);
        let claimed = store.claim(&except_cleanup, None).unwrap();
        assert_eq!(ids(&claimed), vec![deploy]);
        store.done(&claimed[0]).unwrap();

        assert_eq!(ids(&store.claim(&only_cleanup, None).unwrap()), vec![cleanup]);
        assert!(store
            .claim(&MessageFilter::Only(Vec::new()), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn retry_records_error_and_backs_off() {
        let store = store();
        let id = queue(&store, "app-1", "g1");
        let job = claim_all(&store).remove(0);
        let before = Utc::now();

        store.retry(&job, "boom").unwrap();

        let job = fetch(&store, &id);
        assert_eq!(job.error_code.as_deref(), Some("boom"));
        assert!(!job.retrieved);
        assert!(job.not_before >= before + Duration::seconds(RETRY_DELAY_SECS));
        assert!(claim_all(&store).is_empty());
    }

    #[test]
    fn retry_preserving_order_pushes_back_the_group() {
        let store = store();
        let policy = JobPolicy::RETRY_PRESERVE_ORDER;
        let a = store
            .create(new_job("app-1", "deploy", Some("g1"), policy))
            .unwrap();
        let b = store
            .create(new_job("app-1", "deploy", Some("g1"), policy))
            .unwrap();
        let c = store
            .create(new_job("app-1", "deploy", Some("g1"), policy))
            .unwrap();
        let c_before = fetch(&store, &c).not_before;

        let job = claim_all(&store).remove(0);
        assert_eq!(job.id, a);
        store.retry(&job, "boom").unwrap();

        let (a, b, c) = (fetch(&store, &a), fetch(&store, &b), fetch(&store, &c));
        assert!(a.not_before > c_before);
        assert!(a.not_before < b.not_before);
        assert!(b.not_before < c.not_before);
        assert_eq!(a.error_code.as_deref(), Some("boom"));
        assert_eq!(b.error_code, None);
        assert_eq!(c.error_code, None);
        assert!(!a.retrieved);
    }

    #[test]
    fn delay_backs_off_without_error() {
        let store = store();
        let id = queue(&store, "app-1", "g1");
        let job = claim_all(&store).remove(0);
        store.retry(&job, "boom").unwrap();
        store.clear_error(id.as_str()).unwrap();

        let job = claim_all(&store).remove(0);
        store.delay(&job).unwrap();

        let job = fetch(&store, &id);
        assert_eq!(job.error_code, None);
        assert!(!job.retrieved);
        assert!(job.not_before > Utc::now());
    }

    #[test]
    fn delete_requires_cancellable_and_idle() {
        let store = store();
        let plain = queue(&store, "app-1", "g1");
        assert!(matches!(
            store.delete(plain.as_str()),
            Err(SchedulerError::JobNotFound { .. })
        ));
        assert!(store.get(plain.as_str()).unwrap().is_some());

        let cancellable = store
            .create(new_job("app-2", "deploy", Some("g2"), JobPolicy::CANCELLABLE))
            .unwrap();
        let deleted = store.delete(cancellable.as_str()).unwrap();
        assert_eq!(deleted.resource_id, "app-2");
        assert!(store.get(cancellable.as_str()).unwrap().is_none());

        let running = store
            .create(new_job("app-3", "deploy", Some("g3"), JobPolicy::CANCELLABLE))
            .unwrap();
        store.claim(&MessageFilter::Only(vec!["deploy".into()]), None).unwrap();
        assert!(fetch(&store, &running).retrieved);
        assert!(store.delete(running.as_str()).is_err());
        assert!(store.delete("missing").is_err());
    }

    #[test]
    fn restore_puts_back_a_deleted_job() {
        let store = store();
        let id = store
            .create(new_job("app-1", "deploy", Some("g1"), JobPolicy::CANCELLABLE))
            .unwrap();
        let original = fetch(&store, &id);

        let deleted = store.delete(id.as_str()).unwrap();
        assert!(store.get(id.as_str()).unwrap().is_none());
        store.restore(&deleted).unwrap();

        assert_eq!(fetch(&store, &id), original);
        assert_eq!(ids(&claim_all(&store)), vec![id.clone()]);
        // The row is already there again.
        assert!(store.restore(&deleted).is_err());
    }

    #[test]
    fn clear_error_only_applies_to_failed_jobs() {
        let store = store();
        let id = queue(&store, "app-1", "g1");
        assert!(store.clear_error(id.as_str()).is_err());

        let job = claim_all(&store).remove(0);
        store.retry(&job, "boom").unwrap();
        store.clear_error(id.as_str()).unwrap();

        let job = fetch(&store, &id);
        assert_eq!(job.error_code, None);
        assert!(job.not_before <= Utc::now());
        assert_eq!(ids(&claim_all(&store)), vec![id]);
    }

    #[test]
    fn wait_for_others_holds_until_last_reference() {
        let store = store();
        let first = queue(&store, "app-1", "g1");
        let cleanup = store
            .create(new_job(
                "app-1",
                "cleanup",
                Some("g2"),
                JobPolicy::WAIT_FOR_OTHERS_RESOURCE_ID,
            ))
            .unwrap();

        let claimed = claim_all(&store);
        assert_eq!(ids(&claimed), vec![first]);
        store.done(&claimed[0]).unwrap();

        assert_eq!(ids(&claim_all(&store)), vec![cleanup]);
    }

    #[test]
    fn waiting_jobs_on_one_resource_block_each_other() {
        let store = store();
        let policy = JobPolicy::WAIT_FOR_OTHERS_RESOURCE_ID | JobPolicy::CANCELLABLE;
        let first = store
            .create(new_job("app-1", "cleanup", Some("g1"), policy))
            .unwrap();
        let second = store
            .create(new_job("app-1", "cleanup", Some("g2"), policy))
            .unwrap();

        assert!(claim_all(&store).is_empty());

        store.delete(first.as_str()).unwrap();
        assert_eq!(ids(&claim_all(&store)), vec![second]);
    }

    #[test]
    fn combined_policies() {
        let store = store();
        let policy = JobPolicy::MERGE | JobPolicy::RETRY_PRESERVE_ORDER | JobPolicy::CANCELLABLE;
        let a = store
            .create(new_job("app-1", "deploy", Some("g1"), policy))
            .unwrap();
        let b = store
            .create(new_job("app-2", "deploy", Some("g1"), policy))
            .unwrap();
        // Same resource and message as `b`: merged.
        assert_eq!(
            store
                .create(new_job("app-2", "deploy", Some("g1"), policy))
                .unwrap(),
            b
        );

        let job = claim_all(&store).remove(0);
        assert_eq!(job.id, a);
        assert!(store.delete(a.as_str()).is_err());
        store.retry(&job, "boom").unwrap();
        assert!(fetch(&store, &a).not_before < fetch(&store, &b).not_before);

        // Now idle again, so it can be cancelled.
        store.delete(a.as_str()).unwrap();
        assert_eq!(store.list(1).unwrap().total, 1);
    }

    #[test]
    fn list_paginates_in_queue_order() {
        let store = store();
        let ids: Vec<JobId> = (0..12)
            .map(|i| queue(&store, &format!("app-{i}"), &format!("g{i}")))
            .collect();

        let first = store.list(0).unwrap();
        assert_eq!(first.page, 1);
        assert_eq!(first.data.len(), 10);
        assert_eq!(first.total, 12);
        assert!(first.is_first_page);
        assert!(!first.is_last_page);
        assert_eq!(first.data[0].id, ids[0]);

        let second = store.list(2).unwrap();
        assert_eq!(second.data.len(), 2);
        assert!(second.is_last_page);
        assert_eq!(second.data[1].id, ids[11]);
    }

    #[test]
    fn setup_releases_jobs_after_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        let id = {
            let store = JobStore::open(&path).unwrap();
            store.setup().unwrap();
            let id = queue(&store, "app-1", "g1");
            assert_eq!(claim_all(&store).len(), 1);
            id
        };

        let store = JobStore::open(&path).unwrap();
        assert!(claim_all(&store).is_empty());
        assert_eq!(store.setup().unwrap(), 1);
        assert_eq!(ids(&claim_all(&store)), vec![id]);
    }

    #[test]
    fn concurrent_claims_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let store = JobStore::open(&path).unwrap();
        store.setup().unwrap();
        for group in 0..5 {
            for n in 0..3 {
                queue(&store, &format!("app-{group}-{n}"), &format!("g{group}"));
            }
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let store = JobStore::open(&path).unwrap();
                    claim_all(&store)
                })
            })
            .collect();

        let claimed: Vec<Job> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let groups: HashSet<_> = claimed.iter().map(|j| j.group.clone()).collect();
        assert_eq!(claimed.len(), 5);
        assert_eq!(groups.len(), 5);
    }

    #[test]
    fn concurrent_merges_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        JobStore::open(&path).unwrap().setup().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let path = path.clone();
                thread::spawn(move || {
                    let store = JobStore::open(&path).unwrap();
                    let mut job = new_job("app-1", "deploy", None, JobPolicy::MERGE);
                    job.message_data = format!(r#"{{"v":{n}}}"#);
                    store.create(job)
                })
            })
            .collect();

        let merged: HashSet<JobId> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert_eq!(merged.len(), 1);
        assert_eq!(JobStore::open(&path).unwrap().list(1).unwrap().total, 1);
    }
}

use std::{fmt, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    select,
    sync::{oneshot, Notify},
    task,
    time::{self, Instant},
};
use tracing::{debug, error, info, instrument, trace};

use super::db::{query, query_tx, row_extract, Database};
use crate::{config::Settings, helpers::Closer};

const JOB_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const JOB_REFRESH_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// The transcode queue: jobs go in at the back and run one at a time from the front.
pub struct JobsService {
    state: State,
    start: Arc<Notify>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobRow {
    pub id: i32,
    pub args: String,
    pub job_type: String,
    pub state: String,
    pub scheduled: i64,
    pub completed: Option<i64>,
    pub active: Option<i64>,
    pub output: Option<String>,
}

impl JobRow {
    /// Human readable form of the queued job, e.g. its command line.
    pub fn describe(&self) -> Option<String> {
        let job: Box<dyn Job> = serde_json::from_str(&self.args).ok()?;
        Some(job.describe())
    }
}

/// How many jobs a drain got through.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub completed: usize,
    pub failed: usize,
}

/// What the status line shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueueStatus {
    Empty,
    Queued {
        queued: i64,
    },
    Running {
        id: i32,
        status: Option<String>,
        queued: i64,
    },
    Finished {
        completed: i64,
        failed: i64,
    },
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "No commands in the queue."),
            Self::Queued { queued } => write!(f, "{} command(s) queued.", queued),
            Self::Running {
                status: Some(status),
                ..
            } => write!(f, "{}", status),
            Self::Running { id, .. } => write!(f, "running job {}", id),
            Self::Finished { failed: 0, .. } => write!(f, "All processes finished."),
            Self::Finished { failed, .. } => {
                write!(f, "All processes finished. {} failed.", failed)
            }
        }
    }
}

impl JobsService {
    pub fn new(state: State) -> Arc<Self> {
        Arc::new(Self {
            state,
            start: Arc::new(Notify::new()),
        })
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Spawn the single background worker. It sits idle until [`Self::start`].
    pub fn spawn_worker(&self, closer: &mut Closer) {
        let state = self.state.clone();
        let start = Arc::clone(&self.start);
        let (close_tx, close_rx) = oneshot::channel();
        let worker = task::spawn(async move {
            info!("starting background job worker");
            worker_jobs_loop(&state, &start, close_rx).await;
        });

        closer.add(async {
            let _ = close_tx.send(());
            if let Err(err) = worker.await {
                error!("background job worker panicked: {}", err);
            }
        });
    }

    /// Wake the worker to drain the queue.
    pub fn start(&self) {
        self.start.notify_one();
    }

    /// Enqueue a new job, returning its id.
    #[instrument(skip(self, job))]
    pub async fn enqueue<J>(&self, job: J) -> Result<(String, i32)>
    where
        J: Job + Serialize,
    {
        Self::enqueue_inner(&self.state.db, &job).await
    }

    async fn enqueue_inner(db: &Database, job: &dyn Job) -> Result<(String, i32)> {
        let kind = job.typetag_name();
        let args = serde_json::to_string(job)?;

        let id: i32 = query(db, |conn| {
            let mut stmt = conn.prepare_cached(
                    "INSERT INTO job_queue (scheduled, state, args, job_type) VALUES (unixepoch(), 'queued', ?, ?) \
                     RETURNING id",
                ).map_err(|e| anyhow::anyhow!("failed to enqueue job: {}", e))?;

            let row = stmt.query_row((&args, kind), |row| row.get::<_, i32>(0))?;
            Ok(row)
        })?;

        info!("enqueued background job of kind: {} with id: {}", kind, id);
        Ok((kind.to_string(), id))
    }

    /// List every job, oldest first.
    pub async fn list(&self) -> Result<Vec<JobRow>> {
        query(&self.state.db, |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, args, job_type, state, scheduled, completed, active, output \
                     FROM job_queue \
                     ORDER BY scheduled, id",
            )?;

            let rows = stmt
                .query_map([], job_row)?
                .collect::<rusqlite::Result<Vec<JobRow>>>()?;
            Ok(rows)
        })
    }

    pub async fn get(&self, id: i32) -> Result<Option<JobRow>> {
        query(&self.state.db, |conn| {
            let row = conn
                .prepare_cached(
                    "SELECT id, args, job_type, state, scheduled, completed, active, output \
                     FROM job_queue WHERE id = ?",
                )?
                .query_row((id,), job_row);
            match row {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }

    /// Run queued jobs in order until none are left.
    pub async fn drain(&self) -> Result<DrainSummary> {
        drain_queue(&self.state).await
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        let counts: Vec<(String, i64)> = query(&self.state.db, |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT state, COUNT(*) FROM job_queue GROUP BY state")?;
            let rows = stmt
                .query_map([], row_extract::<(String, i64)>)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        let count = |state: &str| {
            counts
                .iter()
                .find(|(s, _)| s == state)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };

        let running: Option<(i32, Option<String>)> = query(&self.state.db, |conn| {
            let row = conn
                .prepare_cached(
                    "SELECT id, output FROM job_queue WHERE state = 'running' \
                     ORDER BY active DESC LIMIT 1",
                )?
                .query_row([], row_extract::<(i32, Option<String>)>);
            match row {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })?;

        let queued = count("queued");
        let status = if let Some((id, output)) = running {
            let status = output
                .and_then(|o| serde_json::from_str::<serde_json::Value>(&o).ok())
                .and_then(|v| v.get("status")?.as_str().map(str::to_owned));
            QueueStatus::Running { id, status, queued }
        } else if queued > 0 {
            QueueStatus::Queued { queued }
        } else if count("completed") + count("failed") > 0 {
            QueueStatus::Finished {
                completed: count("completed"),
                failed: count("failed"),
            }
        } else {
            QueueStatus::Empty
        };
        Ok(status)
    }

    /// Forget jobs that have finished, returning how many were removed.
    pub async fn clear_finished(&self) -> Result<usize> {
        let removed = query(&self.state.db, |conn| {
            Ok(conn
                .prepare_cached("DELETE FROM job_queue WHERE state IN ('completed', 'failed')")?
                .execute([])?)
        })?;
        debug!("cleared {} finished jobs", removed);
        Ok(removed)
    }
}

fn job_row(row: &rusqlite::Row) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        args: row.get(1)?,
        job_type: row.get(2)?,
        state: row.get(3)?,
        scheduled: row.get(4)?,
        completed: row.get(5)?,
        active: row.get(6)?,
        output: row.get(7)?,
    })
}

async fn worker_jobs_loop(state: &State, start: &Notify, mut close_rx: oneshot::Receiver<()>) {
    loop {
        select! {
            _ = start.notified() => {}
            _ = &mut close_rx => {
                info!("background job worker shutting down...");
                return;
            }
        }

        select! {
            result = drain_queue(state) => {
                match result {
                    Ok(summary) => info!(
                        "queue drained: {} completed, {} failed",
                        summary.completed, summary.failed
                    ),
                    Err(err) => error!("error performing background job work: {}", err),
                }
            }
            _ = &mut close_rx => {
                info!("background job worker shutting down...");
                return;
            }
        }
    }
}

#[instrument(skip(state))]
async fn drain_queue(state: &State) -> Result<DrainSummary> {
    let mut summary = DrainSummary::default();
    while let Some(succeeded) = execute_next_job(state).await? {
        if succeeded {
            summary.completed += 1;
        } else {
            summary.failed += 1;
        }
    }
    Ok(summary)
}

/// Claim the oldest queued job, or one whose runner stopped refreshing its lock.
fn claim_next(db: &Database) -> Result<Option<(i32, String)>> {
    trace!("attempting to load job from queue");
    query_tx(db, |tx| {
        let maybe_row: rusqlite::Result<(i32, String)> = tx
            .prepare_cached(
                r#"
            UPDATE job_queue
            SET state = 'running',
                active = unixepoch()
            WHERE id =
                (SELECT id
                 FROM job_queue
                 WHERE state = 'queued'
                   OR (state = 'running'
                       AND active < (unixepoch() - ?))
                 ORDER BY scheduled, id
                 LIMIT 1) RETURNING id,
                                    args
            "#,
            )?
            .query_row((JOB_REFRESH_EXPIRY.as_secs() as i64,), row_extract);

        let data = match maybe_row {
            Ok(data) => Some(data),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(err) => return Err(err.into()),
        };
        tx.commit()?;
        Ok(data)
    })
}

async fn run_job(state: &State, id: i32, job: &dyn Job) -> Result<serde_json::Value> {
    let start = Instant::now();
    let mut lock_update = time::interval_at(start + JOB_REFRESH_INTERVAL, JOB_REFRESH_INTERVAL);
    let run = job.run(state, JobCtx { id });
    tokio::pin!(run);
    let res = loop {
        select! {
            res = &mut run => {
                break res;
            }
            _ = lock_update.tick() => {
                debug!("updating lock for background job with id: {}", id);
                query(&state.db, |conn| {
                    conn.prepare_cached("UPDATE job_queue SET active = unixepoch() WHERE id = ?")?.execute((id,))?;
                    Ok(())
                })?;
            }
        }
    };

    debug!(
        "finished running background job with id: {}, took {:?}",
        id,
        start.elapsed()
    );

    res
}

async fn save_job_result(state: &State, id: i32, res: &Result<serde_json::Value>) -> Result<()> {
    fn update(job_state: &str, output: &str, id: i32, db: &Database) -> Result<()> {
        query(db, |conn| {
            conn.prepare_cached(
                "UPDATE job_queue SET state = ?, completed = unixepoch(), output = ?, active = \
                 NULL WHERE id = ?",
            )?
            .execute((job_state, output, id))?;

            Ok(())
        })
    }

    match res {
        Ok(output) => {
            let output = serde_json::to_string(&output)?;
            update("completed", &output, id, &state.db)?;
            debug!("successfully completed background job with id: {}", id);
            Ok(())
        }
        Err(err) => {
            let output = json!({ "error": format!("{:#}", err) });
            let output = serde_json::to_string(&output)?;
            update("failed", &output, id, &state.db)?;
            error!("error executing background job with id {}: {:#}", id, err);
            Ok(())
        }
    }
}

/// Run the next job. `None` once the queue is empty, otherwise whether it succeeded.
#[instrument(skip(state), err)]
async fn execute_next_job(state: &State) -> Result<Option<bool>> {
    let Some((id, args)) = claim_next(&state.db)? else {
        trace!("background job queue is empty");
        return Ok(None);
    };
    debug!("pulled background job with id: {} from queue", id);

    let res = match serde_json::from_str::<Box<dyn Job>>(&args) {
        Ok(job) => run_job(state, id, job.as_ref()).await,
        Err(err) => Err(anyhow::Error::new(err).context("could not decode job arguments")),
    };
    save_job_result(state, id, &res).await?;
    Ok(Some(res.is_ok()))
}

pub struct JobCtx {
    pub id: i32,
}

impl JobCtx {
    /// Updates job information (in 'output' column). Will not change the job state.
    pub async fn update(&self, state: &State, update_to: &serde_json::Value) -> Result<()> {
        let output = update_to.to_string();
        query(&state.db, |conn| {
            conn.prepare_cached("UPDATE job_queue SET output = ? WHERE id = ?")?
                .execute((&output, self.id))?;
            Ok(())
        })
    }
}

#[derive(Clone)]
pub struct State {
    pub db: Arc<Database>,
    pub settings: Arc<Settings>,
}

impl State {
    pub fn new(db: Arc<Database>, settings: Settings) -> Self {
        Self {
            db,
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
#[typetag::serde(tag = "type")]
pub trait Job: Send + Sync {
    async fn run(&self, state: &State, info: JobCtx) -> Result<serde_json::Value>;

    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static RAN: Mutex<Vec<String>> = Mutex::new(Vec::new());

    /// Records its label, checks it is the only running job, optionally fails.
    #[derive(Serialize, Deserialize)]
    struct RecordJob {
        label: String,
        fail: bool,
    }

    #[async_trait]
    #[typetag::serde]
    impl Job for RecordJob {
        async fn run(&self, state: &State, jctx: JobCtx) -> Result<serde_json::Value> {
            let running: i64 = query(&state.db, |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM job_queue WHERE state = 'running'",
                    [],
                    |row| row.get(0),
                )?)
            })?;
            assert_eq!(running, 1, "only one job may run at a time");

            jctx.update(state, &json!({ "status": format!("working on {}", self.label) }))
                .await?;
            RAN.lock().unwrap().push(self.label.clone());
            if self.fail {
                anyhow::bail!("{} failed on purpose", self.label);
            }
            Ok(json!({ "label": self.label }))
        }

        fn describe(&self) -> String {
            format!("record {}", self.label)
        }
    }

    fn service(dir: &tempfile::TempDir) -> Arc<JobsService> {
        let db = Database::new(dir.path().join("jobs.db")).unwrap();
        JobsService::new(State::new(db, Settings::default()))
    }

    fn job(label: &str, fail: bool) -> RecordJob {
        RecordJob {
            label: label.to_owned(),
            fail,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drains_front_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = service(&dir);
        assert_eq!(jobs.status().await.unwrap(), QueueStatus::Empty);

        let mut ids = Vec::new();
        for label in ["fifo-a", "fifo-b", "fifo-c"] {
            let (kind, id) = jobs.enqueue(job(label, false)).await.unwrap();
            assert_eq!(kind, "RecordJob");
            ids.push(id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(jobs.status().await.unwrap(), QueueStatus::Queued { queued: 3 });

        let summary = jobs.drain().await.unwrap();
        assert_eq!(
            summary,
            DrainSummary {
                completed: 3,
                failed: 0
            }
        );

        let ran: Vec<String> = RAN
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("fifo-"))
            .cloned()
            .collect();
        assert_eq!(ran, ["fifo-a", "fifo-b", "fifo-c"]);

        let rows = jobs.list().await.unwrap();
        assert!(rows.iter().all(|r| r.state == "completed"));
        assert_eq!(rows[0].describe().as_deref(), Some("record fifo-a"));
        assert_eq!(
            jobs.status().await.unwrap().to_string(),
            "All processes finished."
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_do_not_stop_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = service(&dir);
        jobs.enqueue(job("fail-a", true)).await.unwrap();
        jobs.enqueue(job("fail-b", false)).await.unwrap();

        let summary = jobs.drain().await.unwrap();
        assert_eq!(
            summary,
            DrainSummary {
                completed: 1,
                failed: 1
            }
        );

        let rows = jobs.list().await.unwrap();
        assert_eq!(rows[0].state, "failed");
        let output: serde_json::Value =
            serde_json::from_str(rows[0].output.as_deref().unwrap()).unwrap();
        assert_eq!(output["error"], "fail-a failed on purpose");
        assert_eq!(rows[1].state, "completed");
        assert_eq!(
            jobs.status().await.unwrap(),
            QueueStatus::Finished {
                completed: 1,
                failed: 1
            }
        );

        assert_eq!(jobs.clear_finished().await.unwrap(), 2);
        assert_eq!(jobs.status().await.unwrap(), QueueStatus::Empty);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_drain_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = service(&dir);
        assert_eq!(jobs.drain().await.unwrap(), DrainSummary::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn undecodable_jobs_are_marked_failed() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = service(&dir);
        query(&jobs.state().db, |conn| {
            conn.execute(
                "INSERT INTO job_queue (scheduled, state, args, job_type) \
                 VALUES (unixepoch(), 'queued', '{\"type\":\"Gone\"}', 'Gone')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let summary = jobs.drain().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(jobs.list().await.unwrap()[0].describe(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_running_jobs_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = service(&dir);
        let (_, id) = jobs.enqueue(job("stale", false)).await.unwrap();
        query(&jobs.state().db, |conn| {
            conn.execute(
                "UPDATE job_queue SET state = 'running', active = unixepoch() - 3600 WHERE id = ?",
                (id,),
            )?;
            Ok(())
        })
        .unwrap();

        assert_eq!(jobs.drain().await.unwrap().completed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_drains_after_start() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = service(&dir);
        let mut closer = Closer::new();
        jobs.spawn_worker(&mut closer);
        jobs.enqueue(job("worker-a", false)).await.unwrap();

        // nothing runs until started
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(jobs.status().await.unwrap(), QueueStatus::Queued { queued: 1 });

        jobs.start();
        let deadline = Instant::now() + Duration::from_secs(10);
        while jobs.status().await.unwrap() != (QueueStatus::Finished { completed: 1, failed: 0 }) {
            assert!(Instant::now() < deadline, "worker never drained the queue");
            time::sleep(Duration::from_millis(20)).await;
        }
        closer.close().await;
    }

    #[test]
    fn status_messages() {
        assert_eq!(QueueStatus::Empty.to_string(), "No commands in the queue.");
        assert_eq!(
            QueueStatus::Running {
                id: 3,
                status: Some("progress = 5% frame=5".into()),
                queued: 0
            }
            .to_string(),
            "progress = 5% frame=5"
        );
        assert_eq!(
            QueueStatus::Finished {
                completed: 2,
                failed: 1
            }
            .to_string(),
            "All processes finished. 1 failed."
        );
    }
}

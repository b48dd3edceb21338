//! Off-request-path work: the index task queue and the retention sweeper.
//!
//! Index mutations are fire-and-forget from the handlers' point of view.
//! A single worker thread drains the queue, so tasks execute in submission
//! order (which keeps the per-post index/reindex/deindex ordering intact)
//! and in-flight work finishes even when the client has gone away. Failures
//! are logged and dropped; a full rebuild is the recovery path.

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};

use crate::posts;
use crate::search::FullTextIndex;
use crate::DbPool;

const MS_PER_DAY: i64 = 86_400_000;

#[derive(Debug)]
pub enum IndexTask {
    Index { id: i64, text: String },
    Reindex { id: i64, text: String },
    Deindex { id: i64 },
}

#[derive(Clone)]
pub struct BackgroundRunner {
    tx: mpsc::Sender<IndexTask>,
}

impl BackgroundRunner {
    pub fn start(index: Arc<FullTextIndex>) -> Self {
        let (tx, rx) = mpsc::channel::<IndexTask>();

        let spawned = thread::Builder::new()
            .name("index-worker".to_string())
            .spawn(move || {
                for task in rx {
                    let (kind, id, result) = match task {
                        IndexTask::Index { id, text } => ("index", id, index.index(id, &text)),
                        IndexTask::Reindex { id, text } => ("reindex", id, index.reindex(id, &text)),
                        IndexTask::Deindex { id } => ("deindex", id, index.deindex(id)),
                    };
                    match result {
                        Ok(()) => log::debug!("{kind} of post {id} done"),
                        Err(err) => log::error!("background {kind} of post {id} failed: {err}"),
                    }
                }
            });
        if let Err(err) = spawned {
            log::error!("failed to spawn index worker: {err}");
        }

        BackgroundRunner { tx }
    }

    pub fn submit(&self, task: IndexTask) {
        if self.tx.send(task).is_err() {
            log::error!("index worker is gone, task dropped");
        }
    }
}

/// Sleep until the next local 03:00, then hard-delete every post whose
/// soft-delete timestamp is older than the retention window and drop its
/// index entries.
pub fn start_retention_sweeper(db: DbPool, runner: BackgroundRunner, retention_days: i64) {
    let spawned = thread::Builder::new()
        .name("retention-sweeper".to_string())
        .spawn(move || loop {
            thread::sleep(duration_until_sweep(Local::now()));
            sweep_once(&db, &runner, retention_days);
        });
    if let Err(err) = spawned {
        log::error!("failed to spawn retention sweeper: {err}");
    }
}

fn sweep_once(db: &DbPool, runner: &BackgroundRunner, retention_days: i64) {
    let cutoff = Utc::now().timestamp_millis() - retention_days * MS_PER_DAY;
    let swept = {
        let mut conn = match db.lock() {
            Ok(conn) => conn,
            Err(_) => {
                log::error!("database lock poisoned, skipping retention sweep");
                return;
            }
        };
        posts::sweep_expired(&mut conn, cutoff)
    };
    match swept {
        Ok(ids) if ids.is_empty() => {}
        Ok(ids) => {
            log::info!("retention sweep removed {} posts", ids.len());
            for id in ids {
                runner.submit(IndexTask::Deindex { id });
            }
        }
        Err(err) => log::error!("retention sweep failed: {err}"),
    }
}

/// Time until the next 03:00 in the sweeper's timezone.
fn duration_until_sweep(now: DateTime<Local>) -> Duration {
    let sweep_time = NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN);
    let mut next = now.date_naive().and_time(sweep_time);
    if now.time() >= sweep_time {
        next += chrono::Duration::days(1);
    }
    match Local.from_local_datetime(&next).earliest() {
        Some(next_local) => (next_local - now).to_std().unwrap_or(Duration::from_secs(60)),
        // DST gap right on the sweep time; try again in an hour.
        None => Duration::from_secs(3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_delay_is_at_most_a_day() {
        let delay = duration_until_sweep(Local::now());
        assert!(delay > Duration::ZERO);
        assert!(delay <= Duration::from_secs(86_400));
    }
}

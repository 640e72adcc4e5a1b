//! Background loop that fires the daily digest on its schedule.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use taskpoints_core::digest::{run_digest, DigestOptions, DigestReport};
use taskpoints_core::lifecycle::Engine;
use taskpoints_core::notify::Notifier;
use taskpoints_core::schedule::{run_day, Schedule};

#[derive(Clone)]
pub struct DigestJob {
    pub engine: Engine,
    pub notifier: Arc<dyn Notifier>,
    pub options: Arc<DigestOptions>,
    pub schedule: Schedule,
}

impl DigestJob {
    /// One digest run for `day` on the blocking pool.
    pub async fn run_for(&self, day: NaiveDate) -> Result<DigestReport> {
        let engine = self.engine.clone();
        let notifier = Arc::clone(&self.notifier);
        let options = Arc::clone(&self.options);
        let report = tokio::task::spawn_blocking(move || {
            run_digest(&engine, notifier.as_ref(), &options, day)
        })
        .await
        .context("digest task aborted")??;
        Ok(report)
    }

    /// Sleeps until each firing and runs the digest for that firing's
    /// calendar day. Stops when `shutdown` flips to true or its sender drops.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let offset = self.engine.offset();
            info!(schedule = %self.schedule, "digest scheduler started");
            loop {
                let now = self.engine.now();
                let Some(next) = self.schedule.next_after(now, offset) else {
                    error!(schedule = %self.schedule, "schedule never fires; scheduler stopped");
                    return;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                info!(next = %next, "next digest run");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("digest scheduler stopping");
                            return;
                        }
                        continue;
                    }
                }

                let day = run_day(next, offset);
                match self.run_for(day).await {
                    Ok(report) => info!(
                        %day,
                        records = report.records_written(),
                        sent = report.notifications_sent,
                        "scheduled digest complete"
                    ),
                    Err(err) => error!(%day, error = ?err, "scheduled digest failed"),
                }
            }
        })
    }
}

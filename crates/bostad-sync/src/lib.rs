//! Daily scrape and weekly report actions, and the clock-fed queue that runs them.

pub mod mail;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bostad_adapters::{CounterSource, ExtractionError, PageRenderer};
use bostad_core::{build_snapshot, CounterPair, SecondaryCounts, Snapshot};
use bostad_report::{ReportError, ReportRenderer};
use bostad_storage::{FetchError, FetchOptions, PageCapture, SnapshotStore, StoreError};
use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use mail::{MailError, MailSetup, Mailer, ReportDelivery, ReportEmail, SmtpConfig, SmtpMailer};

pub const CRATE_NAME: &str = "bostad-sync";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Which snapshots go into a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportRange {
    /// Full history, newest first.
    All,
    /// The last `n` days up to today, oldest first.
    LastDays(u32),
}

impl FromStr for ReportRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s == "all" {
            return Ok(Self::All);
        }
        if s == "week" {
            return Ok(Self::LastDays(7));
        }
        s.strip_prefix("last-")
            .and_then(|rest| rest.strip_suffix("-days"))
            .and_then(|n| n.parse::<u32>().ok())
            .map(Self::LastDays)
            .ok_or_else(|| anyhow!("invalid report range {s:?}; expected all, week or last-<N>-days"))
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub database_path: PathBuf,
    pub primary_url: String,
    pub secondary_url: String,
    pub secondary_enabled: bool,
    pub user_agent: String,
    pub locale: String,
    pub fetch_timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub scrape_cron: String,
    pub report_cron: String,
    pub timezone: Tz,
    pub report_range: ReportRange,
    pub capture_dir: Option<PathBuf>,
    pub run_on_startup: bool,
    pub send_test_email: bool,
}

fn flag(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true"))
        .unwrap_or(default)
}

impl TrackerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse()
                    .with_context(|| format!("parsing {key}={v:?} as a number")),
                None => Ok(default),
            }
        };

        let tz_name = get("BOSTAD_TIMEZONE", "Europe/Stockholm");
        let timezone = tz_name
            .parse::<Tz>()
            .map_err(|e| anyhow!("invalid BOSTAD_TIMEZONE {tz_name:?}: {e}"))?;
        let report_range = get("BOSTAD_REPORT_RANGE", "all")
            .parse::<ReportRange>()
            .context("parsing BOSTAD_REPORT_RANGE")?;

        Ok(Self {
            database_path: PathBuf::from(get("DATABASE_PATH", "./data/snapshots.db")),
            primary_url: get("BOSTAD_PRIMARY_URL", "https://www.booli.se/sok/till-salu"),
            secondary_url: get("BOSTAD_SECONDARY_URL", "https://www.hemnet.se/bostader"),
            secondary_enabled: flag(lookup("BOSTAD_SECONDARY_ENABLED"), true),
            user_agent: get("BOSTAD_USER_AGENT", DEFAULT_USER_AGENT),
            locale: get("BOSTAD_LOCALE", "sv-SE"),
            fetch_timeout_secs: number("BOSTAD_FETCH_TIMEOUT_SECS", 60)?,
            settle_delay_ms: number("BOSTAD_SETTLE_DELAY_MS", 5_000)?,
            scrape_cron: get("BOSTAD_SCRAPE_CRON", "0 0 10 * * *"),
            report_cron: get("BOSTAD_REPORT_CRON", "0 0 9 * * Mon"),
            timezone,
            report_range,
            capture_dir: lookup("BOSTAD_CAPTURE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            run_on_startup: flag(lookup("RUN_ON_STARTUP"), false),
            send_test_email: flag(lookup("SEND_TEST_EMAIL"), false),
        })
    }

    fn fetch_options(&self, locale: Option<&str>) -> FetchOptions {
        FetchOptions {
            locale: locale.map(ToString::to_string),
            user_agent: Some(self.user_agent.clone()),
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }

    pub fn primary_source(&self) -> CounterSource {
        CounterSource::primary(self.primary_url.clone(), self.fetch_options(None))
    }

    pub fn secondary_source(&self) -> CounterSource {
        CounterSource::secondary(
            self.secondary_url.clone(),
            self.fetch_options(Some(&self.locale)),
        )
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Mail(#[from] MailError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    DailyScrape,
    WeeklyReport,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::DailyScrape => "daily-scrape",
            Action::WeeklyReport => "weekly-report",
        })
    }
}

/// Owns the store handle and every collaborator an action needs.
pub struct Tracker {
    config: TrackerConfig,
    store: SnapshotStore,
    renderer: Box<dyn PageRenderer>,
    mail: MailSetup,
    report: ReportRenderer,
    capture: Option<PageCapture>,
}

impl Tracker {
    pub fn new(
        config: TrackerConfig,
        store: SnapshotStore,
        renderer: Box<dyn PageRenderer>,
        mail: MailSetup,
    ) -> Self {
        let capture = config.capture_dir.clone().map(PageCapture::new);
        let report = ReportRenderer::new(config.primary_url.clone());
        Self {
            config,
            store,
            renderer,
            mail,
            report,
            capture,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn report_renderer(&self) -> &ReportRenderer {
        &self.report
    }

    /// Release the store. Every shutdown path ends here.
    pub fn close(self) -> Result<(), StoreError> {
        self.store.close()
    }

    /// Run an action to completion, logging rather than propagating failure.
    pub async fn dispatch(&self, action: Action) -> bool {
        let outcome = match action {
            Action::DailyScrape => self.run_daily_scrape().await.map(|snapshot| {
                info!(%snapshot, "daily scrape completed");
            }),
            Action::WeeklyReport => self.run_weekly_report().await.map(|delivery_id| {
                info!(%delivery_id, "weekly report sent");
            }),
        };
        match outcome {
            Ok(()) => true,
            Err(err) => {
                error!(%action, error = %err, "action failed; stored state left untouched");
                false
            }
        }
    }

    pub async fn run_daily_scrape(&self) -> Result<Snapshot, ActionError> {
        self.run_daily_scrape_at(Utc::now()).await
    }

    /// Fetch, extract and store today's snapshot. Nothing is written unless
    /// both primary counters were read.
    pub async fn run_daily_scrape_at(&self, now: DateTime<Utc>) -> Result<Snapshot, ActionError> {
        let run_id = Uuid::new_v4();
        async {
            info!("starting daily scrape");
            let counters = self.read_source(&self.config.primary_source(), now).await?;
            let secondary = self.read_secondary(now).await;

            let snapshot = build_snapshot(counters, secondary, now);
            self.store.upsert(&snapshot)?;
            info!(date = %snapshot.date_key(), "snapshot saved");
            Ok::<_, ActionError>(snapshot)
        }
        .instrument(info_span!("daily_scrape", %run_id))
        .await
    }

    async fn read_secondary(&self, now: DateTime<Utc>) -> SecondaryCounts {
        if !self.config.secondary_enabled {
            return SecondaryCounts::default();
        }
        let source = self.config.secondary_source();
        match self.read_source(&source, now).await {
            Ok(pair) => pair.into(),
            Err(err) => {
                warn!(source = source.source_id, error = %err, "secondary source skipped for this run");
                SecondaryCounts::default()
            }
        }
    }

    async fn read_source(
        &self,
        source: &CounterSource,
        now: DateTime<Utc>,
    ) -> Result<CounterPair, ActionError> {
        info!(source = source.source_id, url = %source.url, "fetching page");
        let text = source.fetch_text(self.renderer.as_ref()).await?;
        match source.extract(&text) {
            Ok(pair) => {
                info!(
                    source = source.source_id,
                    for_sale = pair.for_sale,
                    soon_to_be_sold = pair.soon_to_be_sold,
                    "counters extracted"
                );
                Ok(pair)
            }
            Err(err) => {
                self.capture_failed_page(source.source_id, &err, &text, now).await;
                Err(err.into())
            }
        }
    }

    async fn capture_failed_page(
        &self,
        source_id: &str,
        err: &ExtractionError,
        text: &str,
        now: DateTime<Utc>,
    ) {
        let Some(capture) = &self.capture else {
            return;
        };
        match capture
            .keep_failed_page(now.date_naive(), source_id, &err.to_string(), text)
            .await
        {
            Ok(path) => warn!(source = source_id, path = %path.display(), "page text kept for inspection"),
            Err(err) => warn!(source = source_id, error = %err, "could not keep page text"),
        }
    }

    pub async fn run_weekly_report(&self) -> Result<String, ActionError> {
        self.run_weekly_report_at(Utc::now()).await
    }

    /// Render the configured range and mail it. Returns the delivery receipt.
    pub async fn run_weekly_report_at(&self, now: DateTime<Utc>) -> Result<String, ActionError> {
        info!("starting weekly report");
        let delivery = self.mail.delivery()?;
        let snapshots = self.report_snapshots(now.date_naive())?;
        info!(count = snapshots.len(), range = ?self.config.report_range, "snapshots selected");

        let report = self.report.render(&snapshots)?;
        let email = ReportEmail {
            from: delivery.from.clone(),
            to: delivery.to.clone(),
            subject: report.subject(),
            text_body: report.plain_text,
            html_body: report.rich_text,
        };
        Ok(delivery.mailer.send(&email).await?)
    }

    pub fn report_snapshots(&self, today: NaiveDate) -> Result<Vec<Snapshot>, StoreError> {
        match self.config.report_range {
            ReportRange::All => self.store.all(),
            ReportRange::LastDays(n) => {
                let start = today
                    .checked_sub_days(Days::new(u64::from(n)))
                    .unwrap_or(NaiveDate::MIN);
                self.store.since(start)
            }
        }
    }
}

#[derive(Debug, Default)]
struct PendingActions {
    scrape: AtomicBool,
    report: AtomicBool,
}

impl PendingActions {
    fn flag(&self, action: Action) -> &AtomicBool {
        match action {
            Action::DailyScrape => &self.scrape,
            Action::WeeklyReport => &self.report,
        }
    }
}

/// Producer side of the action queue. Clocks and startup flags enqueue; only
/// the worker executes.
#[derive(Debug, Clone)]
pub struct ActionQueue {
    tx: mpsc::Sender<Action>,
    pending: Arc<PendingActions>,
}

pub struct ActionWorker {
    rx: mpsc::Receiver<Action>,
    pending: Arc<PendingActions>,
}

impl ActionQueue {
    pub fn channel() -> (ActionQueue, ActionWorker) {
        let (tx, rx) = mpsc::channel(4);
        let pending = Arc::new(PendingActions::default());
        (
            ActionQueue {
                tx,
                pending: Arc::clone(&pending),
            },
            ActionWorker { rx, pending },
        )
    }

    /// Returns false when the same action is already queued or running.
    pub fn enqueue(&self, action: Action) -> bool {
        let flag = self.pending.flag(action);
        if flag.swap(true, Ordering::AcqRel) {
            debug!(%action, "already pending; trigger skipped");
            return false;
        }
        if let Err(err) = self.tx.try_send(action) {
            flag.store(false, Ordering::Release);
            warn!(%action, error = %err, "could not enqueue action");
            return false;
        }
        true
    }
}

impl ActionWorker {
    /// Execute queued actions one at a time until `shutdown` resolves or every
    /// producer is gone. An action in progress always runs to completion.
    pub async fn run_until<F>(mut self, tracker: Tracker, shutdown: F) -> Tracker
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                next = self.rx.recv() => {
                    let Some(action) = next else { break };
                    tracker.dispatch(action).await;
                    self.pending.flag(action).store(false, Ordering::Release);
                }
            }
        }
        tracker
    }
}

/// Cron jobs that enqueue the two actions at wall-clock times in the
/// configured timezone.
pub async fn build_scheduler(config: &TrackerConfig, queue: &ActionQueue) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let triggers = [
        (config.scrape_cron.as_str(), Action::DailyScrape),
        (config.report_cron.as_str(), Action::WeeklyReport),
    ];
    for (cron, action) in triggers {
        let queue = queue.clone();
        let job = Job::new_async_tz(cron, config.timezone, move |_uuid, _l| {
            let queue = queue.clone();
            Box::pin(async move {
                if queue.enqueue(action) {
                    info!(%action, "trigger fired");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%action, cron, timezone = %config.timezone, "trigger scheduled");
    }
    Ok(sched)
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Long-running service: schedule triggers, honour startup flags, run the
/// worker until `shutdown`, then close the store.
pub async fn run_service<F>(tracker: Tracker, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let (queue, worker) = ActionQueue::channel();
    let mut sched = match build_scheduler(tracker.config(), &queue).await {
        Ok(sched) => sched,
        Err(err) => {
            if let Err(close_err) = tracker.close() {
                error!(error = %close_err, "closing store after failed startup");
            }
            return Err(err);
        }
    };
    if let Err(err) = sched.start().await {
        if let Err(close_err) = tracker.close() {
            error!(error = %close_err, "closing store after failed startup");
        }
        return Err(anyhow!(err).context("starting scheduler"));
    }

    if tracker.config().run_on_startup {
        info!("running initial scrape on startup");
        queue.enqueue(Action::DailyScrape);
    }
    if tracker.config().send_test_email {
        info!("sending report on startup");
        queue.enqueue(Action::WeeklyReport);
    }

    info!("service running");
    let tracker = worker.run_until(tracker, shutdown).await;

    info!("shutting down");
    if let Err(err) = sched.shutdown().await {
        warn!(error = %err, "scheduler shutdown");
    }
    tracker.close().context("closing snapshot store")?;
    Ok(())
}

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::TimeZone;
use tempfile::tempdir;

use super::*;

const PRIMARY: &str = "https://listing.example.test/till-salu";
const SECONDARY: &str = "https://portal.example.test/bostader";

#[derive(Clone)]
enum Page {
    Text(&'static str),
    Timeout,
}

#[derive(Default)]
struct ScriptedPages {
    pages: HashMap<&'static str, Page>,
    requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl ScriptedPages {
    fn with(mut self, url: &'static str, page: Page) -> Self {
        self.pages.insert(url, page);
        self
    }

    fn request_log(&self) -> Arc<Mutex<Vec<(String, Option<String>)>>> {
        Arc::clone(&self.requests)
    }
}

#[async_trait]
impl PageRenderer for ScriptedPages {
    async fn render_text(&self, url: &str, options: &FetchOptions) -> Result<String, FetchError> {
        self.requests
            .lock()
            .expect("lock")
            .push((url.to_string(), options.locale.clone()));
        match self.pages.get(url) {
            Some(Page::Text(text)) => Ok(text.to_string()),
            Some(Page::Timeout) | None => Err(FetchError::Timeout {
                url: url.to_string(),
                after: options.timeout,
            }),
        }
    }
}

#[derive(Clone, Default)]
struct RecordingMailer {
    sent: Arc<Mutex<Vec<ReportEmail>>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &ReportEmail) -> Result<String, MailError> {
        let mut sent = self.sent.lock().expect("lock");
        sent.push(email.clone());
        Ok(format!("250 queued as {}", sent.len()))
    }
}

fn config_with(overrides: &[(&str, &str)]) -> TrackerConfig {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("BOSTAD_PRIMARY_URL".to_string(), PRIMARY.to_string()),
        ("BOSTAD_SECONDARY_URL".to_string(), SECONDARY.to_string()),
        ("BOSTAD_SETTLE_DELAY_MS".to_string(), "0".to_string()),
    ]);
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    TrackerConfig::from_lookup(|key| vars.get(key).cloned()).expect("config")
}

fn tracker(config: TrackerConfig, pages: ScriptedPages, mailer: Option<RecordingMailer>) -> Tracker {
    let mail = match mailer {
        Some(mailer) => MailSetup::Ready(ReportDelivery {
            mailer: Box::new(mailer),
            from: "bot@example.test".into(),
            to: "ops@example.test".into(),
        }),
        None => MailSetup::Unconfigured {
            missing: vec!["SMTP_HOST".into()],
        },
    };
    let store = SnapshotStore::open_in_memory().expect("store");
    Tracker::new(config, store, Box::new(pages), mail)
}

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 8, 0, 0).single().expect("ts")
}

fn seed(tracker: &Tracker, date: DateTime<Utc>, for_sale: u64) {
    let pair = CounterPair {
        for_sale,
        soon_to_be_sold: for_sale / 10,
    };
    tracker
        .store()
        .upsert(&build_snapshot(pair, SecondaryCounts::default(), date))
        .expect("seed");
}

#[test]
fn config_defaults_follow_the_service_schedule() {
    let config = TrackerConfig::from_lookup(|_| None).expect("config");
    assert_eq!(config.database_path, PathBuf::from("./data/snapshots.db"));
    assert_eq!(config.primary_url, "https://www.booli.se/sok/till-salu");
    assert!(config.secondary_enabled);
    assert_eq!(config.scrape_cron, "0 0 10 * * *");
    assert_eq!(config.report_cron, "0 0 9 * * Mon");
    assert_eq!(config.timezone, chrono_tz::Europe::Stockholm);
    assert_eq!(config.report_range, ReportRange::All);
    assert_eq!(config.fetch_timeout_secs, 60);
    assert!(!config.run_on_startup);
    assert!(!config.send_test_email);
    assert_eq!(config.capture_dir, None);
}

#[test]
fn config_reads_flags_and_rejects_bad_values() {
    let config = config_with(&[
        ("RUN_ON_STARTUP", "TRUE"),
        ("SEND_TEST_EMAIL", "1"),
        ("BOSTAD_SECONDARY_ENABLED", "false"),
        ("BOSTAD_REPORT_RANGE", "last-14-days"),
        ("BOSTAD_TIMEZONE", "UTC"),
    ]);
    assert!(config.run_on_startup);
    assert!(config.send_test_email);
    assert!(!config.secondary_enabled);
    assert_eq!(config.report_range, ReportRange::LastDays(14));
    assert_eq!(config.timezone, chrono_tz::UTC);

    assert!(TrackerConfig::from_lookup(|k| (k == "BOSTAD_TIMEZONE").then(|| "Mars/Olympus".to_string())).is_err());
    assert!(TrackerConfig::from_lookup(|k| (k == "BOSTAD_FETCH_TIMEOUT_SECS").then(|| "soon".to_string())).is_err());
}

#[test]
fn report_range_parsing() {
    assert_eq!("all".parse::<ReportRange>().expect("all"), ReportRange::All);
    assert_eq!("week".parse::<ReportRange>().expect("week"), ReportRange::LastDays(7));
    assert_eq!("Last-30-Days".parse::<ReportRange>().expect("30"), ReportRange::LastDays(30));
    assert!("fortnight".parse::<ReportRange>().is_err());
}

#[tokio::test]
async fn daily_scrape_stores_both_sources() {
    let pages = ScriptedPages::default()
        .with(PRIMARY, Page::Text("41 234 till salu och 5 120 snart till salu"))
        .with(SECONDARY, Page::Text("52 331 bostäder till salu · 2 180 kommande"));
    let tracker = tracker(config_with(&[]), pages, None);

    let snapshot = tracker.run_daily_scrape_at(at(2024, 3, 1)).await.expect("scrape");

    assert_eq!(snapshot.date_key(), "2024-03-01");
    assert_eq!(snapshot.for_sale, 41_234);
    assert_eq!(snapshot.soon_to_be_sold, 5_120);
    assert_eq!(snapshot.secondary_for_sale, Some(52_331));
    assert_eq!(snapshot.secondary_coming, Some(2_180));
    assert_eq!(tracker.store().latest().expect("latest"), Some(snapshot));
}

#[tokio::test]
async fn secondary_source_gets_the_configured_locale() {
    let pages = ScriptedPages::default()
        .with(PRIMARY, Page::Text("41 234 till salu och 5 120 snart till salu"))
        .with(SECONDARY, Page::Text("52 331 till salu, 2 180 kommande"));
    let requests = pages.request_log();
    let tracker = tracker(config_with(&[]), pages, None);
    tracker.run_daily_scrape_at(at(2024, 3, 1)).await.expect("scrape");

    assert_eq!(
        *requests.lock().expect("lock"),
        vec![
            (PRIMARY.to_string(), None),
            (SECONDARY.to_string(), Some("sv-SE".to_string())),
        ]
    );
}

#[tokio::test]
async fn fetch_timeout_writes_nothing() {
    let pages = ScriptedPages::default().with(PRIMARY, Page::Timeout);
    let tracker = tracker(config_with(&[]), pages, None);

    let err = tracker
        .run_daily_scrape_at(at(2024, 3, 1))
        .await
        .expect_err("timeout");
    assert!(matches!(err, ActionError::Fetch(FetchError::Timeout { .. })));
    assert_eq!(tracker.store().count().expect("count"), 0);
    assert!(!tracker.dispatch(Action::DailyScrape).await);
    assert_eq!(tracker.store().count().expect("count"), 0);
}

#[tokio::test]
async fn unreadable_page_writes_nothing_and_is_captured() {
    let dir = tempdir().expect("tempdir");
    let capture_dir = dir.path().join("captures");
    let pages = ScriptedPages::default()
        .with(PRIMARY, Page::Text("41 234 till salu, resten laddas..."));
    let config = config_with(&[("BOSTAD_CAPTURE_DIR", capture_dir.to_str().expect("utf8 path"))]);
    let tracker = tracker(config, pages, None);

    let err = tracker
        .run_daily_scrape_at(at(2024, 3, 1))
        .await
        .expect_err("half a page");
    assert!(matches!(err, ActionError::Extraction(_)));
    assert_eq!(tracker.store().count().expect("count"), 0);

    let kept = std::fs::read_to_string(capture_dir.join("2024-03-01-booli.txt")).expect("capture file");
    assert_eq!(
        kept,
        "no pattern matched the soon_to_be_sold counter\n\n41 234 till salu, resten laddas...\n"
    );
    assert_eq!(std::fs::read_dir(&capture_dir).expect("capture dir").count(), 1);
}

#[tokio::test]
async fn secondary_failure_still_stores_primary_counters() {
    let pages = ScriptedPages::default()
        .with(PRIMARY, Page::Text("41 234 till salu och 5 120 snart till salu"))
        .with(SECONDARY, Page::Timeout);
    let tracker = tracker(config_with(&[]), pages, None);

    let snapshot = tracker.run_daily_scrape_at(at(2024, 3, 1)).await.expect("scrape");
    assert_eq!(snapshot.for_sale, 41_234);
    assert_eq!(snapshot.secondary_for_sale, None);
    assert_eq!(snapshot.secondary_coming, None);
    assert_eq!(tracker.store().count().expect("count"), 1);
}

#[tokio::test]
async fn rerun_on_same_day_replaces_the_row() {
    let pages = ScriptedPages::default()
        .with(PRIMARY, Page::Text("41 300 till salu och 5 100 snart till salu"));
    let tracker = tracker(
        config_with(&[("BOSTAD_SECONDARY_ENABLED", "false")]),
        pages,
        None,
    );
    let mut earlier = build_snapshot(
        CounterPair {
            for_sale: 41_000,
            soon_to_be_sold: 5_000,
        },
        SecondaryCounts {
            for_sale: Some(52_000),
            coming: Some(2_000),
        },
        at(2024, 3, 1),
    );
    earlier.recorded_at = at(2024, 3, 1) - chrono::Duration::hours(1);
    tracker.store().upsert(&earlier).expect("seed");

    tracker.run_daily_scrape_at(at(2024, 3, 1)).await.expect("scrape");

    let rows = tracker.store().all().expect("all");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].for_sale, 41_300);
    assert_eq!(rows[0].secondary_for_sale, None);
    assert_eq!(rows[0].secondary_coming, None);
}

#[tokio::test]
async fn weekly_report_mails_full_history_newest_first() {
    let mailer = RecordingMailer::default();
    let tracker = tracker(config_with(&[]), ScriptedPages::default(), Some(mailer.clone()));
    seed(&tracker, at(2024, 1, 1), 40_000);
    seed(&tracker, at(2024, 1, 3), 41_000);
    seed(&tracker, at(2024, 1, 10), 42_500);

    let receipt = tracker.run_weekly_report_at(at(2024, 1, 15)).await.expect("report");
    assert_eq!(receipt, "250 queued as 1");

    let sent = mailer.sent.lock().expect("lock");
    assert_eq!(sent.len(), 1);
    let email = &sent[0];
    assert_eq!(email.from, "bot@example.test");
    assert_eq!(email.to, "ops@example.test");
    assert_eq!(email.subject, "Weekly Report (2024-01-10 to 2024-01-01)");
    assert!(email.html_body.contains(">42,500<"));
    assert!(email.text_body.contains("2024-01-10 |    42500 |"));
}

#[tokio::test]
async fn last_days_range_reports_oldest_first() {
    let mailer = RecordingMailer::default();
    let tracker = tracker(
        config_with(&[("BOSTAD_REPORT_RANGE", "last-7-days")]),
        ScriptedPages::default(),
        Some(mailer.clone()),
    );
    seed(&tracker, at(2024, 1, 1), 40_000);
    seed(&tracker, at(2024, 1, 9), 41_000);
    seed(&tracker, at(2024, 1, 14), 42_000);

    tracker.run_weekly_report_at(at(2024, 1, 15)).await.expect("report");
    let sent = mailer.sent.lock().expect("lock");
    assert_eq!(sent[0].subject, "Weekly Report (2024-01-09 to 2024-01-14)");
    assert!(!sent[0].text_body.contains("2024-01-01"));
}

#[tokio::test]
async fn report_without_mail_config_fails_and_sends_nothing() {
    let tracker = tracker(config_with(&[]), ScriptedPages::default(), None);
    seed(&tracker, at(2024, 1, 1), 40_000);

    let err = tracker
        .run_weekly_report_at(at(2024, 1, 15))
        .await
        .expect_err("no smtp");
    assert!(matches!(err, ActionError::Mail(MailError::MissingConfig(_))));
    assert!(!tracker.dispatch(Action::WeeklyReport).await);
}

#[tokio::test]
async fn queue_skips_a_trigger_while_the_action_is_pending() {
    let (queue, worker) = ActionQueue::channel();
    assert!(queue.enqueue(Action::DailyScrape));
    assert!(!queue.enqueue(Action::DailyScrape));
    assert!(queue.enqueue(Action::WeeklyReport));

    let pages = ScriptedPages::default()
        .with(PRIMARY, Page::Text("41 234 till salu och 5 120 snart till salu"));
    let tracker = tracker(
        config_with(&[("BOSTAD_SECONDARY_ENABLED", "false")]),
        pages,
        None,
    );

    let producer = queue.clone();
    drop(queue);
    let worker_task = worker.run_until(tracker, std::future::pending());
    let (tracker, ()) = tokio::join!(worker_task, async move {
        // Once the worker has drained both actions the flags are free again.
        loop {
            tokio::task::yield_now().await;
            if !producer.pending.scrape.load(Ordering::Acquire)
                && !producer.pending.report.load(Ordering::Acquire)
            {
                break;
            }
        }
        assert!(producer.enqueue(Action::DailyScrape));
        drop(producer);
    });

    // Two scrapes ran (the initial one and the re-enqueued one), same day, one row.
    assert_eq!(tracker.store().count().expect("count"), 1);
    tracker.close().expect("close");
}

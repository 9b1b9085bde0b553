//! Plain-text and HTML report bodies for a run of snapshots.

use std::fmt::Write as _;

use askama::Template;
use bostad_core::Snapshot;
use thiserror::Error;

pub const CRATE_NAME: &str = "bostad-report";

pub const NO_DATA: &str = "No data available for this period.";
pub const NOT_AVAILABLE: &str = "N/A";
pub const REPORT_TITLE: &str = "Weekly Housing Report";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("rendering report template: {0}")]
    Template(#[from] askama::Error),
}

/// First and last date of the rendered sequence, in the order given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

impl DateRange {
    pub fn of(snapshots: &[Snapshot]) -> Self {
        match (snapshots.first(), snapshots.last()) {
            (Some(first), Some(last)) => Self {
                start: first.date_key(),
                end: last.date_key(),
            },
            _ => Self {
                start: NOT_AVAILABLE.to_string(),
                end: NOT_AVAILABLE.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderedReport {
    pub range: DateRange,
    pub plain_text: String,
    pub rich_text: String,
}

impl RenderedReport {
    pub fn subject(&self) -> String {
        format!("Weekly Report ({} to {})", self.range.start, self.range.end)
    }
}

struct ReportRow {
    date: String,
    for_sale: String,
    soon_to_be_sold: String,
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportHtmlTemplate<'a> {
    title: &'a str,
    start: &'a str,
    end: &'a str,
    no_data: &'a str,
    source_url: &'a str,
    rows: Vec<ReportRow>,
}

/// Renders snapshots in the order it is handed them; choosing the range and
/// the order is the caller's business.
#[derive(Debug, Clone)]
pub struct ReportRenderer {
    source_url: String,
}

impl ReportRenderer {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
        }
    }

    pub fn render(&self, snapshots: &[Snapshot]) -> Result<RenderedReport, ReportError> {
        let range = DateRange::of(snapshots);
        let rich_text = self.render_html(&range, snapshots)?;
        let plain_text = self.render_text(&range, snapshots);
        Ok(RenderedReport {
            range,
            plain_text,
            rich_text,
        })
    }

    fn render_html(&self, range: &DateRange, snapshots: &[Snapshot]) -> Result<String, ReportError> {
        let rows = snapshots
            .iter()
            .map(|s| ReportRow {
                date: s.date_key(),
                for_sale: group_thousands(s.for_sale),
                soon_to_be_sold: group_thousands(s.soon_to_be_sold),
            })
            .collect();
        let tpl = ReportHtmlTemplate {
            title: REPORT_TITLE,
            start: &range.start,
            end: &range.end,
            no_data: NO_DATA,
            source_url: &self.source_url,
            rows,
        };
        Ok(tpl.render()?)
    }

    fn render_text(&self, range: &DateRange, snapshots: &[Snapshot]) -> String {
        format!(
            "{REPORT_TITLE}\nData from {} to {}\n\n{}\n\nSource: {}\n",
            range.start,
            range.end,
            text_table(snapshots),
            self.source_url
        )
    }
}

fn text_table(snapshots: &[Snapshot]) -> String {
    if snapshots.is_empty() {
        return NO_DATA.to_string();
    }
    let mut table = String::from(
        "Date       | For Sale | Soon to be Sold\n-----------|----------|----------------",
    );
    for s in snapshots {
        let _ = write!(
            table,
            "\n{} | {:>8} | {:>15}",
            s.date_key(),
            s.for_sale,
            s.soon_to_be_sold
        );
    }
    table
}

/// `1234567` -> `1,234,567`.
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

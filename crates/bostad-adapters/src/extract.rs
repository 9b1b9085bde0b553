//! Ordered fallback patterns that pull counters out of page text.

#![allow(clippy::expect_used)]

use std::fmt;
use std::sync::LazyLock;

use bostad_core::CounterPair;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// A count as printed on the page: digits with optional space, no-break
/// space or comma group separators. A leading minus is captured so it can be
/// rejected instead of silently dropped.
pub const NUMBER: &str = r"-?[0-9](?:[ \t\x{00A0}\x{2009}\x{202F},]*[0-9])*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    ForSale,
    SoonToBeSold,
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Counter::ForSale => "for_sale",
            Counter::SoonToBeSold => "soon_to_be_sold",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("no pattern matched the {counter} counter")]
    NoMatch { counter: Counter },
    #[error("matched {token:?} for {counter} via {pattern} but it is not a valid count")]
    InvalidNumber {
        counter: Counter,
        pattern: &'static str,
        token: String,
    },
}

#[derive(Debug, Error)]
pub enum PatternError {
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error("pattern {name} needs {needed} capture group(s) for its counts, found {found}")]
    MissingGroups {
        name: &'static str,
        needed: usize,
        found: usize,
    },
}

/// One rule for locating counters in free text.
#[derive(Debug, Clone)]
pub enum ExtractionPattern {
    /// A single phrase carrying both counters: group 1 is for-sale, group 2
    /// is soon-to-be-sold.
    Combined { name: &'static str, phrase: Regex },
    /// A phrase for one counter; capture group 1 holds its token.
    Split {
        name: &'static str,
        counter: Counter,
        phrase: Regex,
    },
}

impl ExtractionPattern {
    pub fn combined(name: &'static str, phrase: &str) -> Result<Self, PatternError> {
        Ok(Self::Combined {
            name,
            phrase: compile_with_groups(name, phrase, 2)?,
        })
    }

    pub fn split(name: &'static str, counter: Counter, phrase: &str) -> Result<Self, PatternError> {
        let phrase = compile_with_groups(name, phrase, 1)?;
        Ok(Self::Split {
            name,
            counter,
            phrase,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Combined { name, .. } | Self::Split { name, .. } => name,
        }
    }

    /// Raw tokens this pattern finds in `text`, tagged with their counter.
    /// Empty when the pattern does not match.
    pub fn attempt<'t>(&self, text: &'t str) -> Vec<(Counter, &'t str)> {
        match self {
            Self::Combined { phrase, .. } => phrase
                .captures(text)
                .and_then(|caps| Some((caps.get(1)?, caps.get(2)?)))
                .map(|(for_sale, soon)| {
                    vec![
                        (Counter::ForSale, for_sale.as_str()),
                        (Counter::SoonToBeSold, soon.as_str()),
                    ]
                })
                .unwrap_or_default(),
            Self::Split { counter, phrase, .. } => phrase
                .captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| vec![(*counter, m.as_str())])
                .unwrap_or_default(),
        }
    }
}

fn compile_with_groups(name: &'static str, phrase: &str, needed: usize) -> Result<Regex, PatternError> {
    let phrase = Regex::new(phrase)?;
    // captures_len counts the implicit whole-match group.
    let found = phrase.captures_len() - 1;
    if found < needed {
        return Err(PatternError::MissingGroups {
            name,
            needed,
            found,
        });
    }
    Ok(phrase)
}

/// Patterns tried in declaration order; the first hit for a counter wins it.
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<ExtractionPattern>,
}

static PRIMARY: LazyLock<PatternSet> = LazyLock::new(|| {
    let n = NUMBER;
    PatternSet::new(vec![
        ExtractionPattern::combined(
            "combined-sv",
            &format!(
                r"(?i)({n})\s+(?:bostäder\s+)?till\s+salu\b[^\n.]{{0,60}}?({n})\s+(?:bostäder\s+)?snart\s+till\s+salu"
            ),
        )
        .expect("combined-sv regex"),
        ExtractionPattern::combined(
            "combined-en",
            &format!(
                r"(?i)({n})\s+(?:homes\s+)?for\s+sale\b[^\n.]{{0,60}}?({n})\s+(?:homes\s+)?(?:coming\s+soon|soon\s+to\s+be\s+sold)"
            ),
        )
        .expect("combined-en regex"),
        ExtractionPattern::split(
            "for-sale-sv",
            Counter::ForSale,
            &format!(r"(?i)({n})\s+(?:bostäder\s+)?till\s+salu"),
        )
        .expect("for-sale-sv regex"),
        ExtractionPattern::split(
            "for-sale-en",
            Counter::ForSale,
            &format!(r"(?i)({n})\s+(?:homes\s+)?for\s+sale"),
        )
        .expect("for-sale-en regex"),
        ExtractionPattern::split(
            "soon-sv",
            Counter::SoonToBeSold,
            &format!(r"(?i)({n})\s+(?:bostäder\s+)?snart\s+till\s+salu"),
        )
        .expect("soon-sv regex"),
        ExtractionPattern::split(
            "soon-en",
            Counter::SoonToBeSold,
            &format!(r"(?i)({n})\s+(?:homes\s+)?(?:coming\s+soon|soon\s+to\s+be\s+sold)"),
        )
        .expect("soon-en regex"),
    ])
});

static SECONDARY: LazyLock<PatternSet> = LazyLock::new(|| {
    let n = NUMBER;
    PatternSet::new(vec![
        ExtractionPattern::split(
            "listed",
            Counter::ForSale,
            &format!(r"(?i)({n})\s*(?:bostäder\s+)?till\s+salu"),
        )
        .expect("listed regex"),
        ExtractionPattern::split(
            "upcoming",
            Counter::SoonToBeSold,
            &format!(r"(?i)({n})\s*(?:kommande|snart)"),
        )
        .expect("upcoming regex"),
    ])
});

impl PatternSet {
    pub fn new(patterns: Vec<ExtractionPattern>) -> Self {
        Self { patterns }
    }

    /// Listing-site phrasing: combined sentence first, then split phrases,
    /// Swedish before English.
    pub fn primary() -> &'static PatternSet {
        &PRIMARY
    }

    pub fn secondary() -> &'static PatternSet {
        &SECONDARY
    }

    pub fn patterns(&self) -> &[ExtractionPattern] {
        &self.patterns
    }

    /// Resolve both counters or fail; never returns a half-filled pair.
    pub fn extract(&self, text: &str) -> Result<CounterPair, ExtractionError> {
        let mut for_sale: Option<u64> = None;
        let mut soon: Option<u64> = None;

        for pattern in &self.patterns {
            if for_sale.is_some() && soon.is_some() {
                break;
            }
            for (counter, token) in pattern.attempt(text) {
                let slot = match counter {
                    Counter::ForSale => &mut for_sale,
                    Counter::SoonToBeSold => &mut soon,
                };
                if slot.is_some() {
                    continue;
                }
                let value = parse_count(token).ok_or_else(|| ExtractionError::InvalidNumber {
                    counter,
                    pattern: pattern.name(),
                    token: token.to_string(),
                })?;
                debug!(pattern = pattern.name(), %counter, value, "counter matched");
                *slot = Some(value);
            }
        }

        match (for_sale, soon) {
            (Some(for_sale), Some(soon_to_be_sold)) => Ok(CounterPair {
                for_sale,
                soon_to_be_sold,
            }),
            (None, _) => Err(ExtractionError::NoMatch {
                counter: Counter::ForSale,
            }),
            (_, None) => Err(ExtractionError::NoMatch {
                counter: Counter::SoonToBeSold,
            }),
        }
    }
}

/// Extract with the primary listing-site patterns.
pub fn extract(page_text: &str) -> Result<CounterPair, ExtractionError> {
    PatternSet::primary().extract(page_text)
}

/// Parse a printed count, dropping whitespace and comma separators.
/// Negative or overflowing values are rejected.
pub fn parse_count(token: &str) -> Option<u64> {
    let digits: String = token
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    digits.parse().ok()
}

//! Report delivery over SMTP.

use std::fmt;

use async_trait::async_trait;
use lettre::address::AddressError;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

const REQUIRED_VARS: [&str; 6] = [
    "SMTP_HOST",
    "SMTP_PORT",
    "SMTP_USER",
    "SMTP_PASS",
    "FROM_EMAIL",
    "TO_EMAIL",
];

/// Port on which the server expects TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingConfig(Vec<String>),
    #[error("invalid SMTP_PORT {0:?}")]
    InvalidPort(String),
    #[error("invalid address {address:?}: {source}")]
    Address {
        address: String,
        source: AddressError,
    },
    #[error("building message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// Delivers one email and returns the server's receipt.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &ReportEmail) -> Result<String, MailError>;
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub from: String,
    pub to: String,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

impl SmtpConfig {
    /// Every required variable must be present and non-empty; the error names
    /// all of the missing ones at once.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, MailError> {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let missing: Vec<String> = REQUIRED_VARS
            .iter()
            .filter(|key| value(key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(MailError::MissingConfig(missing));
        }

        let get = |key: &str| value(key).unwrap_or_default();
        let port_raw = get("SMTP_PORT");
        let port = port_raw
            .trim()
            .parse::<u16>()
            .map_err(|_| MailError::InvalidPort(port_raw.clone()))?;

        Ok(Self {
            host: get("SMTP_HOST"),
            port,
            user: get("SMTP_USER"),
            pass: get("SMTP_PASS"),
            from: get("FROM_EMAIL"),
            to: get("TO_EMAIL"),
        })
    }
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let builder = if config.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        };
        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(config.user.clone(), config.pass.clone()))
            .build();
        Ok(Self { transport })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &ReportEmail) -> Result<String, MailError> {
        let message = build_message(email)?;
        let response = self.transport.send(message).await?;
        let receipt = response
            .message()
            .map(|line| line.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(format!("{} {}", response.code(), receipt).trim().to_string())
    }
}

fn mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.parse().map_err(|source| MailError::Address {
        address: address.to_string(),
        source,
    })
}

pub fn build_message(email: &ReportEmail) -> Result<Message, MailError> {
    Ok(Message::builder()
        .from(mailbox(&email.from)?)
        .to(mailbox(&email.to)?)
        .subject(email.subject.clone())
        .multipart(MultiPart::alternative_plain_html(
            email.text_body.clone(),
            email.html_body.clone(),
        ))?)
}

/// Sender, recipient and transport for the weekly report.
pub struct ReportDelivery {
    pub mailer: Box<dyn Mailer>,
    pub from: String,
    pub to: String,
}

/// Mail is optional at startup: without it the scrape path still runs and
/// only the report action fails.
pub enum MailSetup {
    Ready(ReportDelivery),
    Unconfigured { missing: Vec<String> },
}

impl MailSetup {
    pub fn from_env() -> Result<Self, MailError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, MailError> {
        match SmtpConfig::from_lookup(lookup) {
            Ok(config) => Ok(Self::Ready(ReportDelivery {
                mailer: Box::new(SmtpMailer::new(&config)?),
                from: config.from,
                to: config.to,
            })),
            Err(MailError::MissingConfig(missing)) => Ok(Self::Unconfigured { missing }),
            Err(err) => Err(err),
        }
    }

    pub fn delivery(&self) -> Result<&ReportDelivery, MailError> {
        match self {
            Self::Ready(delivery) => Ok(delivery),
            Self::Unconfigured { missing } => Err(MailError::MissingConfig(missing.clone())),
        }
    }
}

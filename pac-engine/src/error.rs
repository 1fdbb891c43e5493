//! Error types for PAC resolution

use crate::directive::ProxyDirective;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PacError>;

#[derive(Debug, Error)]
pub enum PacError {
    #[error("Failed to compile PAC script: {message}")]
    Compile { message: String },

    #[error("Failed to start PAC evaluator thread: {0}")]
    Evaluator(#[source] std::io::Error),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error(transparent)]
    Directive(#[from] DirectiveError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("FindProxyForURL({url:?}, {host:?}) returned no usable directives")]
    EmptyVerdict { url: String, host: String },

    #[error("unable to process FindProxyForURL({url:?}, {host:?}) result {verdict:?}{}", RejectionList(.rejected))]
    Unresolvable {
        url: String,
        host: String,
        verdict: String,
        rejected: Vec<Rejection>,
    },

    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to read PAC file {path}: {source}")]
    SourceLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to fetch PAC from {url}: {source}")]
    SourceFetch {
        url: String,
        source: reqwest::Error,
    },
}

/// Failure to obtain a verdict from `FindProxyForURL`.
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    #[error("ReferenceError: 'FindProxyForURL' is not defined")]
    Undefined,

    #[error("TypeError: 'FindProxyForURL' is not a function")]
    NotCallable,

    #[error("{0}")]
    Thrown(String),

    #[error("PAC evaluator is not running")]
    Unavailable,
}

/// Malformed statement in a `FindProxyForURL` verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("unsupported PAC command {0:?}")]
    UnsupportedCommand(String),

    #[error("unable to parse proxy details from {0:?}")]
    MissingArgument(String),

    #[error("unable to parse hostname and port from {0:?}")]
    InvalidAddress(String),

    #[error("PAC result has more than {max} statements")]
    TooManyStatements { max: usize },
}

/// Dial failure for an upstream, with the backoff window that applies to it.
#[derive(Debug, Clone, Error)]
#[error("connection to {address:?} is currently blacklisted for {}: {source}", human(.remaining))]
pub struct DialError {
    pub address: String,
    pub remaining: Duration,
    #[source]
    pub source: Arc<std::io::Error>,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },

    #[error("Invalid listen address: {address}")]
    InvalidListen { address: String },

    #[error("Invalid PAC source: {source_ref}")]
    InvalidSource { source_ref: String },
}

/// A candidate skipped by `PacResolver::resolve`, with the reason.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub directive: ProxyDirective,
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.directive, self.reason)
    }
}

struct RejectionList<'a>(&'a [Rejection]);

impl fmt::Display for RejectionList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rejection in self.0 {
            write!(f, "; {}", rejection.reason)?;
        }
        Ok(())
    }
}

fn human(duration: &Duration) -> HumanDuration {
    HumanDuration(*duration)
}

/// Renders a duration as `4m59s`, truncated to whole seconds.
pub struct HumanDuration(pub Duration);

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.as_secs();
        let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
        if hours > 0 {
            write!(f, "{hours}h{minutes}m{seconds}s")
        } else if minutes > 0 {
            write!(f, "{minutes}m{seconds}s")
        } else if total > 0 {
            write!(f, "{seconds}s")
        } else {
            write!(f, "{}ms", self.0.as_millis())
        }
    }
}

use std::time::Duration;
use thiserror::Error;

// Failures of the entitlement store, never used to mean "no record"
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Entitlement store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Entitlement store returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Entitlement store response could not be decoded: {0}")]
    Decode(String),

    #[error("Entitlement store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Gave up charging identity {identity} after {attempts} conflicting updates")]
    Contention { identity: i64, attempts: u32 },
}

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Completion queue is closed")]
    QueueClosed,

    #[error("Completion worker dropped the request")]
    WorkerGone,

    #[error("No healthy completion backends available")]
    NoBackend,

    #[error("Completion request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Completion backend returned status {0}")]
    Status(u16),

    #[error("Completion response missing field `{0}`")]
    MissingField(&'static str),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Transport rejected {method}: {description}")]
    Api {
        method: &'static str,
        description: String,
    },
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Effect search request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Effect search returned status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("At least one completion backend required")]
    NoBackends,
}

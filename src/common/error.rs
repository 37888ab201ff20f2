//! Error types for the tunnel supervisor

use crate::supervisor::ExitReport;
use std::io;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Binary(#[from] BinaryError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Error::Network(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

/// A subscription line that could not be turned into an [`Outbound`](crate::outbound::Outbound)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported link scheme: {0}")]
    UnsupportedScheme(String),

    #[error("malformed link: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        DecodeError::Malformed(msg.into())
    }
}

/// Subscription retrieval failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("subscription fetch failed: {0}")]
    Network(String),

    #[error("subscription contained no usable links")]
    EmptyBody,
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Network(e.to_string())
    }
}

/// Engine binary acquisition failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BinaryError {
    #[error("engine download failed: {0}")]
    DownloadFailed(String),

    #[error("no engine build for {0}")]
    UnsupportedOS(String),
}

impl BinaryError {
    pub fn download<S: Into<String>>(msg: S) -> Self {
        BinaryError::DownloadFailed(msg.into())
    }
}

/// Failure to bring one candidate's engine process up
#[derive(Error, Debug, Clone)]
pub enum StartError {
    #[error("failed to launch engine: {0}")]
    LaunchFailed(String),

    #[error("engine exited during startup ({0})")]
    ProbeFailedDead(ExitReport),
}

impl StartError {
    pub fn launch<S: Into<String>>(msg: S) -> Self {
        StartError::LaunchFailed(msg.into())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

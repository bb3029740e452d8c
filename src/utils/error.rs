//! Customized error type and conversions.

use std::error::Error;
use std::fmt;
use std::io;
use std::net;

/// Quorumcast's universal error type. Carries a human-readable message;
/// everything fallible in the crate funnels into this.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct QuorumcastError(pub String);

impl QuorumcastError {
    /// Creates an error out of anything printable.
    pub fn msg(m: impl ToString) -> Self {
        QuorumcastError(m.to_string())
    }
}

impl fmt::Display for QuorumcastError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for QuorumcastError {}

impl From<io::Error> for QuorumcastError {
    fn from(e: io::Error) -> Self {
        QuorumcastError(format!("io error: {}", e))
    }
}

impl From<serde_json::Error> for QuorumcastError {
    fn from(e: serde_json::Error) -> Self {
        QuorumcastError(format!("json error: {}", e))
    }
}

impl From<toml::de::Error> for QuorumcastError {
    fn from(e: toml::de::Error) -> Self {
        QuorumcastError(format!("toml error: {}", e))
    }
}

impl From<net::AddrParseError> for QuorumcastError {
    fn from(e: net::AddrParseError) -> Self {
        QuorumcastError(format!("addr parse error: {}", e))
    }
}

impl From<std::str::Utf8Error> for QuorumcastError {
    fn from(e: std::str::Utf8Error) -> Self {
        QuorumcastError(format!("utf8 error: {}", e))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for QuorumcastError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        QuorumcastError(format!("mpsc send error: {}", e))
    }
}

impl From<tokio::sync::watch::error::RecvError> for QuorumcastError {
    fn from(e: tokio::sync::watch::error::RecvError) -> Self {
        QuorumcastError(format!("watch recv error: {}", e))
    }
}

impl From<tokio::task::JoinError> for QuorumcastError {
    fn from(e: tokio::task::JoinError) -> Self {
        QuorumcastError(format!("join error: {}", e))
    }
}

impl From<ctrlc::Error> for QuorumcastError {
    fn from(e: ctrlc::Error) -> Self {
        QuorumcastError(format!("ctrlc error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = QuorumcastError::msg("oops");
        assert_eq!(format!("{}", e), "oops");
    }

    #[test]
    fn error_from_io() {
        let ioe = io::Error::new(io::ErrorKind::NotFound, "gone");
        let e = QuorumcastError::from(ioe);
        assert!(e.0.contains("gone"));
    }
}

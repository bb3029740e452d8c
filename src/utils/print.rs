//! Logging initialization and identity-prefixed log macros.

use std::io::Write;
use std::sync::RwLock;

use lazy_static::lazy_static;

lazy_static! {
    /// Identity string of this process, prepended to every log line.
    /// Set once at startup (the server's `host:port` or the client's id).
    pub static ref ME: RwLock<String> = RwLock::new("-".into());
}

/// Sets the identity string used as the log prefix.
pub fn set_me(id: &str) {
    if let Ok(mut me) = ME.write() {
        *me = id.into();
    }
}

/// Returns a copy of the identity string.
pub fn me() -> String {
    ME.read().map(|me| me.clone()).unwrap_or_else(|_| "-".into())
}

/// Initializes the env_logger, with colorless level tags and without the
/// module path (the `ME` prefix carries the useful identity).
pub fn logger_init() {
    let _ = env_logger::Builder::from_default_env()
        .format(|buf, record| {
            writeln!(buf, "[{:5}] {}", record.level(), record.args())
        })
        .try_init();
}

/// Log at trace level with the identity prefix.
#[macro_export]
macro_rules! pf_trace {
    ($($arg:tt)*) => {
        ::log::trace!("({}) {}", $crate::me(), format!($($arg)*))
    };
}

/// Log at debug level with the identity prefix.
#[macro_export]
macro_rules! pf_debug {
    ($($arg:tt)*) => {
        ::log::debug!("({}) {}", $crate::me(), format!($($arg)*))
    };
}

/// Log at info level with the identity prefix.
#[macro_export]
macro_rules! pf_info {
    ($($arg:tt)*) => {
        ::log::info!("({}) {}", $crate::me(), format!($($arg)*))
    };
}

/// Log at warn level with the identity prefix.
#[macro_export]
macro_rules! pf_warn {
    ($($arg:tt)*) => {
        ::log::warn!("({}) {}", $crate::me(), format!($($arg)*))
    };
}

/// Log at error level with the identity prefix.
#[macro_export]
macro_rules! pf_error {
    ($($arg:tt)*) => {
        ::log::error!("({}) {}", $crate::me(), format!($($arg)*))
    };
}

/// Logs an error line and evaluates to the corresponding `Err`, for
/// one-expression bail-outs.
#[macro_export]
macro_rules! logged_err {
    ($($arg:tt)*) => {{
        $crate::pf_error!($($arg)*);
        Err($crate::QuorumcastError::msg(format!($($arg)*)))
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn me_roundtrip() {
        set_me("10.0.0.1:5001");
        assert_eq!(me(), "10.0.0.1:5001");
    }

    #[test]
    fn logged_err_value() {
        let r: Result<(), crate::utils::QuorumcastError> =
            logged_err!("bad thing {}", 42);
        assert_eq!(
            r,
            Err(crate::utils::QuorumcastError::msg("bad thing 42"))
        );
    }
}

//! Helper macros for logging (console printing).

use std::sync::OnceLock;

use env_logger::Env;

/// Global variable holding the process identity string used as logging
/// prefix, e.g. "r3" for a service rank or "cli" for a client.
pub static ME: OnceLock<String> = OnceLock::new();

/// Sets the logging identity of this process if not set yet. Later calls
/// are silently ignored.
pub fn set_me(me: impl ToString) {
    let _ = ME.set(me.to_string());
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => {
        log::trace!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_debug!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => {
        log::debug!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_info!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => {
        log::info!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_warn!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => {
        log::warn!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_error!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => {
        log::error!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log a request-scoped message at the given level, prefixed with the
/// request's ID and opcode.
///
/// Example:
/// ```no_compile
/// rpc_log!(debug, rpc; "sent to {}", uri);
/// ```
#[macro_export]
macro_rules! rpc_log {
    ($level:ident, $rpc:expr; $($fmt_args:tt)*) => {
        log::$level!(
            "({}) rpc {} opc {:#x}: {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            $rpc.id(),
            $rpc.opcode(),
            format!($($fmt_args)*)
        )
    };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Log an error string to logger and then return an `Err` containing a
/// `CartwrightError` with that string. An optional leading `ErrorKind`
/// variant name selects the error kind (default `Generic`).
///
/// Example:
/// ```no_compile
/// let e = logged_err!("got {} to print", msg);
/// let e = logged_err!(Timeout; "rpc {} expired", id);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($kind:ident; $($fmt_args:tt)*) => {
        {
            pf_error!($($fmt_args)*);
            Err($crate::CartwrightError::new(
                $crate::ErrorKind::$kind,
                format!($($fmt_args)*),
            ))
        }
    };

    ($($fmt_args:tt)*) => {
        {
            pf_error!($($fmt_args)*);
            Err($crate::CartwrightError::msg(format!($($fmt_args)*)))
        }
    };
}

//! Crate-internal logging shims.
//!
//! With the `tracing` feature the macros forward to `tracing`; without it the
//! arguments are still type-checked through `format_args!` but nothing is
//! emitted.
#![allow(unused_macros)]

macro_rules! msl_log {
    ($level:ident, $($arg:tt)+) => {{
        #[cfg(feature = "tracing")]
        {
            tracing::$level!(target: "rsmsl", $($arg)+);
        }
        #[cfg(not(feature = "tracing"))]
        {
            if false {
                let _ = format_args!($($arg)+);
            }
        }
    }};
}

macro_rules! trace {
    ($($arg:tt)+) => { msl_log!(trace, $($arg)+) };
}

macro_rules! debug {
    ($($arg:tt)+) => { msl_log!(debug, $($arg)+) };
}

macro_rules! info {
    ($($arg:tt)+) => { msl_log!(info, $($arg)+) };
}

macro_rules! warn {
    ($($arg:tt)+) => { msl_log!(warn, $($arg)+) };
}

macro_rules! error {
    ($($arg:tt)+) => { msl_log!(error, $($arg)+) };
}

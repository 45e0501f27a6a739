//! Level-gated diagnostics
//!
//! Messages go to stderr with a component tag, e.g. `[VM] ...`. The level is
//! checked before the message is formatted.

/// Log a diagnostic line if `$level` is enabled by `$opts.log_level`.
macro_rules! vm_log {
    ($opts:expr, $level:expr, $tag:literal, $($arg:tt)*) => {
        if $opts.log_level.enabled($level) {
            eprintln!(concat!("[", $tag, "] {}"), format_args!($($arg)*));
        }
    };
}

//! Runtime configuration
//!
//! Options are fixed when a `Processor` is created and shared by every
//! coroutine spawned from it.

/// Diagnostic log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Coroutine transitions and bytecode dumps
    Debug,

    /// Tail-call frame reuse and error unwinding
    Verbose,

    /// Failed error decorators
    Notice,

    /// Exceeded limits and cross-thread entry; the default
    Warning,
}

impl LogLevel {
    /// Whether a message at `level` should be emitted under this setting
    pub fn enabled(self, level: LogLevel) -> bool {
        level >= self
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Warning
    }
}

/// Options controlling a script runtime instance
#[derive(Debug, Clone)]
pub struct ScriptOptions {
    /// Tail calls reuse the current frame once both the value stack and the
    /// execution stack are deeper than this. 0 = always, `usize::MAX` = never.
    pub tail_call_threshold: usize,

    /// Detect entry into the runtime from a second OS thread
    pub check_thread_access: bool,

    /// Synchronous calls block on host tasks returned by native callbacks
    pub auto_await: bool,

    /// Hard execution budget shared by the whole coroutine tree
    pub instruction_limit: Option<u64>,

    /// Maximum execution stack depth before "stack overflow" is raised
    pub max_call_depth: usize,

    /// Maximum number of chained `__call` metamethods resolved for one call
    pub max_call_metamethod_depth: usize,

    /// Format error locations as `source:line:` instead of `source:(line,col-col):`
    pub legacy_error_locations: bool,

    /// Diagnostics verbosity
    pub log_level: LogLevel,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        ScriptOptions {
            tail_call_threshold: 65_536,
            check_thread_access: true,
            auto_await: false,
            instruction_limit: None,
            max_call_depth: 200_000,
            max_call_metamethod_depth: 32,
            legacy_error_locations: false,
            log_level: LogLevel::Warning,
        }
    }
}

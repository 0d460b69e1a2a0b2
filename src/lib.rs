#![allow(dead_code)] // temporarily disable dead code lint

pub mod address;
pub mod blockgraph;
pub mod callspec;
pub mod config;
pub mod containers;
pub mod contracts;
pub mod encode;
pub mod error;
pub mod funcdata;
pub mod heritage;
pub mod highvar;
pub mod jumptable;
pub mod lanes;
pub mod op;
pub mod opcode;
pub mod pattern;
pub mod rangemap;
pub mod rewrite;
pub mod symbols;
pub mod tests;
pub mod typeprop;
pub mod varnode;

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    /// Install the process-wide logger backing the `crate::log` macros: compact records on
    /// stderr at the given verbosity (0 = warnings only, 1 = info, 2 = debug, 3 and up =
    /// trace). Until this is called, `slog_scope` discards every record.
    ///
    /// The returned guard keeps the logger installed; dropping it reverts to discarding.
    /// Embedders with their own `slog` hierarchy can skip this and call
    /// `slog_scope::set_global_logger` themselves.
    pub fn init_logging(verbosity: usize) -> slog_scope::GlobalLoggerGuard {
        use sloggers::Build;

        let level = match verbosity {
            0 => sloggers::types::Severity::Warning,
            1 => sloggers::types::Severity::Info,
            2 => sloggers::types::Severity::Debug,
            _ => sloggers::types::Severity::Trace,
        };
        let logger = sloggers::terminal::TerminalLoggerBuilder::new()
            .destination(sloggers::terminal::Destination::Stderr)
            .level(level)
            .overflow_strategy(sloggers::types::OverflowStrategy::Block)
            .format(sloggers::types::Format::Compact)
            .build()
            .unwrap();
        slog_scope::set_global_logger(logger)
    }
}

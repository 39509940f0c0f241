use std::{backtrace::Backtrace, panic};

/// Route panics through `tracing` with their location and a captured backtrace.
///
/// The hook runs on the panicking thread before unwinding, so the log line is emitted
/// inside the request span of the task that panicked.
pub fn install() {
    panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let backtrace = Backtrace::force_capture();

        tracing::error!(
            location = %location,
            panic = %info,
            backtrace = %backtrace,
            "panic"
        );
    }));
}

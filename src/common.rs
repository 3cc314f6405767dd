// Licensed under the Apache-2.0 license

//! Shared driver plumbing: the logger abstraction used by every controller.

/// Sink for driver diagnostics.
///
/// Controllers are generic over a `Logger` so that production builds can plug in
/// a UART or RTT backend while tests and size-constrained images use [`NoOpLogger`].
pub trait Logger {
    fn debug(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Logger that discards everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn debug(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Capacity of the scratch line used by [`i3c_log!`].
pub const LOG_LINE_MAX: usize = 96;

/// Format a message without allocating and hand it to a [`Logger`].
///
/// Output that does not fit in [`LOG_LINE_MAX`] bytes is dropped.
macro_rules! i3c_log {
    ($logger:expr, $level:ident, $($arg:tt)*) => {{
        let mut line: heapless::String<{ $crate::common::LOG_LINE_MAX }> = heapless::String::new();
        let _ = core::fmt::Write::write_fmt(&mut line, format_args!($($arg)*));
        $crate::common::Logger::$level(&mut $logger, line.as_str());
    }};
}

pub(crate) use i3c_log;

//! ---
//! keel_section: "03-persistence-logging"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Structured logging adapters and sinks."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Logging macros that stamp every event with the rebind [`LogContext`](crate::LogContext).

#[doc(hidden)]
#[macro_export]
macro_rules! __keel_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            run = ctx.run.unwrap_or(""),
            mode = ctx.mode.unwrap_or(""),
            iteration = ctx.iteration.unwrap_or_default(),
            phase = ctx.phase.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with rebind context.
#[macro_export]
macro_rules! keel_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__keel_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__keel_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with rebind context.
#[macro_export]
macro_rules! keel_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__keel_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__keel_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with rebind context.
#[macro_export]
macro_rules! keel_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__keel_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__keel_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a trace log enriched with rebind context.
#[macro_export]
macro_rules! keel_trace {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__keel_event!(tracing::Level::TRACE, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__keel_event!(tracing::Level::TRACE, $crate::LogContext::default(), $($arg)+)
    };
}

/// Phase-progress logging: DEBUG on loud iterations, TRACE otherwise.
#[macro_export]
macro_rules! keel_rebinding {
    (loud = $loud:expr, context = $ctx:expr, $($arg:tt)+) => {
        if $loud {
            $crate::keel_debug!(context = $ctx, $($arg)+)
        } else {
            $crate::keel_trace!(context = $ctx, $($arg)+)
        }
    };
}

//! Diagnostic traces for faults nobody classified.
//!
//! A caught panic only carries its payload, so a panic hook records where
//! it happened and the stack at that point. The record lives in a
//! thread-local: `catch_unwind` runs on the thread that panicked.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::error::Error;
use std::fmt::Write;
use std::panic;
use std::sync::Once;

struct PanicSite {
    location: Option<String>,
    backtrace: Backtrace,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

/// Chain a hook that records the panic site in front of the current one.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let site = PanicSite {
                location: info.location().map(|l| l.to_string()),
                backtrace: Backtrace::force_capture(),
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(site));
            previous(info);
        }));
    });
}

/// Trace for an error: its message, every source, and the current stack.
pub fn error_trace(err: &(dyn Error + 'static)) -> String {
    let mut trace = format!("internal error: {}\n", err);
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = writeln!(trace, "caused by: {}", cause);
        source = cause.source();
    }
    let _ = write!(trace, "backtrace:\n{}", Backtrace::force_capture());
    trace
}

/// Trace for a panic caught on this thread, using the site recorded by
/// [`install_panic_hook`] when there is one.
pub fn panic_trace(message: &str) -> String {
    let mut trace = format!("internal error: panic: {}\n", message);
    match LAST_PANIC.with(|slot| slot.borrow_mut().take()) {
        Some(site) => {
            if let Some(location) = site.location {
                let _ = writeln!(trace, "at: {}", location);
            }
            let _ = write!(trace, "backtrace:\n{}", site.backtrace);
        }
        None => trace.push_str("backtrace: unavailable\n"),
    }
    trace
}

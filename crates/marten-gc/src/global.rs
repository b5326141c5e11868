//! Process-wide default collector.
//!
//! A convenience wrapper for hosts that want one collector per thread
//! instead of threading an explicit [`Collector`] value through every
//! call. Each thread owns its own default; nothing is shared.

use std::cell::RefCell;

use crate::collector::Collector;
use crate::config::GcConfig;
use crate::stack::StackBase;

thread_local! {
    static DEFAULT: RefCell<Option<Collector>> = const { RefCell::new(None) };
}

/// Install this thread's default collector, replacing any previous one.
/// The sentinel must come from a frame that outlives every later
/// [`with`] call on this thread.
pub fn start(stack_base: StackBase, config: GcConfig) {
    DEFAULT.with(|slot| {
        *slot.borrow_mut() = Some(Collector::with_config(stack_base, config));
    });
}

/// Run `f` against this thread's default collector. Returns `None` when
/// no default has been started.
///
/// Calls must not nest: the default collector is borrowed for the whole
/// closure, and finalisers must not re-enter it anyway.
pub fn with<R>(f: impl FnOnce(&mut Collector) -> R) -> Option<R> {
    DEFAULT.with(|slot| slot.borrow_mut().as_mut().map(f))
}

/// Final collection and teardown of this thread's default collector.
/// Returns the bytes reclaimed by the final sweep, or 0 when no default
/// was running.
pub fn shutdown() -> usize {
    DEFAULT.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some(gc) => {
                let reclaimed = gc.shutdown();
                *slot = None;
                reclaimed
            }
            None => 0,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_before_start_is_none() {
        assert!(with(|_gc| ()).is_none());
        assert_eq!(shutdown(), 0);
    }

    #[test]
    fn test_start_with_shutdown_cycle() {
        let anchor = 0usize;
        start(
            StackBase::new(&anchor),
            GcConfig {
                scan_stack: false,
                ..GcConfig::default()
            },
        );

        let count = with(|gc| {
            let region = gc.alloc(16).expect("allocation failed");
            gc.make_root(region.as_ptr());
            gc.allocation_count()
        });
        assert_eq!(count, Some(1));

        // The rooted region survives the final sweep; only its metadata
        // goes away.
        assert_eq!(shutdown(), 0);
        assert!(with(|_gc| ()).is_none());
    }
}

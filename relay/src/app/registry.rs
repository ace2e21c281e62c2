// Process-wide set of live apps, the per-thread current app and the default app

use super::{App, AppInner};
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tracing::{debug, warn};

/// Environment variable that turns on default-app tracing at startup
pub const TRACE_APP_ENV: &str = "RELAY_TRACE_APP";

fn active() -> MutexGuard<'static, Vec<Weak<AppInner>>> {
    static ACTIVE: OnceLock<Mutex<Vec<Weak<AppInner>>>> = OnceLock::new();
    ACTIVE
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

static DEFAULT_APP: Mutex<Option<App>> = Mutex::new(None);

thread_local! {
    static CURRENT_APP: RefCell<Option<App>> = const { RefCell::new(None) };
}

/// Track `app` without keeping it alive
pub(crate) fn register(app: &App) {
    let mut active = active();
    active.retain(|entry| entry.strong_count() > 0);
    active.push(app.downgrade());
}

/// Every app that still has a strong holder
pub fn active_apps() -> Vec<App> {
    let mut active = active();
    active.retain(|entry| entry.strong_count() > 0);
    active
        .iter()
        .filter_map(Weak::upgrade)
        .map(App::from_inner)
        .collect()
}

pub(crate) fn set_current_app(app: &App) {
    CURRENT_APP.with(|current| *current.borrow_mut() = Some(app.clone()));
}

/// App explicitly made current on this thread
pub fn thread_current_app() -> Option<App> {
    CURRENT_APP.with(|current| current.borrow().clone())
}

/// Forget this thread's current app
pub fn clear_current_app() -> Option<App> {
    CURRENT_APP.with(|current| current.borrow_mut().take())
}

/// The calling thread's current app, falling back to the process default.
///
/// With tracing enabled every fallback to the default app is logged along
/// with the caller's backtrace.
pub fn current_app() -> App {
    thread_current_app().unwrap_or_else(|| {
        if is_trace_enabled() {
            warn!(
                backtrace = %Backtrace::force_capture(),
                "Using the default app; no app is current on this thread"
            );
        }
        default_app()
    })
}

fn trace_flag() -> &'static AtomicBool {
    static TRACE: OnceLock<AtomicBool> = OnceLock::new();
    TRACE.get_or_init(|| AtomicBool::new(std::env::var_os(TRACE_APP_ENV).is_some()))
}

/// Log every fallback to the default app
pub fn enable_trace() {
    trace_flag().store(true, Ordering::Release);
}

pub fn disable_trace() {
    trace_flag().store(false, Ordering::Release);
}

pub fn is_trace_enabled() -> bool {
    trace_flag().load(Ordering::Acquire)
}

/// The process default app, built on first use
pub fn default_app() -> App {
    let mut slot = DEFAULT_APP.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(app) = slot.as_ref() {
        return app.clone();
    }
    let app = App::builder().main("default").set_as_current(false).build();
    debug!(app = %app.name(), "Created default app");
    *slot = Some(app.clone());
    app
}

/// Replace the process default app
pub fn set_default_app(app: &App) {
    *DEFAULT_APP.lock().unwrap_or_else(PoisonError::into_inner) = Some(app.clone());
}

/// Run fork cleanup on every active app
pub fn after_fork_all() {
    for app in active_apps() {
        app.after_fork();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_app(main: &str) -> App {
        App::builder()
            .main(main)
            .set_as_current(false)
            .read_env(false)
            .build()
    }

    #[test]
    fn test_enable_disable_trace() {
        enable_trace();
        assert!(is_trace_enabled());
        let fallback = std::thread::spawn(|| current_app().id()).join().unwrap();
        assert!(active_apps().iter().any(|a| a.id() == fallback));

        disable_trace();
        assert!(!is_trace_enabled());
    }

    #[test]
    fn test_active_set_prunes_dropped_apps() {
        let app = quiet_app("registry_prune");
        let id = app.id();
        assert!(active_apps().iter().any(|a| a.id() == id));

        drop(app);
        assert!(!active_apps().iter().any(|a| a.id() == id));
    }

    #[test]
    fn test_registry_does_not_keep_apps_alive() {
        let app = quiet_app("registry_weak");
        let weak = app.downgrade();
        drop(app);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_current_app_is_thread_local() {
        let app = quiet_app("registry_thread");
        app.set_current();
        assert_eq!(thread_current_app().as_ref(), Some(&app));
        assert_eq!(current_app(), app);

        let id = app.id();
        let other_thread = std::thread::spawn(move || {
            (
                thread_current_app().map(|a| a.id()),
                current_app().id(),
            )
        })
        .join()
        .unwrap();
        assert_eq!(other_thread.0, None);
        assert_ne!(other_thread.1, id);

        assert_eq!(clear_current_app(), Some(app));
        assert!(thread_current_app().is_none());
    }

    #[test]
    fn test_default_app_fallback() {
        let handle = std::thread::spawn(|| {
            let fallback = current_app();
            let listed = active_apps().contains(&fallback);
            (listed, thread_current_app().is_none())
        });
        assert_eq!(handle.join().unwrap(), (true, true));
    }

    #[test]
    fn test_set_default_app() {
        let previous = default_app();
        let replacement = quiet_app("registry_default");
        set_default_app(&replacement);
        assert_eq!(default_app(), replacement);
        set_default_app(&previous);
        assert_eq!(default_app(), previous);
    }

    #[test]
    fn test_after_fork_all_resets_pools() {
        let app = App::builder()
            .broker("memory://")
            .set_as_current(false)
            .build();
        let pool = app.pool().unwrap();
        after_fork_all();
        assert!(!std::sync::Arc::ptr_eq(&pool, &app.pool().unwrap()));
    }
}

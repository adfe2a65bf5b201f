//! Transaction-aware deferral of invalidation.
//!
//! Each thread keeps, per connection alias, a stack of frames mirroring the
//! host's nested transactions and savepoints. Invalidation callbacks queued
//! inside a transaction run only once the outermost frame commits, after the
//! database commit itself has returned. A frame that saw a mutating statement
//! is dirty; cache writes are skipped while any frame on the connection is
//! dirty, since the values computed there may never become visible.

use std::cell::RefCell;
use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::CacheResult;

static MUTATING_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(INSERT|UPDATE|DELETE)\b").expect("Invalid mutating statement regex")
});

/// Deferred invalidation step.
pub type Callback = Box<dyn FnOnce() -> CacheResult<()>>;

#[derive(Default)]
struct Frame {
    callbacks: Vec<Callback>,
    dirty: bool,
}

thread_local! {
    static FRAMES: RefCell<HashMap<String, Vec<Frame>>> = RefCell::new(HashMap::new());
}

fn with_frames<T>(f: impl FnOnce(&mut HashMap<String, Vec<Frame>>) -> T) -> T {
    FRAMES.with(|frames| f(&mut frames.borrow_mut()))
}

/// Opens a transaction (or savepoint) frame on `db`.
pub fn enter(db: &str) {
    with_frames(|frames| frames.entry(db.to_string()).or_default().push(Frame::default()));
}

/// Closes the innermost frame on `db` successfully.
///
/// A nested frame hands its callbacks and dirty flag to its parent. Closing
/// the outermost frame runs every queued callback in enqueue order; all of
/// them run even if one fails, and the first error is returned.
pub fn commit(db: &str) -> CacheResult<()> {
    let callbacks = with_frames(|frames| {
        let stack = frames.get_mut(db)?;
        let frame = stack.pop()?;
        match stack.last_mut() {
            Some(parent) => {
                parent.callbacks.extend(frame.callbacks);
                parent.dirty |= frame.dirty;
                None
            }
            None => {
                frames.remove(db);
                Some(frame.callbacks)
            }
        }
    });

    let Some(callbacks) = callbacks else {
        return Ok(());
    };

    debug!(db, callbacks = callbacks.len(), "Running deferred invalidations");
    let mut first_error = None;
    for callback in callbacks {
        if let Err(err) = callback() {
            warn!(db, error = %err, "Deferred invalidation failed");
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Discards the innermost frame on `db` together with its callbacks.
pub fn rollback(db: &str) {
    with_frames(|frames| {
        if let Some(stack) = frames.get_mut(db) {
            stack.pop();
            if stack.is_empty() {
                frames.remove(db);
            }
        }
    });
}

/// Enters a frame that rolls back on drop unless committed.
#[must_use = "the frame is rolled back as soon as the guard is dropped"]
pub fn atomic(db: &str) -> AtomicGuard {
    enter(db);
    AtomicGuard {
        db: db.to_string(),
        finished: false,
    }
}

/// RAII handle for a frame opened with [`atomic`].
pub struct AtomicGuard {
    db: String,
    finished: bool,
}

impl AtomicGuard {
    pub fn commit(mut self) -> CacheResult<()> {
        self.finished = true;
        commit(&self.db)
    }

    pub fn rollback(mut self) {
        self.finished = true;
        rollback(&self.db);
    }
}

impl Drop for AtomicGuard {
    fn drop(&mut self) {
        if !self.finished {
            rollback(&self.db);
        }
    }
}

/// Marks the innermost frame on `db` dirty. No-op outside a transaction.
pub fn mark_dirty(db: &str) {
    with_frames(|frames| {
        if let Some(frame) = frames.get_mut(db).and_then(|stack| stack.last_mut()) {
            frame.dirty = true;
        }
    });
}

/// Inspects a statement executed on `db` and marks the frame dirty when it
/// mutates data.
pub fn observe_statement(db: &str, sql: &str) {
    if in_transaction(db) && MUTATING_STATEMENT.is_match(sql) {
        mark_dirty(db);
    }
}

/// Runs `callback` now outside a transaction; otherwise queues it on the
/// innermost frame and returns immediately.
pub fn queue_or_run(db: &str, callback: Callback) -> CacheResult<()> {
    let pending = with_frames(|frames| match frames.get_mut(db).and_then(|s| s.last_mut()) {
        Some(frame) => {
            frame.callbacks.push(callback);
            None
        }
        None => Some(callback),
    });

    match pending {
        Some(callback) => callback(),
        None => Ok(()),
    }
}

/// True when any frame on any of `dbs` is dirty.
pub fn is_dirty<S: AsRef<str>>(dbs: &[S]) -> bool {
    with_frames(|frames| {
        dbs.iter().any(|db| {
            frames
                .get(db.as_ref())
                .is_some_and(|stack| stack.iter().any(|frame| frame.dirty))
        })
    })
}

pub fn in_transaction(db: &str) -> bool {
    with_frames(|frames| frames.get(db).is_some_and(|stack| !stack.is_empty()))
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::error::CacheError;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let log = Rc::clone(&log);
            move |name: &'static str| -> Callback {
                let log = Rc::clone(&log);
                Box::new(move || {
                    log.borrow_mut().push(name);
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[test]
    fn runs_immediately_outside_transaction() {
        let (log, make) = recorder();
        queue_or_run("default", make("now")).unwrap();
        assert_eq!(*log.borrow(), vec!["now"]);
    }

    #[test]
    fn outer_commit_runs_callbacks_in_order() {
        let (log, make) = recorder();
        let outer = atomic("default");
        queue_or_run("default", make("a")).unwrap();
        {
            let inner = atomic("default");
            queue_or_run("default", make("b")).unwrap();
            inner.commit().unwrap();
        }
        queue_or_run("default", make("c")).unwrap();
        assert!(log.borrow().is_empty());

        outer.commit().unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert!(!in_transaction("default"));
    }

    #[test]
    fn rolled_back_savepoint_discards_its_callbacks() {
        let (log, make) = recorder();
        let outer = atomic("default");
        queue_or_run("default", make("kept")).unwrap();
        {
            let _inner = atomic("default");
            queue_or_run("default", make("dropped")).unwrap();
        }
        outer.commit().unwrap();
        assert_eq!(*log.borrow(), vec!["kept"]);
    }

    #[test]
    fn frames_are_per_connection() {
        let (log, make) = recorder();
        let _tx = atomic("primary");
        queue_or_run("replica", make("replica")).unwrap();
        assert_eq!(*log.borrow(), vec!["replica"]);
    }

    #[test]
    fn mutating_statements_mark_frames_dirty() {
        observe_statement("default", "INSERT INTO t VALUES (1)");
        assert!(!is_dirty(&["default"]));

        let tx = atomic("default");
        observe_statement("default", "SELECT updated_at FROM t");
        assert!(!is_dirty(&["default"]));
        observe_statement("default", "update t set a = 1");
        assert!(is_dirty(&["default"]));
        assert!(!is_dirty(&["other"]));
        tx.rollback();
        assert!(!is_dirty(&["default"]));
    }

    #[test]
    fn dirty_flag_propagates_to_parent() {
        let outer = atomic("default");
        {
            let inner = atomic("default");
            mark_dirty("default");
            inner.commit().unwrap();
        }
        assert!(is_dirty(&["default"]));
        outer.commit().unwrap();
        assert!(!is_dirty(&["default"]));
    }

    #[test]
    fn commit_reports_first_error_after_running_all() {
        let (log, make) = recorder();
        let tx = atomic("default");
        queue_or_run("default", Box::new(|| Err(CacheError::configuration("boom")))).unwrap();
        queue_or_run("default", make("after")).unwrap();

        let err = tx.commit().expect_err("first callback fails");
        assert!(matches!(err, CacheError::Configuration { .. }));
        assert_eq!(*log.borrow(), vec!["after"]);
    }
}

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::value::Value;

use super::{Context, VmFault, VmResult};

/// A spawned execution context. Clones refer to the same thread.
#[derive(Clone)]
pub struct ThreadHandle(Arc<ThreadSlot>);

struct ThreadSlot {
    name: String,
    state: Mutex<ThreadState>,
}

enum ThreadState {
    /// Deferred: waits for `RUN_THREAD`.
    Pending(Box<Context>),
    Running(JoinHandle<VmResult<Value>>),
    /// Joined, or discarded without ever running.
    Joined,
}

impl ThreadHandle {
    pub(crate) fn deferred(name: &str, context: Context, threads: &Threads) -> Self {
        let slot = Arc::new(ThreadSlot {
            name: name.to_string(),
            state: Mutex::new(ThreadState::Pending(Box::new(context))),
        });
        threads.track(&slot);
        ThreadHandle(slot)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// True until something has started the thread.
    pub fn is_pending(&self) -> bool {
        matches!(*self.0.state.lock(), ThreadState::Pending(_))
    }

    /// Move the context onto its own platform thread. No-op once started.
    pub(crate) fn start(&self, threads: &Threads) -> VmResult<()> {
        launch(&self.0.name, &mut self.0.state.lock(), threads)
    }

    /// Start the thread if it is still deferred, then block until it finishes.
    ///
    /// A fault inside the thread comes back unchanged. A handle can be joined once.
    pub(crate) fn join(&self, threads: &Threads) -> VmResult<Value> {
        let name = &self.0.name;
        let state = {
            let mut state = self.0.state.lock();
            launch(name, &mut state, threads)?;
            if matches!(&*state, ThreadState::Running(h) if h.thread().id() == thread::current().id()) {
                return Err(VmFault::ThreadJoin { name: name.clone(), reason: "thread joins itself".into() });
            }
            std::mem::replace(&mut *state, ThreadState::Joined)
        };
        match state {
            ThreadState::Running(handle) => {
                debug!(thread = %name, "joining thread");
                handle.join().unwrap_or_else(|panic| {
                    Err(VmFault::ThreadJoin { name: name.clone(), reason: panic_message(panic.as_ref()) })
                })
            }
            ThreadState::Joined => Err(VmFault::ThreadJoin { name: name.clone(), reason: "already joined".into() }),
            ThreadState::Pending(_) => unreachable!("pending thread was started above"),
        }
    }
}

fn launch(name: &str, state: &mut ThreadState, threads: &Threads) -> VmResult<()> {
    let ThreadState::Pending(_) = state else {
        return Ok(());
    };
    let ThreadState::Pending(mut context) = std::mem::replace(state, ThreadState::Joined) else {
        unreachable!("checked above");
    };
    let label = name.to_string();
    let live = threads.enter();
    let handle = thread::Builder::new()
        .name(format!("xtella-{name}"))
        .spawn(move || {
            let _live = live;
            let result = context.run();
            if let Err(fault) = &result {
                warn!(thread = %label, %fault, "thread faulted");
            }
            result
        })
        .map_err(|e| VmFault::ThreadJoin { name: name.to_string(), reason: format!("could not start: {e}") })?;
    debug!(thread = %name, "thread started");
    *state = ThreadState::Running(handle);
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// The threads of one VM: how many are running, and every handle spawned.
#[derive(Clone, Default)]
pub(crate) struct Threads(Arc<Registry>);

#[derive(Default)]
struct Registry {
    running: Mutex<usize>,
    idle: Condvar,
    spawned: Mutex<Vec<Weak<ThreadSlot>>>,
}

impl Threads {
    fn track(&self, slot: &Arc<ThreadSlot>) {
        let mut spawned = self.0.spawned.lock();
        spawned.retain(|s| s.strong_count() > 0);
        spawned.push(Arc::downgrade(slot));
    }

    fn enter(&self) -> Live {
        *self.0.running.lock() += 1;
        Live(self.clone())
    }

    /// Block until every started thread has finished, including threads
    /// started by other threads meanwhile.
    pub(crate) fn wait_idle(&self) {
        let mut running = self.0.running.lock();
        while *running > 0 {
            debug!(running = *running, "waiting for threads");
            self.0.idle.wait(&mut running);
        }
    }

    /// Drop the contexts of deferred threads that never ran. Their context
    /// holds the globals, which hold the handle.
    pub(crate) fn discard_pending(&self) {
        let slots: Vec<Arc<ThreadSlot>> = self.0.spawned.lock().drain(..).filter_map(|s| s.upgrade()).collect();
        for slot in slots {
            let mut state = slot.state.lock();
            if let ThreadState::Pending(_) = *state {
                debug!(thread = %slot.name, "discarding thread that never ran");
                let context = std::mem::replace(&mut *state, ThreadState::Joined);
                drop(state);
                drop(context);
            }
        }
    }
}

/// Held by a running thread; the count drops when it ends, fault or not.
struct Live(Threads);

impl Drop for Live {
    fn drop(&mut self) {
        let registry = &self.0.0;
        let mut running = registry.running.lock();
        *running -= 1;
        if *running == 0 {
            registry.idle.notify_all();
        }
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.0.state.lock() {
            ThreadState::Pending(_) => "pending",
            ThreadState::Running(_) => "running",
            ThreadState::Joined => "joined",
        };
        f.debug_struct("ThreadHandle").field("name", &self.0.name).field("state", &state).finish()
    }
}

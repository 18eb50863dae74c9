//! Worker pool and completion handles
//!
//! Operations run on a shared worker pool and complete into a [`Pending`]
//! handle. A caller either blocks on the handle or registers a
//! continuation, which runs on the completing worker or is marshalled onto
//! a [`SerialExecutor`] for host environments whose follow-up work must
//! not run concurrently with other mutations.

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

static POOL: Lazy<rayon::ThreadPool> = Lazy::new(|| {
    rayon::ThreadPoolBuilder::new()
        .thread_name(|i| format!("tierdb-worker-{i}"))
        .build()
        .expect("worker pool construction cannot fail with default settings")
});

/// Run `f` on the shared worker pool, returning its completion handle
pub fn spawn_op<T, F>(f: F) -> Pending<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (pending, completer) = Pending::pair();
    POOL.spawn(move || completer.complete(f()));
    pending
}

enum State<T> {
    Waiting,
    Value(T),
    Continuation(Box<dyn FnOnce(T) + Send>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cv: Condvar,
}

/// The consumer side of an in-flight operation.
///
/// Exactly one consumer: waiting or attaching a continuation consumes the
/// handle. Dropping the handle detaches it; the operation still runs to
/// completion.
pub struct Pending<T> {
    inner: Arc<Inner<T>>,
}

/// The producer side: completes the paired [`Pending`] exactly once
pub struct Completer<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Pending<T> {
    /// A fresh handle and its completer
    pub fn pair() -> (Pending<T>, Completer<T>) {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Waiting),
            cv: Condvar::new(),
        });
        (
            Pending {
                inner: Arc::clone(&inner),
            },
            Completer { inner },
        )
    }

    /// A handle that is already complete
    pub fn ready(value: T) -> Pending<T> {
        let (pending, completer) = Pending::pair();
        completer.complete(value);
        pending
    }

    /// Block until the operation completes
    pub fn wait(self) -> T {
        let mut state = self.inner.state.lock();
        loop {
            if let State::Value(_) = *state {
                match std::mem::replace(&mut *state, State::Waiting) {
                    State::Value(v) => return v,
                    _ => unreachable!(),
                }
            }
            self.inner.cv.wait(&mut state);
        }
    }

    /// Block up to `timeout`; `None` if the operation is still in flight.
    /// The operation keeps running detached after a timeout.
    pub fn wait_timeout(self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Value(_) = *state {
                match std::mem::replace(&mut *state, State::Waiting) {
                    State::Value(v) => return Some(v),
                    _ => unreachable!(),
                }
            }
            if self.inner.cv.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Run `f` with the result: inline if already complete, otherwise on
    /// the worker that completes the operation
    pub fn then<F>(self, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match std::mem::replace(&mut *state, State::Continuation(Box::new(f))) {
            State::Value(v) => {
                let cont = match std::mem::replace(&mut *state, State::Waiting) {
                    State::Continuation(cont) => cont,
                    _ => unreachable!(),
                };
                drop(state);
                cont(v);
            }
            State::Waiting => {}
            State::Continuation(_) => unreachable!("handle consumed twice"),
        }
    }

    /// Run `f` with the result on `executor`'s single thread
    pub fn then_serial<F>(self, executor: &SerialExecutor, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let submit = executor.submitter();
        self.then(move |value| submit(Box::new(move || f(value))));
    }
}

impl<T: Send + 'static> Completer<T> {
    /// Deliver the result, waking the waiter or firing the continuation
    pub fn complete(self, value: T) {
        let mut state = self.inner.state.lock();
        match std::mem::replace(&mut *state, State::Value(value)) {
            State::Continuation(cont) => {
                let value = match std::mem::replace(&mut *state, State::Waiting) {
                    State::Value(v) => v,
                    _ => unreachable!(),
                };
                drop(state);
                cont(value);
            }
            State::Waiting => {
                self.inner.cv.notify_all();
            }
            State::Value(_) => unreachable!("completed twice"),
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// One dedicated thread running submitted jobs strictly in order
pub struct SerialExecutor {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Default for SerialExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialExecutor {
    /// Spawn the executor thread
    pub fn new() -> Self {
        let (tx, rx) = channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("tierdb-serial".to_string())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("serial executor thread spawn");
        SerialExecutor {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue `f` behind every previously submitted job
    pub fn submit<F: FnOnce() + Send + 'static>(&self, f: F) {
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(f)).is_err() {
                warn!("serial executor is shut down; dropping job");
            }
        }
    }

    fn submitter(&self) -> impl Fn(Job) + Send + 'static {
        let tx = self.tx.clone();
        move |job| {
            if let Some(tx) = &tx {
                if tx.send(job).is_err() {
                    warn!("serial executor is shut down; dropping job");
                }
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain and exit
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

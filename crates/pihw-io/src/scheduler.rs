//! Single-thread polling/command scheduler
//!
//! Every transport owns one [`Scheduler`]. Its worker thread owns the
//! transport context `C` outright and is the only code that touches the
//! hardware. Other threads interact through a cloneable
//! [`SchedulerHandle`]: they register periodic polls, enqueue one-shot
//! commands and stop the worker.
//!
//! # Loop
//!
//! Each iteration the worker, in this order:
//!
//! 1. lets the context drain incoming link data ([`WorkerContext::service_incoming`])
//! 2. runs exactly one queued command, if any
//! 3. otherwise runs the earliest poll whose due time has arrived and
//!    reschedules it one period later
//! 4. otherwise idles until the next poll is due, new work arrives, or the
//!    context's link becomes readable ([`WorkerContext::idle`])
//!
//! The queue mutex is held only while the queues are restructured, never
//! while a command or poll runs.
//!
//! # Example
//!
//! ```rust
//! use pihw_io::scheduler::{Scheduler, WorkerContext};
//!
//! struct Counter(u32);
//! impl WorkerContext for Counter {}
//!
//! let scheduler = Scheduler::spawn("example", Counter(0)).unwrap();
//! let handle = scheduler.handle();
//! handle.enqueue(|ctx: &mut Counter| ctx.0 += 1);
//! assert!(handle.sync());
//! scheduler.stop();
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

/// Deferred unit of work executed on the worker
pub type Command<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Out-of-band wake used when the worker idles on something other than
/// the scheduler's own condition variable
pub type WakeHook = Arc<dyn Fn() + Send + Sync>;

/// Something polled periodically on the worker thread
pub trait Pollable<C>: Send + Sync {
    fn poll(&self, ctx: &mut C);
}

/// Per-transport state driven by a scheduler
///
/// All hooks run on the worker thread.
pub trait WorkerContext: Sized + Send + 'static {
    /// Called once before the first iteration
    fn start(&mut self, _handle: &SchedulerHandle<Self>) {}

    /// Drain pending incoming data; return `true` if anything was handled
    fn service_incoming(&mut self, _handle: &SchedulerHandle<Self>) -> bool {
        false
    }

    /// Nothing to do until `deadline` (or ever, for `None`)
    fn idle(&mut self, handle: &SchedulerHandle<Self>, deadline: Option<Instant>) {
        handle.wait_for_work(deadline);
    }

    /// Called once after the loop exits
    fn finish(&mut self) {}
}

/// Identifies a registered poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PollToken(u64);

struct PollEntry<C> {
    token: PollToken,
    period: Duration,
    pollable: Arc<dyn Pollable<C>>,
}

struct Queues<C> {
    commands: VecDeque<Command<C>>,
    /// Keyed by due time, then registration order for stable ties
    polls: BTreeMap<(Instant, u64), PollEntry<C>>,
    keys: HashMap<PollToken, (Instant, u64)>,
    running: Option<PollToken>,
    running_cancelled: bool,
    next_order: u64,
    next_token: u64,
}

impl<C> Queues<C> {
    fn head_due(&self, now: Instant) -> bool {
        self.polls
            .keys()
            .next()
            .is_some_and(|(due, _)| *due <= now)
    }

    fn insert_poll(&mut self, due: Instant, entry: PollEntry<C>) {
        let key = (due, self.next_order);
        self.next_order += 1;
        self.keys.insert(entry.token, key);
        self.polls.insert(key, entry);
    }
}

struct Shared<C> {
    name: String,
    queues: Mutex<Queues<C>>,
    work: Condvar,
    settled: Condvar,
    stopping: AtomicBool,
    waker: Mutex<Option<WakeHook>>,
    worker: Mutex<Option<ThreadId>>,
}

enum Job<C> {
    Command(Command<C>),
    Poll(Instant, PollEntry<C>),
    Idle(Option<Instant>),
}

/// Cloneable access to a running scheduler
pub struct SchedulerHandle<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for SchedulerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: WorkerContext> SchedulerHandle<C> {
    fn new(name: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                queues: Mutex::new(Queues {
                    commands: VecDeque::new(),
                    polls: BTreeMap::new(),
                    keys: HashMap::new(),
                    running: None,
                    running_cancelled: false,
                    next_order: 0,
                    next_token: 1,
                }),
                work: Condvar::new(),
                settled: Condvar::new(),
                stopping: AtomicBool::new(false),
                waker: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Register `pollable` to run `frequency_hz` times per second, first
    /// due immediately
    pub fn register_poll(
        &self,
        pollable: Arc<dyn Pollable<C>>,
        frequency_hz: u32,
    ) -> Result<PollToken, ConfigError> {
        if frequency_hz == 0 {
            return Err(ConfigError::ZeroFrequency(self.shared.name.clone()));
        }
        let period = Duration::from_nanos(1_000_000_000 / u64::from(frequency_hz));

        let token = {
            let mut queues = self.shared.queues.lock();
            let token = PollToken(queues.next_token);
            queues.next_token += 1;
            queues.insert_poll(
                Instant::now(),
                PollEntry {
                    token,
                    period,
                    pollable,
                },
            );
            token
        };

        debug!(
            target: "pihw::scheduler",
            "{}: poll {:?} registered at {} Hz",
            self.shared.name, token, frequency_hz
        );
        self.notify();
        Ok(token)
    }

    /// Remove a poll. Unknown tokens are ignored.
    ///
    /// If the poll is executing right now on the worker, this waits for it
    /// to finish (unless called from the worker itself), so no poll for
    /// `token` starts after this returns.
    pub fn unregister_poll(&self, token: PollToken) -> bool {
        let mut queues = self.shared.queues.lock();
        let mut found = false;

        if let Some(key) = queues.keys.remove(&token) {
            queues.polls.remove(&key);
            found = true;
        }

        if queues.running == Some(token) {
            queues.running_cancelled = true;
            found = true;
            if !self.is_worker_thread() {
                while queues.running == Some(token) {
                    self.shared.settled.wait(&mut queues);
                }
            }
        }

        if found {
            debug!(target: "pihw::scheduler", "{}: poll {:?} removed", self.shared.name, token);
        }
        found
    }

    /// Append a command to the FIFO
    ///
    /// Commands enqueued after [`Scheduler::stop`] are dropped unexecuted.
    pub fn enqueue<F>(&self, command: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        {
            let mut queues = self.shared.queues.lock();
            if self.is_stopping() {
                return;
            }
            queues.commands.push_back(Box::new(command));
        }
        self.notify();
    }

    /// Wait until every command enqueued before this call has run
    ///
    /// Returns `false` if the worker stopped first. Must not be called from
    /// the worker thread.
    pub fn sync(&self) -> bool {
        if self.is_worker_thread() {
            warn!(target: "pihw::scheduler", "{}: sync called on worker", self.shared.name);
            return false;
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.enqueue(move |_| {
            let _ = tx.send(());
        });
        rx.recv().is_ok()
    }

    /// Number of commands waiting to run
    pub fn pending_commands(&self) -> usize {
        self.shared.queues.lock().commands.len()
    }

    /// Number of registered polls
    pub fn poll_count(&self) -> usize {
        let queues = self.shared.queues.lock();
        queues.keys.len() + usize::from(queues.running.is_some() && !queues.running_cancelled)
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Whether the caller is this scheduler's worker
    pub fn is_worker_thread(&self) -> bool {
        *self.shared.worker.lock() == Some(thread::current().id())
    }

    /// Install the hook called whenever the worker must wake up
    pub fn set_wake_hook(&self, hook: Option<WakeHook>) {
        *self.shared.waker.lock() = hook;
    }

    /// Whether a command or a due poll is waiting
    pub fn has_work(&self) -> bool {
        let queues = self.shared.queues.lock();
        !queues.commands.is_empty() || queues.head_due(Instant::now())
    }

    /// Block until new work, stop, or `deadline`
    pub fn wait_for_work(&self, deadline: Option<Instant>) {
        let mut queues = self.shared.queues.lock();
        loop {
            let now = Instant::now();
            if self.is_stopping() || !queues.commands.is_empty() || queues.head_due(now) {
                return;
            }
            // Wake for the head too, it may have been registered after the
            // deadline was computed
            let head = queues.polls.keys().next().map(|(due, _)| *due);
            let until = match (deadline, head) {
                (Some(d), Some(h)) => Some(d.min(h)),
                (d, h) => d.or(h),
            };
            match until {
                Some(until) => {
                    if now >= until {
                        return;
                    }
                    self.shared.work.wait_until(&mut queues, until);
                }
                None => self.shared.work.wait(&mut queues),
            }
        }
    }

    /// Sleep for `duration`, returning early (with `false`) on stop
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut queues = self.shared.queues.lock();
        while !self.is_stopping() && Instant::now() < deadline {
            self.shared.work.wait_until(&mut queues, deadline);
        }
        !self.is_stopping()
    }

    fn notify(&self) {
        self.shared.work.notify_all();
        let hook = self.shared.waker.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn request_stop(&self) {
        {
            let _queues = self.shared.queues.lock();
            self.shared.stopping.store(true, Ordering::Release);
        }
        self.notify();
    }

    fn next_job(&self) -> Job<C> {
        let mut queues = self.shared.queues.lock();
        if let Some(command) = queues.commands.pop_front() {
            return Job::Command(command);
        }

        let now = Instant::now();
        let head = queues.polls.keys().next().copied();
        match head {
            Some(key) if key.0 <= now => {
                let Some(entry) = queues.polls.remove(&key) else {
                    return Job::Idle(None);
                };
                queues.keys.remove(&entry.token);
                queues.running = Some(entry.token);
                queues.running_cancelled = false;
                Job::Poll(key.0, entry)
            }
            Some(key) => Job::Idle(Some(key.0)),
            None => Job::Idle(None),
        }
    }

    fn finish_poll(&self, due: Instant, entry: PollEntry<C>) {
        let mut queues = self.shared.queues.lock();
        queues.running = None;
        if !queues.running_cancelled {
            let now = Instant::now();
            let next = (due + entry.period).max(now);
            queues.insert_poll(next, entry);
        }
        queues.running_cancelled = false;
        self.shared.settled.notify_all();
    }

    fn run(&self, mut ctx: C) {
        *self.shared.worker.lock() = Some(thread::current().id());
        info!(target: "pihw::scheduler", "{}: worker started", self.shared.name);

        ctx.start(self);
        while !self.is_stopping() {
            if ctx.service_incoming(self) {
                continue;
            }
            if self.is_stopping() {
                break;
            }

            match self.next_job() {
                Job::Command(command) => command(&mut ctx),
                Job::Poll(due, entry) => {
                    entry.pollable.poll(&mut ctx);
                    self.finish_poll(due, entry);
                }
                Job::Idle(deadline) => ctx.idle(self, deadline),
            }
        }
        ctx.finish();

        let dropped = std::mem::take(&mut self.shared.queues.lock().commands);
        if !dropped.is_empty() {
            debug!(
                target: "pihw::scheduler",
                "{}: dropping {} queued commands",
                self.shared.name,
                dropped.len()
            );
        }
        drop(dropped);
        info!(target: "pihw::scheduler", "{}: worker stopped", self.shared.name);
    }
}

/// Owner of a transport worker thread
pub struct Scheduler<C: WorkerContext> {
    handle: SchedulerHandle<C>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<C: WorkerContext> Scheduler<C> {
    /// Spawn the worker thread, moving `ctx` onto it
    pub fn spawn(name: &str, ctx: C) -> io::Result<Self> {
        let handle = SchedulerHandle::new(name);
        let worker = handle.clone();
        let thread = thread::Builder::new()
            .name(format!("pihw-{}", name))
            .spawn(move || worker.run(ctx))?;

        Ok(Self {
            handle,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> SchedulerHandle<C> {
        self.handle.clone()
    }

    /// Stop the worker and wait for it to exit
    ///
    /// A running command or poll finishes first. Calling this from the
    /// worker itself only requests the stop. Idempotent.
    pub fn stop(&self) {
        self.handle.request_stop();

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!(target: "pihw::scheduler", "{}: worker panicked", self.handle.name());
            }
        }
    }
}

impl<C: WorkerContext> std::ops::Deref for Scheduler<C> {
    type Target = SchedulerHandle<C>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<C: WorkerContext> Drop for Scheduler<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

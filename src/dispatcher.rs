//! Single-threaded readiness + timer event loop (§4.5, §9 "Timers", §9 "Cross-thread
//! wakeup").
//!
//! All peer state mutations, socket I/O, and registry updates happen on this one
//! thread. Producer threads (service discovery) never touch that state directly;
//! they hand a [`Task`] to [`Dispatcher::task_sender`] and the dispatcher's
//! [`mio::Waker`] pokes the poll loop awake to run it.
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{error, warn};
use mio::{Events, Poll, Token};

const WAKE_TOKEN: Token = Token(usize::MAX);

pub type TimerId = u64;

/// A unit of work enqueued from another thread, run on the dispatcher thread
/// against the shared handler state (§6 "Discovery input"). Takes `&mut Timers`
/// too, since a task (e.g. a discovery-triggered invite) may need to arm one.
pub type Task<H> = Box<dyn FnOnce(&mut H, &mut Timers) + Send>;

/// Domain logic the dispatcher drives. Implemented once, by whatever owns the
/// endpoint's sockets and the local sequencer handle; the dispatcher itself knows
/// nothing about MIDI, peers, or the registry. `timers` lets a callback schedule
/// or cancel further timers of its own (e.g. an invite retry) in reaction to the
/// event it was just given.
pub trait EventHandler {
    fn on_ready(&mut self, token: Token, timers: &mut Timers);
    fn on_timer(&mut self, id: TimerId, timers: &mut Timers);
}

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
}

/// The min-by-scan timer list (§9: "a linear scan is acceptable at the expected
/// scale (<100 peers)"). A side index would buy O(log n) removal; at this scale
/// it is not worth the bookkeeping.
#[derive(Default)]
pub struct Timers {
    entries: Vec<TimerEntry>,
    next_id: TimerId,
}

impl Timers {
    /// Schedules a timer to fire no earlier than `delay` from now. Returns the id
    /// so the caller can cancel it with [`Timers::cancel`].
    pub fn call_later(&mut self, delay: Duration) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(TimerEntry { deadline: Instant::now() + delay, id });
        id
    }

    /// Removing a non-existent id is a no-op (§4.5).
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.retain(|t| t.id != id);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|t| t.deadline).min()
    }

    /// Removes and returns every timer whose deadline has passed, in deadline order.
    fn take_expired(&mut self) -> Vec<TimerId> {
        let now = Instant::now();
        let mut due = Vec::new();
        self.entries.retain(|t| {
            if t.deadline <= now {
                due.push((t.deadline, t.id));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, id)| id).collect()
    }
}

/// The event loop itself: readiness polling, the timer list, and the
/// cross-thread task queue.
pub struct Dispatcher<H: EventHandler> {
    poll: Poll,
    events: Events,
    handler: H,
    timers: Timers,
    waker: std::sync::Arc<mio::Waker>,
    task_rx: Receiver<Task<H>>,
    task_tx: Sender<Task<H>>,
    next_token: usize,
}

impl<H: EventHandler> Dispatcher<H> {
    pub fn new(handler: H) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = std::sync::Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (task_tx, task_rx) = unbounded();
        Ok(Dispatcher {
            poll,
            events: Events::with_capacity(128),
            handler,
            timers: Timers::default(),
            waker,
            task_rx,
            task_tx,
            next_token: 0,
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }

    /// Allocates a fresh registration token for a caller-owned `mio` source.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// An owned, independent handle to the poll registry, for registering
    /// sources that are constructed after the dispatcher already owns the
    /// handler (e.g. from outside, before the loop starts).
    pub fn registry_handle(&self) -> std::io::Result<mio::Registry> {
        self.poll.registry().try_clone()
    }

    /// Runs `f` against the handler and the timer list together, the same
    /// split-borrow the dispatcher uses internally for callback/timer dispatch.
    /// Lets callers outside the loop (startup auto-connects, tests) drive the
    /// handler through calls that need to arm or cancel a timer.
    pub fn with_handler<R>(&mut self, f: impl FnOnce(&mut H, &mut Timers) -> R) -> R {
        f(&mut self.handler, &mut self.timers)
    }

    /// A clonable handle producer threads use to hand work to the dispatcher
    /// thread; paired with the internal waker so `run_once` wakes promptly even
    /// with no timer due and no socket readiness (§5 "Shared resources").
    pub fn task_sender(&self) -> TaskSender<H> {
        TaskSender { tx: self.task_tx.clone(), waker: self.waker.clone() }
    }

    /// One iteration of the loop in §4.5: compute the timeout from the nearest
    /// timer, wait for readiness, dispatch ready handles, drain the task queue,
    /// then fire every timer whose deadline has passed, in deadline order.
    pub fn run_once(&mut self) -> std::io::Result<()> {
        let timeout = self.timers.next_deadline().map(|deadline| deadline.saturating_duration_since(Instant::now()));

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut drain_tasks = false;
        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            if token == WAKE_TOKEN {
                drain_tasks = true;
                continue;
            }
            self.dispatch_ready(token);
        }

        if drain_tasks {
            self.drain_tasks();
        }

        self.fire_expired_timers();
        Ok(())
    }

    /// Runs forever. Intended for the daemon binary; tests drive `run_once`
    /// directly so they can assert on state between iterations.
    pub fn run(&mut self) -> std::io::Result<()> {
        loop {
            self.run_once()?;
        }
    }

    fn dispatch_ready(&mut self, token: Token) {
        let handler = &mut self.handler;
        let timers = &mut self.timers;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.on_ready(token, timers))) {
            error!("dispatcher: callback for {token:?} panicked: {payload:?}");
        }
    }

    fn drain_tasks(&mut self) {
        while let Ok(task) = self.task_rx.try_recv() {
            let handler = &mut self.handler;
            let timers = &mut self.timers;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task(handler, timers))) {
                error!("dispatcher: queued task panicked: {payload:?}");
            }
        }
    }

    fn fire_expired_timers(&mut self) {
        for id in self.timers.take_expired() {
            let handler = &mut self.handler;
            let timers = &mut self.timers;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.on_timer(id, timers))) {
                error!("dispatcher: timer {id} panicked: {payload:?}");
            }
        }
    }
}

/// Cross-thread handle for enqueueing a [`Task`] and waking the dispatcher
/// (§5 "Shared resources": the only inter-thread primitives are this queue and
/// the wakeup mechanism; the task queue is MPSC-safe by construction).
pub struct TaskSender<H: EventHandler> {
    tx: Sender<Task<H>>,
    waker: std::sync::Arc<mio::Waker>,
}

impl<H: EventHandler> Clone for TaskSender<H> {
    fn clone(&self) -> Self {
        TaskSender { tx: self.tx.clone(), waker: self.waker.clone() }
    }
}

impl<H: EventHandler> TaskSender<H> {
    pub fn send(&self, task: Task<H>) {
        if self.tx.send(task).is_err() {
            warn!("dispatcher: task queue send failed, dispatcher thread must have exited");
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!("dispatcher: waker.wake() failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        ready: Vec<Token>,
        fired_timers: Vec<TimerId>,
    }

    impl EventHandler for RecordingHandler {
        fn on_ready(&mut self, token: Token, _timers: &mut Timers) {
            self.ready.push(token);
        }

        fn on_timer(&mut self, id: TimerId, _timers: &mut Timers) {
            self.fired_timers.push(id);
        }
    }

    #[test]
    fn timer_fires_after_its_delay() {
        let mut dispatcher = Dispatcher::new(RecordingHandler::default()).unwrap();
        let id = dispatcher.timers().call_later(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        dispatcher.run_once().unwrap();
        assert_eq!(dispatcher.handler().fired_timers, vec![id]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut dispatcher = Dispatcher::new(RecordingHandler::default()).unwrap();
        let id = dispatcher.timers().call_later(Duration::from_millis(1));
        dispatcher.timers().cancel(id);
        std::thread::sleep(Duration::from_millis(5));
        dispatcher.run_once().unwrap();
        assert!(dispatcher.handler().fired_timers.is_empty());
    }

    #[test]
    fn cancelling_unknown_id_is_a_no_op() {
        let mut dispatcher = Dispatcher::new(RecordingHandler::default()).unwrap();
        dispatcher.timers().cancel(999);
    }

    #[test]
    fn cross_thread_task_runs_on_dispatcher_thread() {
        let mut dispatcher = Dispatcher::new(RecordingHandler::default()).unwrap();
        let sender = dispatcher.task_sender();
        let handle = std::thread::spawn(move || {
            sender.send(Box::new(|handler: &mut RecordingHandler, _timers: &mut Timers| {
                handler.ready.push(Token(42));
            }));
        });
        handle.join().unwrap();
        dispatcher.run_once().unwrap();
        assert_eq!(dispatcher.handler().ready, vec![Token(42)]);
    }

    #[test]
    fn panicking_timer_callback_does_not_kill_the_loop() {
        struct PanicOnce {
            fired: bool,
        }
        impl EventHandler for PanicOnce {
            fn on_ready(&mut self, _token: Token, _timers: &mut Timers) {}
            fn on_timer(&mut self, _id: TimerId, _timers: &mut Timers) {
                if !self.fired {
                    self.fired = true;
                    panic!("boom");
                }
            }
        }
        let mut dispatcher = Dispatcher::new(PanicOnce { fired: false }).unwrap();
        dispatcher.timers().call_later(Duration::from_millis(1));
        dispatcher.timers().call_later(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        dispatcher.run_once().unwrap();
        assert!(dispatcher.handler().fired);
    }
}

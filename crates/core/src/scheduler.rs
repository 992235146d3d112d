//! Single-threaded cooperative event scheduler.
//!
//! Every socket and every timed media delivery in the server is driven from
//! one [`Scheduler`]. It wraps a [`mio::Poll`] for socket readiness and a
//! binary heap for delayed tasks. Callbacks run to completion; the only
//! suspension point is returning control to the loop.
//!
//! ## Dispatch order
//!
//! Each [`turn`](Scheduler::turn):
//!
//! 1. polls for readiness, waiting at most until the earliest timer,
//! 2. dispatches I/O events in the order the poller reported them,
//! 3. dispatches timers that were due when the poll returned, in deadline
//!    order (ties in scheduling order).
//!
//! Timers scheduled from inside a callback never fire in the same turn, so a
//! zero-delay task cannot starve socket handling.
//!
//! ## Failures
//!
//! A callback that returns `Err` does not stop the loop. The error is logged
//! and handed back to [`EventHandler::on_failure`], which tears down whatever
//! owned the event.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

/// Upper bound on how long one poll may block, so the `running` flag is
/// observed promptly.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

const EVENT_CAPACITY: usize = 1024;

/// Handle to a delayed task, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// Why a callback was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Io {
        readable: bool,
        writable: bool,
        closed: bool,
    },
    Timer,
}

/// Receives the events produced by a [`Scheduler`].
pub trait EventHandler<E> {
    type Error: fmt::Display;

    fn on_event(
        &mut self,
        scheduler: &mut Scheduler<E>,
        event: E,
        trigger: Trigger,
    ) -> Result<(), Self::Error>;

    /// Called with the error of a failed [`on_event`](Self::on_event).
    fn on_failure(&mut self, scheduler: &mut Scheduler<E>, event: E, error: Self::Error);
}

struct Task<E> {
    payload: E,
    period: Option<Duration>,
}

pub struct Scheduler<E> {
    poll: Poll,
    events: Events,
    sources: Slab<E>,
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task<E>>,
    next_task: u64,
}

impl<E: Clone + fmt::Debug> Scheduler<E> {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            sources: Slab::new(),
            timers: BinaryHeap::new(),
            tasks: HashMap::new(),
            next_task: 0,
        })
    }

    /// Watch `source` for `interest`; readiness is delivered as `payload`.
    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        interest: Interest,
        payload: E,
    ) -> io::Result<Token> {
        let entry = self.sources.vacant_entry();
        let token = Token(entry.key());
        self.poll.registry().register(source, token, interest)?;
        entry.insert(payload);
        Ok(token)
    }

    pub fn reregister<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Stop watching `source`. Events already collected for it in the
    /// current turn are dropped.
    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        self.sources.try_remove(token.0);
        self.poll.registry().deregister(source)
    }

    /// Run `payload` once after `delay`.
    pub fn schedule(&mut self, delay: Duration, payload: E) -> TaskHandle {
        self.insert_task(delay, payload, None)
    }

    /// Run `payload` every `period`, first after one period.
    pub fn schedule_periodic(&mut self, period: Duration, payload: E) -> TaskHandle {
        self.insert_task(period, payload, Some(period))
    }

    /// Cancel a pending task. Returns `false` if it already fired (one-shot)
    /// or was already cancelled; that case is a no-op.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.tasks.remove(&handle.0).is_some()
    }

    pub fn is_scheduled(&self, handle: TaskHandle) -> bool {
        self.tasks.contains_key(&handle.0)
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn insert_task(&mut self, delay: Duration, payload: E, period: Option<Duration>) -> TaskHandle {
        let id = self.next_task;
        self.next_task += 1;
        self.tasks.insert(id, Task { payload, period });
        self.timers.push(Reverse((Instant::now() + delay, id)));
        TaskHandle(id)
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((deadline, id))) = self.timers.peek() {
            if self.tasks.contains_key(&id) {
                return Some(deadline);
            }
            // cancelled
            self.timers.pop();
        }
        None
    }

    /// Poll once (blocking at most `max_wait`) and dispatch everything that
    /// became ready. Returns the number of callbacks invoked.
    pub fn turn<H: EventHandler<E>>(&mut self, handler: &mut H, max_wait: Duration) -> io::Result<usize> {
        let timeout = match self.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(max_wait),
            None => max_wait,
        };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e);
            }
        }

        let ready: Vec<(Token, Trigger)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token(),
                    Trigger::Io {
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                        closed: event.is_read_closed() || event.is_error(),
                    },
                )
            })
            .collect();

        let mut dispatched = 0;
        for (token, trigger) in ready {
            let Some(payload) = self.sources.get(token.0).cloned() else {
                continue;
            };
            self.dispatch(handler, payload, trigger);
            dispatched += 1;
        }

        let now = Instant::now();
        while let Some(&Reverse((deadline, id))) = self.timers.peek() {
            if deadline > now {
                break;
            }
            self.timers.pop();

            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            let payload = task.payload.clone();
            match task.period {
                Some(period) => {
                    let mut next = deadline + period;
                    if next <= now {
                        next = now + period;
                    }
                    self.timers.push(Reverse((next, id)));
                }
                None => {
                    self.tasks.remove(&id);
                }
            }

            self.dispatch(handler, payload, Trigger::Timer);
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Turn until `running` is cleared.
    pub fn run<H: EventHandler<E>>(&mut self, handler: &mut H, running: &AtomicBool) -> io::Result<()> {
        while running.load(Ordering::SeqCst) {
            self.turn(handler, POLL_INTERVAL)?;
        }
        tracing::debug!("scheduler loop exited");
        Ok(())
    }

    fn dispatch<H: EventHandler<E>>(&mut self, handler: &mut H, payload: E, trigger: Trigger) {
        if let Err(error) = handler.on_event(self, payload.clone(), trigger) {
            tracing::warn!(event = ?payload, %error, "callback failed");
            handler.on_failure(self, payload, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(u32, Trigger)>,
        failures: Vec<u32>,
        fail_on: Option<u32>,
    }

    impl EventHandler<u32> for Recorder {
        type Error = String;

        fn on_event(&mut self, _: &mut Scheduler<u32>, event: u32, trigger: Trigger) -> Result<(), String> {
            self.seen.push((event, trigger));
            if self.fail_on == Some(event) {
                return Err(format!("event {event} failed"));
            }
            Ok(())
        }

        fn on_failure(&mut self, _: &mut Scheduler<u32>, event: u32, _: String) {
            self.failures.push(event);
        }
    }

    fn turn_until(sched: &mut Scheduler<u32>, rec: &mut Recorder, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while rec.seen.len() < count && Instant::now() < deadline {
            sched.turn(rec, Duration::from_millis(10)).unwrap();
        }
    }

    fn events(rec: &Recorder) -> Vec<u32> {
        rec.seen.iter().map(|(e, _)| *e).collect()
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut sched = Scheduler::new().unwrap();
        let mut rec = Recorder::default();
        sched.schedule(Duration::from_millis(30), 3);
        sched.schedule(Duration::from_millis(10), 1);
        sched.schedule(Duration::from_millis(20), 2);

        turn_until(&mut sched, &mut rec, 3);
        assert_eq!(events(&rec), vec![1, 2, 3]);
        assert!(rec.seen.iter().all(|(_, t)| *t == Trigger::Timer));
        assert_eq!(sched.pending_tasks(), 0);
    }

    #[test]
    fn equal_deadlines_fire_in_scheduling_order() {
        let mut sched = Scheduler::new().unwrap();
        let mut rec = Recorder::default();
        for i in 0..5 {
            sched.schedule(Duration::ZERO, i);
        }
        turn_until(&mut sched, &mut rec, 5);
        assert_eq!(events(&rec), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancelled_task_never_fires() {
        let mut sched = Scheduler::new().unwrap();
        let mut rec = Recorder::default();
        let doomed = sched.schedule(Duration::from_millis(5), 1);
        sched.schedule(Duration::from_millis(20), 2);
        assert!(sched.cancel(doomed));
        assert!(!sched.is_scheduled(doomed));

        turn_until(&mut sched, &mut rec, 1);
        assert_eq!(events(&rec), vec![2]);
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let mut sched = Scheduler::new().unwrap();
        let mut rec = Recorder::default();
        let handle = sched.schedule(Duration::ZERO, 9);
        turn_until(&mut sched, &mut rec, 1);
        assert_eq!(events(&rec), vec![9]);
        assert!(!sched.cancel(handle));
    }

    #[test]
    fn periodic_task_repeats_until_cancelled() {
        let mut sched = Scheduler::new().unwrap();
        let mut rec = Recorder::default();
        let handle = sched.schedule_periodic(Duration::from_millis(5), 4);
        turn_until(&mut sched, &mut rec, 3);
        assert!(rec.seen.len() >= 3);

        assert!(sched.cancel(handle));
        let before = rec.seen.len();
        for _ in 0..3 {
            sched.turn(&mut rec, Duration::from_millis(10)).unwrap();
        }
        assert_eq!(rec.seen.len(), before);
    }

    #[test]
    fn failing_callback_does_not_stop_the_loop() {
        let mut sched = Scheduler::new().unwrap();
        let mut rec = Recorder {
            fail_on: Some(1),
            ..Default::default()
        };
        sched.schedule(Duration::ZERO, 1);
        sched.schedule(Duration::from_millis(5), 2);
        turn_until(&mut sched, &mut rec, 2);
        assert_eq!(events(&rec), vec![1, 2]);
        assert_eq!(rec.failures, vec![1]);
    }

    #[test]
    fn socket_readiness_is_dispatched_with_payload() {
        let mut sched = Scheduler::new().unwrap();
        let mut rec = Recorder::default();
        let mut socket = mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        sched.register(&mut socket, Interest::READABLE, 42).unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", addr).unwrap();

        turn_until(&mut sched, &mut rec, 1);
        assert_eq!(rec.seen[0].0, 42);
        assert!(matches!(rec.seen[0].1, Trigger::Io { readable: true, .. }));
    }
}

//! Typed publish/dispatch.
//!
//! Every event kind has at most one handler and any number of passive
//! listeners, all registered up front in a [`Registry`]. Blocking events are
//! processed strictly in order on one dedicated worker; everything else goes
//! to a fixed pool with no ordering between events. A failed handler is
//! retried up to the event's retry limit before its error callback fires.

use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        OnceLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::{
    error::{Error, Result},
    state::StopSignal,
};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(20);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait Message: Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    type Reply: Clone + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;

    /// Blocking events run one at a time, in publish order.
    fn is_blocking(&self) -> bool {
        false
    }

    /// The kind whose publication shuts the bus down.
    fn terminal_kind() -> Self::Kind;
}

type Handler<M> = Arc<
    dyn Fn(&Event<M>) -> Result<Option<<M as Message>::Reply>> + Send + Sync,
>;
type Listener<M> = Arc<dyn Fn(&Event<M>) + Send + Sync>;
type Callback<M> = Box<dyn FnOnce(&Event<M>) + Send>;

struct Outcome<R> {
    finished: bool,
    failed: bool,
    reply: Option<R>,
    error: Option<String>,
}

pub struct Event<M: Message> {
    message: M,
    max_retries: Option<u32>,
    executions: AtomicU32,
    outcome: Mutex<Outcome<M::Reply>>,
    done: Condvar,
    on_success: Mutex<Option<Callback<M>>>,
    on_error: Mutex<Option<Callback<M>>>,
}

impl<M: Message + Debug> Debug for Event<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("message", &self.message)
            .field("executions", &self.executions())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl<M: Message> Event<M> {
    pub fn new(message: M) -> Self {
        Self {
            message,
            max_retries: None,
            executions: AtomicU32::new(0),
            outcome: Mutex::new(Outcome {
                finished: false,
                failed: false,
                reply: None,
                error: None,
            }),
            done: Condvar::new(),
            on_success: Mutex::new(None),
            on_error: Mutex::new(None),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn on_success(
        self,
        callback: impl FnOnce(&Event<M>) + Send + 'static,
    ) -> Self {
        *self.on_success.lock() = Some(Box::new(callback));
        self
    }

    pub fn on_error(
        self,
        callback: impl FnOnce(&Event<M>) + Send + 'static,
    ) -> Self {
        *self.on_error.lock() = Some(Box::new(callback));
        self
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    /// Failed executions so far.
    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.lock().finished
    }

    pub fn is_failed(&self) -> bool {
        self.outcome.lock().failed
    }

    pub fn reply(&self) -> Option<M::Reply> {
        self.outcome.lock().reply.clone()
    }

    /// The cause captured when every retry failed.
    pub fn error(&self) -> Option<String> {
        self.outcome.lock().error.clone()
    }

    /// Wait for the event to finish. Returns true when it failed or did not
    /// finish within `timeout`.
    pub fn await_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.outcome.lock();
        while !outcome.finished {
            if self.done.wait_until(&mut outcome, deadline).timed_out() {
                if !outcome.finished {
                    tracing::warn!("timed out waiting for event");
                    return true;
                }
                break;
            }
        }
        outcome.failed
    }

    fn finish_ok(&self) {
        {
            let mut outcome = self.outcome.lock();
            outcome.finished = true;
        }
        self.done.notify_all();
        if let Some(callback) = self.on_success.lock().take() {
            callback(self);
        }
    }

    fn finish_err(&self, error: String) {
        {
            let mut outcome = self.outcome.lock();
            outcome.finished = true;
            outcome.failed = true;
            outcome.error = Some(error);
        }
        self.done.notify_all();
        if let Some(callback) = self.on_error.lock().take() {
            callback(self);
        }
    }
}

/// Handler and listener table, frozen once the bus starts.
pub struct Registry<M: Message> {
    handlers: HashMap<M::Kind, Handler<M>>,
    listeners: HashMap<M::Kind, Vec<Listener<M>>>,
}

impl<M: Message> Default for Registry<M> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            listeners: HashMap::new(),
        }
    }
}

impl<M: Message> Registry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(
        &mut self,
        kind: M::Kind,
        handler: impl Fn(&Event<M>) -> Result<Option<M::Reply>>
        + Send
        + Sync
        + 'static,
    ) -> Result<()> {
        if kind == M::terminal_kind() {
            return Err(Error::TerminalHandler(format!("{kind:?}")));
        }
        if self.handlers.contains_key(&kind) {
            return Err(Error::DuplicateHandler(format!("{kind:?}")));
        }
        self.handlers.insert(kind, Arc::new(handler));
        Ok(())
    }

    /// Listeners run after the handler, in registration order.
    pub fn listener(
        &mut self,
        kind: M::Kind,
        listener: impl Fn(&Event<M>) + Send + Sync + 'static,
    ) {
        self.listeners
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    fn listeners_of(&self, kind: &M::Kind) -> &[Listener<M>] {
        self.listeners.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

struct Inner<M: Message> {
    registry: OnceLock<Registry<M>>,
    exiting: AtomicBool,
    exit_signal: Arc<StopSignal>,
    tx: Sender<Arc<Event<M>>>,
    rx: Receiver<Arc<Event<M>>>,
    blocking_tx: Sender<Arc<Event<M>>>,
    blocking_rx: Receiver<Arc<Event<M>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    default_max_retries: u32,
}

pub struct EventBus<M: Message> {
    inner: Arc<Inner<M>>,
}

impl<M: Message> Clone for EventBus<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Message> Debug for EventBus<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("started", &self.inner.registry.get().is_some())
            .field("exiting", &self.is_exiting())
            .finish_non_exhaustive()
    }
}

impl<M: Message> EventBus<M> {
    /// Create a bus. Events published before [`start`](Self::start) wait in
    /// the queues.
    pub fn new(default_max_retries: u32) -> Self {
        let (tx, rx) = channel::unbounded();
        let (blocking_tx, blocking_rx) = channel::unbounded();
        Self {
            inner: Arc::new(Inner {
                registry: OnceLock::new(),
                exiting: AtomicBool::new(false),
                exit_signal: Arc::new(StopSignal::new()),
                tx,
                rx,
                blocking_tx,
                blocking_rx,
                workers: Mutex::new(Vec::new()),
                default_max_retries,
            }),
        }
    }

    /// Freeze the registration table and start `workers` pool threads plus
    /// the ordered worker.
    pub fn start(&self, registry: Registry<M>, workers: usize) -> Result<()> {
        self.inner
            .registry
            .set(registry)
            .map_err(|_| Error::Config("event bus already started".into()))?;

        let mut handles = self.inner.workers.lock();
        for i in 0..workers.max(1) {
            let inner = self.inner.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("event-worker-{i}"))
                    .spawn(move || run_worker(&inner, &inner.rx, false))?,
            );
        }
        let inner = self.inner.clone();
        handles.push(
            std::thread::Builder::new()
                .name("event-ordered".into())
                .spawn(move || run_worker(&inner, &inner.blocking_rx, true))?,
        );
        Ok(())
    }

    pub fn is_exiting(&self) -> bool {
        self.inner.exiting.load(Ordering::Acquire)
    }

    /// Fires once the terminal event has been published.
    pub fn exit_signal(&self) -> Arc<StopSignal> {
        self.inner.exit_signal.clone()
    }

    pub fn publish(&self, message: M) -> Arc<Event<M>> {
        self.submit(Event::new(message))
    }

    /// Queue an event. After shutdown the event is dropped and reads as
    /// failed.
    pub fn submit(&self, mut event: Event<M>) -> Arc<Event<M>> {
        if event.max_retries.is_none() {
            event.max_retries = Some(self.inner.default_max_retries);
        }
        let event = Arc::new(event);
        if self.is_exiting() {
            tracing::debug!("event dropped after shutdown");
            event.finish_err(Error::BusClosed.to_string());
            return event;
        }
        if event.message.kind() == M::terminal_kind() {
            self.shutdown(&event);
            return event;
        }
        enqueue(&self.inner, event.clone());
        event
    }

    fn shutdown(&self, event: &Arc<Event<M>>) {
        if let Some(registry) = self.inner.registry.get() {
            for listener in registry.listeners_of(&event.message.kind()) {
                listener(event);
            }
        }
        self.inner.exiting.store(true, Ordering::Release);
        self.inner.exit_signal.stop();
        event.finish_ok();
        tracing::info!("event bus shutting down");
    }

    /// Wait for every worker thread to exit. Only meaningful after the
    /// terminal event.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> =
            self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == std::thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("event worker panicked");
            }
        }
    }
}

fn enqueue<M: Message>(inner: &Inner<M>, event: Arc<Event<M>>) {
    let tx = if event.message.is_blocking() {
        &inner.blocking_tx
    } else {
        &inner.tx
    };
    // Both receivers live as long as `inner`, so sending cannot fail.
    let _ = tx.send(event);
}

fn run_worker<M: Message>(
    inner: &Arc<Inner<M>>,
    rx: &Receiver<Arc<Event<M>>>,
    ordered: bool,
) {
    loop {
        if inner.exiting.load(Ordering::Acquire) {
            return;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => dispatch(inner, event, ordered),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn dispatch<M: Message>(
    inner: &Arc<Inner<M>>,
    event: Arc<Event<M>>,
    ordered: bool,
) {
    let Some(registry) = inner.registry.get() else {
        return;
    };
    let kind = event.message.kind();
    let result = match registry.handlers.get(&kind) {
        Some(handler) => {
            std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event)))
                .unwrap_or_else(|_| {
                    Err(Error::Handler(format!("{kind:?} handler panicked")))
                })
        }
        None => Ok(None),
    };

    match result {
        Ok(reply) => {
            event.outcome.lock().reply = reply;
            for listener in registry.listeners_of(&kind) {
                listener(&event);
            }
            event.finish_ok();
        }
        Err(e) => {
            let executions =
                event.executions.fetch_add(1, Ordering::AcqRel) + 1;
            let max = event.max_retries.unwrap_or(inner.default_max_retries);
            if executions > max {
                tracing::error!(?kind, executions, error = %e, "event failed");
                event.finish_err(e.to_string());
            } else {
                tracing::debug!(?kind, executions, error = %e, "retrying");
                if ordered {
                    // Strict FIFO: retry in place before anything queued
                    // behind it.
                    dispatch(inner, event, ordered);
                } else {
                    enqueue(inner, event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Work,
        Fail,
        Ordered,
        Close,
    }

    #[derive(Debug)]
    struct Msg(Kind, usize);

    impl Message for Msg {
        type Kind = Kind;
        type Reply = usize;

        fn kind(&self) -> Kind {
            self.0
        }

        fn is_blocking(&self) -> bool {
            self.0 == Kind::Ordered
        }

        fn terminal_kind() -> Kind {
            Kind::Close
        }
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let mut registry = Registry::<Msg>::new();
        registry.handler(Kind::Work, |_| Ok(None)).unwrap();
        let err = registry.handler(Kind::Work, |_| Ok(None)).unwrap_err();
        assert!(matches!(err, Error::DuplicateHandler(_)));
    }

    #[test]
    fn terminal_kind_cannot_have_handler() {
        let mut registry = Registry::<Msg>::new();
        let err = registry.handler(Kind::Close, |_| Ok(None)).unwrap_err();
        assert!(matches!(err, Error::TerminalHandler(_)));
    }

    #[test]
    fn handler_reply_and_listeners() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::<Msg>::new();
        registry
            .handler(Kind::Work, |e| Ok(Some(e.message().1 * 2)))
            .unwrap();
        for tag in ["first", "second"] {
            let seen = seen.clone();
            registry.listener(Kind::Work, move |e| {
                seen.lock().push((tag, e.reply()));
            });
        }
        let bus = EventBus::new(DEFAULT_MAX_RETRIES);
        bus.start(registry, 2).unwrap();

        let event = bus.publish(Msg(Kind::Work, 21));
        assert!(!event.await_finished(Duration::from_secs(5)));
        assert_eq!(event.reply(), Some(42));
        assert_eq!(
            *seen.lock(),
            vec![("first", Some(42)), ("second", Some(42))]
        );
    }

    #[test]
    fn exhausted_retries_fire_error_callback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let successes = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::<Msg>::new();
        {
            let calls = calls.clone();
            registry
                .handler(Kind::Fail, move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Handler("always".into()))
                })
                .unwrap();
        }
        let bus = EventBus::new(DEFAULT_MAX_RETRIES);
        bus.start(registry, 2).unwrap();

        let event = {
            let errors = errors.clone();
            let successes = successes.clone();
            bus.submit(
                Event::new(Msg(Kind::Fail, 0))
                    .max_retries(2)
                    .on_error(move |_| {
                        errors.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_success(move |_| {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }),
            )
        };

        assert!(event.await_finished(Duration::from_secs(5)));
        // One initial run plus exactly two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(event.error().as_deref(), Some("always"));
    }

    #[test]
    fn panicking_handler_counts_as_failure() {
        let mut registry = Registry::<Msg>::new();
        registry
            .handler(Kind::Fail, |_| panic!("handler exploded"))
            .unwrap();
        let bus = EventBus::new(0);
        bus.start(registry, 1).unwrap();

        let event = bus.publish(Msg(Kind::Fail, 0));
        assert!(event.await_finished(Duration::from_secs(5)));
        assert!(event.is_failed());
    }

    #[test]
    fn blocking_events_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::<Msg>::new();
        {
            let order = order.clone();
            registry
                .handler(Kind::Ordered, move |e| {
                    order.lock().push(e.message().1);
                    Ok(None)
                })
                .unwrap();
        }
        let bus = EventBus::new(DEFAULT_MAX_RETRIES);
        let events: Vec<_> =
            (0..50).map(|i| bus.publish(Msg(Kind::Ordered, i))).collect();
        bus.start(registry, 4).unwrap();

        for event in &events {
            assert!(!event.await_finished(Duration::from_secs(5)));
        }
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn terminal_event_runs_listeners_and_drops_later_publishes() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut registry = Registry::<Msg>::new();
        registry.handler(Kind::Work, |_| Ok(Some(1))).unwrap();
        {
            let closed = closed.clone();
            registry.listener(Kind::Close, move |_| {
                closed.store(true, Ordering::SeqCst);
            });
        }
        let bus = EventBus::new(DEFAULT_MAX_RETRIES);
        bus.start(registry, 1).unwrap();

        let close = bus.publish(Msg(Kind::Close, 0));
        assert!(close.is_finished());
        assert!(closed.load(Ordering::SeqCst));
        assert!(bus.is_exiting());
        assert!(bus.exit_signal().is_stopped());

        let late = bus.publish(Msg(Kind::Work, 0));
        assert!(late.await_finished(Duration::from_millis(10)));
        assert_eq!(late.reply(), None);
        bus.join();
    }

    #[test]
    fn await_times_out_as_failure() {
        let bus = EventBus::<Msg>::new(DEFAULT_MAX_RETRIES);
        let event = bus.publish(Msg(Kind::Work, 0));
        assert!(event.await_finished(Duration::from_millis(10)));
        assert!(!event.is_finished());
    }
}

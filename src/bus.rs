use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Result;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// An immutable message. Listeners receive it by shared reference, so it must
/// be a snapshot and never a handle into live state.
pub trait Event: Send + Sync + 'static {
    fn topic(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

pub trait Listener: Send + Sync {
    fn handle(&self, event: &dyn Event) -> Result<()>;
}

impl<F> Listener for F
where
    F: Fn(&dyn Event) -> Result<()> + Send + Sync,
{
    fn handle(&self, event: &dyn Event) -> Result<()> {
        self(event)
    }
}

type Registry = HashMap<String, Vec<Arc<dyn Listener>>>;

/// Topic based publish/subscribe. Every listener invocation runs as its own
/// job on a worker pool; `publish` returns as soon as the jobs are queued.
/// Clones share the same registry and pool.
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<Mutex<Registry>>,
    pool: Arc<ThreadPool>,
    in_flight: Arc<InFlight>,
}

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

impl EventBus {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("event-bus-{}", i))
            .build()?;
        Ok(Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            pool: Arc::new(pool),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn subscribe<L: Listener + 'static>(&self, topic: &str, listener: L) {
        self.subscribe_shared(topic, Arc::new(listener));
    }

    /// Registers an already shared listener, e.g. one instance for several
    /// topics.
    pub fn subscribe_shared(&self, topic: &str, listener: Arc<dyn Listener>) {
        let mut listeners = self.registry();
        listeners.entry(topic.to_string()).or_default().push(listener);
        log::debug!("Subscribed listener to '{}'", topic);
    }

    /// Schedules every listener registered for the event's topic and returns
    /// without waiting for any of them. Listener errors and panics are logged
    /// and go no further.
    pub fn publish<E: Event>(&self, event: E) {
        let topic = event.topic();
        let listeners = match self.registry().get(&topic) {
            Some(listeners) => listeners.clone(),
            None => {
                log::trace!("No listeners for '{}'", topic);
                return;
            }
        };

        log::trace!("Publishing '{}' to {} listener(s)", topic, listeners.len());
        let event: Arc<dyn Event> = Arc::new(event);
        for listener in listeners {
            let event = event.clone();
            let topic = topic.clone();
            let in_flight = self.in_flight.clone();
            in_flight.begin();
            self.pool.spawn(move || {
                match panic::catch_unwind(AssertUnwindSafe(|| listener.handle(event.as_ref()))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("Listener for '{}' failed: {:#}", topic, e),
                    Err(payload) => log::warn!(
                        "Listener for '{}' panicked: {}",
                        topic,
                        panic_message(payload.as_ref())
                    ),
                }
                in_flight.end();
            });
        }
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.registry().get(topic).map_or(0, Vec::len)
    }

    /// Blocks until no listener invocation is queued or running, or until the
    /// timeout elapses. Returns true if the bus went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let count = self.in_flight.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .in_flight
            .idle
            .wait_timeout_while(count, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count == 0
    }

    // The lock is only ever held to read or append to the registry, never
    // while a listener runs.
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const IDLE: Duration = Duration::from_secs(5);

    #[derive(Debug)]
    struct Ping(i32);

    impl Event for Ping {
        fn topic(&self) -> String {
            "ping".to_string()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn counter(bus: &EventBus, topic: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.subscribe(topic, move |_: &dyn Event| -> Result<()> {
            count_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[test]
    fn no_listeners() -> Result<()> {
        let bus = EventBus::new(2)?;
        bus.publish(Ping(1));
        assert!(bus.wait_idle(IDLE));
        assert_eq!(bus.listener_count("ping"), 0);
        Ok(())
    }

    #[test]
    fn every_listener_is_invoked() -> Result<()> {
        let bus = EventBus::new(4)?;
        let counters: Vec<_> = (0..5).map(|_| counter(&bus, "ping")).collect();
        let other = counter(&bus, "pong");

        bus.publish(Ping(1));
        bus.publish(Ping(2));
        assert!(bus.wait_idle(IDLE));

        for count in &counters {
            assert_eq!(count.load(Ordering::SeqCst), 2);
        }
        assert_eq!(other.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count("ping"), 5);
        Ok(())
    }

    #[test]
    fn listener_receives_event_payload() -> Result<()> {
        let bus = EventBus::new(1)?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe("ping", move |event: &dyn Event| -> Result<()> {
            if let Some(Ping(n)) = event.as_any().downcast_ref::<Ping>() {
                seen_clone.lock().unwrap().push(*n);
            }
            Ok(())
        });

        bus.publish(Ping(7));
        assert!(bus.wait_idle(IDLE));
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        Ok(())
    }

    #[test]
    fn failing_listeners_are_isolated() -> Result<()> {
        let bus = EventBus::new(2)?;
        let before = counter(&bus, "ping");
        bus.subscribe("ping", |_: &dyn Event| -> Result<()> { Err(anyhow::anyhow!("listener failed")) });
        bus.subscribe("ping", |_: &dyn Event| -> Result<()> { panic!("listener panicked") });
        let after = counter(&bus, "ping");

        bus.publish(Ping(1));
        assert!(bus.wait_idle(IDLE));
        bus.publish(Ping(2));
        assert!(bus.wait_idle(IDLE));

        assert_eq!(before.load(Ordering::SeqCst), 2);
        assert_eq!(after.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn late_subscriber_gets_no_replay() -> Result<()> {
        let bus = EventBus::new(1)?;
        bus.publish(Ping(1));
        assert!(bus.wait_idle(IDLE));

        let late = counter(&bus, "ping");
        assert!(bus.wait_idle(IDLE));
        assert_eq!(late.load(Ordering::SeqCst), 0);

        bus.publish(Ping(2));
        assert!(bus.wait_idle(IDLE));
        assert_eq!(late.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn publish_does_not_wait_for_listeners() -> Result<()> {
        let bus = EventBus::new(1)?;
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        bus.subscribe("ping", move |_: &dyn Event| -> Result<()> {
            let _ = release_rx.lock().unwrap().recv_timeout(IDLE);
            Ok(())
        });

        bus.publish(Ping(1));
        // Still blocked in the listener, so the bus is busy.
        assert!(!bus.wait_idle(Duration::from_millis(20)));
        release_tx.send(())?;
        assert!(bus.wait_idle(IDLE));
        Ok(())
    }

    #[test]
    fn clone_shares_registry() -> Result<()> {
        let bus1 = EventBus::new(1)?;
        let bus2 = bus1.clone();
        let count = counter(&bus1, "ping");

        bus2.publish(Ping(1));
        assert!(bus2.wait_idle(IDLE));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus2.listener_count("ping"), 1);
        Ok(())
    }

    #[test]
    fn concurrent_publishers() -> Result<()> {
        let bus = EventBus::new(4)?;
        let count = counter(&bus, "ping");

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let bus = bus.clone();
                std::thread::spawn(move || bus.publish(Ping(i)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(bus.wait_idle(IDLE));
        assert_eq!(count.load(Ordering::SeqCst), 10);
        Ok(())
    }
}

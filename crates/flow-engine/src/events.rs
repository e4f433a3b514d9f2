//! Execution update fan-out.
//!
//! Every mutation of an execution is queued here in the order it was made.
//! Whichever caller finds the queue idle delivers it; updates queued while a
//! delivery is running, including ones queued from inside a listener, are
//! delivered by that same caller after the current snapshot has reached every
//! observer. A terminal snapshot is the last one delivered and releases the
//! execution's registrations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::execution::Execution;

/// Callback invoked with a read-only snapshot after each update.
pub type Listener = Arc<dyn Fn(&Execution) + Send + Sync>;

/// Registrations and undelivered updates of one execution.
#[derive(Default)]
struct Outbox {
    listeners: Vec<Listener>,
    sender: Option<broadcast::Sender<Execution>>,
    pending: VecDeque<Execution>,
    delivering: bool,
    closed: bool,
}

type SharedOutbox = Arc<Mutex<Outbox>>;

fn lock(outbox: &Mutex<Outbox>) -> MutexGuard<'_, Outbox> {
    outbox.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-execution listener lists and update channels.
pub struct Notifier {
    outboxes: DashMap<Uuid, SharedOutbox>,
    buffer: usize,
}

impl Notifier {
    /// Create a notifier whose channels buffer `buffer` updates.
    pub fn new(buffer: usize) -> Self {
        Self {
            outboxes: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Start accepting registrations and updates for an execution.
    pub fn open(&self, execution_id: Uuid) {
        self.outboxes.entry(execution_id).or_default();
    }

    fn outbox(&self, execution_id: Uuid) -> Option<SharedOutbox> {
        self.outboxes
            .get(&execution_id)
            .map(|entry| entry.value().clone())
    }

    /// Register a listener. Returns false if the execution is not open.
    pub fn subscribe(&self, execution_id: Uuid, listener: Listener) -> bool {
        let Some(outbox) = self.outbox(execution_id) else {
            return false;
        };
        let mut state = lock(&outbox);
        if state.closed {
            return false;
        }
        state.listeners.push(listener);
        true
    }

    /// Remove one registration of `listener`. Returns false if none matched.
    pub fn unsubscribe(&self, execution_id: Uuid, listener: &Listener) -> bool {
        let Some(outbox) = self.outbox(execution_id) else {
            return false;
        };
        let mut state = lock(&outbox);
        let Some(pos) = state.listeners.iter().position(|l| same_listener(l, listener)) else {
            return false;
        };
        state.listeners.remove(pos);
        true
    }

    /// Number of live listener registrations for an execution.
    pub fn listener_count(&self, execution_id: Uuid) -> usize {
        self.outbox(execution_id)
            .map(|outbox| lock(&outbox).listeners.len())
            .unwrap_or(0)
    }

    /// Open an update channel for an execution. Dropping the receiver unsubscribes.
    pub fn watch(&self, execution_id: Uuid) -> Option<broadcast::Receiver<Execution>> {
        let outbox = self.outbox(execution_id)?;
        let mut state = lock(&outbox);
        if state.closed {
            return None;
        }
        let buffer = self.buffer;
        Some(
            state
                .sender
                .get_or_insert_with(|| broadcast::channel(buffer).0)
                .subscribe(),
        )
    }

    /// Queue a snapshot for delivery. Returns false if the execution is not open.
    pub fn enqueue(&self, execution: &Execution) -> bool {
        let Some(outbox) = self.outbox(execution.id) else {
            return false;
        };
        let mut state = lock(&outbox);
        if state.closed {
            return false;
        }
        state.pending.push_back(execution.clone());
        true
    }

    /// Queue a snapshot and deliver everything pending.
    pub fn publish(&self, execution: &Execution) {
        if self.enqueue(execution) {
            self.deliver(execution.id);
        }
    }

    /// Deliver pending snapshots in order, unless another caller already is.
    pub fn deliver(&self, execution_id: Uuid) {
        let Some(outbox) = self.outbox(execution_id) else {
            return;
        };
        {
            let mut state = lock(&outbox);
            if state.delivering {
                return;
            }
            state.delivering = true;
        }

        loop {
            let (snapshot, listeners, sender) = {
                let mut state = lock(&outbox);
                match state.pending.pop_front() {
                    Some(snapshot) if !state.closed => {
                        (snapshot, state.listeners.clone(), state.sender.clone())
                    }
                    _ => {
                        state.delivering = false;
                        return;
                    }
                }
            };

            for listener in &listeners {
                // Skip listeners removed by an earlier listener of this round.
                if is_registered(&outbox, listener) {
                    listener(&snapshot);
                }
            }

            if let Some(sender) = sender {
                // No receivers left is fine.
                let _ = sender.send(snapshot.clone());
            }

            tracing::trace!(
                execution_id = %snapshot.id,
                status = %snapshot.status,
                listeners = listeners.len(),
                "Execution update published"
            );

            if snapshot.status.is_terminal() {
                self.release(execution_id);
                return;
            }
        }
    }

    /// Drop every registration and undelivered update of an execution.
    pub fn release(&self, execution_id: Uuid) {
        if let Some((_, outbox)) = self.outboxes.remove(&execution_id) {
            let mut state = lock(&outbox);
            state.closed = true;
            state.listeners.clear();
            state.pending.clear();
            state.sender = None;
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(128)
    }
}

fn is_registered(outbox: &Mutex<Outbox>, listener: &Listener) -> bool {
    lock(outbox)
        .listeners
        .iter()
        .any(|l| same_listener(l, listener))
}

/// Listener identity is the identity of its allocation.
fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionStatus, TriggerKind};
    use crate::flow::FlowDefinition;
    use flow_processors::{Step, StepKind};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn execution() -> Execution {
        let flow = FlowDefinition::new("f", "F", vec![Step::new("a", "A", StepKind::Delay)]);
        Execution::new(&flow, TriggerKind::Manual, HashMap::new(), "tester")
    }

    fn opened() -> (Notifier, Execution) {
        let notifier = Notifier::default();
        let exec = execution();
        notifier.open(exec.id);
        (notifier, exec)
    }

    fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = counter.clone();
        Arc::new(move |_: &Execution| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn recording_listener(seen: &Arc<Mutex<Vec<ExecutionStatus>>>) -> Listener {
        let seen = seen.clone();
        Arc::new(move |e: &Execution| seen.lock().unwrap().push(e.status))
    }

    #[test]
    fn test_publish_reaches_listeners() {
        let (notifier, exec) = opened();
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(notifier.subscribe(exec.id, counting_listener(&hits)));
        notifier.publish(&exec);
        notifier.publish(&exec);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_double_subscribe_single_unsubscribe() {
        let (notifier, exec) = opened();
        let hits = Arc::new(AtomicUsize::new(0));
        let listener = counting_listener(&hits);

        notifier.subscribe(exec.id, listener.clone());
        notifier.subscribe(exec.id, listener.clone());
        assert!(notifier.unsubscribe(exec.id, &listener));
        assert_eq!(notifier.listener_count(exec.id), 1);

        notifier.publish(&exec);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(notifier.unsubscribe(exec.id, &listener));
        assert!(!notifier.unsubscribe(exec.id, &listener));
        assert_eq!(notifier.listener_count(exec.id), 0);
    }

    #[test]
    fn test_unsubscribe_matches_identity_only() {
        let (notifier, exec) = opened();
        let hits = Arc::new(AtomicUsize::new(0));
        let registered = counting_listener(&hits);
        let other = counting_listener(&hits);

        notifier.subscribe(exec.id, registered);
        assert!(!notifier.unsubscribe(exec.id, &other));
        assert_eq!(notifier.listener_count(exec.id), 1);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let notifier = Arc::new(Notifier::default());
        let exec = execution();
        notifier.open(exec.id);
        let slot: Arc<Mutex<Option<Listener>>> = Arc::default();

        let listener: Listener = {
            let notifier = notifier.clone();
            let slot = slot.clone();
            Arc::new(move |e: &Execution| {
                if let Some(me) = slot.lock().unwrap().take() {
                    notifier.unsubscribe(e.id, &me);
                }
            })
        };
        *slot.lock().unwrap() = Some(listener.clone());

        notifier.subscribe(exec.id, listener);
        notifier.publish(&exec);
        assert_eq!(notifier.listener_count(exec.id), 0);
    }

    #[test]
    fn test_update_published_from_listener_keeps_order() {
        let notifier = Arc::new(Notifier::default());
        let exec = execution();
        notifier.open(exec.id);

        let mut cancelled = exec.clone();
        assert!(cancelled.transition(ExecutionStatus::Cancelled));

        let reentrant: Listener = {
            let notifier = notifier.clone();
            Arc::new(move |e: &Execution| {
                if e.status == ExecutionStatus::Pending {
                    notifier.publish(&cancelled);
                }
            })
        };
        let seen: Arc<Mutex<Vec<ExecutionStatus>>> = Arc::default();
        let mut rx = notifier.watch(exec.id).unwrap();

        notifier.subscribe(exec.id, reentrant);
        notifier.subscribe(exec.id, recording_listener(&seen));
        notifier.publish(&exec);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ExecutionStatus::Pending, ExecutionStatus::Cancelled]
        );
        assert_eq!(rx.try_recv().unwrap().status, ExecutionStatus::Pending);
        assert_eq!(rx.try_recv().unwrap().status, ExecutionStatus::Cancelled);

        // the terminal update released the execution
        assert_eq!(notifier.listener_count(exec.id), 0);
    }

    #[test]
    fn test_registration_refused_once_released() {
        let (notifier, mut exec) = opened();
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(exec.transition(ExecutionStatus::Cancelled));
        notifier.publish(&exec);

        assert!(!notifier.subscribe(exec.id, counting_listener(&hits)));
        assert!(notifier.watch(exec.id).is_none());
        assert_eq!(notifier.listener_count(exec.id), 0);

        // nothing is delivered after the terminal update
        notifier.publish(&exec);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let unknown = Uuid::new_v4();
        assert!(!notifier.subscribe(unknown, counting_listener(&hits)));
        assert!(!notifier.enqueue(&execution()));
    }

    #[test]
    fn test_watch_receives_snapshots() {
        let notifier = Notifier::new(4);
        let mut exec = execution();
        notifier.open(exec.id);
        let mut rx = notifier.watch(exec.id).unwrap();

        notifier.publish(&exec);
        exec.transition(ExecutionStatus::Running);
        notifier.publish(&exec);

        tokio_test::block_on(async {
            assert_eq!(rx.recv().await.unwrap().status, ExecutionStatus::Pending);
            assert_eq!(rx.recv().await.unwrap().status, ExecutionStatus::Running);

            notifier.release(exec.id);
            assert!(rx.recv().await.is_err());
        });
    }
}

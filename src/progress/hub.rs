//! Event fan-out
//!
//! Every subscriber gets its own unbounded channel. Events published while
//! nobody is listening, before the first subscriber or after the last one
//! went away, are kept for the next subscriber. Once closed, a late
//! subscriber receives the terminal event and nothing else.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

struct HubState<T> {
    backlog: Vec<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    terminal: Option<T>,
}

pub struct ProgressHub<T> {
    state: Arc<Mutex<HubState<T>>>,
}

impl<T> Clone for ProgressHub<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + 'static> Default for ProgressHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> ProgressHub<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                backlog: Vec::new(),
                subscribers: Vec::new(),
                terminal: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState<T>> {
        // Recover from poisoning
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn publish(&self, event: T) {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return;
        }
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        if state.subscribers.is_empty() {
            state.backlog.push(event);
        }
    }

    /// Publish the terminal event and end every subscription
    ///
    /// Later calls are ignored.
    pub fn close(&self, terminal: T) {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return;
        }
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(terminal.clone());
        }
        state.backlog.clear();
        state.terminal = Some(terminal);
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        if let Some(terminal) = &state.terminal {
            let _ = tx.send(terminal.clone());
            return Subscription { rx };
        }

        state.subscribers.retain(|tx| !tx.is_closed());
        for event in state.backlog.drain(..) {
            let _ = tx.send(event);
        }
        state.subscribers.push(tx);
        Subscription { rx }
    }
}

/// One subscriber's view of a hub
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Next event, `None` after the terminal event has been delivered
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Everything already delivered, without waiting
    pub fn drain(&mut self) -> Vec<T> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backlog_goes_to_first_subscriber_only() {
        let hub = ProgressHub::new();
        hub.publish(1);
        hub.publish(2);

        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        hub.publish(3);
        hub.close(99);

        let mut seen = Vec::new();
        while let Some(v) = first.next().await {
            seen.push(v);
        }
        assert_eq!(seen, vec![1, 2, 3, 99]);

        let mut seen = Vec::new();
        while let Some(v) = second.next().await {
            seen.push(v);
        }
        assert_eq!(seen, vec![3, 99]);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_terminal_only() {
        let hub = ProgressHub::new();
        let mut early = hub.subscribe();
        hub.publish("line");
        hub.close("done");
        hub.publish("ignored");

        assert_eq!(early.drain(), vec!["line", "done"]);

        let mut late = hub.subscribe();
        assert_eq!(late.next().await, Some("done"));
        assert_eq!(late.next().await, None);
    }

    #[test]
    fn test_events_without_listener_wait_for_next_subscriber() {
        let hub = ProgressHub::new();
        let panel = hub.subscribe();
        hub.publish("line-0");
        drop(panel);
        hub.publish("line-1");

        let mut audit = hub.subscribe();
        hub.publish("line-2");
        hub.close("done");
        assert_eq!(audit.drain(), vec!["line-1", "line-2", "done"]);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_others() {
        let hub = ProgressHub::new();
        let dropped = hub.subscribe();
        let mut kept = hub.subscribe();
        drop(dropped);
        hub.publish(7);
        hub.close(0);
        assert_eq!(kept.drain(), vec![7, 0]);
    }
}

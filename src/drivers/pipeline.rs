use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

use crate::types::Event;

/// Creates the unbounded FIFO that carries events from the acquisition worker
/// to the consumer.
pub fn event_pipeline() -> (EventSender, EventReceiver) {
    let (tx, rx) = channel();
    (EventSender { tx }, EventReceiver { rx })
}

/// Producer half. Cloned into each acquisition run.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    /// Returns `false` once the consumer half is gone.
    pub fn emit(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Consumer half. Draining never blocks.
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<Event>,
}

impl EventReceiver {
    /// Hands every event queued right now to `apply`, oldest first, and
    /// returns how many there were.
    pub fn drain_with(&self, mut apply: impl FnMut(Event)) -> usize {
        let mut count = 0;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    apply(event);
                    count += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        count
    }

    pub fn drain(&self) -> Vec<Event> {
        let mut events = Vec::new();
        self.drain_with(|event| events.push(event));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sample;
    use std::thread;

    fn reading(i: usize) -> Event {
        Event::Sample(Sample {
            timestamp: i as f64,
            mode: Some("VOLT".into()),
            value: Some(i as f64 * 0.5),
            unit: "V".into(),
        })
    }

    #[test]
    fn drain_returns_everything_in_order() {
        let (tx, rx) = event_pipeline();
        assert!(rx.drain().is_empty());
        for i in 0..1_000 {
            assert!(tx.emit(reading(i)));
        }
        tx.emit(Event::RangeUpdated("AUTO".into()));
        let events = rx.drain();
        assert_eq!(events.len(), 1_001);
        for (i, event) in events.iter().take(1_000).enumerate() {
            assert_eq!(event, &reading(i));
        }
        assert_eq!(events[1_000], Event::RangeUpdated("AUTO".into()));
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn producer_thread_keeps_order() {
        let (tx, rx) = event_pipeline();
        let producer = thread::spawn(move || {
            for i in 0..500 {
                tx.emit(reading(i));
            }
        });
        producer.join().unwrap();
        let mut seen = Vec::new();
        let drained = rx.drain_with(|event| seen.push(event));
        assert_eq!(drained, 500);
        assert_eq!(seen, (0..500).map(reading).collect::<Vec<_>>());
    }

    #[test]
    fn emit_fails_after_consumer_dropped() {
        let (tx, rx) = event_pipeline();
        drop(rx);
        assert!(!tx.emit(Event::ModeChanged("RES".into())));
    }
}

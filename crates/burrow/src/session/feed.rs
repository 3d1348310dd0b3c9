//! Single-consumer event feeds for window changes and signals.

use std::collections::VecDeque;

use tokio::sync::mpsc;

/// Events held while no consumer is attached.
pub(crate) const FEED_BACKLOG: usize = 128;

/// An event source with at most one consumer.
///
/// Events queue in `pending` until the request loop hands them to the
/// consumer one at a time, waiting while the consumer is not ready.
#[derive(Debug)]
pub(crate) struct Feed<T> {
    consumer: Option<mpsc::Sender<T>>,
    pending: VecDeque<T>,
    closed: bool,
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Self {
            consumer: None,
            pending: VecDeque::new(),
            closed: false,
        }
    }
}

impl<T> Feed<T> {
    /// Queues an event. Returns false if the backlog is full or the feed is
    /// closed, in which case the event is dropped.
    pub(crate) fn push(&mut self, event: T) -> bool {
        if self.closed || self.pending.len() >= FEED_BACKLOG {
            return false;
        }
        self.pending.push_back(event);
        true
    }

    /// Attaches a consumer, replacing any previous one.
    pub(crate) fn attach(&mut self, consumer: mpsc::Sender<T>) {
        if !self.closed {
            self.consumer = Some(consumer);
        }
    }

    /// Takes the next event if a consumer is attached.
    pub(crate) fn next(&mut self) -> Option<(mpsc::Sender<T>, T)> {
        let consumer = self.consumer.clone()?;
        let event = self.pending.pop_front()?;
        Some((consumer, event))
    }

    /// Detaches `consumer` after it went away, unless it was replaced.
    pub(crate) fn detach(&mut self, consumer: &mpsc::Sender<T>) {
        if self
            .consumer
            .as_ref()
            .is_some_and(|current| current.same_channel(consumer))
        {
            self.consumer = None;
        }
    }

    /// Drops the consumer and any queued events; the consumer's receiver
    /// then ends once drained.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.consumer = None;
        self.pending.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

//! Per-principal FIFO event queues.
//!
//! An inbox is the receiving half of a bounded mpsc channel plus a small
//! replay buffer. The buffer exists because consumers filter: a handler
//! awaiting a service response must set aside unrelated events without
//! losing their arrival order.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::OwnedPermit;

use crate::message::{Event, InvocationId, Message, ServiceResponse};

pub(crate) fn inbox_pair(capacity: usize) -> (InboxSender, Inbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        InboxSender { tx },
        Inbox {
            rx,
            buffered: VecDeque::new(),
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueError {
    Full,
    Closed,
}

/// Sending half of an inbox, held by the router's registry.
#[derive(Debug, Clone)]
pub(crate) struct InboxSender {
    tx: mpsc::Sender<Event>,
}

impl InboxSender {
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Reserve one slot, waiting up to `timeout` under backpressure. The
    /// permit either carries exactly one later `send` or releases the slot
    /// on drop, which is what lets channel fan-out commit all-or-nothing.
    pub(crate) async fn reserve(&self, timeout: Duration) -> Result<OwnedPermit<Event>, EnqueueError> {
        match tokio::time::timeout(timeout, self.tx.clone().reserve_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(EnqueueError::Closed),
            Err(_) => Err(EnqueueError::Full),
        }
    }

    pub(crate) async fn enqueue(&self, event: Event, timeout: Duration) -> Result<(), EnqueueError> {
        let permit = self.reserve(timeout).await?;
        let _ = permit.send(event);
        Ok(())
    }
}

/// Receiving half of an inbox. Exclusively owned by one runtime (or, for
/// external principals such as `human`, by the embedding program).
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Event>,
    buffered: VecDeque<Event>,
}

impl Inbox {
    /// Move everything already delivered into the replay buffer without
    /// blocking.
    fn pull_pending(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.buffered.push_back(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Next event in arrival order. Returns `None` once the sender side is
    /// gone and the buffer is empty.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.buffered.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    /// Next event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.pull_pending();
        self.buffered.pop_front()
    }

    /// Oldest unread [`Message`], waiting for one to arrive. Non-message
    /// events encountered on the way stay buffered in order.
    pub async fn next_message(&mut self) -> Option<Message> {
        loop {
            if let Some(pos) = self
                .buffered
                .iter()
                .position(|e| matches!(e, Event::Message(_)))
            {
                return self.buffered.remove(pos).and_then(Event::into_message);
            }
            match self.rx.recv().await {
                Some(event) => self.buffered.push_back(event),
                None => return None,
            }
        }
    }

    /// The service response correlated with `invocation_id`, waiting for it
    /// to arrive. Everything else stays buffered.
    pub async fn next_response(&mut self, invocation_id: &InvocationId) -> Option<ServiceResponse> {
        loop {
            if let Some(pos) = self.buffered.iter().position(
                |e| matches!(e, Event::TeamServiceResponse(r) if &r.reply_to == invocation_id),
            ) {
                return match self.buffered.remove(pos) {
                    Some(Event::TeamServiceResponse(response)) => Some(response),
                    _ => None,
                };
            }
            match self.rx.recv().await {
                Some(event) => self.buffered.push_back(event),
                None => return None,
            }
        }
    }

    /// Copies of all unread events, oldest first. Non-destructive.
    pub fn unread(&mut self) -> Vec<Event> {
        self.pull_pending();
        self.buffered.iter().cloned().collect()
    }

    /// Copies of all unread messages, oldest first. Non-destructive.
    pub fn unread_messages(&mut self) -> Vec<Message> {
        self.pull_pending();
        self.buffered
            .iter()
            .filter_map(|e| e.as_message().cloned())
            .collect()
    }

    /// Remove and return all unread messages, oldest first. Other events
    /// stay buffered.
    pub fn take_messages(&mut self) -> Vec<Message> {
        self.pull_pending();
        let mut messages = Vec::new();
        let mut rest = VecDeque::with_capacity(self.buffered.len());
        for event in self.buffered.drain(..) {
            match event {
                Event::Message(message) => messages.push(message),
                other => rest.push_back(other),
            }
        }
        self.buffered = rest;
        messages
    }

    /// Whether an unread message is queued.
    pub fn has_message(&mut self) -> bool {
        self.pull_pending();
        self.buffered
            .iter()
            .any(|e| matches!(e, Event::Message(_)))
    }

    /// Close the inbox and return everything still undelivered.
    pub fn drain(&mut self) -> Vec<Event> {
        self.rx.close();
        self.pull_pending();
        self.buffered.drain(..).collect()
    }
}

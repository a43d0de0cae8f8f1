//! Outbound work queue
//!
//! A transport-agnostic FIFO of send items with per-item age timeouts,
//! bounded retries, and a pluggable dispatch hook. The queue knows nothing
//! about the network: the owner supplies the dispatcher on every
//! [`tick`](MessageQueue::tick) and reports asynchronous outcomes through
//! [`complete`](MessageQueue::complete).
//!
//! Items are owned by the queue (arena style) and identified by [`ItemId`];
//! terminal completions are *returned* to the owner rather than invoked
//! in place, so the owner can map them with full access to its own state.
//! A consequence of the `&mut` receiver is that completion handling can
//! never re-enter `tick` synchronously.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Identifies one enqueued item for the lifetime of the queue.
pub type ItemId = u64;

/// Queue tunables. A value of zero disables the respective check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Additional attempts after the first. Zero means try once, never retry.
    pub max_retry_count: u32,
    /// Maximum total time an item may spend in the queue (pending plus
    /// in flight) before it is failed with [`ProcessResult::Timeout`].
    pub max_message_enqueued_time_secs: u64,
    /// Maximum time a single in-flight attempt may take.
    pub max_message_processing_time_secs: u64,
}

/// Terminal result of processing one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    Success,
    Error,
    Cancelled,
    Timeout,
}

/// Outcome of one synchronous dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The item was handed off; its result arrives later via
    /// [`MessageQueue::complete`].
    Dispatched,
    /// The handoff itself failed; counts as an [`ProcessResult::Error`]
    /// attempt.
    Failed,
}

/// A finished item handed back to the queue owner. The owner must invoke
/// `callback` exactly once.
#[derive(Debug)]
pub struct Completion<M, C> {
    pub id: ItemId,
    pub message: M,
    pub callback: C,
    pub result: ProcessResult,
}

#[derive(Debug)]
struct Item<M, C> {
    id: ItemId,
    message: M,
    callback: C,
    /// Stamped on the first tick that observes the item.
    enqueued_at: Option<Instant>,
    attempts: u32,
    dispatched_at: Option<Instant>,
}

impl<M, C> Item<M, C> {
    fn into_completion(self, result: ProcessResult) -> Completion<M, C> {
        Completion {
            id: self.id,
            message: self.message,
            callback: self.callback,
            result,
        }
    }
}

/// FIFO work queue with age timeouts and bounded retry.
///
/// Generic over the message type `M` and an opaque completion payload `C`
/// (typically the caller's boxed callback); the queue never invokes `C`.
#[derive(Debug)]
pub struct MessageQueue<M, C> {
    options: QueueOptions,
    pending: VecDeque<Item<M, C>>,
    in_flight: VecDeque<Item<M, C>>,
    next_id: ItemId,
}

impl<M, C> MessageQueue<M, C> {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Appends an item to the pending list.
    pub fn enqueue(&mut self, message: M, callback: C) -> ItemId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.push_back(Item {
            id,
            message,
            callback,
            enqueued_at: None,
            attempts: 0,
            dispatched_at: None,
        });
        id
    }

    /// True iff both the pending and in-flight lists are empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// One cooperative turn: expire aged items, then dispatch while no item
    /// is in flight. Dispatch is single-item-at-a-time, which preserves
    /// FIFO enqueue-to-complete order per item.
    ///
    /// Returns every item that reached a terminal result this turn; the
    /// caller must invoke each completion's callback exactly once.
    pub fn tick(
        &mut self,
        now: Instant,
        mut dispatch: impl FnMut(ItemId, &M) -> DispatchOutcome,
    ) -> Vec<Completion<M, C>> {
        let mut completions = self.expire(now);

        // Each pending item gets at most one dispatch attempt per tick.
        let mut budget = self.pending.len();
        while self.in_flight.is_empty() && budget > 0 {
            budget -= 1;
            let Some(mut item) = self.pending.pop_front() else {
                break;
            };
            item.dispatched_at = Some(now);
            match dispatch(item.id, &item.message) {
                DispatchOutcome::Dispatched => {
                    self.in_flight.push_back(item);
                }
                DispatchOutcome::Failed => {
                    item.dispatched_at = None;
                    if item.attempts < self.options.max_retry_count {
                        item.attempts += 1;
                        debug!(id = item.id, attempts = item.attempts, "dispatch failed, requeued");
                        self.pending.push_front(item);
                        break;
                    }
                    completions.push(item.into_completion(ProcessResult::Error));
                }
            }
        }

        completions
    }

    /// Reports the asynchronous outcome of an in-flight item.
    ///
    /// An `Error` outcome with retries remaining puts the item back at the
    /// head of pending and returns `None`; any other outcome (or exhausted
    /// retries) yields the terminal completion.
    pub fn complete(&mut self, id: ItemId, result: ProcessResult) -> Option<Completion<M, C>> {
        let position = self.in_flight.iter().position(|item| item.id == id)?;
        let mut item = self.in_flight.remove(position)?;

        if result == ProcessResult::Error && item.attempts < self.options.max_retry_count {
            item.attempts += 1;
            item.dispatched_at = None;
            debug!(id = item.id, attempts = item.attempts, "processing failed, requeued");
            self.pending.push_front(item);
            return None;
        }

        Some(item.into_completion(result))
    }

    /// Returns every in-flight item to the head of the pending list,
    /// preserving original FIFO order. Used on stop; attempt counts are
    /// kept so a restarted messenger does not reset retry budgets.
    pub fn move_all_in_flight_back_to_pending(&mut self) {
        while let Some(mut item) = self.in_flight.pop_back() {
            item.dispatched_at = None;
            self.pending.push_front(item);
        }
    }

    /// Empties the queue, yielding every remaining item with the given
    /// terminal result. Used on teardown.
    pub fn drain(&mut self, result: ProcessResult) -> Vec<Completion<M, C>> {
        self.pending
            .drain(..)
            .chain(self.in_flight.drain(..))
            .map(|item| item.into_completion(result))
            .collect()
    }

    pub fn set_max_enqueued_time(&mut self, secs: u64) {
        self.options.max_message_enqueued_time_secs = secs;
    }

    pub fn options(&self) -> QueueOptions {
        self.options.clone()
    }

    pub fn set_options(&mut self, options: QueueOptions) {
        self.options = options;
    }

    /// Stamps fresh items and completes any whose age or processing budget
    /// is exhausted.
    fn expire(&mut self, now: Instant) -> Vec<Completion<M, C>> {
        for item in self.pending.iter_mut().chain(self.in_flight.iter_mut()) {
            if item.enqueued_at.is_none() {
                item.enqueued_at = Some(now);
            }
        }

        let mut expired = Vec::new();

        let enqueued_limit = self.options.max_message_enqueued_time_secs;
        if enqueued_limit > 0 {
            let limit = Duration::from_secs(enqueued_limit);
            let aged_out = |item: &Item<M, C>| {
                item.enqueued_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= limit)
            };
            Self::extract(&mut self.pending, &mut expired, aged_out);
            Self::extract(&mut self.in_flight, &mut expired, aged_out);
        }

        let processing_limit = self.options.max_message_processing_time_secs;
        if processing_limit > 0 {
            let limit = Duration::from_secs(processing_limit);
            let overdue = |item: &Item<M, C>| {
                item.dispatched_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= limit)
            };
            Self::extract(&mut self.in_flight, &mut expired, overdue);
        }

        expired
            .into_iter()
            .map(|item| item.into_completion(ProcessResult::Timeout))
            .collect()
    }

    fn extract(
        list: &mut VecDeque<Item<M, C>>,
        out: &mut Vec<Item<M, C>>,
        mut pick: impl FnMut(&Item<M, C>) -> bool,
    ) {
        let mut index = 0;
        while index < list.len() {
            if pick(&list[index]) {
                if let Some(item) = list.remove(index) {
                    out.push(item);
                }
            } else {
                index += 1;
            }
        }
    }
}

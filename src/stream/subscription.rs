//! Per-subscription delivery state machine.
//!
//! A [`Subscription`] tracks the last delivered offset of one stream
//! partition, detects gaps, and buffers live traffic while a resend is in
//! flight. It never talks to the wire; the owning client drains
//! [`SubscriptionEvent`]s after each call and reacts to them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::stream::proto::{ProtocolError, ResendDirective, ResendOptions, StreamMessage};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique subscription id, sent on the wire as a string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Callback receiving the parsed content and the raw message.
pub type MessageHandler = Arc<dyn Fn(&Value, &StreamMessage) + Send + Sync>;

/// Delivery state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// Notification produced by a subscription.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    StateChanged(SubscriptionState),
    /// Offsets `from..=to` are missing; a resend should be requested.
    Gap { from: u64, to: u64 },
    /// End-of-stream marker was delivered.
    Done,
    Resending,
    Resent,
    NoResend,
    /// Content error routed to this subscription.
    Error(Arc<ProtocolError>),
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("stream id is required")]
    MissingStreamId,

    #[error("api key is required")]
    MissingApiKey,
}

pub struct Subscription {
    id: SubscriptionId,
    stream_id: String,
    partition: u32,
    api_key: SecretString,
    handler: MessageHandler,
    resend: ResendOptions,
    queue: VecDeque<StreamMessage>,
    state: SubscriptionState,
    state_tx: watch::Sender<SubscriptionState>,
    resending: bool,
    last_received_offset: Option<u64>,
    resend_on_subscribed: bool,
    events: Vec<SubscriptionEvent>,
}

impl Subscription {
    pub fn new(
        stream_id: impl Into<String>,
        partition: u32,
        api_key: SecretString,
        handler: MessageHandler,
        resend: ResendOptions,
    ) -> Result<Self, SubscriptionError> {
        let stream_id = stream_id.into();
        if stream_id.trim().is_empty() {
            return Err(SubscriptionError::MissingStreamId);
        }
        if api_key.expose_secret().trim().is_empty() {
            return Err(SubscriptionError::MissingApiKey);
        }

        let (state_tx, _) = watch::channel(SubscriptionState::Unsubscribed);
        Ok(Self {
            id: SubscriptionId::next(),
            stream_id,
            partition,
            api_key,
            handler,
            resend,
            queue: VecDeque::new(),
            state: SubscriptionState::Unsubscribed,
            state_tx,
            resending: false,
            last_received_offset: None,
            resend_on_subscribed: false,
            events: Vec::new(),
        })
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn api_key(&self) -> &SecretString {
        &self.api_key
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state_tx.subscribe()
    }

    pub fn is_resending(&self) -> bool {
        self.resending
    }

    pub fn last_received_offset(&self) -> Option<u64> {
        self.last_received_offset
    }

    pub fn resend_options(&self) -> &ResendOptions {
        &self.resend
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn set_state(&mut self, state: SubscriptionState) {
        if self.state == state {
            return;
        }
        debug!(
            event = "subscription_state",
            sub_id = %self.id,
            stream_id = %self.stream_id,
            from = ?self.state,
            to = ?state
        );
        self.state = state;
        self.state_tx.send_replace(state);
        if state == SubscriptionState::Unsubscribed {
            self.resending = false;
        }
        self.events.push(SubscriptionEvent::StateChanged(state));
    }

    pub fn set_resending(&mut self, resending: bool) {
        self.resending = resending;
    }

    pub fn has_resend_option(&self) -> bool {
        self.resend.is_set()
    }

    /// Options to use when (re)subscribing. Once anything has been
    /// delivered, open-ended directives resume right after the last offset.
    pub fn effective_resend_options(&self) -> ResendOptions {
        match (self.last_received_offset, self.resend.directive()) {
            (
                Some(last),
                Some(ResendDirective::All | ResendDirective::From(_) | ResendDirective::FromTime(_)),
            ) => ResendOptions::from_offset(last + 1),
            _ => self.resend.clone(),
        }
    }

    pub fn handle_message(&mut self, message: StreamMessage, is_resend: bool) {
        if self.resending && !is_resend {
            self.queue.push_back(message);
            return;
        }

        if !self.resending {
            if let Some((from, to)) = self.detect_gap(message.previous_offset) {
                debug!(event = "subscription_gap", sub_id = %self.id, from, to);
                self.queue.push_back(message);
                // Buffer everything behind the gap until the resend completes.
                self.resending = true;
                self.events.push(SubscriptionEvent::Gap { from, to });
                return;
            }
        }

        if let Some(last) = self.last_received_offset {
            if message.offset <= last {
                debug!(
                    event = "subscription_duplicate",
                    sub_id = %self.id,
                    offset = message.offset,
                    last
                );
                return;
            }
        }

        self.last_received_offset = Some(message.offset);
        match message.parsed_content() {
            Ok(content) => {
                (self.handler)(content, &message);
                if message.is_bye() {
                    self.events.push(SubscriptionEvent::Done);
                }
            }
            Err(err) => self.events.push(SubscriptionEvent::Error(Arc::new(err))),
        }
    }

    /// Replays buffered messages in arrival order.
    pub fn check_queue(&mut self) {
        let pending = std::mem::take(&mut self.queue);
        for message in pending {
            self.handle_message(message, false);
        }
    }

    /// Adopts the offset of an unparseable message when it does not open a
    /// gap, then reports the error.
    pub fn handle_error(&mut self, error: Arc<ProtocolError>) {
        if let ProtocolError::InvalidJson { message, .. } = error.as_ref() {
            if self.detect_gap(message.previous_offset).is_none() {
                self.last_received_offset = Some(message.offset);
            }
        }
        self.events.push(SubscriptionEvent::Error(error));
    }

    pub fn on_resending(&mut self) {
        self.events.push(SubscriptionEvent::Resending);
    }

    pub fn on_resent(&mut self) {
        self.events.push(SubscriptionEvent::Resent);
        self.resending = false;
        self.check_queue();
    }

    pub fn on_no_resend(&mut self) {
        self.events.push(SubscriptionEvent::NoResend);
        self.resending = false;
        self.check_queue();
    }

    /// A lost connection cannot stay subscribed.
    pub fn on_disconnected(&mut self) {
        self.set_state(SubscriptionState::Unsubscribed);
        self.resending = false;
    }

    pub(crate) fn arm_resend_on_subscribed(&mut self) {
        self.resend_on_subscribed = true;
    }

    pub(crate) fn take_resend_on_subscribed(&mut self) -> bool {
        std::mem::take(&mut self.resend_on_subscribed)
    }

    pub fn take_events(&mut self) -> Vec<SubscriptionEvent> {
        std::mem::take(&mut self.events)
    }

    fn detect_gap(&self, previous_offset: Option<u64>) -> Option<(u64, u64)> {
        match (previous_offset, self.last_received_offset) {
            (Some(previous), Some(last)) if previous > last => Some((last + 1, previous)),
            _ => None,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("partition", &self.partition)
            .field("state", &self.state)
            .field("resending", &self.resending)
            .field("last_received_offset", &self.last_received_offset)
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use secrecy::SecretString;
    use serde_json::{json, Value};

    use super::{
        MessageHandler, Subscription, SubscriptionError, SubscriptionEvent, SubscriptionState,
    };
    use crate::stream::proto::{
        Content, ProtocolError, ResendDirective, ResendOptions, StreamMessage,
    };

    fn recording_handler() -> (MessageHandler, Arc<Mutex<Vec<u64>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let handler: MessageHandler = Arc::new(move |_content: &Value, message: &StreamMessage| {
            sink.lock().expect("delivered lock").push(message.offset);
        });
        (handler, delivered)
    }

    fn subscription(resend: ResendOptions) -> (Subscription, Arc<Mutex<Vec<u64>>>) {
        let (handler, delivered) = recording_handler();
        let sub = Subscription::new("s1", 0, SecretString::new("key".to_string()), handler, resend)
            .expect("subscription");
        (sub, delivered)
    }

    fn message(offset: u64, previous_offset: Option<u64>) -> StreamMessage {
        StreamMessage::new(
            "s1",
            0,
            1_000 + offset as i64,
            offset,
            previous_offset,
            Content::Json(json!({"n": offset})),
        )
    }

    fn delivered(log: &Arc<Mutex<Vec<u64>>>) -> Vec<u64> {
        log.lock().expect("delivered lock").clone()
    }

    fn gaps(events: &[SubscriptionEvent]) -> Vec<(u64, u64)> {
        events
            .iter()
            .filter_map(|event| match event {
                SubscriptionEvent::Gap { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn chained_messages_are_delivered_once_in_order() {
        let (mut sub, log) = subscription(ResendOptions::default());
        sub.handle_message(message(1, None), false);
        for offset in 2..=5 {
            sub.handle_message(message(offset, Some(offset - 1)), false);
        }

        assert_eq!(delivered(&log), vec![1, 2, 3, 4, 5]);
        assert_eq!(sub.last_received_offset(), Some(5));
        assert!(sub.take_events().is_empty());
    }

    #[test]
    fn redelivered_offsets_are_ignored() {
        let (mut sub, log) = subscription(ResendOptions::default());
        sub.handle_message(message(1, None), false);
        sub.handle_message(message(2, Some(1)), false);
        sub.handle_message(message(2, Some(1)), false);
        sub.handle_message(message(1, None), false);

        assert_eq!(delivered(&log), vec![1, 2]);
    }

    #[test]
    fn gap_buffers_until_resend_completes() {
        let (mut sub, log) = subscription(ResendOptions::default());
        sub.handle_message(message(1, None), false);
        sub.handle_message(message(5, Some(4)), false);

        assert_eq!(delivered(&log), vec![1]);
        assert!(sub.is_resending());
        assert_eq!(gaps(&sub.take_events()), vec![(2, 4)]);

        // Live traffic during the resend is deferred.
        sub.handle_message(message(6, Some(5)), false);
        for offset in 2..=4 {
            sub.handle_message(message(offset, Some(offset - 1)), true);
        }
        assert_eq!(delivered(&log), vec![1, 2, 3, 4]);
        assert_eq!(sub.queued_len(), 2);

        sub.on_resent();
        assert_eq!(delivered(&log), vec![1, 2, 3, 4, 5, 6]);
        assert!(!sub.is_resending());
        assert_eq!(sub.queued_len(), 0);
        assert!(gaps(&sub.take_events()).is_empty());
    }

    #[test]
    fn no_resend_replays_buffer_and_reports_remaining_gap_once() {
        let (mut sub, log) = subscription(ResendOptions::default());
        sub.handle_message(message(1, None), false);
        sub.handle_message(message(5, Some(4)), false);
        sub.handle_message(message(6, Some(5)), false);
        assert_eq!(gaps(&sub.take_events()), vec![(2, 4)]);

        sub.on_no_resend();
        let events = sub.take_events();
        assert!(matches!(events.first(), Some(SubscriptionEvent::NoResend)));
        assert_eq!(gaps(&events), vec![(2, 4)]);
        assert_eq!(delivered(&log), vec![1]);
        assert_eq!(sub.queued_len(), 2);
    }

    #[test]
    fn effective_resend_options_resume_after_last_offset() {
        for options in [
            ResendOptions::all(),
            ResendOptions::from_offset(0),
            ResendOptions::from_time(1_000),
        ] {
            let (mut sub, _) = subscription(options.clone());
            assert_eq!(sub.effective_resend_options(), options);
            sub.handle_message(message(10, None), false);
            assert_eq!(
                sub.effective_resend_options().directive(),
                Some(ResendDirective::From(11))
            );
        }

        let (mut sub, _) = subscription(ResendOptions::last(5));
        sub.handle_message(message(10, None), false);
        assert_eq!(sub.effective_resend_options(), ResendOptions::last(5));

        let (mut sub, _) = subscription(ResendOptions::default());
        sub.handle_message(message(10, None), false);
        assert!(!sub.effective_resend_options().is_set());
        assert!(!sub.has_resend_option());
    }

    #[test]
    fn content_error_adopts_offset_when_contiguous() {
        let (mut sub, log) = subscription(ResendOptions::default());
        sub.handle_message(message(1, None), false);

        let broken = StreamMessage::new("s1", 0, 2, 2, Some(1), Content::Text("{oops".into()));
        let error = broken.parsed_content().expect_err("invalid json");
        sub.handle_error(Arc::new(error));
        assert_eq!(sub.last_received_offset(), Some(2));

        let events = sub.take_events();
        assert!(matches!(
            events.as_slice(),
            [SubscriptionEvent::Error(error)] if matches!(**error, ProtocolError::InvalidJson { .. })
        ));

        sub.handle_message(message(3, Some(2)), false);
        assert_eq!(delivered(&log), vec![1, 3]);
    }

    #[test]
    fn content_error_behind_a_gap_keeps_offset() {
        let (mut sub, _) = subscription(ResendOptions::default());
        sub.handle_message(message(1, None), false);

        let broken = StreamMessage::new("s1", 0, 9, 9, Some(8), Content::Text("{oops".into()));
        let error = broken.parsed_content().expect_err("invalid json");
        sub.handle_error(Arc::new(error));
        assert_eq!(sub.last_received_offset(), Some(1));
    }

    #[test]
    fn bye_marker_emits_done() {
        let (mut sub, log) = subscription(ResendOptions::default());
        let bye = StreamMessage::new("s1", 0, 1, 1, None, Content::Json(json!({"_bye": true})));
        sub.handle_message(bye, false);

        assert_eq!(delivered(&log), vec![1]);
        assert!(matches!(
            sub.take_events().as_slice(),
            [SubscriptionEvent::Done]
        ));
    }

    #[test]
    fn state_changes_are_observable() {
        let (mut sub, _) = subscription(ResendOptions::default());
        let watch = sub.watch_state();

        sub.set_state(SubscriptionState::Subscribing);
        sub.set_state(SubscriptionState::Subscribed);
        sub.set_state(SubscriptionState::Subscribed);
        assert_eq!(*watch.borrow(), SubscriptionState::Subscribed);

        sub.set_resending(true);
        sub.on_disconnected();
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
        assert!(!sub.is_resending());

        let states: Vec<_> = sub
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                SubscriptionEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SubscriptionState::Subscribing,
                SubscriptionState::Subscribed,
                SubscriptionState::Unsubscribed,
            ]
        );
    }

    #[test]
    fn construction_requires_stream_and_key() {
        let (handler, _) = recording_handler();
        let error = Subscription::new(
            "",
            0,
            SecretString::new("key".to_string()),
            Arc::clone(&handler),
            ResendOptions::default(),
        )
        .expect_err("missing stream");
        assert!(matches!(error, SubscriptionError::MissingStreamId));

        let error = Subscription::new(
            "s1",
            0,
            SecretString::new(String::new()),
            handler,
            ResendOptions::default(),
        )
        .expect_err("missing key");
        assert!(matches!(error, SubscriptionError::MissingApiKey));
    }

    #[test]
    fn ids_are_unique() {
        let (first, _) = subscription(ResendOptions::default());
        let (second, _) = subscription(ResendOptions::default());
        assert_ne!(first.id(), second.id());
    }
}

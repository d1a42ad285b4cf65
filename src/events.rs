//! Session notification channel.
//!
//! The engine thread emits `SessionEvent`s through an `EventHub`, which fans
//! them out to registered `SessionObserver`s (called synchronously on the
//! engine thread, in order) and to an `EventFeed`. The feed keeps a bounded
//! history so a subscriber attaching mid-session first receives what it
//! missed, then live events.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::prompt::PromptKind;
use crate::results::{RunSummary, StepResult};
use crate::session::SessionStatus;

/// Events retained for late subscribers.
pub const DEFAULT_HISTORY: usize = 1024;

/// A detected application prompt awaiting an answer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PromptEvent {
    pub session_id: String,
    /// Step in flight when the prompt appeared.
    pub step: Option<String>,
    pub kind: PromptKind,
    /// Trailing window, ANSI-stripped and deduplicated.
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        status: SessionStatus,
    },
    StepStarted {
        index: usize,
        name: String,
        command: String,
    },
    /// Raw channel output, in arrival order.
    Output {
        step: Option<String>,
        chunk: String,
    },
    PromptDetected(PromptEvent),
    /// A configured step input answered a prompt. The value is not carried.
    AutoAnswered {
        step: String,
        prompt: String,
    },
    /// Externally supplied input was written. Only the length is carried.
    InputSubmitted {
        step: Option<String>,
        length: usize,
    },
    StepCompleted {
        index: usize,
        result: StepResult,
    },
    SessionEnded {
        summary: RunSummary,
    },
}

/// Callbacks invoked on the engine thread for every event.
///
/// Implement `on_event` to see everything, or override the narrower hooks.
pub trait SessionObserver: Send {
    fn on_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Output { chunk, .. } => self.on_output(chunk),
            SessionEvent::PromptDetected(prompt) => self.on_prompt(prompt),
            SessionEvent::StepStarted { name, .. } => self.on_step_start(name),
            SessionEvent::StepCompleted { result, .. } => self.on_step_complete(result),
            _ => {}
        }
    }

    fn on_output(&mut self, _chunk: &str) {}
    fn on_prompt(&mut self, _prompt: &PromptEvent) {}
    fn on_step_start(&mut self, _name: &str) {}
    fn on_step_complete(&mut self, _result: &StepResult) {}
}

/// Broadcast of session events with bounded replay.
#[derive(Debug, Clone)]
pub struct EventFeed {
    inner: Arc<Mutex<FeedInner>>,
}

#[derive(Debug)]
struct FeedInner {
    history: VecDeque<SessionEvent>,
    max_history: usize,
    subscribers: Vec<Sender<SessionEvent>>,
    closed: bool,
}

impl EventFeed {
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeedInner {
                history: VecDeque::with_capacity(max_history.min(DEFAULT_HISTORY)),
                max_history,
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Receive the retained history, then live events. The receiver ends
    /// once the feed is closed.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for event in &inner.history {
            let _ = tx.send(event.clone());
        }
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        rx
    }

    pub fn publish(&self, event: SessionEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.max_history > 0 {
            if inner.history.len() >= inner.max_history {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());
        }
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Stop streaming. Existing receivers drain and end; later subscribers
    /// get the history only.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn history(&self) -> Vec<SessionEvent> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.history.iter().cloned().collect()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

/// Fan-out point owned by the engine thread.
pub struct EventHub {
    observers: Vec<Box<dyn SessionObserver>>,
    feed: EventFeed,
}

impl EventHub {
    pub fn new(observers: Vec<Box<dyn SessionObserver>>, feed: EventFeed) -> Self {
        Self { observers, feed }
    }

    pub fn emit(&mut self, event: SessionEvent) {
        for observer in &mut self.observers {
            observer.on_event(&event);
        }
        self.feed.publish(event);
    }

    pub fn feed(&self) -> &EventFeed {
        &self.feed
    }

    pub fn close(&self) {
        self.feed.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(chunk: &str) -> SessionEvent {
        SessionEvent::Output {
            step: Some("build".to_string()),
            chunk: chunk.to_string(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl SessionObserver for Recorder {
        fn on_output(&mut self, chunk: &str) {
            self.seen.lock().unwrap().push(format!("out:{chunk}"));
        }

        fn on_step_start(&mut self, name: &str) {
            self.seen.lock().unwrap().push(format!("start:{name}"));
        }
    }

    #[test]
    fn late_subscriber_gets_history_then_live_events() {
        let feed = EventFeed::new(10);
        feed.publish(output("a"));
        feed.publish(output("b"));

        let rx = feed.subscribe();
        feed.publish(output("c"));
        feed.close();

        let received: Vec<_> = rx.iter().collect();
        assert_eq!(received, vec![output("a"), output("b"), output("c")]);
    }

    #[test]
    fn subscribing_after_close_replays_and_ends() {
        let feed = EventFeed::new(10);
        feed.publish(output("a"));
        feed.close();
        let rx = feed.subscribe();
        assert_eq!(rx.iter().count(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let feed = EventFeed::new(2);
        for chunk in ["a", "b", "c"] {
            feed.publish(output(chunk));
        }
        assert_eq!(feed.history(), vec![output("b"), output("c")]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let feed = EventFeed::new(0);
        drop(feed.subscribe());
        feed.publish(output("a"));
        assert!(feed.history().is_empty());
        assert!(feed.inner.lock().unwrap().subscribers.is_empty());
    }

    #[test]
    fn hub_dispatches_to_narrow_hooks() {
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let mut hub = EventHub::new(vec![Box::new(recorder)], EventFeed::default());

        hub.emit(SessionEvent::StepStarted {
            index: 0,
            name: "build".to_string(),
            command: "make".to_string(),
        });
        hub.emit(output("cc main.c"));
        hub.emit(SessionEvent::StatusChanged {
            status: SessionStatus::Running,
        });

        assert_eq!(*seen.lock().unwrap(), vec!["start:build", "out:cc main.c"]);
        assert_eq!(hub.feed().history().len(), 3);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&SessionEvent::InputSubmitted {
            step: None,
            length: 7,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"input_submitted","step":null,"length":7}"#);

        let prompt = SessionEvent::PromptDetected(PromptEvent {
            session_id: "s1".to_string(),
            step: Some("migrate".to_string()),
            kind: PromptKind::Confirmation,
            prompt: "Continue? [y/N]".to_string(),
            timestamp: Utc::now(),
        });
        let json = serde_json::to_string(&prompt).unwrap();
        assert!(json.contains(r#""type":"prompt_detected""#));
        assert!(json.contains(r#""kind":"confirmation""#));
    }
}

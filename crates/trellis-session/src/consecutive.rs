//! Handlers for two adjacent user messages.
//!
//! A handler receives the session, the previous user event (already in the
//! log) and the incoming one. It may edit `session.events` in place and
//! returns whether the incoming event is appended. Returning `false` drops
//! only the incoming event.

use std::sync::Arc;

use trellis_core::{Choice, Event, Message, Response, AUTHOR_SYSTEM};

use crate::session::Session;

/// `(session, prev, curr) -> keep curr`
pub type ConsecutiveUserHandler = Arc<dyn Fn(&mut Session, &Event, &Event) -> bool + Send + Sync>;

/// Content of the synthetic assistant turn inserted between two user turns.
pub const INTERRUPTED_PLACEHOLDER: &str = "[Connection interrupted]";

/// Insert an assistant placeholder after `prev`; keep `curr`.
pub fn insert_placeholder(session: &mut Session, prev: &Event, _curr: &Event) -> bool {
    let mut placeholder = Event::new(
        prev.invocation_id.clone(),
        AUTHOR_SYSTEM,
        Some(Response {
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(INTERRUPTED_PLACEHOLDER),
                finish_reason: Some("error".to_string()),
            }],
            done: true,
            ..Default::default()
        }),
    );
    placeholder.parent_invocation_id = prev.parent_invocation_id.clone();
    placeholder.timestamp = prev.timestamp;
    placeholder.branch = prev.branch.clone();
    placeholder.filter_key = prev.filter_key.clone();

    let pos = session
        .events
        .iter()
        .rposition(|e| e.id == prev.id)
        .map(|p| p + 1)
        .unwrap_or(session.events.len());
    session.events.insert(pos, placeholder);
    true
}

/// Drop `prev` from the log; keep `curr`.
pub fn remove_previous(session: &mut Session, prev: &Event, _curr: &Event) -> bool {
    if let Some(pos) = session.events.iter().rposition(|e| e.id == prev.id) {
        session.events.remove(pos);
    }
    true
}

/// Keep the log as is and drop `curr`.
pub fn skip_current(_session: &mut Session, _prev: &Event, _curr: &Event) -> bool {
    false
}

/// Append `curr`'s text to `prev` and drop `curr`.
pub fn merge_into_previous(session: &mut Session, prev: &Event, curr: &Event) -> bool {
    let Some(target) = session.events.iter_mut().rev().find(|e| e.id == prev.id) else {
        return true;
    };
    let addition = curr.content().to_string();
    if let Some(choice) = target.response.as_mut().and_then(|r| r.choices.first_mut()) {
        if choice.message.content.is_empty() {
            choice.message.content = addition;
        } else {
            choice.message.content = format!("{}\n{}", choice.message.content, addition);
        }
    }
    target.timestamp = curr.timestamp;
    for (k, v) in &curr.state_delta {
        target.state_delta.insert(k.clone(), v.clone());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use trellis_core::Role;

    fn session_with_user(text: &str) -> (Session, Event) {
        let mut s = Session::new("a", "u", "s");
        let mut prev = Event::user_text("inv-1", text);
        prev.branch = "root".into();
        prev.filter_key = "app/agent".into();
        s.events.push(prev.clone());
        (s, prev)
    }

    #[test]
    fn placeholder_copies_prev_identity() {
        let (mut s, prev) = session_with_user("hello");
        let curr = Event::user_text("inv-2", "again").with_timestamp(prev.timestamp + Duration::seconds(1));
        assert!(insert_placeholder(&mut s, &prev, &curr));

        let ph = &s.events[1];
        let msg = ph.first_message().unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, INTERRUPTED_PLACEHOLDER);
        assert_eq!(ph.author, AUTHOR_SYSTEM);
        assert_eq!(ph.response.as_ref().unwrap().choices[0].finish_reason.as_deref(), Some("error"));
        assert_eq!(ph.timestamp, prev.timestamp);
        assert_eq!(ph.invocation_id, "inv-1");
        assert_eq!(ph.branch, "root");
        assert_eq!(ph.filter_key, "app/agent");
    }

    #[test]
    fn remove_and_skip() {
        let (mut s, prev) = session_with_user("hello");
        let curr = Event::user_text("inv-2", "again");
        assert!(remove_previous(&mut s, &prev, &curr));
        assert!(s.events.is_empty());

        let (mut s, prev) = session_with_user("hello");
        assert!(!skip_current(&mut s, &prev, &curr));
        assert_eq!(s.events.len(), 1);
    }

    #[test]
    fn merge_joins_text() {
        let (mut s, prev) = session_with_user("hello");
        let later = Utc::now() + Duration::seconds(5);
        let curr = Event::user_text("inv-2", "world").with_timestamp(later);
        assert!(!merge_into_previous(&mut s, &prev, &curr));
        assert_eq!(s.events.len(), 1);
        assert_eq!(s.events[0].content(), "hello\nworld");
        assert_eq!(s.events[0].timestamp, later);
    }
}

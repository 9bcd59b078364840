//! Matching optimistic messages against authoritative ones
//!
//! An optimistic message carries its temporary id as idempotency token and
//! the server echoes that token back. When both sides carry a token the
//! tokens decide. Otherwise the message is matched on sender and content
//! with local and server timestamps less than the match window apart.

use std::collections::HashSet;
use std::time::Duration;
use teebox_dm::Message;

/// How an optimistic message was matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The server echoed our idempotency token
    Token,
    /// Same sender and content inside the match window. Proves only that a
    /// similar message exists, not that this send landed.
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub temp_id: String,
    pub kind: MatchKind,
}

pub fn match_kind(
    optimistic: &Message,
    authoritative: &Message,
    window: Duration,
) -> Option<MatchKind> {
    if let (Some(ours), Some(theirs)) = (
        optimistic.idempotency_token.as_deref(),
        authoritative.idempotency_token.as_deref(),
    ) {
        return (ours == theirs).then_some(MatchKind::Token);
    }

    let similar = optimistic.sender_id == authoritative.sender_id
        && optimistic.content == authoritative.content
        && optimistic.timestamp.abs_diff(authoritative.timestamp) < window.as_millis() as u64;
    similar.then_some(MatchKind::Heuristic)
}

pub fn confirms(optimistic: &Message, authoritative: &Message, window: Duration) -> bool {
    match_kind(optimistic, authoritative, window).is_some()
}

/// Drop every pending message confirmed by `authoritative`. Each
/// authoritative message confirms at most one pending message.
pub fn reconcile(
    pending: &mut Vec<Message>,
    authoritative: &[Message],
    window: Duration,
) -> Vec<Confirmation> {
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut confirmed = Vec::new();

    pending.retain(|optimistic| {
        let matched = authoritative.iter().find_map(|a| {
            if claimed.contains(a.id.as_str()) {
                return None;
            }
            match_kind(optimistic, a, window).map(|kind| (a, kind))
        });
        match matched {
            Some((a, kind)) => {
                claimed.insert(a.id.as_str());
                confirmed.push(Confirmation {
                    temp_id: optimistic.id.clone(),
                    kind,
                });
                false
            }
            None => true,
        }
    });

    confirmed
}

/// Insert or replace messages by id, keeping chronological order
pub fn merge_by_id(buffer: &mut Vec<Message>, incoming: Vec<Message>) {
    for message in incoming {
        match buffer.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => buffer.push(message),
        }
    }
    sort_chronologically(buffer);
}

pub fn sort_chronologically(buffer: &mut [Message]) {
    buffer.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

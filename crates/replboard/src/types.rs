use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Index of a replica in the fixed, ID-ordered peer list
pub type ReplicaId = usize;

/// Sequence number issued by a sequencer or a delivery wrapper
pub type SequenceNumber = u64;

/// Who issued a request.
///
/// On the wire this is the `MYID` field: `-1` for clients, the replica index
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Origin {
    Client,
    Replica(ReplicaId),
}

impl Origin {
    pub fn is_client(&self) -> bool {
        matches!(self, Origin::Client)
    }

    pub fn replica(&self) -> Option<ReplicaId> {
        match self {
            Origin::Client => None,
            Origin::Replica(id) => Some(*id),
        }
    }
}

impl From<i64> for Origin {
    fn from(id: i64) -> Self {
        if id < 0 {
            Origin::Client
        } else {
            Origin::Replica(id as ReplicaId)
        }
    }
}

impl From<Origin> for i64 {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Client => -1,
            Origin::Replica(id) => id as i64,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Client => write!(f, "client"),
            Origin::Replica(id) => write!(f, "replica {}", id),
        }
    }
}

/// Vector timestamp, one counter per replica indexed by replica ID
///
/// Serialized as a plain JSON array, e.g. `[2, 0, 1]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorTime(Vec<u64>);

impl VectorTime {
    /// All-zero vector for a cluster of `replicas` members
    pub fn new(replicas: usize) -> Self {
        Self(vec![0; replicas])
    }

    pub fn from_counters(counters: Vec<u64>) -> Self {
        Self(counters)
    }

    pub fn counters(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Counter for a replica; missing entries read as zero
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    fn width(&self, other: &VectorTime) -> usize {
        self.0.len().max(other.0.len())
    }

    /// True iff every component of `self` is <= the matching one in `other`
    pub fn less_equal(&self, other: &VectorTime) -> bool {
        (0..self.width(other)).all(|i| self.get(i) <= other.get(i))
    }

    /// True iff neither vector is causally before the other
    pub fn concurrent(&self, other: &VectorTime) -> bool {
        !self.less_equal(other) && !other.less_equal(self)
    }

    /// Deterministic cluster-wide ordering of timestamps.
    ///
    /// Equal vectors compare equal, causally related vectors follow causality,
    /// and concurrent vectors fall back to comparing components in index
    /// order.
    pub fn total_order(&self, other: &VectorTime) -> Ordering {
        let width = self.width(other);
        if (0..width).all(|i| self.get(i) == other.get(i)) {
            return Ordering::Equal;
        }
        if self.less_equal(other) {
            return Ordering::Less;
        }
        if other.less_equal(self) {
            return Ordering::Greater;
        }

        for i in 0..width {
            match self.get(i).cmp(&other.get(i)) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }

    /// Result of `owner` receiving `remote`: own counter + 1, every other
    /// counter the pointwise maximum.
    pub fn merged(&self, remote: &VectorTime, owner: ReplicaId) -> VectorTime {
        let width = self.width(remote).max(owner + 1);
        let counters = (0..width)
            .map(|i| {
                if i == owner {
                    self.get(i) + 1
                } else {
                    self.get(i).max(remote.get(i))
                }
            })
            .collect();
        VectorTime(counters)
    }

    /// Increment the counter for `owner`, growing the vector if needed
    pub fn increment(&mut self, owner: ReplicaId) -> u64 {
        if self.0.len() <= owner {
            self.0.resize(owner + 1, 0);
        }
        self.0[owner] += 1;
        self.0[owner]
    }
}

impl fmt::Display for VectorTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "[{}]", parts.join(","))
    }
}

/// One entry on the message board.
///
/// Plain text for most strategies; causal replication attaches the vector
/// timestamp of the write, which travels as `[time, text]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Timestamped(VectorTime, String),
    Text(String),
}

impl Message {
    pub fn text(&self) -> &str {
        match self {
            Message::Timestamped(_, text) | Message::Text(text) => text,
        }
    }

    pub fn time(&self) -> Option<&VectorTime> {
        match self {
            Message::Timestamped(time, _) => Some(time),
            Message::Text(_) => None,
        }
    }

    /// Same position in causal order, new payload
    pub fn with_text(&self, text: impl Into<String>) -> Message {
        match self {
            Message::Timestamped(time, _) => Message::Timestamped(time.clone(), text.into()),
            Message::Text(_) => Message::Text(text.into()),
        }
    }

    /// Board ordering. Timestamped messages come first, by timestamp and
    /// then by text; messages without a timestamp follow, by text. Only
    /// identical messages compare equal.
    pub fn total_order(&self, other: &Message) -> Ordering {
        match (self.time(), other.time()) {
            (Some(a), Some(b)) => a.total_order(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| self.text().cmp(other.text()))
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Timestamped(time, text) => write!(f, "{} {}", time, text),
            Message::Text(text) => write!(f, "{}", text),
        }
    }
}

/// Acknowledgement for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Applied (or forwarded and applied) before replying
    Done,
    /// Accepted into a local queue, applied later in protocol order
    Queued,
}

/// A board mutation that can be queued, retried, or replayed elsewhere
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Put(Message),
    Modify(usize, Message),
    Delete(usize),
    DeleteAll,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Put(_) => "PUT",
            Operation::Modify(..) => "MODIFY",
            Operation::Delete(_) => "DELETE",
            Operation::DeleteAll => "DELETEALL",
        }
    }
}

/// An operation waiting to be applied, with its ordering key if any
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub seq: Option<SequenceNumber>,
    pub op: Operation,
}

impl PendingOperation {
    pub fn new(op: Operation, seq: Option<SequenceNumber>) -> Self {
        Self { seq, op }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vt(c: &[u64]) -> VectorTime {
        VectorTime::from_counters(c.to_vec())
    }

    #[test]
    fn test_origin_wire_mapping() {
        assert_eq!(Origin::from(-1), Origin::Client);
        assert_eq!(Origin::from(3), Origin::Replica(3));
        assert_eq!(i64::from(Origin::Client), -1);
        assert_eq!(i64::from(Origin::Replica(2)), 2);
    }

    #[test]
    fn test_less_equal_and_concurrent() {
        assert!(vt(&[1, 0, 0]).less_equal(&vt(&[1, 1, 0])));
        assert!(!vt(&[1, 1, 0]).less_equal(&vt(&[1, 0, 0])));
        assert!(vt(&[2, 2]).less_equal(&vt(&[2, 2])));

        assert!(vt(&[1, 0]).concurrent(&vt(&[0, 1])));
        assert!(!vt(&[1, 0]).concurrent(&vt(&[1, 1])));
    }

    #[test]
    fn test_total_order_causal_then_lexicographic() {
        assert_eq!(vt(&[1, 2]).total_order(&vt(&[1, 2])), Ordering::Equal);
        assert_eq!(vt(&[0, 1]).total_order(&vt(&[1, 1])), Ordering::Less);
        assert_eq!(vt(&[2, 1]).total_order(&vt(&[1, 1])), Ordering::Greater);

        // concurrent: first differing component decides
        assert_eq!(vt(&[1, 0]).total_order(&vt(&[0, 1])), Ordering::Greater);
        assert_eq!(vt(&[0, 3, 1]).total_order(&vt(&[1, 0, 0])), Ordering::Less);
    }

    #[test]
    fn test_untimestamped_messages_sort_after_timestamped() {
        let early = Message::Timestamped(vt(&[1, 0]), "early".into());
        let late = Message::Timestamped(vt(&[2, 0]), "late".into());
        let plain = Message::from("plain");

        let mut one = vec![late.clone(), plain.clone(), early.clone()];
        let mut other = vec![early.clone(), plain.clone(), late.clone()];
        one.sort_by(|a, b| a.total_order(b));
        other.sort_by(|a, b| a.total_order(b));
        assert_eq!(one, vec![early.clone(), late, plain.clone()]);
        assert_eq!(one, other);

        assert_eq!(plain.total_order(&Message::from("other")), Ordering::Less);
        assert_eq!(early.total_order(&early.with_text("z")), Ordering::Less);
        assert_eq!(plain.total_order(&plain), Ordering::Equal);
    }

    #[test]
    fn test_merged_bumps_owner_once() {
        let local = vt(&[1, 0, 4]);
        let remote = vt(&[0, 5, 2]);
        assert_eq!(local.merged(&remote, 0), vt(&[2, 5, 4]));
    }

    #[test]
    fn test_message_wire_shapes() {
        let plain: Message = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(plain, Message::Text("hello".into()));

        let stamped: Message = serde_json::from_str("[[1,0],\"hi\"]").unwrap();
        assert_eq!(stamped, Message::Timestamped(vt(&[1, 0]), "hi".into()));
        assert_eq!(serde_json::to_string(&stamped).unwrap(), "[[1,0],\"hi\"]");
    }

    #[test]
    fn test_with_text_keeps_timestamp() {
        let msg = Message::Timestamped(vt(&[3, 1]), "old".into());
        let edited = msg.with_text("new");
        assert_eq!(edited.time(), Some(&vt(&[3, 1])));
        assert_eq!(edited.text(), "new");
    }
}

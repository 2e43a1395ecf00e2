//! The in-memory Raft log slice.

use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::membership::MembershipConfig;
use crate::LogIndex;
use crate::ReplicatedState;
use crate::Term;

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub enum EntryPayload<S: ReplicatedState> {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A normal entry carrying a state machine change.
    Normal(S::Change),
    /// A configuration change entry, used to reconfigure the cluster
    /// through joint consensus.
    ConfigChange(MembershipConfig),
}

/// An entry in the Raft log.
///
/// Entries carry no index of their own; an entry's index is its position in
/// the [`Log`] that holds it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub struct Entry<S: ReplicatedState> {
    /// The term in which the entry was created.
    pub term: Term,
    /// The entry's payload.
    pub payload: EntryPayload<S>,
}

/// A slice of the Raft log.
///
/// This shows up in two places: inside an append-entries request, where
/// `prev_index` and `prev_term` play the role of the consistency-check
/// coordinates, and in each member's persistent state, where they are the
/// last index and term covered by the snapshot (both zero until the log has
/// been compacted). Grouping the three together keeps both uses on one
/// type.
///
/// Indices are 1-based; `prev_index` is the index just before the first
/// entry held. Out-of-range access is a programming error and panics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub struct Log<S: ReplicatedState> {
    /// The index of the last entry before this slice.
    pub prev_index: LogIndex,
    /// The term of the entry at `prev_index`.
    pub prev_term: Term,
    /// The entries held, starting at index `prev_index + 1`.
    pub entries: VecDeque<Entry<S>>,
}

impl<S: ReplicatedState> Log<S> {
    /// Create an empty log based at the given index and term.
    pub fn new(prev_index: LogIndex, prev_term: Term) -> Self {
        Self {
            prev_index,
            prev_term,
            entries: VecDeque::new(),
        }
    }

    /// The latest index present in the log. If the log is empty, this is
    /// the index the log is based on.
    pub fn latest_index(&self) -> LogIndex {
        self.prev_index + self.entries.len() as u64
    }

    /// The term of the entry at the given index. The index must either be
    /// present in the log or be the base index.
    pub fn term_at(&self, index: LogIndex) -> Term {
        assert!(
            index >= self.prev_index,
            "log index {} precedes the log base {}",
            index,
            self.prev_index
        );
        if index == self.prev_index {
            self.prev_term
        } else {
            self.entry_at(index).term
        }
    }

    /// The entry at the given index.
    pub fn entry_at(&self, index: LogIndex) -> &Entry<S> {
        assert!(
            index > self.prev_index,
            "log index {} precedes the log base {}",
            index,
            self.prev_index
        );
        assert!(
            index <= self.latest_index(),
            "log index {} exceeds the latest index {}",
            index,
            self.latest_index()
        );
        &self.entries[(index - self.prev_index - 1) as usize]
    }

    /// Append the given entry at the tail of the log.
    pub fn append(&mut self, entry: Entry<S>) {
        self.entries.push_back(entry);
    }

    /// Remove the entry at the given index and all entries after it.
    pub fn truncate_suffix_from(&mut self, index: LogIndex) {
        assert!(
            index > self.prev_index,
            "log index {} precedes the log base {}",
            index,
            self.prev_index
        );
        assert!(
            index <= self.latest_index(),
            "log index {} exceeds the latest index {}",
            index,
            self.latest_index()
        );
        self.entries.truncate((index - self.prev_index - 1) as usize);
    }

    /// Remove the entry at the given index and all entries before it,
    /// re-basing the log at `index`.
    pub fn truncate_prefix_through(&mut self, index: LogIndex) {
        assert!(
            index > self.prev_index,
            "log index {} precedes the log base {}",
            index,
            self.prev_index
        );
        assert!(
            index <= self.latest_index(),
            "log index {} exceeds the latest index {}",
            index,
            self.latest_index()
        );
        let new_prev_term = self.term_at(index);
        self.entries.drain(..(index - self.prev_index) as usize);
        self.prev_index = index;
        self.prev_term = new_prev_term;
    }

    /// Build the slice of this log starting at `from`, for shipping in an
    /// append-entries request. `from` may be one past the latest index, in
    /// which case the slice is empty and acts as a heartbeat.
    pub fn slice_from(&self, from: LogIndex) -> Log<S> {
        assert!(
            from > self.prev_index,
            "log index {} precedes the log base {}",
            from,
            self.prev_index
        );
        assert!(
            from <= self.latest_index() + 1,
            "log index {} exceeds the latest index {} + 1",
            from,
            self.latest_index()
        );
        let mut slice = Log::new(from - 1, self.term_at(from - 1));
        slice.entries = self.entries.iter().skip((from - self.prev_index - 1) as usize).cloned().collect();
        slice
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestState;

    fn entry(term: Term, change: i64) -> Entry<TestState> {
        Entry {
            term,
            payload: EntryPayload::Normal(change),
        }
    }

    fn sample_log() -> Log<TestState> {
        let mut log = Log::new(0, 0);
        log.append(entry(1, 10));
        log.append(entry(1, 20));
        log.append(entry(2, 30));
        log.append(entry(3, 40));
        log
    }

    #[test]
    fn test_empty_log() {
        let log: Log<TestState> = Log::new(5, 2);
        assert_eq!(log.latest_index(), 5);
        assert_eq!(log.term_at(5), 2);
    }

    #[test]
    fn test_latest_index_and_term_at() {
        let log = sample_log();
        assert_eq!(log.latest_index(), 4);
        assert_eq!(log.term_at(0), 0);
        assert_eq!(log.term_at(1), 1);
        assert_eq!(log.term_at(3), 2);
        assert_eq!(log.term_at(4), 3);
    }

    #[test]
    fn test_truncate_suffix_from() {
        let mut log = sample_log();
        log.truncate_suffix_from(3);
        assert_eq!(log.latest_index(), 2);
        assert_eq!(log.term_at(2), 1);
        // Truncating at the latest index removes a single entry.
        log.truncate_suffix_from(2);
        assert_eq!(log.latest_index(), 1);
    }

    #[test]
    fn test_truncate_prefix_through() {
        let mut log = sample_log();
        log.truncate_prefix_through(3);
        assert_eq!(log.prev_index, 3);
        assert_eq!(log.prev_term, 2);
        assert_eq!(log.latest_index(), 4);
        assert_eq!(log.entry_at(4), &entry(3, 40));
    }

    #[test]
    fn test_slice_from() {
        let log = sample_log();
        let slice = log.slice_from(3);
        assert_eq!(slice.prev_index, 2);
        assert_eq!(slice.prev_term, 1);
        assert_eq!(slice.latest_index(), 4);
        assert_eq!(slice.entry_at(3), &entry(2, 30));

        // One past the latest index produces an empty heartbeat slice.
        let heartbeat = log.slice_from(5);
        assert_eq!(heartbeat.prev_index, 4);
        assert_eq!(heartbeat.prev_term, 3);
        assert!(heartbeat.entries.is_empty());
    }

    #[test]
    #[should_panic(expected = "precedes the log base")]
    fn test_term_at_before_base_panics() {
        let mut log = sample_log();
        log.truncate_prefix_through(2);
        log.term_at(1);
    }

    #[test]
    #[should_panic(expected = "exceeds the latest index")]
    fn test_entry_at_past_latest_panics() {
        let log = sample_log();
        log.entry_at(5);
    }

    #[test]
    #[should_panic(expected = "exceeds the latest index")]
    fn test_truncate_suffix_past_latest_panics() {
        let mut log = sample_log();
        log.truncate_suffix_from(5);
    }
}

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::workflow::models::{LogAvailability, LogCategory, Stage, StageLogEntry};

/// Default number of entries retained per instance before dropping oldest.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    NotFetched,
    Fetching,
    Fetched,
}

/// Bounded, per-instance history of parsed log entries.
///
/// Sequence numbers keep increasing across evictions, so `since` queries stay
/// meaningful after the oldest entries have been dropped.
#[derive(Debug)]
pub struct LogBuffer {
    instance_id: String,
    capacity: usize,
    entries: VecDeque<StageLogEntry>,
    next_seq: u64,
    state: FetchState,
    evicted: u64,
}

impl LogBuffer {
    pub fn new(instance_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            instance_id: instance_id.into(),
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            next_seq: 1,
            state: FetchState::NotFetched,
            evicted: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped to respect the capacity since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Sequence number of the newest entry, 0 when nothing was ever appended.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.back().map(|e| e.timestamp)
    }

    pub fn push(&mut self, stage: Stage, category: LogCategory, payload: Value) -> StageLogEntry {
        let entry = StageLogEntry {
            instance_id: self.instance_id.clone(),
            stage,
            seq: self.next_seq,
            timestamp: Utc::now(),
            category,
            payload,
        };
        self.next_seq += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry.clone());
        entry
    }

    /// Entries in arrival order, optionally restricted to one stage and to
    /// sequences after `since`. `limit` keeps the newest matches.
    pub fn query(
        &self,
        stage: Option<Stage>,
        since: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<StageLogEntry> {
        let matching: Vec<&StageLogEntry> = self
            .entries
            .iter()
            .filter(|e| stage.is_none_or(|s| e.stage == s))
            .filter(|e| since.is_none_or(|s| e.seq > s))
            .collect();
        let skip = limit.map_or(0, |l| matching.len().saturating_sub(l));
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn has_stage(&self, stage: Stage) -> bool {
        self.entries.iter().any(|e| e.stage == stage)
    }

    pub fn is_fetched(&self) -> bool {
        self.state == FetchState::Fetched
    }

    pub fn is_fetching(&self) -> bool {
        self.state == FetchState::Fetching
    }

    /// Returns false if a fetch is already running or has completed.
    pub fn begin_fetch(&mut self) -> bool {
        if self.state != FetchState::NotFetched {
            return false;
        }
        self.state = FetchState::Fetching;
        true
    }

    /// Return to `NotFetched` after a failed fetch so it can be retried.
    pub fn abort_fetch(&mut self) {
        if self.state == FetchState::Fetching {
            self.state = FetchState::NotFetched;
        }
    }

    pub fn finish_fetch(&mut self) {
        self.state = FetchState::Fetched;
    }

    pub fn availability(&self) -> LogAvailability {
        match self.state {
            FetchState::NotFetched => LogAvailability::NotFetched,
            FetchState::Fetching => LogAvailability::Fetching,
            FetchState::Fetched if self.entries.is_empty() => LogAvailability::Empty,
            FetchState::Fetched => LogAvailability::Populated(self.entries.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fill(buffer: &mut LogBuffer, n: usize, stage: Stage) {
        for i in 0..n {
            buffer.push(stage, LogCategory::Text, json!({ "i": i }));
        }
    }

    #[test]
    fn test_append_then_read_preserves_order() {
        let mut buffer = LogBuffer::new("wf-1", 10);
        fill(&mut buffer, 7, Stage::Build);
        let entries = buffer.query(None, None, None);
        assert_eq!(entries.len(), 7);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.payload["i"], i);
            assert_eq!(entry.seq, i as u64 + 1);
        }
    }

    #[test]
    fn test_overflow_evicts_oldest_first() {
        let capacity = 5;
        let k = 3;
        let mut buffer = LogBuffer::new("wf-1", capacity);
        fill(&mut buffer, capacity + k, Stage::Build);

        let entries = buffer.query(None, None, None);
        assert_eq!(entries.len(), capacity);
        assert_eq!(entries[0].payload["i"], k);
        assert_eq!(entries.last().unwrap().payload["i"], capacity + k - 1);
        assert_eq!(buffer.evicted(), k as u64);
        assert_eq!(buffer.last_seq(), (capacity + k) as u64);
    }

    #[test]
    fn test_query_filters() {
        let mut buffer = LogBuffer::new("wf-1", 100);
        fill(&mut buffer, 3, Stage::Plan);
        fill(&mut buffer, 4, Stage::Build);

        assert_eq!(buffer.query(Some(Stage::Plan), None, None).len(), 3);
        assert_eq!(buffer.query(Some(Stage::Build), None, None).len(), 4);
        assert!(buffer.query(Some(Stage::Test), None, None).is_empty());

        let since = buffer.query(None, Some(5), None);
        assert_eq!(since.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![6, 7]);

        let newest = buffer.query(None, None, Some(2));
        assert_eq!(newest.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![6, 7]);
        assert!(buffer.has_stage(Stage::Plan));
        assert!(!buffer.has_stage(Stage::Review));
    }

    #[test]
    fn test_not_fetched_is_distinct_from_empty() {
        let mut buffer = LogBuffer::new("wf-1", 10);
        assert_eq!(buffer.availability(), LogAvailability::NotFetched);
        assert!(!buffer.availability().is_empty());

        assert!(buffer.begin_fetch());
        assert_eq!(buffer.availability(), LogAvailability::Fetching);
        assert!(!buffer.begin_fetch());
        buffer.abort_fetch();
        assert_eq!(buffer.availability(), LogAvailability::NotFetched);
        assert!(buffer.begin_fetch());

        buffer.finish_fetch();
        assert_eq!(buffer.availability(), LogAvailability::Empty);
        assert!(buffer.availability().is_empty());

        fill(&mut buffer, 2, Stage::Test);
        assert_eq!(buffer.availability(), LogAvailability::Populated(2));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buffer = LogBuffer::new("wf-1", 0);
        fill(&mut buffer, 3, Stage::Test);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.len(), 1);
    }
}

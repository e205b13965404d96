//! In-memory image of one object's stored state.
//!
//! Both backends keep an [`ObjectData`] per object. The memory backend
//! keeps it as the source of truth, the file backend rebuilds it from the
//! object's log on first access.

use std::collections::BTreeMap;
use std::ops::Bound;

use super::traits::{
    ms_to_time, CommitBatch, CommitOutcome, Entry, ListOptions, Mutation, ObjectSummary,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ObjectData {
    pub(crate) entries: BTreeMap<String, Entry>,
    pub(crate) alarm_ms: Option<u64>,
    /// Sequence number of the last applied commit.
    pub(crate) seq: u64,
}

impl ObjectData {
    /// Empty state whose next commit is numbered `seq + 1`.
    pub(crate) fn after(seq: u64) -> Self {
        Self {
            seq,
            ..Self::default()
        }
    }

    pub(crate) fn read(&self, keys: &[String]) -> Vec<Option<Entry>> {
        keys.iter().map(|k| self.entries.get(k).cloned()).collect()
    }

    /// First failing expectation, if any.
    pub(crate) fn check(&self, batch: &CommitBatch) -> Option<CommitOutcome> {
        batch.expectations.iter().find_map(|(key, expected)| {
            let actual = self.entries.get(key).map(|e| e.version);
            (actual != *expected).then(|| CommitOutcome::Aborted {
                key: key.clone(),
                expected: *expected,
                actual,
            })
        })
    }

    /// Apply `mutations` as commit number `seq`. Returns how many existing
    /// keys were removed.
    pub(crate) fn apply(&mut self, seq: u64, mutations: &[Mutation]) -> usize {
        let mut deleted = 0;
        for mutation in mutations {
            match mutation {
                Mutation::Put { key, value } => {
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            version: seq,
                        },
                    );
                }
                Mutation::Delete { key } => {
                    if self.entries.remove(key).is_some() {
                        deleted += 1;
                    }
                }
                Mutation::DeleteAll => {
                    deleted += self.entries.len();
                    self.entries.clear();
                }
                Mutation::SetAlarm { at_ms } => {
                    self.alarm_ms = *at_ms;
                }
            }
        }
        self.seq = seq;
        deleted
    }

    /// Check then apply `batch` as the next commit.
    pub(crate) fn commit(&mut self, batch: &CommitBatch) -> CommitOutcome {
        if let Some(aborted) = self.check(batch) {
            return aborted;
        }
        let version = self.seq + 1;
        let deleted = self.apply(version, &batch.mutations);
        CommitOutcome::Committed { version, deleted }
    }

    pub(crate) fn list(&self, options: &ListOptions) -> Vec<(String, Entry)> {
        let lower = match (&options.start, &options.prefix) {
            (Some(start), Some(prefix)) if prefix > start => Bound::Included(prefix.clone()),
            (Some(start), _) => Bound::Included(start.clone()),
            (None, Some(prefix)) => Bound::Included(prefix.clone()),
            (None, None) => Bound::Unbounded,
        };
        let upper = match &options.end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };
        if let (Bound::Included(lo), Bound::Excluded(hi)) = (&lower, &upper) {
            if lo >= hi {
                return Vec::new();
            }
        }

        let limit = options.limit.unwrap_or(usize::MAX);
        let matches_prefix = |key: &String| {
            options
                .prefix
                .as_ref()
                .map_or(true, |p| key.starts_with(p.as_str()))
        };
        let range = self.entries.range::<String, _>((lower, upper));

        if options.reverse {
            range
                .rev()
                .filter(|(k, _)| matches_prefix(k))
                .take(limit)
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect()
        } else {
            range
                .filter(|(k, _)| matches_prefix(k))
                .take(limit)
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect()
        }
    }

    pub(crate) fn summary(&self) -> ObjectSummary {
        ObjectSummary {
            keys: self.entries.len(),
            alarm: self.alarm_ms.map(ms_to_time),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.alarm_ms.is_none()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn put(key: &str, value: Value) -> Mutation {
        Mutation::Put {
            key: key.into(),
            value,
        }
    }

    fn seeded() -> ObjectData {
        let mut data = ObjectData::default();
        data.commit(&CommitBatch::unconditional(vec![
            put("a", json!(1)),
            put("b/1", json!(2)),
            put("b/2", json!(3)),
            put("b/3", json!(4)),
            put("c", json!(5)),
        ]));
        data
    }

    fn keys(list: Vec<(String, Entry)>) -> Vec<String> {
        list.into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_commit_assigns_versions() {
        let mut data = ObjectData::default();
        let first = data.commit(&CommitBatch::unconditional(vec![put("a", json!(1))]));
        assert_eq!(first, CommitOutcome::Committed { version: 1, deleted: 0 });

        let second = data.commit(&CommitBatch::unconditional(vec![put("b", json!(2))]));
        assert_eq!(second, CommitOutcome::Committed { version: 2, deleted: 0 });

        let read = data.read(&["a".into(), "b".into(), "z".into()]);
        assert_eq!(read[0].as_ref().map(|e| e.version), Some(1));
        assert_eq!(read[1].as_ref().map(|e| e.version), Some(2));
        assert!(read[2].is_none());
    }

    #[test]
    fn test_failed_expectation_applies_nothing() {
        let mut data = seeded();
        let before = data.clone();

        let outcome = data.commit(&CommitBatch {
            expectations: vec![("a".into(), Some(99))],
            mutations: vec![put("a", json!(100)), Mutation::DeleteAll],
        });

        assert_eq!(
            outcome,
            CommitOutcome::Aborted {
                key: "a".into(),
                expected: Some(99),
                actual: Some(1),
            }
        );
        assert_eq!(data, before);
    }

    #[test]
    fn test_expect_absent() {
        let mut data = seeded();
        let ok = data.commit(&CommitBatch {
            expectations: vec![("fresh".into(), None)],
            mutations: vec![put("fresh", json!(true))],
        });
        assert!(matches!(ok, CommitOutcome::Committed { .. }));

        let again = data.commit(&CommitBatch {
            expectations: vec![("fresh".into(), None)],
            mutations: vec![put("fresh", json!(false))],
        });
        assert!(matches!(again, CommitOutcome::Aborted { .. }));
    }

    #[test]
    fn test_delete_counts_existing_keys() {
        let mut data = seeded();
        let outcome = data.commit(&CommitBatch::unconditional(vec![
            Mutation::Delete { key: "a".into() },
            Mutation::Delete { key: "missing".into() },
        ]));
        assert_eq!(outcome, CommitOutcome::Committed { version: 2, deleted: 1 });

        let outcome = data.commit(&CommitBatch::unconditional(vec![Mutation::DeleteAll]));
        assert_eq!(outcome, CommitOutcome::Committed { version: 3, deleted: 4 });
        assert!(data.is_empty());
    }

    #[test]
    fn test_delete_all_keeps_alarm() {
        let mut data = seeded();
        data.commit(&CommitBatch::unconditional(vec![
            Mutation::SetAlarm { at_ms: Some(5_000) },
            Mutation::DeleteAll,
        ]));
        assert_eq!(data.summary().keys, 0);
        assert!(data.summary().alarm.is_some());
        assert!(!data.is_empty());
    }

    #[test]
    fn test_list_prefix_and_bounds() {
        let data = seeded();

        assert_eq!(
            keys(data.list(&ListOptions::new().prefix("b/"))),
            vec!["b/1", "b/2", "b/3"]
        );
        assert_eq!(
            keys(data.list(&ListOptions::new().start("b/2").end("c"))),
            vec!["b/2", "b/3"]
        );
        assert_eq!(
            keys(data.list(&ListOptions::new().prefix("b/").start("a"))),
            vec!["b/1", "b/2", "b/3"]
        );
        assert!(data.list(&ListOptions::new().start("c").end("a")).is_empty());
    }

    #[test]
    fn test_list_reverse_with_limit() {
        let data = seeded();
        assert_eq!(
            keys(data.list(&ListOptions::new().reverse(true).limit(2))),
            vec!["c", "b/3"]
        );
        assert_eq!(
            keys(data.list(&ListOptions::new().prefix("b/").reverse(true).limit(2))),
            vec!["b/3", "b/2"]
        );
    }
}

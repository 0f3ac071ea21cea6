//! Array-of-strings view over a record: `addEntry`/`removeEntry`/
//! `setEntries` compute a deterministic add/move/remove diff and delegate
//! the actual write to the underlying record's `set`.

use super::{RecordEngine, RecordInner};
use crate::error::ClientError;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum ListChange {
    EntryAdded(String, usize),
    EntryRemoved(String, usize),
    EntryMoved(String, usize),
}

pub type ListCallback = Arc<dyn Fn(&ListChange) + Send + Sync>;

pub struct ListHandle {
    record: Arc<RecordInner>,
    engine: Arc<RecordEngine>,
    listeners: Mutex<Vec<(u64, ListCallback)>>,
    next_id: AtomicU64,
}

impl ListHandle {
    pub fn new(engine: Arc<RecordEngine>, record: Arc<RecordInner>) -> Arc<Self> {
        Arc::new(ListHandle {
            record,
            engine,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn get_entries(&self) -> Vec<String> {
        to_strings(self.record.get(None))
    }

    pub fn on_change(&self, cb: ListCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().expect("listeners mutex poisoned").push((id, cb));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners.lock().expect("listeners mutex poisoned").retain(|(i, _)| *i != id);
    }

    pub fn add_entry(&self, entry: &str, index: Option<usize>) -> Result<(), ClientError> {
        let mut entries = self.get_entries();
        let at = index.unwrap_or(entries.len()).min(entries.len());
        entries.insert(at, entry.to_string());
        self.set_entries(entries)
    }

    pub fn remove_entry(&self, entry: &str, index: Option<usize>) -> Result<(), ClientError> {
        let mut entries = self.get_entries();
        match index {
            Some(i) if entries.get(i).map(String::as_str) == Some(entry) => {
                entries.remove(i);
            }
            _ => entries.retain(|e| e != entry),
        }
        self.set_entries(entries)
    }

    /// Writes the new array and reports the diff against the entries held
    /// before the call, in add-then-move-then-remove order, each keyed by
    /// the new array's index.
    pub fn set_entries(&self, new_entries: Vec<String>) -> Result<(), ClientError> {
        let old_entries = self.get_entries();
        let changes = diff(&old_entries, &new_entries);
        let json = Value::Array(new_entries.into_iter().map(Value::String).collect());
        self.engine.set(&self.record, None, json)?;
        let listeners: Vec<ListCallback> = self.listeners.lock().expect("listeners mutex poisoned").iter().map(|(_, cb)| cb.clone()).collect();
        for change in &changes {
            for cb in &listeners {
                cb(change);
            }
        }
        Ok(())
    }
}

fn to_strings(v: Value) -> Vec<String> {
    match v {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Computes the add/move/remove diff between `old` and `new`, matching
/// entries by value (not position). An entry whose index differs between
/// `old` and `new` but whose value is present in both is a move, not a
/// remove+add. Results are yielded in three grouped passes — every add,
/// then every move, then every remove — so a live list can be replayed
/// deterministically regardless of iteration order.
fn diff(old: &[String], new: &[String]) -> Vec<ListChange> {
    let mut old_positions: std::collections::HashMap<&str, Vec<usize>> = std::collections::HashMap::new();
    for (i, entry) in old.iter().enumerate() {
        old_positions.entry(entry.as_str()).or_default().push(i);
    }

    let mut consumed: std::collections::HashSet<usize> = std::collections::HashSet::new();
    let mut added = Vec::new();
    let mut moved = Vec::new();

    for (new_index, entry) in new.iter().enumerate() {
        let found_old_index = old_positions
            .get(entry.as_str())
            .and_then(|positions| positions.iter().find(|p| !consumed.contains(p)).copied());
        match found_old_index {
            Some(old_index) => {
                consumed.insert(old_index);
                if old_index != new_index {
                    moved.push(ListChange::EntryMoved(entry.clone(), new_index));
                }
            }
            None => added.push(ListChange::EntryAdded(entry.clone(), new_index)),
        }
    }

    let mut removed = Vec::new();
    for (old_index, entry) in old.iter().enumerate() {
        if !consumed.contains(&old_index) {
            removed.push(ListChange::EntryRemoved(entry.clone(), old_index));
        }
    }

    let mut changes = added;
    changes.extend(moved);
    changes.extend(removed);
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_move_remove_in_grouped_order() {
        let old = vec!["a", "b", "c", "d", "e"].into_iter().map(String::from).collect::<Vec<_>>();
        let new = vec!["c", "b", "f"].into_iter().map(String::from).collect::<Vec<_>>();
        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![
                ListChange::EntryAdded("f".to_string(), 2),
                ListChange::EntryMoved("c".to_string(), 0),
                ListChange::EntryRemoved("a".to_string(), 0),
                ListChange::EntryRemoved("d".to_string(), 3),
                ListChange::EntryRemoved("e".to_string(), 4),
            ]
        );
    }

    #[test]
    fn identical_lists_produce_no_changes() {
        let entries = vec!["x".to_string(), "y".to_string()];
        assert!(diff(&entries, &entries).is_empty());
    }

    #[test]
    fn adding_a_duplicate_of_an_existing_value_is_reported() {
        let old = vec!["a".to_string()];
        let new = vec!["a".to_string(), "a".to_string()];
        let changes = diff(&old, &new);
        assert_eq!(changes, vec![ListChange::EntryAdded("a".to_string(), 1)]);
    }

    #[test]
    fn duplicate_values_are_matched_positionally() {
        let old = vec!["a".to_string(), "a".to_string(), "b".to_string()];
        let new = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let changes = diff(&old, &new);
        assert!(changes.iter().any(|c| matches!(c, ListChange::EntryMoved(_, _))));
        assert!(!changes.iter().any(|c| matches!(c, ListChange::EntryAdded(_, _) | ListChange::EntryRemoved(_, _))));
    }
}

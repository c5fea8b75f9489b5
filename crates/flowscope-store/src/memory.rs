//! Bounded in-memory hot store
//!
//! Holds the most recent N terminal Flows plus every non-terminal Flow.
//! Readers share Flow contents through per-flow `Arc<RwLock<_>>`; the
//! creation-order index sits behind its own short-lived lock. Exactly one
//! task writes a given Flow at a time (the capture pipeline for that id).

use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;
use flowscope_core::flow::{Flow, FlowId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub type SharedFlow = Arc<RwLock<Flow>>;

pub struct MemoryStore {
    capacity: usize,
    flows: DashMap<FlowId, SharedFlow>,
    /// Creation-ordered index for reverse-chronological scans.
    order: RwLock<BTreeSet<(DateTime<Utc>, FlowId)>>,
    /// Terminal flows in creation order; eviction pops the front.
    terminal: Mutex<BTreeSet<(DateTime<Utc>, FlowId)>>,
    /// Bytes counted per flow, so re-estimates subtract what they added.
    counted_bytes: DashMap<FlowId, u64>,
    bytes_estimate: AtomicU64,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            flows: DashMap::new(),
            order: RwLock::new(BTreeSet::new()),
            terminal: Mutex::new(BTreeSet::new()),
            counted_bytes: DashMap::new(),
            bytes_estimate: AtomicU64::new(0),
        }
    }

    /// Install a new Flow. Returns the shared handle the producing task
    /// keeps for writes.
    pub fn insert(&self, flow: Flow) -> SharedFlow {
        let id = flow.id.clone();
        let created = flow.timestamps.created;
        let terminal = flow.is_terminal();
        let bytes = flow.byte_estimate() as u64;
        self.counted_bytes.insert(id.clone(), bytes);
        self.bytes_estimate.fetch_add(bytes, Ordering::Relaxed);

        let shared = Arc::new(RwLock::new(flow));
        self.flows.insert(id.clone(), shared.clone());
        self.order
            .write()
            .expect("order index poisoned")
            .insert((created, id.clone()));
        if terminal {
            self.note_terminal(created, id);
        }
        shared
    }

    pub fn get(&self, id: &str) -> Option<SharedFlow> {
        self.flows.get(id).map(|entry| entry.value().clone())
    }

    /// Immutable copy for broadcast or query results.
    pub fn snapshot(&self, id: &str) -> Option<Flow> {
        self.get(id)
            .map(|shared| shared.read().expect("flow lock poisoned").clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.flows.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Flow> {
        let (_, shared) = self.flows.remove(id)?;
        let flow = shared.read().expect("flow lock poisoned").clone();
        let key = (flow.timestamps.created, flow.id.clone());
        self.order.write().expect("order index poisoned").remove(&key);
        self.terminal.lock().expect("terminal set poisoned").remove(&key);
        self.forget_bytes(id);
        Some(flow)
    }

    fn forget_bytes(&self, id: &str) {
        if let Some((_, bytes)) = self.counted_bytes.remove(id) {
            self.bytes_estimate.fetch_sub(bytes, Ordering::Relaxed);
        }
    }

    /// Record that a Flow reached a terminal state, refresh its byte
    /// estimate, and evict beyond capacity. Non-terminal flows are never
    /// evicted.
    pub fn mark_terminal(&self, id: &str) {
        let Some(shared) = self.get(id) else {
            return;
        };
        let (created, bytes) = {
            let flow = shared.read().expect("flow lock poisoned");
            if !flow.is_terminal() {
                return;
            }
            (flow.timestamps.created, flow.byte_estimate() as u64)
        };
        // Re-estimate: the response arrived since insert
        let previous = self.counted_bytes.insert(id.to_string(), bytes).unwrap_or(0);
        self.bytes_estimate.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_estimate.fetch_sub(previous, Ordering::Relaxed);
        self.note_terminal(created, id.to_string());
    }

    fn note_terminal(&self, created: DateTime<Utc>, id: FlowId) {
        let evict: Vec<(DateTime<Utc>, FlowId)> = {
            let mut terminal = self.terminal.lock().expect("terminal set poisoned");
            terminal.insert((created, id));
            let mut evict = Vec::new();
            while terminal.len() > self.capacity {
                let oldest = terminal
                    .iter()
                    .next()
                    .cloned()
                    .expect("non-empty set has a first element");
                terminal.remove(&oldest);
                evict.push(oldest);
            }
            evict
        };
        for (created, id) in evict {
            self.flows.remove(&id);
            self.forget_bytes(&id);
            self.order
                .write()
                .expect("order index poisoned")
                .remove(&(created, id));
        }
    }

    /// Ids in reverse-chronological order, newest first.
    pub fn recent_ids(&self) -> Vec<FlowId> {
        self.order
            .read()
            .expect("order index poisoned")
            .iter()
            .rev()
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Snapshot every resident Flow, newest first.
    pub fn snapshot_all(&self) -> Vec<Flow> {
        self.recent_ids()
            .iter()
            .filter_map(|id| self.snapshot(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn terminal_len(&self) -> usize {
        self.terminal.lock().expect("terminal set poisoned").len()
    }

    /// Advisory byte counter for observability; eviction is count-based.
    pub fn bytes_estimate(&self) -> u64 {
        self.bytes_estimate.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscope_core::flow::{FlowMetadata, FlowRequest, FlowState, Message, RequestParams};

    fn test_flow(label: &str) -> Flow {
        Flow::new(
            FlowRequest {
                method: "POST".to_string(),
                path: "/v1/messages".to_string(),
                headers: vec![],
                body: serde_json::Value::Null,
                messages: vec![Message::text("user", label)],
                system: None,
                tools: None,
                model: "claude-sonnet-4".to_string(),
                original_model: None,
                params: RequestParams::default(),
                body_bytes: 32,
                created_at: Utc::now(),
            },
            FlowMetadata::for_provider("anthropic"),
        )
    }

    fn terminal_flow(label: &str) -> Flow {
        let mut flow = test_flow(label);
        flow.transition(FlowState::Completed).unwrap();
        flow
    }

    #[test]
    fn insert_and_get() {
        let store = MemoryStore::new(10);
        let flow = test_flow("a");
        let id = flow.id.clone();
        store.insert(flow);
        assert!(store.contains(&id));
        assert_eq!(store.snapshot(&id).unwrap().id, id);
    }

    #[test]
    fn evicts_oldest_terminal_beyond_capacity() {
        let store = MemoryStore::new(3);
        let mut ids = Vec::new();
        for label in ["a", "b", "c", "d"] {
            let flow = terminal_flow(label);
            ids.push(flow.id.clone());
            store.insert(flow);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(store.len(), 3);
        assert!(!store.contains(&ids[0]), "oldest terminal should be evicted");
        for id in &ids[1..] {
            assert!(store.contains(id));
        }
    }

    #[test]
    fn never_evicts_non_terminal() {
        let store = MemoryStore::new(2);
        let pending = test_flow("pending");
        let pending_id = pending.id.clone();
        store.insert(pending);
        for label in ["a", "b", "c", "d"] {
            store.insert(terminal_flow(label));
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(store.contains(&pending_id));
        assert_eq!(store.terminal_len(), 2);
    }

    #[test]
    fn mark_terminal_triggers_eviction() {
        let store = MemoryStore::new(1);
        let first = test_flow("first");
        let first_id = first.id.clone();
        let shared = store.insert(first);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = test_flow("second");
        let second_id = second.id.clone();
        let shared_second = store.insert(second);

        shared
            .write()
            .unwrap()
            .transition(FlowState::Completed)
            .unwrap();
        store.mark_terminal(&first_id);
        assert!(store.contains(&first_id));

        shared_second
            .write()
            .unwrap()
            .transition(FlowState::Completed)
            .unwrap();
        store.mark_terminal(&second_id);

        assert!(!store.contains(&first_id));
        assert!(store.contains(&second_id));
    }

    #[test]
    fn recent_ids_are_reverse_chronological() {
        let store = MemoryStore::new(10);
        let mut ids = Vec::new();
        for label in ["a", "b", "c"] {
            let flow = test_flow(label);
            ids.push(flow.id.clone());
            store.insert(flow);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let recent = store.recent_ids();
        assert_eq!(recent, ids.iter().rev().cloned().collect::<Vec<_>>());
    }

    #[test]
    fn byte_estimate_tracks_inserts_and_removals() {
        let store = MemoryStore::new(10);
        let flow = test_flow("bytes");
        let id = flow.id.clone();
        let expected = flow.byte_estimate() as u64;
        store.insert(flow);
        assert_eq!(store.bytes_estimate(), expected);
        store.remove(&id);
        assert_eq!(store.bytes_estimate(), 0);
    }
}

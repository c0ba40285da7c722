use std::collections::{HashMap, VecDeque};

use idrs_core::EndedBinding;

/// Ended bindings per session key, oldest evicted first.
///
/// At most `max_sessions` keys are tracked; past that the session whose
/// history was touched least recently is forgotten.
#[derive(Debug)]
pub struct RotationHistory {
    capacity: usize,
    max_sessions: usize,
    tick: u64,
    sessions: HashMap<String, (u64, VecDeque<EndedBinding>)>,
}

impl RotationHistory {
    pub fn new(capacity: usize, max_sessions: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_sessions: max_sessions.max(1),
            tick: 0,
            sessions: HashMap::new(),
        }
    }

    pub fn push(&mut self, ended: EndedBinding) {
        self.tick += 1;
        let key = &ended.binding.session_key;
        if !self.sessions.contains_key(key) && self.sessions.len() >= self.max_sessions {
            self.evict_stalest();
        }
        let (touched, entries) = self.sessions.entry(key.clone()).or_default();
        *touched = self.tick;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(ended);
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .sessions
            .iter()
            .min_by_key(|(_, (touched, _))| *touched)
            .map(|(key, _)| key.clone());
        if let Some(key) = stalest {
            self.sessions.remove(&key);
        }
    }

    /// Oldest first.
    pub fn for_session(&self, session_key: &str) -> Vec<EndedBinding> {
        self.sessions
            .get(session_key)
            .map(|(_, entries)| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

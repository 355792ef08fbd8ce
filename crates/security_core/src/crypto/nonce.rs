//! Bounded memory of recently used nonces

use std::collections::{HashMap, HashSet, VecDeque};

/// The last `capacity` nonces used with one key
pub(super) struct NonceWindow {
    capacity: usize,
    order: VecDeque<Vec<u8>>,
    seen: HashSet<Vec<u8>>,
}

impl NonceWindow {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record `nonce`; returns `false` if it is still in the window
    pub(super) fn insert(&mut self, nonce: &[u8]) -> bool {
        if self.seen.contains(nonce) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(nonce.to_vec());
        self.seen.insert(nonce.to_vec());
        true
    }
}

/// Nonce windows for at most `max_keys` keys. The least recently used key
/// is forgotten when a new one arrives at capacity.
pub(super) struct KeyedNonceWindows {
    max_keys: usize,
    nonce_history: usize,
    recency: VecDeque<String>,
    windows: HashMap<String, NonceWindow>,
}

impl KeyedNonceWindows {
    pub(super) fn new(max_keys: usize, nonce_history: usize) -> Self {
        Self {
            max_keys: max_keys.max(1),
            nonce_history,
            recency: VecDeque::new(),
            windows: HashMap::new(),
        }
    }

    /// Record `nonce` for `key`; returns `false` if it is still in that key's
    /// window
    pub(super) fn insert(&mut self, key: &str, nonce: &[u8]) -> bool {
        if self.windows.contains_key(key) {
            if let Some(position) = self.recency.iter().position(|k| k == key) {
                self.recency.remove(position);
            }
        } else {
            if self.windows.len() >= self.max_keys {
                if let Some(oldest) = self.recency.pop_front() {
                    self.windows.remove(&oldest);
                }
            }
            self.windows
                .insert(key.to_string(), NonceWindow::new(self.nonce_history));
        }
        self.recency.push_back(key.to_string());
        self.windows
            .get_mut(key)
            .map_or(true, |window| window.insert(nonce))
    }

    pub(super) fn len(&self) -> usize {
        self.windows.len()
    }

    pub(super) fn clear(&mut self) {
        self.recency.clear();
        self.windows.clear();
    }
}

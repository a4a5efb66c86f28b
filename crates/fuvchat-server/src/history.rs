//! Bounded public message history

use fuvchat_core::protocol::PublicMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Append-only log of public messages; the oldest entry is evicted at capacity
#[derive(Debug)]
pub struct HistoryBuffer {
    capacity: usize,
    messages: Mutex<VecDeque<PublicMessage>>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn append(&self, message: PublicMessage) {
        let mut messages = self.messages.lock();
        messages.push_back(message);
        while messages.len() > self.capacity {
            messages.pop_front();
        }
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<PublicMessage> {
        self.messages.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: usize) -> PublicMessage {
        PublicMessage {
            username: "alice".to_string(),
            message: format!("m{}", n),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            file: None,
        }
    }

    #[test]
    fn test_evicts_oldest_first() {
        let history = HistoryBuffer::new(3);
        for n in 0..5 {
            history.append(message(n));
        }
        let texts: Vec<String> = history.snapshot().into_iter().map(|m| m.message).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let history = HistoryBuffer::new(10);
        history.append(message(1));
        let snapshot = history.snapshot();
        history.append(message(2));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(history.len(), 2);
    }
}

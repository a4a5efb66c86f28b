//! Typing indicator de-duplication
//!
//! Only state changes go on the wire: one flag for the public room and one
//! per private recipient.

use fuvchat_core::protocol::{TypingContext, TypingRequest};
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct TypingTracker {
    public: bool,
    private: HashSet<String>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `typing` request to emit, or `None` when nothing changed
    pub fn update(&mut self, recipient: Option<&str>, is_typing: bool) -> Option<TypingRequest> {
        match recipient.map(str::trim).filter(|name| !name.is_empty()) {
            None => {
                if self.public == is_typing {
                    return None;
                }
                self.public = is_typing;
                Some(TypingRequest {
                    context: TypingContext::Public,
                    is_typing,
                    recipient: None,
                })
            }
            Some(name) => {
                let changed = if is_typing {
                    self.private.insert(name.to_string())
                } else {
                    self.private.remove(name)
                };
                changed.then(|| TypingRequest {
                    context: TypingContext::Private,
                    is_typing,
                    recipient: Some(name.to_string()),
                })
            }
        }
    }

    /// Forget every flag, e.g. after a disconnect
    pub fn clear(&mut self) {
        self.public = false;
        self.private.clear();
    }
}

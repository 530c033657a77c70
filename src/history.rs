use std::collections::VecDeque;

use crate::messages::Message;

/// The last `capacity` events of a room, oldest first.
#[derive(Debug)]
pub struct RecentHistory {
    capacity: usize,
    entries: VecDeque<Message>,
}

impl RecentHistory {
    pub fn new(capacity: usize) -> Self {
        RecentHistory {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, message: Message) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Message> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().cloned().collect()
    }
}

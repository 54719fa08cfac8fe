//! Day-sectioned, time-ordered projection of a conversation.
//!
//! [`ChronologicalCollection`] is what the presenter renders. It is rebuilt
//! from the canonical message list whenever that list changes wholesale,
//! and edited in place for single adds and updates. It performs no I/O.

use std::collections::HashMap;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};

use colloquy_proto::message::Message;

/// Location of a message in the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    /// Index of the day section.
    pub section: usize,
    /// Index of the message within its section.
    pub row: usize,
}

/// All messages that fall on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// The calendar day, in the collection's offset.
    pub day: NaiveDate,
    /// Messages ascending by time.
    pub messages: Vec<Message>,
}

/// Messages bucketed into ascending day sections, ascending by time within
/// a section.
#[derive(Debug, Clone)]
pub struct ChronologicalCollection {
    offset: FixedOffset,
    sections: Vec<Section>,
    index: HashMap<NaiveDate, usize>,
}

impl Default for ChronologicalCollection {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl ChronologicalCollection {
    /// Create an empty collection bucketing days in `offset`.
    #[must_use]
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            sections: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Insert a message at its chronological position.
    ///
    /// Adding an identity that is already present changes nothing and
    /// returns the existing position.
    pub fn add(&mut self, message: Message) -> Position {
        if let Some(existing) = self.find(&message) {
            return existing;
        }

        let day = message.time.day_in(self.offset);
        let section = match self.index.get(&day) {
            Some(&i) => i,
            None => {
                let at = self.sections.partition_point(|s| s.day < day);
                self.sections.insert(
                    at,
                    Section {
                        day,
                        messages: Vec::new(),
                    },
                );
                self.rebuild_index();
                at
            }
        };

        let messages = &mut self.sections[section].messages;
        let mut row = messages.len();
        while row > 0 && messages[row - 1].time > message.time {
            row -= 1;
        }
        messages.insert(row, message);
        Position { section, row }
    }

    /// Replace the stored copy of `message` and re-sort it.
    ///
    /// The message may move to another section if its time changed.
    /// Returns `None` when the identity is not present.
    pub fn update(&mut self, message: Message) -> Option<Position> {
        self.remove(&message)?;
        Some(self.add(message))
    }

    /// Remove the message with the same identity, returning it.
    pub fn remove(&mut self, message: &Message) -> Option<Message> {
        let Position { section, row } = self.find(message)?;
        let removed = self.sections[section].messages.remove(row);
        if self.sections[section].messages.is_empty() {
            self.sections.remove(section);
            self.rebuild_index();
        }
        Some(removed)
    }

    /// Replace the whole contents.
    pub fn set(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.clear();
        for message in messages {
            self.add(message);
        }
    }

    /// Position of the message with the same identity.
    #[must_use]
    pub fn find(&self, message: &Message) -> Option<Position> {
        if !message.has_identity() {
            return None;
        }
        self.sections.iter().enumerate().find_map(|(section, s)| {
            s.messages
                .iter()
                .position(|m| m.is_same(message))
                .map(|row| Position { section, row })
        })
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.sections.clear();
        self.index.clear();
    }

    /// Position of the newest message.
    #[must_use]
    pub fn last_position(&self) -> Option<Position> {
        let section = self.sections.len().checked_sub(1)?;
        let row = self.sections[section].messages.len().checked_sub(1)?;
        Some(Position { section, row })
    }

    /// Message at `position`, if any.
    #[must_use]
    pub fn message_at(&self, position: Position) -> Option<&Message> {
        self.sections
            .get(position.section)?
            .messages
            .get(position.row)
    }

    /// The day sections, oldest first.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Number of messages across all sections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.iter().map(|s| s.messages.len()).sum()
    }

    /// Whether no message is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .sections
            .iter()
            .enumerate()
            .map(|(i, s)| (s.day, i))
            .collect();
    }
}

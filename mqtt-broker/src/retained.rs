//! Retained message store (§4.7): a fixed-capacity table of the single
//! retained message per topic, scanned linearly like every other broker
//! table.

use mqtt_core::QoS;

use crate::topic;

#[derive(Debug, Clone)]
pub struct RetainedEntry {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Holds at most one retained message per distinct topic name.
///
/// A free slot is `None`; there is no compaction, so insertion order is not
/// preserved across deletes.
pub struct RetainedStore {
    entries: Vec<Option<RetainedEntry>>,
}

impl RetainedStore {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self { entries }
    }

    /// Store, replace, or delete the retained message for `topic`.
    ///
    /// An empty `payload` deletes any existing retained message for `topic`
    /// and stores nothing new. A non-empty payload replaces the existing
    /// entry for this exact topic in place, or takes the first free slot. If
    /// the table is full and no entry for this topic exists, the message is
    /// dropped and a warning is logged; every existing retained entry is left
    /// untouched.
    pub fn store(&mut self, topic: &str, payload: &[u8], qos: QoS) {
        if let Some(slot) = self.entries.iter_mut().find(
            |slot| matches!(slot, Some(entry) if entry.topic == topic),
        ) {
            if payload.is_empty() {
                *slot = None;
            } else {
                *slot = Some(RetainedEntry {
                    topic: topic.to_owned(),
                    payload: payload.to_owned(),
                    qos,
                });
            }
            return;
        }

        if payload.is_empty() {
            return;
        }

        match self.entries.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(RetainedEntry {
                    topic: topic.to_owned(),
                    payload: payload.to_owned(),
                    qos,
                });
            }
            None => {
                log::warn!("retained message table full, dropping retain for {topic}");
            }
        }
    }

    /// Iterate the retained entries whose topic matches `filter`.
    pub fn iter_matching<'a>(
        &'a self,
        filter: &'a str,
    ) -> impl Iterator<Item = &'a RetainedEntry> + 'a {
        self.entries
            .iter()
            .filter_map(|slot| slot.as_ref())
            .filter(move |entry| topic::matches(filter, &entry.topic))
    }
}

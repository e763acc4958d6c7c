use crate::model::{EmergencyId, EmergencyRecord};

/// Append-only episode log, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    records: Vec<EmergencyRecord>,
}

impl History {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_records(records: Vec<EmergencyRecord>) -> Self {
        Self { records }
    }

    pub(crate) fn append(&mut self, record: EmergencyRecord) {
        self.records.push(record);
    }

    /// Overwrites the record with the same id in place. Returns false if no
    /// such record exists.
    pub(crate) fn replace(&mut self, record: &EmergencyRecord) -> bool {
        match self.get_mut(record.id()) {
            Some(slot) => {
                *slot = record.clone();
                true
            }
            None => false,
        }
    }

    pub(crate) fn get_mut(&mut self, id: &EmergencyId) -> Option<&mut EmergencyRecord> {
        self.records.iter_mut().find(|r| r.id() == id)
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    #[must_use]
    pub fn get(&self, id: &EmergencyId) -> Option<&EmergencyRecord> {
        self.records.iter().find(|r| r.id() == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[EmergencyRecord] {
        &self.records
    }

    /// Most recent first. `sort_by` is stable, so equal start times keep
    /// insertion order.
    #[must_use]
    pub fn newest_first(&self) -> Vec<EmergencyRecord> {
        newest_first(&self.records)
    }
}

pub(crate) fn newest_first(records: &[EmergencyRecord]) -> Vec<EmergencyRecord> {
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| b.started_at().cmp(&a.started_at()));
    sorted
}

use std::collections::HashMap;
use ups_hid_types::{ByteChange, LengthChange, ReportChange};

/// The last payload read for a report ID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportSnapshot {
    pub report_id: u8,
    pub payload: Vec<u8>,
    pub has_baseline: bool,
}

/// Tracks the last payload per report ID for the current session, and works out what changed.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    snapshots: HashMap<u8, ReportSnapshot>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Default::default()
    }

    /// Compares a payload with the stored snapshot for the ID, then stores it.
    ///
    /// Returns `None` if nothing changed, a baseline on the first read of an ID, or the changed
    /// offsets otherwise.
    pub fn observe(&mut self, report_id: u8, payload: &[u8]) -> Option<ReportChange> {
        let snapshot = self
            .snapshots
            .entry(report_id)
            .or_insert_with(|| ReportSnapshot {
                report_id,
                ..Default::default()
            });

        let change = if !snapshot.has_baseline {
            Some(ReportChange::Baseline)
        } else if snapshot.payload == payload {
            None
        } else {
            Some(diff(&snapshot.payload, payload))
        };

        snapshot.payload.clear();
        snapshot.payload.extend_from_slice(payload);
        snapshot.has_baseline = true;

        change
    }

    pub fn snapshot(&self, report_id: u8) -> Option<&ReportSnapshot> {
        self.snapshots.get(&report_id)
    }

    pub fn has_baseline(&self, report_id: u8) -> bool {
        self.snapshots
            .get(&report_id)
            .is_some_and(|snapshot| snapshot.has_baseline)
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

fn diff(previous: &[u8], current: &[u8]) -> ReportChange {
    let bytes = previous
        .iter()
        .zip(current)
        .enumerate()
        .filter(|(_, (old, new))| old != new)
        .map(|(offset, (old, new))| ByteChange {
            offset,
            old: *old,
            new: *new,
        })
        .collect();

    let length = (previous.len() != current.len()).then_some(LengthChange {
        previous: previous.len(),
        current: current.len(),
    });

    ReportChange::Changed { bytes, length }
}

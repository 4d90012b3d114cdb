use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::DispatchError;
use crate::schema::Schema;
use crate::template::Template;
use crate::workunit::WorkUnit;

struct Inner {
    templates: VecDeque<Template>,
    packed_remaining: u64,
}

/// FIFO of [`Template`]s awaiting expansion, with a running sum of
/// cardinality so callers can cheaply check how much work remains packed.
pub struct TemplateStore {
    inner: Mutex<Inner>,
    max_per_template: u64,
}

impl TemplateStore {
    pub fn new(max_per_template: u64) -> Self {
        TemplateStore {
            inner: Mutex::new(Inner {
                templates: VecDeque::new(),
                packed_remaining: 0,
            }),
            max_per_template,
        }
    }

    /// Parses every non-empty line of `text` via `schema`, splits each
    /// resulting template against `max_per_template`, and appends them in
    /// order. Partial progress from lines parsed before a failing line is
    /// retained (matching the original loader's "partial load on error"
    /// behavior).
    pub fn load(&self, text: &str, schema: &dyn Schema) -> Result<(), DispatchError> {
        let mut guard = self.inner.lock().unwrap();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let template = schema.parse_template_line(line)?;
            for part in template.split(self.max_per_template) {
                guard.packed_remaining += part.cardinality();
                guard.templates.push_back(part);
            }
        }
        Ok(())
    }

    /// Dequeues templates from the front and materializes their work units
    /// into `sink`, stopping once `sink` reaches `high_water` or the store
    /// empties. Returns the distinct primary keys touched, for the dedup
    /// pass to target.
    pub fn unpack_into(
        &self,
        high_water: u64,
        current_sink_size: u64,
        mut emit: impl FnMut(WorkUnit),
    ) -> Vec<i64> {
        let mut guard = self.inner.lock().unwrap();
        let mut touched = Vec::new();
        let mut produced = current_sink_size;
        while produced < high_water {
            let Some(template) = guard.templates.pop_front() else {
                break;
            };
            guard.packed_remaining -= template.cardinality();
            touched.push(template.primary());
            for unit in template.expand() {
                produced += 1;
                emit(unit);
            }
        }
        touched.sort_unstable();
        touched.dedup();
        touched
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().packed_remaining
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SimpleSchema;

    #[test]
    fn load_splits_and_tracks_cardinality() {
        let store = TemplateStore::new(300);
        let schema = SimpleSchema;
        store.load("5;a;1..2\n6;b;1..1000\n", &schema).unwrap();
        assert_eq!(store.size(), 2 + 1000);
    }

    #[test]
    fn unpack_into_respects_high_water_and_reports_primaries() {
        let store = TemplateStore::new(10_000);
        let schema = SimpleSchema;
        store.load("1;1..3\n2;1..3\n", &schema).unwrap();
        let mut produced = Vec::new();
        let touched = store.unpack_into(3, 0, |u| produced.push(u));
        assert_eq!(produced.len(), 3);
        assert_eq!(touched, vec![1]);
        assert_eq!(store.size(), 3);
    }

    #[test]
    fn malformed_line_preserves_partial_load() {
        let store = TemplateStore::new(10_000);
        let schema = SimpleSchema;
        let err = store.load("1;1..3\nbad\n", &schema);
        assert!(err.is_err());
        assert_eq!(store.size(), 3);
    }
}

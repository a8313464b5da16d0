use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::model::{CompositeKey, KeyCollision, ReportRow};
use crate::report::read_report;

/// Report rows keyed by `(id, type)`. Later rows win on duplicate keys; every
/// duplicate is kept in `collisions`.
#[derive(Debug, Default)]
pub struct CompositeKeyIndex {
    rows: HashMap<CompositeKey, (usize, ReportRow)>,
    collisions: Vec<KeyCollision>,
}

impl CompositeKeyIndex {
    pub fn load(report_path: &Path) -> Result<Self> {
        Ok(Self::build(read_report(report_path)?))
    }

    pub fn build(rows: Vec<ReportRow>) -> Self {
        let mut index = Self {
            rows: HashMap::with_capacity(rows.len()),
            collisions: Vec::new(),
        };

        for (offset, row) in rows.into_iter().enumerate() {
            let record = offset + 1;
            let key = row.key();
            if let Some((replaced_record, _)) = index.rows.insert(key.clone(), (record, row)) {
                warn!(
                    key = %key,
                    replaced_record,
                    record,
                    "duplicate composite key in report; keeping the later row"
                );
                index.collisions.push(KeyCollision {
                    key,
                    replaced_record,
                    record,
                });
            }
        }

        index
    }

    pub fn get(&self, key: &CompositeKey) -> Option<&ReportRow> {
        self.rows.get(key).map(|(_, row)| row)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn collisions(&self) -> &[KeyCollision] {
        &self.collisions
    }
}

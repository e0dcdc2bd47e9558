//! The read model over the append-only ledger.

use custodia_core::{AttributeRecord, AttributeType};
use std::collections::BTreeMap;

/// Current value per attribute type: the validated record with the greatest
/// `created_at`, ties going to the greater `seq`. Unvalidated records never
/// win, even when newer.
pub fn latest_validated<'a, I>(records: I) -> BTreeMap<AttributeType, AttributeRecord>
where
    I: IntoIterator<Item = &'a AttributeRecord>,
{
    let mut latest: BTreeMap<AttributeType, AttributeRecord> = BTreeMap::new();
    for record in records.into_iter().filter(|r| r.is_validated) {
        let newer = match latest.get(&record.attribute_type) {
            Some(current) => (record.created_at, record.seq) > (current.created_at, current.seq),
            None => true,
        };
        if newer {
            latest.insert(record.attribute_type, record.clone());
        }
    }
    latest
}

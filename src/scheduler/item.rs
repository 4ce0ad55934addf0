//! The immutable unit of schedulable work.

use crate::admission::dimension::Dimension;
use crate::store::WorkRow;

/// One candidate feed poll, with its admission keys precomputed against the
/// scheduler's dimension list (index-aligned). Lives only inside the ready
/// list and, once issued, with whoever is tracking the in-flight call.
#[derive(Debug, Clone)]
pub struct WorkItem {
    id: i64,
    source_id: i64,
    url: String,
    admission_keys: Vec<Option<String>>,
}

impl WorkItem {
    pub fn from_row(row: &WorkRow, dimensions: &[Dimension]) -> Self {
        let admission_keys = dimensions.iter().map(|dim| dim.extract(row)).collect();
        Self {
            id: row.id,
            source_id: row.source_id,
            url: row.url.clone(),
            admission_keys,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn source_id(&self) -> i64 {
        self.source_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Admission key for the dimension at `index`, `None` when the
    /// dimension does not apply to this item.
    pub fn admission_key(&self, index: usize) -> Option<&str> {
        self.admission_keys
            .get(index)
            .and_then(|key| key.as_deref())
    }

    pub fn admission_keys(&self) -> impl Iterator<Item = Option<&str>> {
        self.admission_keys.iter().map(|key| key.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_align_with_the_dimension_list() {
        let dimensions = vec![Dimension::by_source(3), Dimension::by_host(5)];
        let row = WorkRow {
            id: 10,
            source_id: 4,
            url: "https://feeds.example.com/all.xml".into(),
            next_eligible_at: None,
        };

        let item = WorkItem::from_row(&row, &dimensions);
        assert_eq!(item.admission_key(0), Some("4"));
        assert_eq!(item.admission_key(1), Some("feeds.example.com"));
        assert_eq!(item.admission_key(2), None);
    }

    #[test]
    fn unextractable_keys_are_absent() {
        let dimensions = vec![Dimension::by_host(5)];
        let row = WorkRow {
            id: 11,
            source_id: 4,
            url: "garbage".into(),
            next_eligible_at: None,
        };

        let item = WorkItem::from_row(&row, &dimensions);
        assert_eq!(item.admission_key(0), None);
    }
}

//! Summation of classified prescribing by practice and period.

use crate::{dictionary::Matches, ConditionDictionary, PracticeId, PrescriptionRecord};
use std::collections::BTreeMap;

/// Running totals for one practice (or, later, one area): items per
/// condition, items matching any condition, and overall items prescribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionTotals {
    pub by_condition: Vec<u64>,
    pub any: u64,
    pub total: u64,
}

impl ConditionTotals {
    pub fn zeroed(n_conditions: usize) -> Self {
        ConditionTotals {
            by_condition: vec![0; n_conditions],
            any: 0,
            total: 0,
        }
    }

    /// Add one classified record. A match contributes exactly the record's
    /// item count to that condition; non-matches contribute zero.
    pub fn add_record(&mut self, matches: &Matches, items: u64) {
        debug_assert_eq!(matches.by_condition.len(), self.by_condition.len());
        for (total, matched) in self.by_condition.iter_mut().zip(&matches.by_condition) {
            if *matched {
                *total += items;
            }
        }
        if matches.any {
            self.any += items;
        }
        self.total += items;
    }

    pub fn merge(&mut self, other: &ConditionTotals) {
        debug_assert_eq!(other.by_condition.len(), self.by_condition.len());
        for (total, more) in self.by_condition.iter_mut().zip(&other.by_condition) {
            *total += more;
        }
        self.any += other.any;
        self.total += other.total;
    }
}

/// Classified totals grouped by practice.
///
/// Built once per monthly extract and then merged across the reporting year;
/// practices absent from a month simply contribute nothing for it. Merging
/// period summaries is equivalent to aggregating all raw records directly.
#[derive(Debug, Clone)]
pub struct PracticeSummaries {
    n_conditions: usize,
    totals: BTreeMap<PracticeId, ConditionTotals>,
}

impl PracticeSummaries {
    pub fn new(n_conditions: usize) -> Self {
        PracticeSummaries {
            n_conditions,
            totals: BTreeMap::new(),
        }
    }

    pub fn from_records<'a>(
        dictionary: &ConditionDictionary,
        records: impl IntoIterator<Item = &'a PrescriptionRecord>,
    ) -> Self {
        let mut this = Self::new(dictionary.len());
        for record in records {
            let matches = dictionary.classify(record.description.as_deref());
            this.totals
                .entry(record.practice.clone())
                .or_insert_with(|| ConditionTotals::zeroed(dictionary.len()))
                .add_record(&matches, record.items);
        }
        this
    }

    pub fn merge(&mut self, other: PracticeSummaries) {
        assert_eq!(
            self.n_conditions, other.n_conditions,
            "summaries built from different dictionaries"
        );
        for (practice, totals) in other.totals {
            self.totals
                .entry(practice)
                .or_insert_with(|| ConditionTotals::zeroed(self.n_conditions))
                .merge(&totals);
        }
    }

    pub fn n_conditions(&self) -> usize {
        self.n_conditions
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    pub fn get(&self, practice: &str) -> Option<&ConditionTotals> {
        self.totals.get(practice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PracticeId, &ConditionTotals)> {
        self.totals.iter()
    }
}

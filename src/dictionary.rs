//! The condition -> medication keyword dictionary.
//!
//! Each loneliness-associated condition is tracked through the medications
//! typically prescribed for it. A prescription line matches a condition when
//! its item description contains any of that condition's keywords
//! (case-insensitive, keywords may use regex syntax). Conditions are not
//! mutually exclusive: a drug can treat several of them, which is why an
//! `any` matcher over the union of all keywords exists as well - it avoids
//! double counting when reporting an overall rate.

use crate::{load_csv, ArcStr, Result};
use anyhow::{ensure, Context};
use regex::{RegexSet, RegexSetBuilder};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
struct DictionaryRow {
    illness: ArcStr,
    medication: ArcStr,
}

#[derive(Debug, Clone)]
pub struct Condition {
    name: ArcStr,
    keywords: Vec<ArcStr>,
    matcher: RegexSet,
}

impl Condition {
    pub fn name(&self) -> &ArcStr {
        &self.name
    }

    pub fn keywords(&self) -> &[ArcStr] {
        &self.keywords
    }

    pub fn is_match(&self, description: &str) -> bool {
        self.matcher.is_match(description)
    }
}

/// The parsed dictionary, with one compiled matcher per condition plus the
/// union matcher. Condition order follows first appearance in the source
/// file and is the column order of all downstream tables.
#[derive(Debug, Clone)]
pub struct ConditionDictionary {
    conditions: Vec<Condition>,
    any: RegexSet,
}

/// Per-record match flags, aligned with [`ConditionDictionary::names`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matches {
    pub by_condition: Vec<bool>,
    pub any: bool,
}

impl Matches {
    fn none(n: usize) -> Self {
        Matches {
            by_condition: vec![false; n],
            any: false,
        }
    }
}

impl ConditionDictionary {
    /// Load from a two-column CSV (`illness,medication`), one keyword per
    /// row; repeated condition names accumulate keywords.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let rows: Vec<DictionaryRow> = load_csv(path)?;
        Self::from_rows(rows.into_iter().map(|r| (r.illness, r.medication)))
    }

    pub fn from_rows(rows: impl IntoIterator<Item = (ArcStr, ArcStr)>) -> Result<Self> {
        let mut grouped: Vec<(ArcStr, Vec<ArcStr>)> = Vec::new();
        for (illness, medication) in rows {
            match grouped.iter_mut().find(|(name, _)| *name == illness) {
                Some((_, keywords)) => keywords.push(medication),
                None => grouped.push((illness, vec![medication])),
            }
        }
        ensure!(!grouped.is_empty(), "condition dictionary is empty");

        let mut all_keywords = Vec::new();
        let mut conditions = Vec::with_capacity(grouped.len());
        for (name, keywords) in grouped {
            let matcher = build_matcher(&keywords)
                .with_context(|| format!("bad keyword pattern for condition \"{}\"", name))?;
            all_keywords.extend(keywords.iter().cloned());
            conditions.push(Condition {
                name,
                keywords,
                matcher,
            });
        }
        let any = build_matcher(&all_keywords).context("building union matcher")?;
        Ok(ConditionDictionary { conditions, any })
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn names(&self) -> Vec<ArcStr> {
        self.conditions.iter().map(|c| c.name.clone()).collect()
    }

    /// Test a description against every condition. `None` (a blank or
    /// missing description) matches nothing.
    pub fn classify(&self, description: Option<&str>) -> Matches {
        let description = match description {
            Some(d) => d,
            None => return Matches::none(self.len()),
        };
        Matches {
            by_condition: self
                .conditions
                .iter()
                .map(|c| c.is_match(description))
                .collect(),
            any: self.any.is_match(description),
        }
    }
}

fn build_matcher(keywords: &[ArcStr]) -> Result<RegexSet> {
    RegexSetBuilder::new(keywords.iter().map(|k| k.as_ref()))
        .case_insensitive(true)
        .build()
        .map_err(Into::into)
}

//! Mapping prescribing practices onto statistical geographies.
//!
//! Two-stage join: practice id -> postcode via a practice roster, then
//! postcode -> area code (MSOA/LSOA/SDZ) via a postcode directory such as
//! the NSPL. Practices missing from the roster (non-GP prescribers like
//! pharmacies) are excluded before the join; postcodes missing from the
//! directory drop their rows. Both losses are counted, never silent.

use crate::{
    aggregate::{ConditionTotals, PracticeSummaries},
    util::header_index,
    ArcStr, Context, PracticeId, Result,
};
use once_cell::sync::Lazy;
use qu::ick_use::*;
use regex::Regex;
use std::{collections::BTreeMap, fs, io, path::Path};

static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s\-]+").unwrap());

/// Canonical postcode form: uppercase with all whitespace and hyphens
/// removed. Returns `None` when nothing is left.
pub fn normalise_postcode(raw: &str) -> Option<ArcStr> {
    let stripped = SEPARATORS.replace_all(raw, "");
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_uppercase().into())
    }
}

/// Column names for a practice roster file.
#[derive(Debug, Clone)]
pub struct RosterColumns {
    pub practice: ArcStr,
    pub postcode: ArcStr,
}

/// Practice id -> postcode, from the national practice reference file.
///
/// A handful of practices appear with more than one postcode on record (a
/// known data quality issue); the first occurrence wins so the mapping is
/// deterministic.
#[derive(Debug, Clone)]
pub struct PracticeRoster {
    postcodes: BTreeMap<PracticeId, ArcStr>,
}

impl PracticeRoster {
    pub fn load(path: impl AsRef<Path>, columns: &RosterColumns) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening practice roster \"{}\"", path.display()))?;
        Self::from_reader(io::BufReader::new(file), columns)
            .with_context(|| format!("while reading \"{}\"", path.display()))
    }

    pub fn from_reader(reader: impl io::Read, columns: &RosterColumns) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = csv.headers()?.clone();
        let practice_idx = header_index(&headers, &columns.practice)?;
        let postcode_idx = header_index(&headers, &columns.postcode)?;

        let mut pairs = Vec::new();
        for row in csv.records() {
            let row = row?;
            let practice = match row.get(practice_idx) {
                Some(p) if !p.is_empty() => ArcStr::from(p),
                _ => continue,
            };
            let postcode = match row.get(postcode_idx).and_then(normalise_postcode) {
                Some(p) => p,
                None => continue,
            };
            pairs.push((practice, postcode));
        }
        Ok(Self::from_pairs(pairs))
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (PracticeId, ArcStr)>) -> Self {
        let mut postcodes = BTreeMap::new();
        let mut conflicts = 0;
        for (practice, postcode) in pairs {
            match postcodes.entry(practice) {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(postcode);
                }
                std::collections::btree_map::Entry::Occupied(e) => {
                    if *e.get() != postcode {
                        conflicts += 1;
                    }
                }
            }
        }
        if conflicts > 0 {
            event!(
                Level::WARN,
                "{} practices listed with more than one postcode; kept first occurrence",
                conflicts
            );
        }
        PracticeRoster { postcodes }
    }

    pub fn postcode(&self, practice: &str) -> Option<&ArcStr> {
        self.postcodes.get(practice)
    }

    pub fn contains(&self, practice: &str) -> bool {
        self.postcodes.contains_key(practice)
    }

    pub fn len(&self) -> usize {
        self.postcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postcodes.is_empty()
    }
}

/// Column names for a postcode directory file (e.g. the NSPL: `pcds`,
/// `msoa11`, `oseast1m`, `osnrth1m`).
#[derive(Debug, Clone)]
pub struct DirectoryColumns {
    pub postcode: ArcStr,
    pub area: ArcStr,
    /// Easting/northing columns; only needed by the interpolating variants.
    pub easting: Option<ArcStr>,
    pub northing: Option<ArcStr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostcodeInfo {
    pub area: Option<ArcStr>,
    /// British National Grid easting/northing of the postcode centroid.
    pub location: Option<(f64, f64)>,
}

/// Postcode -> statistical area (and optionally coordinates).
#[derive(Debug, Clone)]
pub struct PostcodeDirectory {
    entries: BTreeMap<ArcStr, PostcodeInfo>,
}

impl PostcodeDirectory {
    pub fn load(path: impl AsRef<Path>, columns: &DirectoryColumns) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening postcode directory \"{}\"", path.display()))?;
        Self::from_reader(io::BufReader::new(file), columns)
            .with_context(|| format!("while reading \"{}\"", path.display()))
    }

    pub fn from_reader(reader: impl io::Read, columns: &DirectoryColumns) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = csv.headers()?.clone();
        let postcode_idx = header_index(&headers, &columns.postcode)?;
        let area_idx = header_index(&headers, &columns.area)?;
        let easting_idx = match &columns.easting {
            Some(name) => Some(header_index(&headers, name)?),
            None => None,
        };
        let northing_idx = match &columns.northing {
            Some(name) => Some(header_index(&headers, name)?),
            None => None,
        };

        let mut entries = BTreeMap::new();
        for row in csv.records() {
            let row = row?;
            let postcode = match row.get(postcode_idx).and_then(normalise_postcode) {
                Some(p) => p,
                None => continue,
            };
            let area = row
                .get(area_idx)
                .filter(|a| !a.is_empty())
                .map(ArcStr::from);
            let location = match (easting_idx, northing_idx) {
                (Some(e), Some(n)) => {
                    let easting = row.get(e).and_then(|v| v.parse::<f64>().ok());
                    let northing = row.get(n).and_then(|v| v.parse::<f64>().ok());
                    easting.zip(northing)
                }
                _ => None,
            };
            entries
                .entry(postcode)
                .or_insert(PostcodeInfo { area, location });
        }
        Ok(PostcodeDirectory { entries })
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (ArcStr, PostcodeInfo)>) -> Self {
        PostcodeDirectory {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, postcode: &str) -> Option<&PostcodeInfo> {
        self.entries.get(postcode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rows lost at each join stage. Zero due to a failed join and zero due to
/// true absence are different things; callers get the counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinReport {
    /// Practices excluded because the roster has no postcode for them.
    pub practices_not_in_roster: usize,
    /// Practices whose postcode has no entry (or no area) in the directory.
    pub postcodes_not_in_directory: usize,
}

/// Classified totals re-aggregated by area code (or by postcode for the
/// interpolating variants, where the postcode *is* the reporting unit).
#[derive(Debug, Clone)]
pub struct AreaSummaries {
    n_conditions: usize,
    totals: BTreeMap<ArcStr, ConditionTotals>,
}

impl AreaSummaries {
    /// Practice -> postcode -> area, summing totals per area since several
    /// practices can share one.
    pub fn by_area(
        practices: &PracticeSummaries,
        roster: &PracticeRoster,
        directory: &PostcodeDirectory,
    ) -> (Self, JoinReport) {
        Self::join(practices, roster, |postcode| {
            directory.get(postcode).and_then(|info| info.area.clone())
        })
    }

    /// Practice -> postcode only, summing totals per postcode.
    pub fn by_postcode(
        practices: &PracticeSummaries,
        roster: &PracticeRoster,
    ) -> (Self, JoinReport) {
        Self::join(practices, roster, |postcode| Some(postcode.clone()))
    }

    fn join(
        practices: &PracticeSummaries,
        roster: &PracticeRoster,
        to_unit: impl Fn(&ArcStr) -> Option<ArcStr>,
    ) -> (Self, JoinReport) {
        let mut report = JoinReport::default();
        let mut totals: BTreeMap<ArcStr, ConditionTotals> = BTreeMap::new();
        for (practice, practice_totals) in practices.iter() {
            let postcode = match roster.postcode(practice) {
                Some(p) => p,
                None => {
                    report.practices_not_in_roster += 1;
                    continue;
                }
            };
            let unit = match to_unit(postcode) {
                Some(u) => u,
                None => {
                    report.postcodes_not_in_directory += 1;
                    continue;
                }
            };
            totals
                .entry(unit)
                .or_insert_with(|| ConditionTotals::zeroed(practices.n_conditions()))
                .merge(practice_totals);
        }
        if report.practices_not_in_roster > 0 {
            event!(
                Level::WARN,
                "excluded {} prescribing entities not in the practice roster",
                report.practices_not_in_roster
            );
        }
        if report.postcodes_not_in_directory > 0 {
            event!(
                Level::WARN,
                "dropped {} practices whose postcode has no area mapping",
                report.postcodes_not_in_directory
            );
        }
        (
            AreaSummaries {
                n_conditions: practices.n_conditions(),
                totals,
            },
            report,
        )
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

    pub fn get(&self, area: &str) -> Option<&ConditionTotals> {
        self.totals.get(area)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArcStr, &ConditionTotals)> {
        self.totals.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ConditionDictionary, PrescriptionRecord};

    #[test]
    fn postcode_normalisation() {
        assert_eq!(normalise_postcode("bt1 1aa").as_deref(), Some("BT11AA"));
        assert_eq!(normalise_postcode(" EH8-9YL ").as_deref(), Some("EH89YL"));
        assert_eq!(normalise_postcode("CF10\t3NQ").as_deref(), Some("CF103NQ"));
        assert_eq!(normalise_postcode("  "), None);
        assert_eq!(normalise_postcode("- -"), None);
    }

    #[test]
    fn roster_keeps_first_postcode_for_duplicates() {
        let roster = PracticeRoster::from_pairs([
            (ArcStr::from("1"), ArcStr::from("BT11AA")),
            (ArcStr::from("1"), ArcStr::from("BT22BB")),
            (ArcStr::from("2"), ArcStr::from("BT33CC")),
        ]);
        assert_eq!(roster.postcode("1").map(|p| &**p), Some("BT11AA"));
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn roster_reader_normalises_postcodes() {
        let data = "PracNo,PracticeName,Postcode\n1,Foo Surgery,bt1 1aa\n2,Bar Surgery,\n";
        let columns = RosterColumns {
            practice: "PracNo".into(),
            postcode: "Postcode".into(),
        };
        let roster = PracticeRoster::from_reader(io::Cursor::new(data), &columns).unwrap();
        assert_eq!(roster.postcode("1").map(|p| &**p), Some("BT11AA"));
        // blank postcode row skipped
        assert!(!roster.contains("2"));
    }

    fn summaries() -> PracticeSummaries {
        let dict = ConditionDictionary::from_rows(std::iter::once((
            ArcStr::from("depression"),
            ArcStr::from("sertraline"),
        )))
        .unwrap();
        let records = vec![
            PrescriptionRecord {
                practice: "1".into(),
                description: Some("Sertraline 50mg".into()),
                items: 5,
            },
            PrescriptionRecord {
                practice: "2".into(),
                description: Some("Paracetamol".into()),
                items: 10,
            },
            PrescriptionRecord {
                practice: "99".into(),
                description: Some("Sertraline 100mg".into()),
                items: 2,
            },
        ];
        PracticeSummaries::from_records(&dict, &records)
    }

    #[test]
    fn practices_sharing_an_area_are_summed() {
        let roster = PracticeRoster::from_pairs([
            (ArcStr::from("1"), ArcStr::from("BT11AA")),
            (ArcStr::from("2"), ArcStr::from("BT22BB")),
        ]);
        let directory = PostcodeDirectory::from_entries([
            (
                ArcStr::from("BT11AA"),
                PostcodeInfo {
                    area: Some("SDZ001".into()),
                    location: None,
                },
            ),
            (
                ArcStr::from("BT22BB"),
                PostcodeInfo {
                    area: Some("SDZ001".into()),
                    location: None,
                },
            ),
        ]);
        let (areas, report) = AreaSummaries::by_area(&summaries(), &roster, &directory);
        assert_eq!(areas.len(), 1);
        let totals = areas.get("SDZ001").unwrap();
        assert_eq!(totals.by_condition, vec![5]);
        assert_eq!(totals.total, 15);
        // practice 99 is not a GP practice
        assert_eq!(report.practices_not_in_roster, 1);
        assert_eq!(report.postcodes_not_in_directory, 0);
    }

    #[test]
    fn unmapped_postcode_is_counted_not_silent() {
        let roster = PracticeRoster::from_pairs([
            (ArcStr::from("1"), ArcStr::from("BT11AA")),
            (ArcStr::from("2"), ArcStr::from("ZZ99ZZ")),
        ]);
        let directory = PostcodeDirectory::from_entries([(
            ArcStr::from("BT11AA"),
            PostcodeInfo {
                area: Some("SDZ001".into()),
                location: None,
            },
        )]);
        let (areas, report) = AreaSummaries::by_area(&summaries(), &roster, &directory);
        assert_eq!(areas.len(), 1);
        assert_eq!(report.postcodes_not_in_directory, 1);
    }

    #[test]
    fn by_postcode_uses_postcode_as_unit() {
        let roster = PracticeRoster::from_pairs([
            (ArcStr::from("1"), ArcStr::from("BT11AA")),
            (ArcStr::from("2"), ArcStr::from("BT11AA")),
        ]);
        let (postcodes, _) = AreaSummaries::by_postcode(&summaries(), &roster);
        assert_eq!(postcodes.len(), 1);
        assert_eq!(postcodes.get("BT11AA").unwrap().total, 15);
    }
}

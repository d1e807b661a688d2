//! England: Community Life Survey loneliness percentages mapped onto LSOAs.
//!
//! England has no prescribing route here; the loneliness figure is the
//! survey percentage published per 2011 Output Area Classification group.
//! That figure is walked down the geography chain OAC11 -> OA11 -> LSOA11 ->
//! LSOA21, averaging at each step, to give one percentage per 2021 LSOA.

use crate::{
    load_csv,
    util::{csv_opt, header_index},
    ArcStr, Context, Result,
};
use std::{
    collections::{BTreeMap, HashSet},
    fs, io,
    path::Path,
};

/// Scores keyed by area (or classification group) code. Missing means the
/// source published no figure for that code.
pub type CodeScores = BTreeMap<ArcStr, Option<f64>>;

/// Survey loneliness percentage per OAC11 group. A group can appear with no
/// figure (too few respondents); it stays missing rather than zero.
#[derive(Debug, Clone)]
pub struct ClsScores {
    by_group: CodeScores,
}

impl ClsScores {
    /// Load from a two-column CSV (`oac_11,perc`); an empty percentage
    /// field is a missing figure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        #[derive(serde::Deserialize)]
        struct Row {
            oac_11: ArcStr,
            perc: Option<f64>,
        }
        let rows: Vec<Row> = load_csv(path)?;
        Ok(Self::from_entries(
            rows.into_iter().map(|r| (r.oac_11, r.perc)),
        ))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (ArcStr, Option<f64>)>) -> Self {
        ClsScores {
            by_group: entries.into_iter().collect(),
        }
    }

    pub fn scores(&self) -> &CodeScores {
        &self.by_group
    }

    pub fn len(&self) -> usize {
        self.by_group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_group.is_empty()
    }
}

/// Column names for a two-column geography lookup file.
#[derive(Debug, Clone)]
pub struct LookupColumns {
    pub from: ArcStr,
    pub to: ArcStr,
}

/// A mapping between two geography levels. Exact repeated pairs are
/// deduplicated on load, so a lookup derived from a bigger table (one row
/// per postcode, say) does not bias the averages.
#[derive(Debug, Clone)]
pub struct AreaLookup {
    pairs: Vec<(ArcStr, ArcStr)>,
}

impl AreaLookup {
    pub fn load(path: impl AsRef<Path>, columns: &LookupColumns) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening lookup \"{}\"", path.display()))?;
        Self::from_reader(io::BufReader::new(file), columns)
            .with_context(|| format!("while reading \"{}\"", path.display()))
    }

    pub fn from_reader(reader: impl io::Read, columns: &LookupColumns) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = csv.headers()?.clone();
        let from_idx = header_index(&headers, &columns.from)?;
        let to_idx = header_index(&headers, &columns.to)?;

        let mut pairs = Vec::new();
        for row in csv.records() {
            let row = row?;
            let from = match row.get(from_idx) {
                Some(f) if !f.is_empty() => ArcStr::from(f),
                _ => continue,
            };
            let to = match row.get(to_idx) {
                Some(t) if !t.is_empty() => ArcStr::from(t),
                _ => continue,
            };
            pairs.push((from, to));
        }
        Ok(Self::from_pairs(pairs))
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (ArcStr, ArcStr)>) -> Self {
        let mut seen = HashSet::new();
        let mut deduped = Vec::new();
        for pair in pairs {
            if seen.insert(pair.clone()) {
                deduped.push(pair);
            }
        }
        AreaLookup { pairs: deduped }
    }

    /// Keep only pairs whose source code starts with `prefix` (e.g. `E`
    /// for England rows of a UK-wide lookup).
    pub fn retain_from_prefix(&mut self, prefix: &str) {
        self.pairs.retain(|(from, _)| from.starts_with(prefix));
    }

    /// Keep only pairs whose target code starts with `prefix`.
    pub fn retain_to_prefix(&mut self, prefix: &str) {
        self.pairs.retain(|(_, to)| to.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Carry scores from the source level onto the target level: each
    /// target code gets the mean of its sources' present scores. A target
    /// whose sources are all missing (or absent from `scores`) stays
    /// missing.
    pub fn average(&self, scores: &CodeScores) -> CodeScores {
        let mut sums: BTreeMap<ArcStr, (f64, usize)> = BTreeMap::new();
        for (from, to) in &self.pairs {
            let entry = sums.entry(to.clone()).or_insert((0.0, 0));
            if let Some(score) = scores.get(from).copied().flatten() {
                entry.0 += score;
                entry.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(to, (sum, count))| {
                let mean = if count == 0 {
                    None
                } else {
                    Some(sum / count as f64)
                };
                (to, mean)
            })
            .collect()
    }
}

/// Write the England output: `lsoa21_code,perc`, missing figures as empty
/// fields.
pub fn write_percentages_csv(path: impl AsRef<Path>, scores: &CodeScores) -> Result {
    let path = path.as_ref();
    let mut csv = csv::Writer::from_path(path)
        .with_context(|| format!("creating \"{}\"", path.display()))?;
    csv.write_record(["lsoa21_code", "perc"])?;
    for (code, score) in scores {
        csv.write_record([code.to_string(), csv_opt(*score)])?;
    }
    csv.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> AreaLookup {
        AreaLookup::from_pairs(
            pairs
                .iter()
                .map(|(f, t)| (ArcStr::from(*f), ArcStr::from(*t))),
        )
    }

    fn scores(entries: &[(&str, Option<f64>)]) -> CodeScores {
        entries
            .iter()
            .map(|(code, score)| (ArcStr::from(*code), *score))
            .collect()
    }

    #[test]
    fn average_skips_missing_sources() {
        let lookup = lookup(&[("a", "X"), ("b", "X"), ("c", "Y")]);
        let averaged = lookup.average(&scores(&[("a", Some(10.0)), ("b", None), ("c", None)]));
        // present sources only; all-missing stays missing, not zero
        assert_eq!(averaged.get("X"), Some(&Some(10.0)));
        assert_eq!(averaged.get("Y"), Some(&None));
    }

    #[test]
    fn average_is_the_mean_of_present_sources() {
        let lookup = lookup(&[("a", "X"), ("b", "X")]);
        let averaged = lookup.average(&scores(&[("a", Some(2.0)), ("b", Some(4.0))]));
        assert_eq!(averaged.get("X"), Some(&Some(3.0)));
    }

    #[test]
    fn repeated_pairs_count_once() {
        let lookup = lookup(&[("a", "X"), ("a", "X"), ("b", "X")]);
        assert_eq!(lookup.len(), 2);
        let averaged = lookup.average(&scores(&[("a", Some(2.0)), ("b", Some(4.0))]));
        assert_eq!(averaged.get("X"), Some(&Some(3.0)));
    }

    #[test]
    fn prefix_filters_drop_other_nations() {
        let mut lookup = lookup(&[("oa1", "E01"), ("oa2", "W01")]);
        lookup.retain_to_prefix("E");
        assert_eq!(lookup.len(), 1);
        let averaged = lookup.average(&scores(&[("oa1", Some(1.0)), ("oa2", Some(9.0))]));
        assert!(averaged.contains_key("E01"));
        assert!(!averaged.contains_key("W01"));
    }

    #[test]
    fn lookup_reader_is_column_name_driven() {
        let data = "\
Output Area Code,Local Authority Name,Group Code
E00000001,Foo,1a
E00000002,Foo,2b
";
        let columns = LookupColumns {
            from: "Group Code".into(),
            to: "Output Area Code".into(),
        };
        let lookup = AreaLookup::from_reader(io::Cursor::new(data), &columns).unwrap();
        assert_eq!(lookup.len(), 2);
        let averaged = lookup.average(&scores(&[("1a", Some(25.0)), ("2b", Some(15.0))]));
        assert_eq!(averaged.get("E00000001"), Some(&Some(25.0)));
        assert_eq!(averaged.get("E00000002"), Some(&Some(15.0)));
    }

    #[test]
    fn survey_percentage_walks_the_geography_chain() {
        let cls = ClsScores::from_entries([
            (ArcStr::from("1a"), Some(20.0)),
            (ArcStr::from("2b"), None),
        ]);
        // group -> output area
        let oac = lookup(&[("1a", "oa1"), ("1a", "oa2"), ("2b", "oa3")]);
        let oa_scores = oac.average(cls.scores());

        let mut lsoa11 = lookup(&[
            ("oa1", "E01000001"),
            ("oa2", "E01000001"),
            ("oa3", "E01000001"),
            ("oa3", "W01000001"),
        ]);
        lsoa11.retain_to_prefix("E");
        let lsoa11_scores = lsoa11.average(&oa_scores);
        // oa3 carries no figure and does not drag the mean down
        assert_eq!(lsoa11_scores.get("E01000001"), Some(&Some(20.0)));

        let lsoa21 = lookup(&[("E01000001", "E21000001")]);
        let lsoa21_scores = lsoa21.average(&lsoa11_scores);
        assert_eq!(lsoa21_scores.get("E21000001"), Some(&Some(20.0)));
    }
}

pub mod aggregate;
pub mod dictionary;
pub mod england;
pub mod geography;
pub mod idw;
pub mod pipeline;
pub mod score;
mod util;

pub use anyhow::{Context, Error};
use chrono::NaiveDate;
use qu::ick_use::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::HashSet, fmt, fs, io, path::Path, str::FromStr, sync::Arc};

pub use crate::{
    aggregate::{ConditionTotals, PracticeSummaries},
    dictionary::ConditionDictionary,
    geography::{normalise_postcode, AreaSummaries, PostcodeDirectory, PracticeRoster},
    pipeline::{NationConfig, Pipeline},
    score::{AreaScores, MissingPolicy},
    util::header,
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;

/// Identifier for a prescribing entity (a GP practice in every nation's extract).
pub type PracticeId = ArcStr;

/// A reporting period: one calendar month of prescribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        ensure!(
            NaiveDate::from_ymd_opt(year, month, 1).is_some(),
            "invalid period {}-{}",
            year,
            month
        );
        Ok(Period { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> NaiveDate {
        // month validated on construction
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap()
    }
}

impl FromStr for Period {
    type Err = Error;

    /// Accepts the period formats seen in the national extracts: `202212`,
    /// `20221201`, `2022-12` and `2022-12-01`.
    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
        ensure!(
            digits.len() == 6 || digits.len() == 8,
            "cannot parse \"{}\" as a year-month period",
            s
        );
        let year = digits[..4].parse()?;
        let month = digits[4..6].parse()?;
        Period::new(year, month)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// A single line item from a prescribing extract.
///
/// A missing item description is kept as `None` - it never matches any
/// condition but is not an error, and its items still count towards the
/// practice total.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrescriptionRecord {
    pub practice: PracticeId,
    pub description: Option<ArcStr>,
    pub items: u64,
}

/// Names of the columns to pull from a monthly prescribing extract.
///
/// The extracts use different headers per nation (`GPPractice` /
/// `BNFItemDescription` / `NumberOfPaidItems` in Scotland, `Practice` /
/// `VTM_NM` / `Total Items` in Northern Ireland, and so on), so the reader is
/// driven by configuration rather than a fixed serde schema.
#[derive(Debug, Clone)]
pub struct ExtractColumns {
    pub practice: ArcStr,
    pub description: ArcStr,
    pub items: ArcStr,
    /// Optional period column (e.g. Scotland's `PaidDateMonth`). When absent
    /// the extract's period is unknown and duplicate-file detection is by
    /// path only.
    pub period: Option<ArcStr>,
}

/// One parsed monthly extract.
#[derive(Debug)]
pub struct MonthlyExtract {
    pub period: Option<Period>,
    pub records: Vec<PrescriptionRecord>,
    /// Exact duplicate rows dropped before any summation.
    pub duplicates_dropped: usize,
}

/// Read a monthly prescribing extract, keeping only the configured columns.
///
/// Rows with an empty practice id are dropped (they carry no usable
/// information); an unparseable items count is a hard error since it points
/// at a malformed extract.
pub fn read_extract(path: impl AsRef<Path>, columns: &ExtractColumns) -> Result<MonthlyExtract> {
    let path = path.as_ref();
    let file =
        fs::File::open(path).with_context(|| format!("opening extract \"{}\"", path.display()))?;
    read_extract_from(io::BufReader::new(file), columns)
        .with_context(|| format!("while reading \"{}\"", path.display()))
}

fn read_extract_from(reader: impl io::Read, columns: &ExtractColumns) -> Result<MonthlyExtract> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = csv.headers()?.clone();
    let col = |name: &str| util::header_index(&headers, name);
    let practice_idx = col(&columns.practice)?;
    let description_idx = col(&columns.description)?;
    let items_idx = col(&columns.items)?;
    let period_idx = match &columns.period {
        Some(name) => Some(col(name)?),
        None => None,
    };

    let mut period = None;
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut duplicates_dropped = 0;
    for row in csv.records() {
        let row = row?;
        let practice = match row.get(practice_idx) {
            Some(p) if !p.is_empty() => ArcStr::from(p),
            _ => continue,
        };
        let description = match row.get(description_idx) {
            Some(d) if !d.is_empty() => Some(ArcStr::from(d)),
            _ => None,
        };
        let items: u64 = match row.get(items_idx) {
            Some(i) if !i.is_empty() => i
                .parse()
                .with_context(|| format!("bad items count \"{}\"", i))?,
            _ => 0,
        };
        if period.is_none() {
            if let Some(idx) = period_idx {
                if let Some(p) = row.get(idx) {
                    period = Some(p.parse::<Period>()?);
                }
            }
        }

        let record = PrescriptionRecord {
            practice,
            description,
            items,
        };
        // re-downloaded data protection: identical rows count once
        if seen.insert(record.clone()) {
            records.push(record);
        } else {
            duplicates_dropped += 1;
        }
    }

    if duplicates_dropped > 0 {
        event!(
            Level::WARN,
            "dropped {} exact duplicate rows",
            duplicates_dropped
        );
    }
    Ok(MonthlyExtract {
        period,
        records,
        duplicates_dropped,
    })
}

/// Load a fixed-schema reference CSV into memory.
pub fn load_csv<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?
        .into_deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("while loading \"{}\"", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn columns() -> ExtractColumns {
        ExtractColumns {
            practice: "Practice".into(),
            description: "VTM_NM".into(),
            items: "Total Items".into(),
            period: Some("Date".into()),
        }
    }

    #[test]
    fn extract_parses_configured_columns() {
        let data = "\
Practice,VTM_NM,Total Items,Date,Ignored
1,Sertraline 50mg,10,202201,x
2,,3,202201,y
";
        let extract = read_extract_from(io::Cursor::new(data), &columns()).unwrap();
        assert_eq!(extract.period, Some(Period::new(2022, 1).unwrap()));
        assert_eq!(extract.records.len(), 2);
        assert_eq!(&*extract.records[0].practice, "1");
        assert_eq!(extract.records[0].items, 10);
        assert_eq!(extract.records[1].description, None);
    }

    #[test]
    fn extract_drops_exact_duplicates() {
        let data = "\
Practice,VTM_NM,Total Items,Date
1,Sertraline 50mg,10,202201
1,Sertraline 50mg,10,202201
1,Sertraline 50mg,4,202201
";
        let extract = read_extract_from(io::Cursor::new(data), &columns()).unwrap();
        assert_eq!(extract.records.len(), 2);
        assert_eq!(extract.duplicates_dropped, 1);
    }

    #[test]
    fn extract_missing_column_is_fatal() {
        let data = "Practice,Total Items\n1,10\n";
        assert!(read_extract_from(io::Cursor::new(data), &columns()).is_err());
    }

    #[test]
    fn period_formats() {
        assert_eq!(
            "202212".parse::<Period>().unwrap(),
            Period::new(2022, 12).unwrap()
        );
        assert_eq!(
            "2022-01-01".parse::<Period>().unwrap(),
            Period::new(2022, 1).unwrap()
        );
        assert!("202213".parse::<Period>().is_err());
        assert!("2022".parse::<Period>().is_err());
    }
}

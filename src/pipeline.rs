//! Orchestration of the per-nation runs and the output CSVs.
//!
//! Each nation publishes the same data in a different shape, so a run is
//! parameterised by a [`NationConfig`] carrying the column names and policy
//! choices, and the stages themselves are shared.

use crate::{
    geography::{DirectoryColumns, JoinReport, RosterColumns},
    read_extract,
    score::AreaScores,
    util::csv_opt,
    AreaSummaries, ArcStr, ConditionDictionary, Context, Error, ExtractColumns, MissingPolicy,
    Period, PostcodeDirectory, PracticeRoster, PracticeSummaries, Result,
};
use itertools::Itertools;
use qu::ick_use::*;
use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

/// Everything that differs between the national pipelines.
#[derive(Debug, Clone)]
pub struct NationConfig {
    pub nation: ArcStr,
    pub extract: ExtractColumns,
    pub roster: RosterColumns,
    /// Postcode directory columns; coordinates are configured only for the
    /// interpolating nations.
    pub directory: DirectoryColumns,
    pub policy: MissingPolicy,
}

impl NationConfig {
    /// Scotland: Public Health Scotland monthly extracts, practice contact
    /// details and the postcode to MSOA lookup.
    pub fn scotland() -> Self {
        NationConfig {
            nation: "scotland".into(),
            extract: ExtractColumns {
                practice: "GPPractice".into(),
                description: "BNFItemDescription".into(),
                items: "NumberOfPaidItems".into(),
                period: Some("PaidDateMonth".into()),
            },
            roster: RosterColumns {
                practice: "PracticeCode".into(),
                postcode: "Postcode".into(),
            },
            directory: DirectoryColumns {
                postcode: "postcode".into(),
                area: "msoa21_code".into(),
                easting: None,
                northing: None,
            },
            policy: MissingPolicy::default(),
        }
    }

    /// Northern Ireland: Business Services Organisation extracts, the GP
    /// practice list and the NSPL for coordinates.
    pub fn northern_ireland() -> Self {
        NationConfig {
            nation: "northern-ireland".into(),
            extract: ExtractColumns {
                practice: "Practice".into(),
                description: "VTM_NM".into(),
                items: "Total Items".into(),
                period: None,
            },
            roster: RosterColumns {
                practice: "PracNo".into(),
                postcode: "Postcode".into(),
            },
            directory: nspl_columns(),
            policy: MissingPolicy::default(),
        }
    }

    /// Wales: NHS Wales extracts, the GP address list and the NSPL.
    pub fn wales() -> Self {
        NationConfig {
            nation: "wales".into(),
            extract: ExtractColumns {
                practice: "PracticeID".into(),
                description: "BNFName".into(),
                items: "Items".into(),
                period: None,
            },
            roster: RosterColumns {
                practice: "PracticeId".into(),
                postcode: "Postcode".into(),
            },
            directory: nspl_columns(),
            policy: MissingPolicy::default(),
        }
    }
}

fn nspl_columns() -> DirectoryColumns {
    DirectoryColumns {
        postcode: "pcds".into(),
        area: "lsoa11".into(),
        easting: Some("oseast1m".into()),
        northing: Some("osnrth1m".into()),
    }
}

/// One successfully ingested monthly extract.
#[derive(Debug)]
pub struct IngestedPeriod {
    pub path: PathBuf,
    pub period: Option<Period>,
    pub records: usize,
    pub duplicates_dropped: usize,
}

/// Per-file outcome of an ingest run. A file that fails to parse is
/// reported here and the run continues with the rest, so one bad month
/// degrades the year's coverage visibly rather than aborting it silently.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub loaded: Vec<IngestedPeriod>,
    pub failed: Vec<(PathBuf, Error)>,
    /// Files skipped because the same path was already ingested.
    pub duplicate_paths: Vec<PathBuf>,
    /// Files skipped because another file already supplied their period.
    pub duplicate_periods: Vec<(PathBuf, Period)>,
}

impl IngestReport {
    pub fn all_loaded(&self) -> bool {
        self.failed.is_empty()
            && self.duplicate_paths.is_empty()
            && self.duplicate_periods.is_empty()
    }
}

/// A configured run over one nation's data.
#[derive(Debug)]
pub struct Pipeline {
    pub config: NationConfig,
    pub dictionary: ConditionDictionary,
}

impl Pipeline {
    pub fn new(config: NationConfig, dictionary: ConditionDictionary) -> Self {
        Pipeline { config, dictionary }
    }

    /// Read, classify and aggregate a year of monthly extracts.
    pub fn ingest(&self, paths: &[PathBuf]) -> (PracticeSummaries, IngestReport) {
        let mut summaries = PracticeSummaries::new(self.dictionary.len());
        let mut report = IngestReport::default();
        let mut seen_paths = Vec::new();
        let mut seen_periods = Vec::new();
        for path in paths {
            // same file listed twice must not double count
            if seen_paths.contains(path) {
                event!(Level::WARN, "\"{}\" listed twice; skipped", path.display());
                report.duplicate_paths.push(path.clone());
                continue;
            }
            seen_paths.push(path.clone());
            let extract = match read_extract(path, &self.config.extract) {
                Ok(extract) => extract,
                Err(err) => {
                    event!(
                        Level::WARN,
                        "failed to ingest \"{}\": {:#}",
                        path.display(),
                        err
                    );
                    report.failed.push((path.clone(), err));
                    continue;
                }
            };
            if let Some(period) = extract.period {
                if seen_periods.contains(&period) {
                    event!(
                        Level::WARN,
                        "\"{}\" repeats period {}; skipped",
                        path.display(),
                        period
                    );
                    report.duplicate_periods.push((path.clone(), period));
                    continue;
                }
                seen_periods.push(period);
            }
            summaries.merge(PracticeSummaries::from_records(
                &self.dictionary,
                &extract.records,
            ));
            report.loaded.push(IngestedPeriod {
                path: path.clone(),
                period: extract.period,
                records: extract.records.len(),
                duplicates_dropped: extract.duplicates_dropped,
            });
        }
        if !seen_periods.is_empty() {
            seen_periods.sort();
            event!(
                Level::INFO,
                "ingested periods: {}",
                seen_periods.iter().join(", ")
            );
        }
        event!(
            Level::INFO,
            "{}: {} extracts loaded, {} failed, {} practices seen",
            self.config.nation,
            report.loaded.len(),
            report.failed.len(),
            summaries.len()
        );
        (summaries, report)
    }

    /// Area-level scoring (Scotland): join to the directory's area code,
    /// then rate, standardise, rank and bucket.
    pub fn score_areas(
        &self,
        summaries: &PracticeSummaries,
        roster: &PracticeRoster,
        directory: &PostcodeDirectory,
    ) -> (AreaScores, JoinReport) {
        let (areas, report) = AreaSummaries::by_area(summaries, roster, directory);
        let scores = AreaScores::compute(&areas, self.dictionary.names(), self.config.policy);
        (scores, report)
    }

    /// Postcode-level scoring (NI/Wales): the postcode itself is the
    /// reporting unit, feeding the interpolation stage.
    pub fn score_postcodes(
        &self,
        summaries: &PracticeSummaries,
        roster: &PracticeRoster,
    ) -> (AreaScores, JoinReport) {
        let (postcodes, report) = AreaSummaries::by_postcode(summaries, roster);
        let scores = AreaScores::compute(&postcodes, self.dictionary.names(), self.config.policy);
        (scores, report)
    }
}

/// Write the final output: `area_code,loneliness_zscore,rank,decile`.
pub fn write_scores_csv(path: impl AsRef<Path>, scores: &AreaScores) -> Result {
    let path = path.as_ref();
    write_scores(
        fs::File::create(path)
            .with_context(|| format!("creating \"{}\"", path.display()))?,
        scores,
    )
    .with_context(|| format!("while writing \"{}\"", path.display()))
}

fn write_scores(writer: impl io::Write, scores: &AreaScores) -> Result {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(["area_code", "loneliness_zscore", "rank", "decile"])?;
    for row in scores.iter() {
        csv.write_record([
            row.area.to_string(),
            csv_opt(row.composite),
            csv_opt(row.rank),
            csv_opt(row.decile),
        ])?;
    }
    csv.flush()?;
    Ok(())
}

/// Write the intermediate per-condition rates alongside the composite.
pub fn write_rates_csv(path: impl AsRef<Path>, scores: &AreaScores) -> Result {
    let path = path.as_ref();
    write_rates(
        fs::File::create(path)
            .with_context(|| format!("creating \"{}\"", path.display()))?,
        scores,
    )
    .with_context(|| format!("while writing \"{}\"", path.display()))
}

fn write_rates(writer: impl io::Write, scores: &AreaScores) -> Result {
    let mut csv = csv::Writer::from_writer(writer);
    let mut header = vec!["area_code".to_string()];
    header.extend(
        scores
            .conditions
            .iter()
            .map(|c| format!("{}_rate", c.replace(' ', "_"))),
    );
    header.push("loneliness_rate".to_string());
    header.push("loneliness_zscore".to_string());
    csv.write_record(&header)?;
    for row in scores.iter() {
        let mut record = vec![row.area.to_string()];
        record.extend(row.rates.iter().map(|&r| csv_opt(r)));
        record.push(csv_opt(row.any_rate));
        record.push(csv_opt(row.composite));
        csv.write_record(&record)?;
    }
    csv.flush()?;
    Ok(())
}

/// Write the postcode-level scores handed to the interpolation stage:
/// `postcode,loneliness_zscore`. Unscored postcodes are omitted since the
/// regressor has no use for them.
pub fn write_postcode_scores_csv(path: impl AsRef<Path>, scores: &AreaScores) -> Result {
    let path = path.as_ref();
    let mut csv = csv::Writer::from_path(path)
        .with_context(|| format!("creating \"{}\"", path.display()))?;
    csv.write_record(["postcode", "loneliness_zscore"])?;
    for row in scores.iter() {
        if let Some(composite) = row.composite {
            csv.write_record([row.area.to_string(), composite.to_string()])?;
        }
    }
    csv.flush()?;
    Ok(())
}

/// Rank and bucket interpolated zonal means, then write them in the final
/// output shape. Areas with no score keep empty fields.
pub fn write_zonal_scores_csv(
    path: impl AsRef<Path>,
    means: &[(ArcStr, Option<f64>)],
) -> Result {
    let path = path.as_ref();
    let composites: Vec<Option<f64>> = means.iter().map(|(_, m)| *m).collect();
    let (ranks, deciles) = crate::score::rank_and_decile(&composites);
    let mut csv = csv::Writer::from_path(path)
        .with_context(|| format!("creating \"{}\"", path.display()))?;
    csv.write_record(["area_code", "loneliness_zscore", "rank", "decile"])?;
    for (((area, mean), rank), decile) in means.iter().zip(ranks).zip(deciles) {
        csv.write_record([
            area.to_string(),
            csv_opt(*mean),
            csv_opt(rank),
            csv_opt(decile),
        ])?;
    }
    csv.flush()?;
    Ok(())
}

/// Read a postcode score file back, for runs where preprocessing and
/// interpolation happen in separate invocations.
pub fn read_postcode_scores_csv(path: impl AsRef<Path>) -> Result<Vec<(ArcStr, f64)>> {
    #[derive(serde::Deserialize)]
    struct Row {
        postcode: ArcStr,
        loneliness_zscore: f64,
    }
    let rows: Vec<Row> = crate::load_csv(path)?;
    Ok(rows
        .into_iter()
        .map(|r| (r.postcode, r.loneliness_zscore))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geography::PostcodeInfo;
    use crate::PrescriptionRecord;

    fn pipeline() -> Pipeline {
        let dictionary = ConditionDictionary::from_rows(std::iter::once((
            ArcStr::from("depression"),
            ArcStr::from("sertraline|citalopram"),
        )))
        .unwrap();
        Pipeline::new(NationConfig::northern_ireland(), dictionary)
    }

    fn record(practice: &str, description: &str, items: u64) -> PrescriptionRecord {
        PrescriptionRecord {
            practice: practice.into(),
            description: Some(description.into()),
            items,
        }
    }

    #[test]
    fn two_practice_two_month_two_area_run() {
        let pipeline = pipeline();
        // two monthly extracts, aggregated across the period
        let january = vec![
            record("1", "Sertraline 50mg tablets", 10),
            record("1", "Paracetamol 500mg tablets", 90),
            record("2", "Citalopram 20mg tablets", 5),
        ];
        let february = vec![
            record("1", "Sertraline 100mg tablets", 10),
            record("2", "Ibuprofen 400mg tablets", 95),
        ];
        let mut summaries = PracticeSummaries::from_records(&pipeline.dictionary, &january);
        summaries.merge(PracticeSummaries::from_records(
            &pipeline.dictionary,
            &february,
        ));

        let roster = PracticeRoster::from_pairs([
            (ArcStr::from("1"), ArcStr::from("BT11AA")),
            (ArcStr::from("2"), ArcStr::from("BT99ZZ")),
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
                ArcStr::from("BT99ZZ"),
                PostcodeInfo {
                    area: Some("SDZ002".into()),
                    location: None,
                },
            ),
        ]);

        let (scores, report) = pipeline.score_areas(&summaries, &roster, &directory);
        assert_eq!(report, JoinReport::default());
        assert_eq!(scores.len(), 2);

        // practice 1: 20 of 110 matched; practice 2: 5 of 100
        let sdz1 = scores.iter().find(|r| &*r.area == "SDZ001").unwrap();
        let sdz2 = scores.iter().find(|r| &*r.area == "SDZ002").unwrap();
        assert!((sdz1.rates[0].unwrap() - 20.0 / 110.0 * 100.0).abs() < 1e-9);
        assert!((sdz2.rates[0].unwrap() - 5.0).abs() < 1e-9);

        // the lonelier area ranks second of two and lands in the median bucket
        assert!(sdz1.composite.unwrap() > sdz2.composite.unwrap());
        assert_eq!(sdz1.rank, Some(2.0));
        assert_eq!(sdz2.rank, Some(1.0));
        assert_eq!(sdz2.decile, Some(0));
        assert_eq!(sdz1.decile, Some(5));
    }

    #[test]
    fn ingest_skips_a_path_listed_twice() {
        let pipeline = pipeline();
        let path = std::env::temp_dir().join(format!(
            "loneliness-ingest-dup-{}.csv",
            std::process::id()
        ));
        std::fs::write(&path, "Practice,VTM_NM,Total Items\n1,Sertraline 50mg,10\n").unwrap();

        let (summaries, report) = pipeline.ingest(&[path.clone(), path.clone()]);
        std::fs::remove_file(&path).ok();

        // without a period column the path is the only duplicate signal
        assert_eq!(summaries.get("1").unwrap().total, 10);
        assert_eq!(report.loaded.len(), 1);
        assert_eq!(report.duplicate_paths, vec![path]);
        assert!(!report.all_loaded());
    }

    #[test]
    fn ingest_reports_missing_files() {
        let pipeline = pipeline();
        let paths = vec![PathBuf::from("/nonexistent/extract.csv")];
        let (summaries, report) = pipeline.ingest(&paths);
        assert!(summaries.is_empty());
        assert_eq!(report.loaded.len(), 0);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.all_loaded());
    }

    #[test]
    fn scores_csv_renders_missing_as_empty() {
        let dictionary = ConditionDictionary::from_rows(std::iter::once((
            ArcStr::from("depression"),
            ArcStr::from("sertraline"),
        )))
        .unwrap();
        let scores = AreaScores {
            conditions: dictionary.names(),
            rows: vec![
                crate::score::AreaScore {
                    area: "SDZ001".into(),
                    rates: vec![Some(1.5)],
                    any_rate: Some(1.5),
                    zscores: vec![Some(-1.0)],
                    composite: Some(-1.0),
                    rank: Some(1.0),
                    decile: Some(0),
                },
                crate::score::AreaScore {
                    area: "SDZ002".into(),
                    rates: vec![None],
                    any_rate: None,
                    zscores: vec![None],
                    composite: None,
                    rank: None,
                    decile: None,
                },
            ],
        };
        let mut out = Vec::new();
        write_scores(&mut out, &scores).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "area_code,loneliness_zscore,rank,decile"
        );
        assert_eq!(lines.next().unwrap(), "SDZ001,-1,1,0");
        assert_eq!(lines.next().unwrap(), "SDZ002,,,");

        let mut out = Vec::new();
        write_rates(&mut out, &scores).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(
            "area_code,depression_rate,loneliness_rate,loneliness_zscore\n"
        ));
        assert!(text.contains("SDZ002,,,\n"));
    }
}

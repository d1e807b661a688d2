use clap::Parser;
use loneliness_index::{
    header,
    pipeline::{write_rates_csv, write_scores_csv},
    ConditionDictionary, NationConfig, Pipeline, PostcodeDirectory, PracticeRoster,
};
use qu::ick_use::*;
use std::path::PathBuf;
use term_data_table::{Cell, Row, Table};

#[derive(Debug, Parser)]
struct Opt {
    /// Condition dictionary CSV (`illness,medication`)
    #[clap(long)]
    dictionary: PathBuf,
    /// GP practice contact details CSV
    #[clap(long)]
    roster: PathBuf,
    /// Postcode to MSOA lookup CSV
    #[clap(long)]
    postcodes: PathBuf,
    /// Final scores output
    #[clap(long, default_value = "scotland_loneliness_msoa.csv")]
    out: PathBuf,
    /// Also write the per-condition rates to this path
    #[clap(long)]
    rates: Option<PathBuf>,
    /// Monthly prescribing extracts for the reporting year
    extracts: Vec<PathBuf>,
}

#[qu::ick]
fn main(opt: Opt) -> Result {
    ensure!(!opt.extracts.is_empty(), "no prescribing extracts given");
    let config = NationConfig::scotland();
    let dictionary = ConditionDictionary::load(&opt.dictionary)?;
    let roster = PracticeRoster::load(&opt.roster, &config.roster)?;
    let directory = PostcodeDirectory::load(&opt.postcodes, &config.directory)?;
    let pipeline = Pipeline::new(config, dictionary);

    let (summaries, report) = pipeline.ingest(&opt.extracts);
    ensure!(!report.loaded.is_empty(), "no extracts could be read");

    header("Ingest");
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from("Extract"))
            .with_cell(Cell::from("Period"))
            .with_cell(Cell::from("Records"))
            .with_cell(Cell::from("Duplicates dropped")),
    );
    for loaded in &report.loaded {
        table.add_row(
            Row::new()
                .with_cell(Cell::from(loaded.path.display().to_string()))
                .with_cell(Cell::from(
                    loaded.period.map(|p| p.to_string()).unwrap_or_default(),
                ))
                .with_cell(Cell::from(loaded.records.to_string()))
                .with_cell(Cell::from(loaded.duplicates_dropped.to_string())),
        );
    }
    println!("{}", table);
    if !report.failed.is_empty() {
        println!("{} extracts failed to load:", report.failed.len());
        for (path, err) in &report.failed {
            println!("  {}: {:#}", path.display(), err);
        }
    }
    for path in &report.duplicate_paths {
        println!("skipped {} (listed twice)", path.display());
    }
    for (path, period) in &report.duplicate_periods {
        println!("skipped {} (repeats period {})", path.display(), period);
    }

    let (scores, join) = pipeline.score_areas(&summaries, &roster, &directory);

    header("Scores");
    println!("practices with prescribing: {}", summaries.len());
    println!(
        "practices not in roster: {}",
        join.practices_not_in_roster
    );
    println!(
        "postcodes without an MSOA: {}",
        join.postcodes_not_in_directory
    );
    println!("MSOAs scored: {}", scores.len());

    write_scores_csv(&opt.out, &scores)?;
    println!("scores written to {}", opt.out.display());
    if let Some(rates) = &opt.rates {
        write_rates_csv(rates, &scores)?;
        println!("rates written to {}", rates.display());
    }
    Ok(())
}

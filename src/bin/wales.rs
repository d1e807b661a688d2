use clap::Parser;
use loneliness_index::{
    header,
    idw::{self, Boundaries, ScoredPoint},
    pipeline::{read_postcode_scores_csv, write_postcode_scores_csv, write_zonal_scores_csv},
    ArcStr, ConditionDictionary, Context, NationConfig, Pipeline, PostcodeDirectory,
    PracticeRoster,
};
use qu::ick_use::*;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Opt {
    /// Condition dictionary CSV (`illness,medication`)
    #[clap(long)]
    dictionary: Option<PathBuf>,
    /// GP address list CSV
    #[clap(long)]
    roster: Option<PathBuf>,
    /// NSPL extract with postcode centroids
    #[clap(long)]
    postcodes: PathBuf,
    /// LSOA boundaries GeoJSON
    #[clap(long)]
    boundaries: PathBuf,
    /// Feature property holding the area code
    #[clap(long, default_value = "LSOA21CD")]
    area_code_property: String,
    /// Final scores output
    #[clap(long, default_value = "wales_loneliness_lsoa.csv")]
    out: PathBuf,
    /// Also write the postcode-level scores to this path
    #[clap(long)]
    postcode_scores: Option<PathBuf>,
    /// Reuse a previously written postcode score file instead of extracts
    #[clap(long)]
    postcode_scores_in: Option<PathBuf>,
    /// Monthly prescribing extracts for the reporting year
    extracts: Vec<PathBuf>,
}

#[qu::ick]
fn main(opt: Opt) -> Result {
    let config = NationConfig::wales();
    let directory = PostcodeDirectory::load(&opt.postcodes, &config.directory)?;

    let postcode_scores: Vec<(ArcStr, f64)> = match &opt.postcode_scores_in {
        Some(path) => read_postcode_scores_csv(path)?,
        None => {
            ensure!(!opt.extracts.is_empty(), "no prescribing extracts given");
            let dictionary = opt
                .dictionary
                .as_ref()
                .context("--dictionary is required when ingesting extracts")?;
            let roster = opt
                .roster
                .as_ref()
                .context("--roster is required when ingesting extracts")?;
            let dictionary = ConditionDictionary::load(dictionary)?;
            let roster = PracticeRoster::load(roster, &config.roster)?;
            let pipeline = Pipeline::new(config.clone(), dictionary);

            let (summaries, report) = pipeline.ingest(&opt.extracts);
            ensure!(!report.loaded.is_empty(), "no extracts could be read");
            let (scores, join) = pipeline.score_postcodes(&summaries, &roster);

            header("Preprocessing");
            println!("practices with prescribing: {}", summaries.len());
            println!("practices not in roster: {}", join.practices_not_in_roster);
            println!("postcodes scored: {}", scores.len());
            if let Some(path) = &opt.postcode_scores {
                write_postcode_scores_csv(path, &scores)?;
                println!("postcode scores written to {}", path.display());
            }
            scores
                .iter()
                .filter_map(|row| row.composite.map(|c| (row.area.clone(), c)))
                .collect()
        }
    };

    let mut missing_coords = 0;
    let points: Vec<ScoredPoint> = postcode_scores
        .iter()
        .filter_map(|(postcode, value)| {
            match directory.get(postcode).and_then(|info| info.location) {
                Some((easting, northing)) => Some(ScoredPoint {
                    easting,
                    northing,
                    value: *value,
                }),
                None => {
                    missing_coords += 1;
                    None
                }
            }
        })
        .collect();
    ensure!(!points.is_empty(), "no scored postcodes have coordinates");

    let boundaries = Boundaries::load(&opt.boundaries, &opt.area_code_property)?;
    let means = idw::interpolate_to_areas(&points, &boundaries, idw::CELL_SIZE)?;

    header("Interpolation");
    println!("GP locations used: {}", points.len());
    println!("postcodes without coordinates: {}", missing_coords);
    println!(
        "LSOAs scored: {} of {}",
        means.iter().filter(|(_, m)| m.is_some()).count(),
        means.len()
    );

    write_zonal_scores_csv(&opt.out, &means)?;
    println!("scores written to {}", opt.out.display());
    Ok(())
}

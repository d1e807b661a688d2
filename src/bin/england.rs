use clap::Parser;
use loneliness_index::{
    england::{write_percentages_csv, AreaLookup, ClsScores, LookupColumns},
    header,
};
use qu::ick_use::*;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Opt {
    /// Community Life Survey loneliness percentages CSV (`oac_11,perc`)
    #[clap(long)]
    cls: PathBuf,
    /// 2011 OAC clusters CSV mapping output areas to classification groups
    #[clap(long)]
    oac_lookup: PathBuf,
    /// OA11 to LSOA11 lookup CSV
    #[clap(long)]
    lsoa11_lookup: PathBuf,
    /// LSOA11 to LSOA21 lookup CSV
    #[clap(long)]
    lsoa21_lookup: PathBuf,
    /// Final percentages output
    #[clap(long, default_value = "england_cls_loneliness_lsoa.csv")]
    out: PathBuf,
}

#[qu::ick]
fn main(opt: Opt) -> Result {
    let cls = ClsScores::load(&opt.cls)?;
    let oac = AreaLookup::load(
        &opt.oac_lookup,
        &LookupColumns {
            from: "Group Code".into(),
            to: "Output Area Code".into(),
        },
    )?;
    let mut lsoa11 = AreaLookup::load(
        &opt.lsoa11_lookup,
        &LookupColumns {
            from: "oa11_code".into(),
            to: "lsoa11_code".into(),
        },
    )?;
    lsoa11.retain_to_prefix("E");
    let mut lsoa21 = AreaLookup::load(
        &opt.lsoa21_lookup,
        &LookupColumns {
            from: "lsoa11_code".into(),
            to: "lsoa21_code".into(),
        },
    )?;
    lsoa21.retain_from_prefix("E");

    let oa_scores = oac.average(cls.scores());
    let lsoa11_scores = lsoa11.average(&oa_scores);
    let lsoa21_scores = lsoa21.average(&lsoa11_scores);

    header("England");
    println!("survey groups: {}", cls.len());
    println!("output areas: {}", oa_scores.len());
    println!("LSOA11s: {}", lsoa11_scores.len());
    println!("LSOA21s: {}", lsoa21_scores.len());
    println!(
        "LSOA21s without a figure: {}",
        lsoa21_scores.values().filter(|s| s.is_none()).count()
    );

    write_percentages_csv(&opt.out, &lsoa21_scores)?;
    println!("percentages written to {}", opt.out.display());
    Ok(())
}

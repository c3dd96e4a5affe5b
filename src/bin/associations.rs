use clap::{Parser, ValueEnum};
use gbm_registry_analysis::{
    associations::{
        normalize_groups, CategoryCounts, CounterBundle, DenominatorKind, GroupBy, RankedGroups,
        TOP_GROUPS,
    },
    header,
    incidence::HistologyCodeSet,
    output_path, path_exists, Tumors,
};
use qu::ick_use::*;
use std::{fs, path::Path};
use term_data_table::{Cell, Row, Table};

const COUNTERS: &str = "counters.bin";

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Denominator {
    /// Raw population count of the group.
    Population,
    /// Cumulative survival months of the group.
    Survival,
    /// Survival months restricted to each patient's first-ever record.
    FirstSurvival,
}

impl From<Denominator> for DenominatorKind {
    fn from(from: Denominator) -> Self {
        match from {
            Denominator::Population => DenominatorKind::PopulationCount,
            Denominator::Survival => DenominatorKind::SurvivalMonths,
            Denominator::FirstSurvival => DenominatorKind::FirstRecordSurvivalMonths,
        }
    }
}

#[derive(Parser)]
struct Opt {
    /// Denominator used for the normalized rankings.
    #[clap(long, value_enum, default_value = "population")]
    denominator: Denominator,
    /// Use the three-code GBM definition (omits 9445).
    #[clap(long)]
    narrow_codes: bool,
    /// Recompute the counter bundle even if a checkpoint exists.
    #[clap(long)]
    recompute: bool,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let tumors = Tumors::load("tumors.bin")?;
    let codes = if opt.narrow_codes {
        HistologyCodeSet::gbm_narrow()
    } else {
        HistologyCodeSet::gbm()
    };
    let denominator = DenominatorKind::from(opt.denominator);

    // Non-GBM tumours of GBM patients.
    let gbm_ids = tumors.filter_by_histology(&codes).patient_ids();
    let related = tumors
        .with_patients(&gbm_ids)
        .filter(|t| !codes.contains(t.histology_code));

    let bundle = if !opt.recompute && path_exists(&output_path(Path::new(COUNTERS)))? {
        println!("reusing counter checkpoint \"{}\"", COUNTERS);
        CounterBundle::load(COUNTERS)?
    } else {
        let bundle = CounterBundle::compute(&tumors, &related);
        bundle.save(COUNTERS)?;
        bundle
    };

    header("GBM-associated malignancies, raw counts");
    println!("{}", count_table(&bundle.related_sites, "Site"));
    println!("{}", count_table(&bundle.related_types, "Histology"));
    write_count_series(&bundle.related_sites, "gbm_assoc_site.csv")?;
    write_count_series(&bundle.related_types, "gbm_assoc_type.csv")?;

    header("GBM-associated malignancies, normalized");
    let by_site = normalize_groups(&related, &tumors, GroupBy::Site, denominator);
    let by_type = normalize_groups(&related, &tumors, GroupBy::HistologyType, denominator);
    println!("{}", ranked_table(&by_site, "Site"));
    report_misses(&by_site);
    println!("{}", ranked_table(&by_type, "Histology"));
    report_misses(&by_type);
    write_ranked_series(&by_site, "gbm_assoc_site_norm.csv")?;
    write_ranked_series(&by_type, "gbm_assoc_type_norm.csv")?;

    Ok(())
}

fn count_table(counts: &CategoryCounts, label: &str) -> Table<'static> {
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from(label.to_string()))
            .with_cell(Cell::from("GBM cases")),
    );
    for (group, count) in counts.most_common(TOP_GROUPS) {
        table.add_row(
            Row::new()
                .with_cell(Cell::from(group.to_string()))
                .with_cell(Cell::from(count.to_string())),
        );
    }
    table
}

fn ranked_table(ranked: &RankedGroups, label: &str) -> Table<'static> {
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from(label.to_string()))
            .with_cell(Cell::from("GBM cases"))
            .with_cell(Cell::from("Denominator"))
            .with_cell(Cell::from("Percentage")),
    );
    for group in &ranked.groups {
        table.add_row(
            Row::new()
                .with_cell(Cell::from(group.label.to_string()))
                .with_cell(Cell::from(group.numerator.to_string()))
                .with_cell(Cell::from(format!("{:.0}", group.denominator)))
                .with_cell(Cell::from(format!("{:.2}%", group.ratio * 100.))),
        );
    }
    table
}

fn report_misses(ranked: &RankedGroups) {
    for label in &ranked.misses {
        println!("skipped \"{}\": no denominator", label);
    }
}

/// Write a (label, value) series for the external chart renderer.
fn write_series(
    rows: impl IntoIterator<Item = (String, String)>,
    name: &str,
) -> Result {
    let path = output_path(name.as_ref());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::Writer::from_path(&path)?;
    wtr.write_record(["label", "value"])?;
    for (label, value) in rows {
        wtr.write_record([label, value])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_count_series(counts: &CategoryCounts, name: &str) -> Result {
    write_series(
        counts
            .most_common(TOP_GROUPS)
            .into_iter()
            .map(|(label, count)| (label.to_string(), count.to_string())),
        name,
    )
}

fn write_ranked_series(ranked: &RankedGroups, name: &str) -> Result {
    write_series(
        ranked
            .groups
            .iter()
            .map(|g| (g.label.to_string(), format!("{:.4}", g.ratio * 100.))),
        name,
    )
}

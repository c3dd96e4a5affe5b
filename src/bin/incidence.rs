use clap::Parser;
use gbm_registry_analysis::{
    header,
    incidence::{
        compute_incidence_ratio, incidence_by_group, HistologyCodeSet, IncidenceReport, PriorRate,
        PriorScope,
    },
    output_path, ArcStr, Tumor, Tumors,
};
use qu::ick_use::*;
use serde::Serialize;
use std::{fs, io, path::PathBuf};
use term_data_table::{Cell, Row, Table};

/// Columns of the registry extract the analysis consumes.
const COLUMNS: &[&str] = &[
    "Patient ID",
    "Histologic Type ICD-O-3",
    "ICD-O-3 Hist/behav",
    "Site recode ICD-O-3/WHO 2008",
    "SEER Brain and CNS Recode",
    "Sequence number",
    "Record number recode",
    "Survival months",
    "Sex",
    "Age recode with <1 year olds",
    "Radiation recode",
    "Chemotherapy recode (yes, no/unk)",
];

#[derive(Parser)]
struct Opt {
    /// Use the three-code GBM definition (omits 9445) instead of the
    /// four-code one.
    #[clap(long)]
    narrow_codes: bool,
    /// First-occurrence incidence rate to normalize against. When not given
    /// the rate is derived from the registry itself.
    #[clap(long)]
    prior: Option<f64>,
    /// Catchment population the extract represents.
    #[clap(long, default_value_t = 81_885_000.)]
    catchment: f64,
    /// Years of diagnoses the extract accumulates.
    #[clap(long, default_value_t = 19.)]
    years: f64,
    /// Recount the GBM patient total inside each subgroup instead of
    /// threading the whole-registry total through the sweep. Changes what the
    /// derived prior means; see the incidence module docs.
    #[clap(long)]
    per_subgroup_prior: bool,
    /// Print the registry columns the analysis consumes.
    #[clap(long)]
    dump_columns: bool,
    /// Export the filtered GBM and GBM-related tables as CSV next to the
    /// other outputs.
    #[clap(long)]
    export_intermediate: bool,
    /// Write a JSON report of the overall and per-subgroup results.
    #[clap(long)]
    json: Option<PathBuf>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    codes: Vec<u16>,
    overall: &'a IncidenceReport,
    by_sex: &'a [(ArcStr, IncidenceReport)],
    by_age_band: &'a [(ArcStr, IncidenceReport)],
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let tumors = Tumors::load("tumors.bin")?;
    let codes = if opt.narrow_codes {
        HistologyCodeSet::gbm_narrow()
    } else {
        HistologyCodeSet::gbm()
    };
    let prior = match opt.prior {
        Some(rate) => PriorRate::Fixed(rate),
        None => PriorRate::Derive {
            catchment_population: opt.catchment,
            years_observed: opt.years,
        },
    };
    let scope = if opt.per_subgroup_prior {
        PriorScope::PerSubgroup
    } else {
        PriorScope::WholeRegistry
    };

    header("Registry");
    println!("total tumour records: {}", tumors.len());
    println!("total distinct patients: {}", tumors.distinct_patients());
    let gbm = tumors.filter_by_histology(&codes);
    println!(
        "GBM patients ({} codes): {}",
        codes.iter().count(),
        gbm.distinct_patients()
    );
    // The extract carries a pre-computed CNS recode; a large disagreement
    // with the histology codeset would point at an import problem.
    let via_recode = tumors
        .filter(|t| &*t.brain_cns_recode == "1.1.2 Glioblastoma")
        .distinct_patients();
    println!("GBM patients via Brain/CNS recode cross-check: {}", via_recode);
    if opt.dump_columns {
        println!();
        for col in COLUMNS {
            println!("{}", col);
        }
    }

    header("Overall");
    let overall = compute_incidence_ratio(&tumors, &codes, prior, None);
    println!("{}", report_table(&overall));

    header("By sex");
    let by_sex = incidence_by_group(
        &tumors,
        |t: &Tumor| ArcStr::from(t.sex.to_string()),
        &codes,
        prior,
        scope,
    );
    println!("{}", sweep_table(&by_sex));

    header("By age band");
    let by_age_band = incidence_by_group(
        &tumors,
        |t: &Tumor| t.age_band.clone(),
        &codes,
        prior,
        scope,
    );
    println!("{}", sweep_table(&by_age_band));

    if opt.export_intermediate {
        let gbm_ids = gbm.patient_ids();
        let related = tumors
            .with_patients(&gbm_ids)
            .filter(|t| !codes.contains(t.histology_code));
        export_csv(&gbm, "gbm.csv")?;
        export_csv(&related, "gbm_related.csv")?;
        println!(
            "\nexported {} GBM rows and {} GBM-related rows",
            gbm.len(),
            related.len()
        );
    }

    if let Some(path) = &opt.json {
        let report = JsonReport {
            codes: codes.iter().collect(),
            overall: &overall,
            by_sex: &by_sex,
            by_age_band: &by_age_band,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let out = io::BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer_pretty(out, &report)?;
        println!("\nwrote JSON report to \"{}\"", path.display());
    }

    Ok(())
}

fn report_table(report: &IncidenceReport) -> Table {
    let mut table = Table::new();
    let mut row = |label: &str, value: String| {
        table.add_row(
            Row::new()
                .with_cell(Cell::from(label.to_string()))
                .with_cell(Cell::from(value)),
        );
    };
    row("first/only GBM patients", report.counts.n_first.to_string());
    row("subsequent GBM patients", report.counts.n_second.to_string());
    row(
        "not-first patient population",
        report.counts.n_not_first_pop.to_string(),
    );
    row(
        "GBM patients (prior scope)",
        report.counts.n_target_patients.to_string(),
    );
    row(
        "duplicate first/only tags",
        report.counts.duplicate_first_tags.to_string(),
    );
    row("prior incidence rate", fmt_rate(report.prior_rate));
    row("prior rate per year", fmt_rate(report.annualized_prior));
    row("secondary incidence rate", fmt_rate(report.secondary_rate));
    row("incidence ratio", report.ratio.to_string());
    table
}

fn sweep_table(results: &[(ArcStr, IncidenceReport)]) -> Table {
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from("Subgroup"))
            .with_cell(Cell::from("First"))
            .with_cell(Cell::from("Subsequent"))
            .with_cell(Cell::from("Not-first pop"))
            .with_cell(Cell::from("Secondary rate"))
            .with_cell(Cell::from("Ratio")),
    );
    for (label, report) in results {
        table.add_row(
            Row::new()
                .with_cell(Cell::from(label.to_string()))
                .with_cell(Cell::from(report.counts.n_first.to_string()))
                .with_cell(Cell::from(report.counts.n_second.to_string()))
                .with_cell(Cell::from(report.counts.n_not_first_pop.to_string()))
                .with_cell(Cell::from(fmt_rate(report.secondary_rate)))
                .with_cell(Cell::from(report.ratio.to_string())),
        );
    }
    table
}

fn fmt_rate(rate: Option<f64>) -> String {
    match rate {
        Some(rate) => format!("{:.3e}", rate),
        None => "-".to_string(),
    }
}

fn export_csv(tumors: &Tumors, name: &str) -> Result {
    let path = output_path(name.as_ref());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::Writer::from_path(&path)?;
    for tumor in tumors {
        wtr.serialize(tumor)?;
    }
    wtr.flush()?;
    Ok(())
}

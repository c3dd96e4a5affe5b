use clap::Parser;
use gbm_registry_analysis::{output_path, path_exists, Tumors, DEFAULT_EXTRACT};
use qu::ick_use::*;
use std::path::Path;

#[derive(Parser)]
struct Opt {
    /// CSV extract to import, relative to the data directory.
    #[clap(long, short, default_value = DEFAULT_EXTRACT)]
    extract: String,
    #[clap(long, short)]
    overwrite: bool,
}

#[qu::ick]
fn main(opt: Opt) -> Result {
    let out = "tumors.bin";
    if !opt.overwrite {
        ensure!(
            !path_exists(&output_path(Path::new(out)))?,
            "\"{}\" already exists, pass --overwrite to replace it",
            out
        );
    }
    let tumors = Tumors::load_orig(&opt.extract)?;
    println!(
        "imported {} tumour records ({} distinct patients)",
        tumors.len(),
        tumors.distinct_patients()
    );
    tumors.save(out)?;
    Ok(())
}

//! Malignancies associated with GBM.
//!
//! Takes the non-GBM tumours of GBM patients and ranks their sites and
//! histology types, either by raw count or normalized against how common the
//! site/type is in the registry overall. The aggregate counts are cached in a
//! checkpoint file so chart data can be regenerated without re-reading the
//! extract.
use crate::{check_extension, output_path, util, ArcStr, Context, PatientId, Result, Tumor, Tumors};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    path::Path,
};

/// How many groups the ranked reports keep.
pub const TOP_GROUPS: usize = 15;

/// Occurrence counts per category label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts(BTreeMap<ArcStr, u64>);

impl CategoryCounts {
    pub fn from_values(values: impl IntoIterator<Item = ArcStr>) -> Self {
        let mut map = BTreeMap::new();
        for value in values {
            *map.entry(value).or_insert(0) += 1;
        }
        Self(map)
    }

    pub fn get(&self, label: &str) -> u64 {
        self.0.get(label).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArcStr, u64)> + '_ {
        self.0.iter().map(|(label, count)| (label, *count))
    }

    /// The `n` highest counts, descending; ties break by label so the order
    /// is stable between runs.
    pub fn most_common(&self, n: usize) -> Vec<(ArcStr, u64)> {
        let mut all: Vec<(ArcStr, u64)> = self
            .0
            .iter()
            .map(|(label, count)| (label.clone(), *count))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        all.truncate(n);
        all
    }
}

/// The four aggregate distributions one analysis run produces: site and
/// histology-type counts over the whole registry and over the GBM-related
/// rows.
///
/// This is a cache of cheap-to-recompute aggregates, not authoritative state;
/// the file is fully replaced each time it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterBundle {
    pub all_sites: CategoryCounts,
    pub all_types: CategoryCounts,
    pub related_sites: CategoryCounts,
    pub related_types: CategoryCounts,
}

impl CounterBundle {
    pub fn compute(all: &Tumors, related: &Tumors) -> Self {
        CounterBundle {
            all_sites: CategoryCounts::from_values(all.iter().map(|t| t.site_recode)),
            all_types: CategoryCounts::from_values(all.iter().map(|t| t.histology_label)),
            related_sites: CategoryCounts::from_values(related.iter().map(|t| t.site_recode)),
            related_types: CategoryCounts::from_values(related.iter().map(|t| t.histology_label)),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = output_path(path.as_ref());
        check_extension(&path, "bin")?;
        let reader = io::BufReader::new(fs::File::open(&path)?);
        bincode::deserialize_from(reader)
            .with_context(|| format!("unable to load counters from \"{}\"", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        let path = output_path(path.as_ref());
        check_extension(&path, "bin")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("could not create parent")?;
        }
        if util::path_exists(&path)? {
            event!(
                Level::WARN,
                "overwriting existing file at \"{}\"",
                path.display()
            );
        }
        let mut out = io::BufWriter::new(fs::File::create(&path)?);
        bincode::serialize_into(&mut out, self)
            .with_context(|| format!("unable to save counters to \"{}\"", path.display()))
    }
}

/// Which registry column the ranking groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Site,
    HistologyType,
}

impl GroupBy {
    pub fn key(&self, tumor: &Tumor) -> ArcStr {
        match self {
            GroupBy::Site => tumor.site_recode.clone(),
            GroupBy::HistologyType => tumor.histology_label.clone(),
        }
    }
}

/// What a group's numerator count is divided by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenominatorKind {
    /// Row count of the group across the whole registry.
    PopulationCount,
    /// Sum of survival months of the group across the whole registry.
    SurvivalMonths,
    /// Sum of survival months restricted to each patient's first-ever record.
    FirstRecordSurvivalMonths,
}

/// One group of the ranked output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedGroup {
    pub label: ArcStr,
    pub numerator: u64,
    pub denominator: f64,
    pub ratio: f64,
}

/// Groups ranked descending by normalized ratio, truncated to [`TOP_GROUPS`],
/// plus the groups that had to be skipped for lack of a denominator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedGroups {
    pub groups: Vec<RankedGroup>,
    /// Labels present in the numerator but absent (or zero) in the chosen
    /// denominator. Reported, not silently dropped.
    pub misses: Vec<ArcStr>,
}

/// Rank the categories of `related` (the non-GBM tumours of GBM patients) by
/// their count normalized against the chosen denominator over `all`.
///
/// A category with no usable denominator is logged and collected in
/// `misses`; the remaining categories are ranked as if it never appeared.
pub fn normalize_groups(
    related: &Tumors,
    all: &Tumors,
    group_by: GroupBy,
    denominator: DenominatorKind,
) -> RankedGroups {
    let numerators = CategoryCounts::from_values(related.iter().map(|t| group_by.key(&t)));
    let denominators = denominator_table(all, group_by, denominator);

    let mut groups = Vec::with_capacity(numerators.len());
    let mut misses = Vec::new();
    for (label, numerator) in numerators.iter() {
        let denom = denominators.get(&**label).copied().unwrap_or(0.);
        if denom <= 0. {
            event!(
                Level::WARN,
                "group \"{}\" has {} related cases but no denominator; skipping it",
                label,
                numerator
            );
            misses.push(label.clone());
            continue;
        }
        groups.push(RankedGroup {
            label: label.clone(),
            numerator,
            denominator: denom,
            ratio: numerator as f64 / denom,
        });
    }

    groups.sort_by(|a, b| {
        b.ratio
            .partial_cmp(&a.ratio)
            .expect("ratios are finite")
            .then_with(|| a.label.cmp(&b.label))
    });
    groups.truncate(TOP_GROUPS);

    RankedGroups { groups, misses }
}

fn denominator_table(
    all: &Tumors,
    group_by: GroupBy,
    kind: DenominatorKind,
) -> BTreeMap<ArcStr, f64> {
    let mut map: BTreeMap<ArcStr, f64> = BTreeMap::new();
    match kind {
        DenominatorKind::PopulationCount => {
            for t in all {
                *map.entry(group_by.key(t)).or_insert(0.) += 1.;
            }
        }
        DenominatorKind::SurvivalMonths => {
            for t in all {
                if let Some(months) = t.survival_months {
                    *map.entry(group_by.key(t)).or_insert(0.) += months as f64;
                }
            }
        }
        DenominatorKind::FirstRecordSurvivalMonths => {
            // Keep only the earliest row of each patient's submission
            // history, then sum as above.
            let mut firsts: BTreeMap<PatientId, &Tumor> = BTreeMap::new();
            for t in all {
                firsts
                    .entry(t.patient_id)
                    .and_modify(|cur| {
                        if t.record_number < cur.record_number {
                            *cur = t;
                        }
                    })
                    .or_insert(t);
            }
            for t in firsts.values() {
                if let Some(months) = t.survival_months {
                    *map.entry(group_by.key(t)).or_insert(0.) += months as f64;
                }
            }
        }
    }
    map
}

//! First vs. subsequent GBM incidence.
//!
//! The registry records one row per diagnosed tumour. For the condition of
//! interest we split its patients into those whose diagnosis was flagged as
//! their first/only known primary and those for whom it arrived after another
//! primary, then compare the rate of subsequent occurrence against the
//! first-occurrence incidence rate.
use crate::{ArcStr, Result, Tumor, Tumors};
use once_cell::sync::Lazy;
use qu::ick_use::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// ICD-O-3 histology codes for glioblastoma used by the study.
pub const GBM_CODES: [u16; 4] = [9440, 9441, 9442, 9445];

/// The three-code GBM definition (omits 9445) that part of the original study
/// used. Which definition applies is always an explicit choice of the caller.
pub const GBM_CODES_NARROW: [u16; 3] = [9440, 9441, 9442];

/// A non-empty set of ICD-O-3 histology codes identifying one condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistologyCodeSet(BTreeSet<u16>);

impl HistologyCodeSet {
    pub fn new(codes: impl IntoIterator<Item = u16>) -> Result<Self> {
        let codes: BTreeSet<u16> = codes.into_iter().collect();
        ensure!(!codes.is_empty(), "histology code set must not be empty");
        Ok(Self(codes))
    }

    pub fn gbm() -> Self {
        Self(GBM_CODES.into_iter().collect())
    }

    pub fn gbm_narrow() -> Self {
        Self(GBM_CODES_NARROW.into_iter().collect())
    }

    pub fn contains(&self, code: u16) -> bool {
        self.0.contains(&code)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }
}

static FIRST_PRIMARY: Lazy<Regex> = Lazy::new(|| {
    // The registry writes exactly two phrase families for a first primary;
    // everything else (later primaries, missing values) is "not first".
    Regex::new(r"(?i)one primary only|1st of \d+( or more)? primaries").unwrap()
});

/// Whether a sequence descriptor marks a tumour as the patient's first or
/// only known primary.
pub fn is_first_primary(sequence: &str) -> bool {
    FIRST_PRIMARY.is_match(sequence)
}

/// The first-occurrence incidence rate to normalize against.
///
/// Callers must know which mode they invoke: `Fixed` imports a rate from a
/// reference population, `Derive` computes one from the records themselves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriorRate {
    Fixed(f64),
    Derive {
        /// Population the registry extract is assumed to represent.
        catchment_population: f64,
        /// Years of diagnoses the extract accumulates.
        years_observed: f64,
    },
}

/// Where the target-condition patient total used by a derived prior comes
/// from during a subgroup sweep.
///
/// `WholeRegistry` counts once over the unfiltered table and threads that
/// total through every subgroup. `PerSubgroup` recounts inside each subgroup,
/// which silently changes what the statistic means; it exists because the
/// original study ran both ways, and must be asked for explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorScope {
    WholeRegistry,
    PerSubgroup,
}

/// Which denominator of the incidence ratio was zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZeroDenominator {
    NotFirstPopulation,
    PriorRate,
}

impl fmt::Display for ZeroDenominator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ZeroDenominator::NotFirstPopulation => f.write_str("not-first patient population"),
            ZeroDenominator::PriorRate => f.write_str("prior incidence rate"),
        }
    }
}

/// The incidence ratio, or the reason it could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IncidenceRatio {
    Defined(f64),
    /// A denominator was zero; the ratio is undefined, not zero.
    UndefinedZeroDenominator(ZeroDenominator),
    /// No rows at all, e.g. an age band with no patients.
    InsufficientData,
}

impl IncidenceRatio {
    pub fn value(&self) -> Option<f64> {
        match self {
            IncidenceRatio::Defined(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for IncidenceRatio {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IncidenceRatio::Defined(v) => write!(f, "{:.3}", v),
            IncidenceRatio::UndefinedZeroDenominator(which) => {
                write!(f, "undefined (zero {})", which)
            }
            IncidenceRatio::InsufficientData => f.write_str("insufficient data"),
        }
    }
}

/// Distinct-patient counts behind one incidence-ratio computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidenceCounts {
    /// Patients whose target-condition diagnosis was their first/only primary.
    pub n_first: usize,
    /// Patients diagnosed with the target condition as a later primary.
    pub n_second: usize,
    /// All patients left once first-tagged patients are removed entirely.
    pub n_not_first_pop: usize,
    /// Distinct target-condition patients in the scope the prior was derived
    /// over.
    pub n_target_patients: usize,
    /// Rows carrying a first/only tag beyond one per patient. Should be zero;
    /// anything else is a data-quality problem in the extract.
    pub duplicate_first_tags: usize,
}

/// Result of one incidence-ratio computation, with the intermediate counts
/// and rates for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IncidenceReport {
    pub counts: IncidenceCounts,
    /// First-occurrence rate normalized against. `None` only when there was
    /// no data to derive one from.
    pub prior_rate: Option<f64>,
    /// The derived prior divided by years observed, for reporting alongside
    /// the cumulative rate. `None` when the prior was supplied by the caller.
    pub annualized_prior: Option<f64>,
    /// `n_second / n_not_first_pop`; `None` when that denominator was zero.
    pub secondary_rate: Option<f64>,
    pub ratio: IncidenceRatio,
}

impl IncidenceReport {
    fn insufficient() -> Self {
        IncidenceReport {
            counts: IncidenceCounts::default(),
            prior_rate: None,
            annualized_prior: None,
            secondary_rate: None,
            ratio: IncidenceRatio::InsufficientData,
        }
    }
}

/// Compute the subsequent-vs-first incidence ratio of a condition over a
/// registry table.
///
/// `records` may be the whole registry or a subgroup slice. `n_target_whole`
/// is the distinct-patient count of the condition over the *original,
/// unfiltered* table; pass `Some` when slicing so a derived prior keeps its
/// whole-registry meaning (see [`PriorScope`]), or `None` to count over
/// `records` itself.
pub fn compute_incidence_ratio(
    records: &Tumors,
    codes: &HistologyCodeSet,
    prior: PriorRate,
    n_target_whole: Option<usize>,
) -> IncidenceReport {
    if records.is_empty() {
        return IncidenceReport::insufficient();
    }

    let target = records.filter_by_histology(codes);
    let first = target.filter(|t| is_first_primary(&t.sequence));

    // A patient can carry at most one first/only tag for one condition. The
    // extract is not trusted on this: excess tags are counted and logged, and
    // the computation continues on distinct patients.
    let ids_with_first = first.patient_ids();
    let duplicate_first_tags = first.len() - ids_with_first.len();
    if duplicate_first_tags > 0 {
        event!(
            Level::WARN,
            "{} rows carry a duplicate first/only-primary tag for an already-tagged patient",
            duplicate_first_tags
        );
    }

    // Drop every row of a first-tagged patient, not just the tagged row. What
    // remains is the population whose target-condition diagnosis, if any,
    // was not their first-ever primary.
    let not_first = records.without_patients(&ids_with_first);
    let second = not_first.filter_by_histology(codes);

    let counts = IncidenceCounts {
        n_first: ids_with_first.len(),
        n_second: second.distinct_patients(),
        n_not_first_pop: not_first.distinct_patients(),
        n_target_patients: n_target_whole.unwrap_or_else(|| target.distinct_patients()),
        duplicate_first_tags,
    };

    let (prior_rate, annualized_prior) = match prior {
        PriorRate::Fixed(rate) => (rate, None),
        PriorRate::Derive {
            catchment_population,
            years_observed,
        } => {
            let n_first_ever = counts.n_target_patients.saturating_sub(counts.n_second);
            let rate = n_first_ever as f64 / catchment_population;
            (rate, Some(rate / years_observed))
        }
    };

    if counts.n_not_first_pop == 0 {
        return IncidenceReport {
            counts,
            prior_rate: Some(prior_rate),
            annualized_prior,
            secondary_rate: None,
            ratio: IncidenceRatio::UndefinedZeroDenominator(ZeroDenominator::NotFirstPopulation),
        };
    }
    let secondary_rate = counts.n_second as f64 / counts.n_not_first_pop as f64;

    let ratio = if prior_rate == 0. || !prior_rate.is_finite() {
        IncidenceRatio::UndefinedZeroDenominator(ZeroDenominator::PriorRate)
    } else {
        IncidenceRatio::Defined(secondary_rate / prior_rate)
    };

    IncidenceReport {
        counts,
        prior_rate: Some(prior_rate),
        annualized_prior,
        secondary_rate: Some(secondary_rate),
        ratio,
    }
}

/// Run the incidence-ratio computation once per subgroup of a grouping
/// attribute (sex, age band, ...).
///
/// A zero denominator or empty subgroup only affects that subgroup's entry;
/// the sweep always covers every group present in the data. Results come back
/// ordered by group label.
pub fn incidence_by_group(
    records: &Tumors,
    group: impl Fn(&Tumor) -> ArcStr,
    codes: &HistologyCodeSet,
    prior: PriorRate,
    scope: PriorScope,
) -> Vec<(ArcStr, IncidenceReport)> {
    // Count target patients over the unfiltered table exactly once, before
    // any slicing.
    let n_target_whole = match scope {
        PriorScope::WholeRegistry => Some(records.filter_by_histology(codes).distinct_patients()),
        PriorScope::PerSubgroup => None,
    };

    let mut groups: BTreeMap<ArcStr, Vec<Tumor>> = BTreeMap::new();
    for tumor in records.iter() {
        groups.entry(group(&tumor)).or_default().push(tumor);
    }

    groups
        .into_iter()
        .map(|(label, rows)| {
            let rows: Tumors = rows.into_iter().collect();
            let report = compute_incidence_ratio(&rows, codes, prior, n_target_whole);
            if let IncidenceRatio::UndefinedZeroDenominator(which) = report.ratio {
                event!(
                    Level::WARN,
                    "subgroup \"{}\": ratio undefined, zero {}",
                    label,
                    which
                );
            }
            (label, report)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Sex;

    fn tumor(pid: u64, hist: u16, seq: &str) -> Tumor {
        Tumor {
            patient_id: pid,
            histology_code: hist,
            histology_label: format!("{}/3", hist).into(),
            site_recode: "Brain".into(),
            brain_cns_recode: "".into(),
            sequence: seq.into(),
            record_number: 1,
            survival_months: None,
            sex: Sex::Male,
            age_band: "60-64 years".into(),
            radiation: "None/Unknown".into(),
            chemotherapy: "No/Unknown".into(),
        }
    }

    fn codes() -> HistologyCodeSet {
        HistologyCodeSet::new([9440]).unwrap()
    }

    #[test]
    fn sequence_descriptor_matching() {
        assert!(is_first_primary("One primary only"));
        assert!(is_first_primary("ONE PRIMARY ONLY"));
        assert!(is_first_primary("1st of 2 or more primaries"));
        assert!(is_first_primary("1st of 3 primaries"));
        assert!(!is_first_primary("2nd of 2 or more primaries"));
        assert!(!is_first_primary("3rd of 3 or more primaries"));
        assert!(!is_first_primary(""));
        assert!(!is_first_primary("Unknown"));
    }

    #[test]
    fn worked_scenario() {
        let records: Tumors = vec![
            tumor(1, 9440, "One primary only"),
            tumor(2, 9440, "2nd of 2 primaries"),
            tumor(2, 1234, "1st of 2 primaries"),
        ]
        .into_iter()
        .collect();

        let report = compute_incidence_ratio(&records, &codes(), PriorRate::Fixed(0.5), None);
        assert_eq!(report.counts.n_first, 1);
        assert_eq!(report.counts.n_second, 1);
        assert_eq!(report.counts.n_not_first_pop, 1);
        assert_eq!(report.counts.duplicate_first_tags, 0);
        assert_eq!(report.secondary_rate, Some(1.0));
        assert_eq!(report.ratio, IncidenceRatio::Defined(2.0));
    }

    #[test]
    fn empty_records_is_insufficient_data() {
        let records: Tumors = Vec::<Tumor>::new().into_iter().collect();
        let report = compute_incidence_ratio(&records, &codes(), PriorRate::Fixed(0.5), None);
        assert_eq!(report.ratio, IncidenceRatio::InsufficientData);
        assert_eq!(report.secondary_rate, None);
        assert_eq!(report.counts, IncidenceCounts::default());
    }

    #[test]
    fn zero_not_first_population_is_flagged() {
        // Every patient is first-tagged, so removing them empties the table.
        let records: Tumors = vec![tumor(1, 9440, "One primary only")].into_iter().collect();
        let report = compute_incidence_ratio(&records, &codes(), PriorRate::Fixed(0.5), None);
        assert_eq!(
            report.ratio,
            IncidenceRatio::UndefinedZeroDenominator(ZeroDenominator::NotFirstPopulation)
        );
        assert_eq!(report.secondary_rate, None);
    }

    #[test]
    fn zero_prior_rate_is_flagged() {
        let records: Tumors = vec![
            tumor(1, 9440, "2nd of 2 or more primaries"),
            tumor(2, 8140, "One primary only"),
        ]
        .into_iter()
        .collect();
        let report = compute_incidence_ratio(&records, &codes(), PriorRate::Fixed(0.), None);
        assert_eq!(
            report.ratio,
            IncidenceRatio::UndefinedZeroDenominator(ZeroDenominator::PriorRate)
        );
        // The secondary rate itself is still reportable.
        assert_eq!(report.secondary_rate, Some(0.5));
    }

    #[test]
    fn duplicate_first_tags_warn_but_do_not_abort() {
        let mut dup = tumor(1, 9440, "One primary only");
        dup.record_number = 2;
        let records: Tumors = vec![
            tumor(1, 9440, "One primary only"),
            dup,
            tumor(2, 9440, "2nd of 2 or more primaries"),
        ]
        .into_iter()
        .collect();
        let report = compute_incidence_ratio(&records, &codes(), PriorRate::Fixed(0.5), None);
        assert_eq!(report.counts.duplicate_first_tags, 1);
        assert_eq!(report.counts.n_first, 1);
        assert_eq!(report.counts.n_second, 1);
    }

    #[test]
    fn first_and_not_first_partition_the_patients() {
        let records: Tumors = vec![
            tumor(1, 9440, "One primary only"),
            tumor(2, 9440, "2nd of 2 or more primaries"),
            tumor(2, 8140, "1st of 2 or more primaries"),
            tumor(3, 8070, "One primary only"),
        ]
        .into_iter()
        .collect();
        let ids_with_first = records
            .filter_by_histology(&codes())
            .filter(|t| is_first_primary(&t.sequence))
            .patient_ids();
        let not_first = records.without_patients(&ids_with_first);
        let with_first = records.with_patients(&ids_with_first);

        assert_eq!(with_first.len() + not_first.len(), records.len());
        assert!(not_first.patient_ids().is_disjoint(&ids_with_first));
        let mut union = not_first.patient_ids();
        union.extend(with_first.patient_ids());
        assert_eq!(union, records.patient_ids());
    }

    #[test]
    fn idempotent_over_immutable_input() {
        let records: Tumors = vec![
            tumor(1, 9440, "One primary only"),
            tumor(2, 9440, "2nd of 2 or more primaries"),
            tumor(3, 8140, "One primary only"),
        ]
        .into_iter()
        .collect();
        let prior = PriorRate::Derive {
            catchment_population: 1000.,
            years_observed: 19.,
        };
        let a = compute_incidence_ratio(&records, &codes(), prior, None);
        let b = compute_incidence_ratio(&records, &codes(), prior, None);
        assert_eq!(a, b);
    }

    #[test]
    fn unrelated_patients_only_dilute_the_secondary_rate() {
        let base: Vec<Tumor> = vec![
            tumor(1, 9440, "One primary only"),
            tumor(2, 9440, "2nd of 2 or more primaries"),
            tumor(3, 8140, "One primary only"),
        ];
        let records: Tumors = base.clone().into_iter().collect();
        let before = compute_incidence_ratio(&records, &codes(), PriorRate::Fixed(0.5), None);

        let mut extended = base;
        extended.push(tumor(10, 8140, "One primary only"));
        extended.push(tumor(11, 8070, "2nd of 2 or more primaries"));
        let extended: Tumors = extended.into_iter().collect();
        let after = compute_incidence_ratio(&extended, &codes(), PriorRate::Fixed(0.5), None);

        assert_eq!(after.counts.n_first, before.counts.n_first);
        assert_eq!(after.counts.n_second, before.counts.n_second);
        assert!(after.counts.n_not_first_pop > before.counts.n_not_first_pop);
        assert!(after.secondary_rate.unwrap() < before.secondary_rate.unwrap());
    }

    #[test]
    fn derived_prior_uses_whole_registry_total() {
        // 3 distinct target patients overall, 1 of them subsequent.
        let records: Tumors = vec![
            tumor(1, 9440, "One primary only"),
            tumor(2, 9440, "One primary only"),
            tumor(3, 9440, "2nd of 2 or more primaries"),
            tumor(4, 8140, "One primary only"),
        ]
        .into_iter()
        .collect();
        let prior = PriorRate::Derive {
            catchment_population: 100.,
            years_observed: 10.,
        };
        let report = compute_incidence_ratio(&records, &codes(), prior, None);
        // (3 target patients - 1 subsequent) / 100
        assert_eq!(report.prior_rate, Some(0.02));
        assert_eq!(report.annualized_prior, Some(0.002));
    }

    #[test]
    fn subgroup_sweep_is_local_about_failures() {
        // "A" has a computable ratio, "B" consists only of a first-tagged
        // patient so its not-first population is zero.
        let mut rows = vec![
            tumor(1, 9440, "One primary only"),
            tumor(2, 9440, "2nd of 2 or more primaries"),
            tumor(3, 8140, "One primary only"),
        ];
        for t in &mut rows {
            t.age_band = "A".into();
        }
        let mut b = tumor(4, 9440, "One primary only");
        b.age_band = "B".into();
        rows.push(b);
        let records: Tumors = rows.into_iter().collect();

        let results = incidence_by_group(
            &records,
            |t| t.age_band.clone(),
            &codes(),
            PriorRate::Fixed(0.5),
            PriorScope::WholeRegistry,
        );
        assert_eq!(results.len(), 2);
        assert_eq!(&*results[0].0, "A");
        assert!(matches!(results[0].1.ratio, IncidenceRatio::Defined(_)));
        assert_eq!(
            results[1].1.ratio,
            IncidenceRatio::UndefinedZeroDenominator(ZeroDenominator::NotFirstPopulation)
        );
    }

    #[test]
    fn prior_scope_changes_the_derived_prior() {
        // Subgroup "A" holds 1 of the 2 first-ever target patients.
        let mut rows = vec![
            tumor(1, 9440, "One primary only"),
            tumor(2, 9440, "2nd of 2 or more primaries"),
        ];
        for t in &mut rows {
            t.age_band = "A".into();
        }
        let mut other = tumor(3, 9440, "One primary only");
        other.age_band = "B".into();
        rows.push(other);
        let mut filler = tumor(4, 8140, "One primary only");
        filler.age_band = "A".into();
        rows.push(filler);
        let records: Tumors = rows.into_iter().collect();

        let prior = PriorRate::Derive {
            catchment_population: 100.,
            years_observed: 1.,
        };
        let whole = incidence_by_group(
            &records,
            |t| t.age_band.clone(),
            &codes(),
            prior,
            PriorScope::WholeRegistry,
        );
        let per = incidence_by_group(
            &records,
            |t| t.age_band.clone(),
            &codes(),
            prior,
            PriorScope::PerSubgroup,
        );
        // Whole-registry scope: (3 - 1) / 100 for subgroup A.
        assert_eq!(whole[0].1.prior_rate, Some(0.02));
        // Per-subgroup scope: (2 - 1) / 100.
        assert_eq!(per[0].1.prior_rate, Some(0.01));
    }
}

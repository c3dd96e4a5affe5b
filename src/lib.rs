pub mod associations;
pub mod incidence;
mod util;

pub use anyhow::{Context, Error};
use itertools::Either;
use qu::ick_use::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs, io, iter,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::incidence::HistologyCodeSet;
use crate::util::survival_months;
pub use crate::util::{header, path_exists};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
pub type PatientId = u64;

/// Default filename of the registry extract this study was run against.
pub const DEFAULT_EXTRACT: &str = "SEER RPD 17 Nov 2021.csv";

#[derive(Debug, Clone, Deserialize)]
struct TumorRaw {
    #[serde(rename = "Patient ID")]
    patient_id: PatientId,
    #[serde(rename = "Histologic Type ICD-O-3")]
    histology_code: u16,
    #[serde(rename = "ICD-O-3 Hist/behav")]
    histology_label: ArcStr,
    #[serde(rename = "Site recode ICD-O-3/WHO 2008")]
    site_recode: ArcStr,
    #[serde(rename = "SEER Brain and CNS Recode")]
    brain_cns_recode: ArcStr,
    #[serde(rename = "Sequence number")]
    sequence: ArcStr,
    #[serde(rename = "Record number recode")]
    record_number: u32,
    #[serde(rename = "Survival months", deserialize_with = "survival_months")]
    survival_months: Option<f32>,
    #[serde(rename = "Sex")]
    sex: Sex,
    #[serde(rename = "Age recode with <1 year olds")]
    age_band: ArcStr,
    #[serde(rename = "Radiation recode")]
    radiation: ArcStr,
    #[serde(rename = "Chemotherapy recode (yes, no/unk)")]
    chemotherapy: ArcStr,
}

/// A row in the registry extract: one diagnosed tumour.
///
/// In this and future datastructures, `patient_id` always identifies the same
/// patient. A patient appears once per diagnosed tumour, so multiple rows per
/// patient are expected; counts of patients are always counts of distinct
/// `patient_id` values, never of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tumor {
    pub patient_id: PatientId,
    /// ICD-O-3 histology code, e.g. 9440 for classic glioblastoma.
    pub histology_code: u16,
    pub histology_label: ArcStr,
    pub site_recode: ArcStr,
    pub brain_cns_recode: ArcStr,
    /// Order of this tumour among the patient's primaries at diagnosis time,
    /// e.g. "One primary only" or "2nd of 2 or more primaries".
    pub sequence: ArcStr,
    /// Position of this row within the patient's full submission history.
    pub record_number: u32,
    /// "Unknown" and blank values in the extract become `None`.
    pub survival_months: Option<f32>,
    pub sex: Sex,
    pub age_band: ArcStr,
    pub radiation: ArcStr,
    pub chemotherapy: ArcStr,
}

impl From<TumorRaw> for Tumor {
    fn from(from: TumorRaw) -> Self {
        Self {
            patient_id: from.patient_id,
            histology_code: from.histology_code,
            histology_label: from.histology_label,
            site_recode: from.site_recode,
            brain_cns_recode: from.brain_cns_recode,
            sequence: from.sequence,
            record_number: from.record_number,
            survival_months: from.survival_months,
            sex: from.sex,
            age_band: from.age_band,
            radiation: from.radiation,
            chemotherapy: from.chemotherapy,
        }
    }
}

/// The parsed registry table, with a pre-built index for the `patient_id` field.
///
/// All the filtering methods return a fresh `Tumors`; the underlying rows are
/// never mutated in place.
pub struct Tumors {
    els: Arc<Vec<Tumor>>,
    id_idx: BTreeMap<PatientId, Vec<usize>>,
}

impl Tumors {
    pub fn load_orig(path: impl AsRef<Path>) -> Result<Self, Error> {
        let els: Vec<TumorRaw> = load_orig(path)?;
        Ok(Self::new(els.into_iter().map(Into::into).collect()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(Self::new(load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        Ok(save(&self.els, path)?)
    }

    pub fn records_for_patient(
        &self,
        patient_id: PatientId,
    ) -> impl Iterator<Item = &Tumor> + Clone + '_ {
        let idxs = match self.id_idx.get(&patient_id) {
            Some(idxs) => idxs,
            None => return Either::Left(iter::empty()),
        };
        Either::Right(idxs.iter().map(|idx| {
            self.els
                .get(*idx)
                .expect("inconsistent tumor patient_id index")
        }))
    }

    /// Iterate over rows in this table.
    pub fn iter(&self) -> impl Iterator<Item = Tumor> + '_ {
        self.els.iter().cloned()
    }

    /// Get a `Tumors` object containing only rows that match the filter.
    pub fn filter(&self, f: impl Fn(&Tumor) -> bool) -> Self {
        Tumors::new(self.iter().filter(f).collect())
    }

    pub fn retain(&mut self, f: impl Fn(&Tumor) -> bool) {
        Arc::make_mut(&mut self.els).retain(f);
        self.rebuild_id_map();
    }

    /// Rows whose histology code is in the codeset.
    pub fn filter_by_histology(&self, codes: &HistologyCodeSet) -> Self {
        self.filter(|t| codes.contains(t.histology_code))
    }

    /// Rows belonging to any of the given patients.
    pub fn with_patients(&self, ids: &BTreeSet<PatientId>) -> Self {
        self.filter(|t| ids.contains(&t.patient_id))
    }

    /// Rows belonging to none of the given patients.
    ///
    /// Removes *all* of a patient's rows, not just the matching ones.
    pub fn without_patients(&self, ids: &BTreeSet<PatientId>) -> Self {
        self.filter(|t| !ids.contains(&t.patient_id))
    }

    /// The set of distinct patients appearing in this table.
    pub fn patient_ids(&self) -> BTreeSet<PatientId> {
        self.id_idx.keys().copied().collect()
    }

    /// Number of distinct patients (not rows) in this table.
    pub fn distinct_patients(&self) -> usize {
        self.id_idx.len()
    }

    pub fn term_table(&self) -> term_data_table::Table {
        term_data_table::Table::from_serde(self.iter()).unwrap()
    }

    fn new(els: Vec<Tumor>) -> Self {
        let mut this = Tumors {
            els: Arc::new(els),
            id_idx: BTreeMap::new(),
        };
        this.rebuild_id_map();
        this
    }

    fn rebuild_id_map(&mut self) {
        self.id_idx.clear();
        for (idx, tumor) in self.els.iter().enumerate() {
            self.id_idx
                .entry(tumor.patient_id)
                .or_insert_with(Vec::new)
                .push(idx);
        }
    }
}

impl Deref for Tumors {
    type Target = [Tumor];
    fn deref(&self) -> &Self::Target {
        &*self.els
    }
}

impl<'a> IntoIterator for &'a Tumors {
    type IntoIter = <&'a [Tumor] as IntoIterator>::IntoIter;
    type Item = &'a Tumor;
    fn into_iter(self) -> Self::IntoIter {
        self.els.iter()
    }
}

impl FromIterator<Tumor> for Tumors {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Tumor>,
    {
        Self::new(iter.into_iter().collect())
    }
}

/// Sex is encoded 'Male' or 'Female' in the extract. No other values exist in
/// the data. If another value is added in the future, this will throw an
/// error, forcing us to handle the situation.
///
/// Ordering is arbitrary.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Hash, Ord, PartialOrd)]
pub enum Sex {
    #[serde(rename = "Male", alias = "M")]
    Male,
    #[serde(rename = "Female", alias = "F")]
    Female,
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sex::Male => f.write_str("Male"),
            Sex::Female => f.write_str("Female"),
        }
    }
}

/// Load data into memory.
fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    fn inner<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let reader = io::BufReader::new(fs::File::open(path)?);
        bincode::deserialize_from(reader).map_err(Into::into)
    }
    let path = output_path(path.as_ref());
    check_extension(&path, "bin")?;

    inner(&path).with_context(|| format!("unable to load data from \"{}\"", path.display()))
}

/// Save data to disk.
fn save<T: Serialize>(contents: &[T], path: impl AsRef<Path>) -> Result {
    fn inner<T: Serialize>(contents: &[T], path: &Path) -> Result {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("could not create parent")?;
        }
        // warn rather than refuse: outputs are caches and safe to replace
        if util::path_exists(path)? {
            event!(
                Level::WARN,
                "overwriting existing file at \"{}\"",
                path.display()
            );
        }
        let mut out = io::BufWriter::new(fs::File::create(path)?);
        bincode::serialize_into(&mut out, contents)?;
        Ok(())
    }
    let path = output_path(path.as_ref());
    check_extension(&path, "bin")?;

    inner(contents, &path).with_context(|| format!("unable to save data to \"{}\"", path.display()))
}

/// Load data into memory from the original registry extract.
fn load_orig<T: serde::de::DeserializeOwned>(
    path: impl AsRef<Path>,
) -> Result<Vec<T>, anyhow::Error> {
    let path = orig_path(path.as_ref());
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(&path)?
        .into_deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("while loading \"{}\"", path.display()))
}

/// Note: No protection from escaping the root directory.
pub fn orig_path(input: &Path) -> PathBuf {
    Path::new("data").join(input)
}

/// Note: No protection from escaping the root directory.
pub fn output_path(input: &Path) -> PathBuf {
    Path::new("data/output").join(input)
}

pub fn check_extension(path: &Path, ext: &str) -> Result<()> {
    ensure!(
        matches!(path.extension(), Some(p) if p == ext),
        "filename should end with `.{}`",
        ext
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const CSV: &str = "\
Patient ID,Histologic Type ICD-O-3,ICD-O-3 Hist/behav,Site recode ICD-O-3/WHO 2008,SEER Brain and CNS Recode,Sequence number,Record number recode,Survival months,Sex,Age recode with <1 year olds,Radiation recode,\"Chemotherapy recode (yes, no/unk)\"
1,9440,\"9440/3: Glioblastoma, NOS\",Brain,1.1.2 Glioblastoma,One primary only,1,14,Male,60-64 years,Beam radiation,Yes
2,8140,8140/3: Adenocarcinoma NOS,Prostate,Not CNS,1st of 2 or more primaries,1,Unknown,Male,70-74 years,None/Unknown,No/Unknown
2,9440,\"9440/3: Glioblastoma, NOS\",Brain,1.1.2 Glioblastoma,2nd of 2 or more primaries,2,3,Male,75-79 years,None/Unknown,No/Unknown
";

    fn parse(input: &str) -> Vec<Tumor> {
        csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(input.as_bytes())
            .into_deserialize::<TumorRaw>()
            .map(|raw| raw.unwrap().into())
            .collect()
    }

    #[test]
    fn parse_extract_rows() {
        let rows = parse(CSV);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].patient_id, 1);
        assert_eq!(rows[0].histology_code, 9440);
        assert_eq!(rows[0].survival_months, Some(14.));
        assert_eq!(rows[0].sex, Sex::Male);
        // "Unknown" coerces to missing rather than failing the import.
        assert_eq!(rows[1].survival_months, None);
        assert_eq!(&*rows[2].sequence, "2nd of 2 or more primaries");
        assert_eq!(rows[2].record_number, 2);
    }

    #[test]
    fn patient_index() {
        let tumors: Tumors = parse(CSV).into_iter().collect();
        assert_eq!(tumors.len(), 3);
        assert_eq!(tumors.distinct_patients(), 2);
        assert_eq!(tumors.records_for_patient(2).count(), 2);
        assert_eq!(tumors.records_for_patient(99).count(), 0);

        let only_2 = tumors.with_patients(&[2].into_iter().collect());
        assert_eq!(only_2.len(), 2);
        assert_eq!(only_2.distinct_patients(), 1);
        let without_2 = tumors.without_patients(&[2].into_iter().collect());
        assert_eq!(without_2.len(), 1);
        assert_eq!(without_2.patient_ids(), [1].into_iter().collect());
    }
}

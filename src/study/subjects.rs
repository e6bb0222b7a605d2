//! Subject metadata: group assignment, subject list, stimulation sites,
//! clinical scores and the scrubbing filter

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{FcError, Result};

pub const GROUP1: &str = "group1";
pub const GROUP2: &str = "group2";
pub const GROUPS: [&str; 2] = [GROUP1, GROUP2];

/// Subject to group assignment (`subj group`, space separated, with header)
#[derive(Debug, Clone, Default)]
pub struct GroupTable {
    groups: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct GroupRow {
    subj: String,
    group: String,
}

impl GroupTable {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FcError::MissingInput(path.to_path_buf()));
        }
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b' ')
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut groups = BTreeMap::new();
        for row in reader.deserialize() {
            let row: GroupRow = row?;
            groups.insert(row.subj, row.group);
        }
        Ok(Self { groups })
    }

    pub fn from_pairs<S: AsRef<str>>(pairs: &[(S, S)]) -> Self {
        let groups = pairs
            .iter()
            .map(|(s, g)| (s.as_ref().to_string(), g.as_ref().to_string()))
            .collect();
        Self { groups }
    }

    /// Group of a subject, `None` when the subject is not listed
    pub fn group_of(&self, subj: &str) -> Option<&str> {
        self.groups.get(subj).map(String::as_str)
    }

    /// Number of `subjs` whose group contains `group`
    pub fn count(&self, subjs: &[String], group: &str) -> usize {
        subjs
            .iter()
            .filter(|s| self.group_of(s).map_or(false, |g| g.contains(group)))
            .count()
    }
}

/// One subject ID per line
pub fn load_subject_list(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(FcError::MissingInput(path.to_path_buf()));
    }
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Stimulation site of one subject (MNI mm)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimCoord {
    #[serde(rename = "subjs")]
    pub subj: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl StimCoord {
    pub fn coord(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// Stimulation coordinates table with columns `subjs,x,y,z`
pub fn load_stim_coords(path: &Path) -> Result<Vec<StimCoord>> {
    if !path.exists() {
        return Err(FcError::MissingInput(path.to_path_buf()));
    }
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let mut coords = Vec::new();
    for row in reader.deserialize() {
        coords.push(row?);
    }
    Ok(coords)
}

pub fn stim_coord_of<'a>(coords: &'a [StimCoord], subj: &str) -> Option<&'a StimCoord> {
    coords.iter().find(|c| c.subj == subj)
}

/// Clinical score of one subject at one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalRecord {
    pub subj: String,
    pub ses: String,
    #[serde(rename = "YBOCS_Total")]
    pub ybocs_total: Option<f64>,
}

/// Clinical table with columns `subj,ses,YBOCS_Total`
pub fn load_clinical(path: &Path) -> Result<Vec<ClinicalRecord>> {
    if !path.exists() {
        return Err(FcError::MissingInput(path.to_path_buf()));
    }
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

#[derive(Debug, Deserialize)]
struct ScrubParameters {
    scrubbed_length_min: f64,
}

/// Remove subjects with less than `min_time` minutes of data after scrubbing
///
/// `params_path(subj, ses, metric)` locates the preprocessing parameters
/// JSON. Subjects whose file is missing are revoked too. Returns the kept
/// subjects (original order) and the sorted, de-duplicated revoked ones.
pub fn subjects_after_scrubbing<F>(
    subjs: &[String],
    sessions: &[String],
    metrics: &[String],
    min_time: f64,
    params_path: F,
) -> Result<(Vec<String>, Vec<String>)>
where
    F: Fn(&str, &str, &str) -> std::path::PathBuf,
{
    let mut revoked = Vec::new();
    for subj in subjs {
        for ses in sessions {
            for metric in metrics {
                let path = params_path(subj, ses, metric);
                if !path.exists() {
                    warn!("{} preprocessing not found, removing it", subj);
                    revoked.push(subj.clone());
                    continue;
                }
                let params: ScrubParameters = serde_json::from_str(&fs::read_to_string(&path)?)?;
                if params.scrubbed_length_min < min_time {
                    warn!(
                        "{} has less than {:.2} min of data left after scrubbing, removing it",
                        subj, params.scrubbed_length_min
                    );
                    revoked.push(subj.clone());
                }
            }
        }
    }
    revoked.sort();
    revoked.dedup();
    let kept = subjs
        .iter()
        .filter(|s| revoked.binary_search(s).is_err())
        .cloned()
        .collect();
    Ok((kept, revoked))
}

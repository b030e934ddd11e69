//! # Dataset Manifest
//!
//! JSON file naming each member's id and store location together with the
//! dataset config, so a dataset can be reopened without rebuilding its
//! member list by hand.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use crate::annotated::AnnotatedMatrix;
use crate::config::{DatasetConfig, OpenMode, StoreConfig};
use crate::error::{Result, StoreError};

use super::MultiFileDataset;

const MANIFEST_ENCODING: &str = "annotated-dataset";
const MANIFEST_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Manifest {
    encoding_type: String,
    encoding_version: String,
    config: DatasetConfig,
    members: Vec<ManifestMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ManifestMember {
    id: String,
    path: PathBuf,
}

pub(crate) fn save(dataset: &MultiFileDataset, path: &Path) -> Result<()> {
    let _span = info_span!("manifest_save", path = %path.display()).entered();
    let members = dataset
        .members
        .iter()
        .map(|m| {
            let location = m.matrix.location().ok_or_else(|| {
                StoreError::config(format!("member {:?} is not backed by a store", m.id))
            })?;
            Ok(ManifestMember {
                id: m.id.clone(),
                path: location.to_path_buf(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let manifest = Manifest {
        encoding_type: MANIFEST_ENCODING.to_string(),
        encoding_version: MANIFEST_VERSION.to_string(),
        config: dataset.config.clone(),
        members,
    };

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::invalid_name(path.to_string_lossy()))?;
    let tmp = path.with_file_name(format!(".tmp-{file_name}"));
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, &manifest)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    debug!(n_members = manifest.members.len(), "saved manifest");
    Ok(())
}

pub(crate) fn open(path: &Path, mode: OpenMode, store_config: &StoreConfig) -> Result<MultiFileDataset> {
    let _span = info_span!("manifest_open", path = %path.display(), ?mode).entered();
    if mode == OpenMode::CreateNew {
        return Err(StoreError::config("a dataset manifest can only open existing members"));
    }
    let manifest: Manifest = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    if manifest.encoding_type != MANIFEST_ENCODING {
        return Err(StoreError::corrupted(path, "not a dataset manifest"));
    }
    if manifest.encoding_version.split('.').next() != MANIFEST_VERSION.split('.').next() {
        return Err(StoreError::UnsupportedVersion {
            found: manifest.encoding_version,
            supported: MANIFEST_VERSION.to_string(),
        });
    }
    let members = manifest
        .members
        .into_iter()
        .map(|m| Ok((m.id, AnnotatedMatrix::open(&m.path, mode, store_config)?)))
        .collect::<Result<Vec<_>>>()?;
    MultiFileDataset::build(members, manifest.config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JoinPolicy;
    use ndarray::array;

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::default();
        let mut members = Vec::new();
        for (id, rows) in [("a", array![[1.0f32, 2.0]]), ("b", array![[3.0f32, 4.0]])] {
            let mut m = AnnotatedMatrix::create(dir.path().join(id), &config).unwrap();
            m.set_primary(rows).unwrap();
            members.push((id.to_string(), m));
        }
        let ds_config = DatasetConfig::default()
            .with_join(JoinPolicy::Outer)
            .with_source_key("batch");
        let mut ds = MultiFileDataset::build(members, ds_config.clone()).unwrap();
        let manifest = dir.path().join("dataset.json");
        ds.save(&manifest).unwrap();
        ds.close().unwrap();

        let reopened = MultiFileDataset::open(&manifest, OpenMode::ReadOnly, &config).unwrap();
        assert_eq!(reopened.member_ids(), vec!["a", "b"]);
        assert_eq!(reopened.config(), &ds_config);
        assert_eq!(reopened.n_obs(), 2);
    }

    #[test]
    fn test_in_memory_members_cannot_be_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = AnnotatedMatrix::new();
        m.set_primary(array![[1u8]]).unwrap();
        let ds = MultiFileDataset::build(vec![("a".into(), m)], DatasetConfig::default()).unwrap();
        assert!(matches!(
            ds.save(dir.path().join("d.json")),
            Err(StoreError::Config { .. })
        ));
    }
}

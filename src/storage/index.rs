//! JSON index files for locally persisted state

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Read an index, or the default value when the file does not exist yet
pub fn load<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write an index through a sibling temp file and rename it into place
pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_missing_index_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let index: BTreeMap<String, u32> = load(&temp.path().join("none.json")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("index.json");

        let index = BTreeMap::from([("db".to_string(), 1u32)]);
        save(&path, &index).unwrap();

        let loaded: BTreeMap<String, u32> = load(&path).unwrap();
        assert_eq!(loaded, index);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_index_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("index.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(load::<BTreeMap<String, u32>>(&path).is_err());
    }
}

use chrono::Utc;
use color_eyre::eyre::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
};

/// What `SnapshotStore::load` found on disk.
#[derive(Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Missing,
    /// The file couldn't be decoded and was moved to the contained path.
    Recovered(PathBuf),
}

/// A JSON file holding one serializable value.
///
/// Every write first copies the previous file to `<path>.bak`. A file that
/// can't be parsed is renamed to `<path>.corrupt.<unix>` and replaced by the
/// default value instead of failing startup.
#[derive(Debug)]
pub struct SnapshotStore<T> {
    path: PathBuf,
    _value: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned + Default> SnapshotStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        with_suffix(&self.path, ".bak")
    }

    pub fn load(&self) -> Result<(T, LoadOutcome)> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((T::default(), LoadOutcome::Missing));
            }
            Err(e) => {
                tracing::error!("Could not read {}: {e}", self.path.display());
                return self.recover();
            }
        };

        if contents.trim().is_empty() {
            return Ok((T::default(), LoadOutcome::Missing));
        }

        match serde_json::from_str(&contents) {
            Ok(value) => Ok((value, LoadOutcome::Loaded)),
            Err(e) => {
                tracing::error!("Could not parse {}: {e}", self.path.display());
                self.recover()
            }
        }
    }

    fn recover(&self) -> Result<(T, LoadOutcome)> {
        let aside = with_suffix(&self.path, &format!(".corrupt.{}", Utc::now().timestamp()));

        std::fs::rename(&self.path, &aside)
            .wrap_err_with(|| format!("Could not move {} aside", self.path.display()))?;

        tracing::warn!(
            "Moved unreadable {} to {}, starting from defaults",
            self.path.display(),
            aside.display()
        );

        Ok((T::default(), LoadOutcome::Recovered(aside)))
    }

    pub fn save(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value).wrap_err("Could not serialize snapshot")?;

        if self.path.exists() {
            std::fs::copy(&self.path, self.backup_path())
                .wrap_err("Could not back up previous snapshot")?;
        }

        std::fs::write(&self.path, json).wrap_err("Could not write snapshot")
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    name.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::<Counter>::new(dir.path().join("state.json"));

        let (value, outcome) = store.load().unwrap();
        assert_eq!(value, Counter::default());
        assert_eq!(outcome, LoadOutcome::Missing);
    }

    #[test]
    fn save_backs_up_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::<Counter>::new(dir.path().join("state.json"));

        store.save(&Counter { value: 1 }).unwrap();
        assert!(!store.backup_path().exists());

        store.save(&Counter { value: 2 }).unwrap();

        let (value, outcome) = store.load().unwrap();
        assert_eq!(value, Counter { value: 2 });
        assert_eq!(outcome, LoadOutcome::Loaded);

        let backup: Counter =
            serde_json::from_str(&std::fs::read_to_string(store.backup_path()).unwrap()).unwrap();
        assert_eq!(backup, Counter { value: 1 });
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = SnapshotStore::<Counter>::new(&path);
        let (value, outcome) = store.load().unwrap();

        assert_eq!(value, Counter::default());
        let LoadOutcome::Recovered(aside) = outcome else {
            panic!("expected recovery, got {outcome:?}");
        };
        assert!(aside.exists());
        assert!(!path.exists());
        assert_eq!(std::fs::read_to_string(aside).unwrap(), "{ not json");
    }
}

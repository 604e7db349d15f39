pub mod audit;
pub mod snapshot;

use std::{fmt::Debug, path::Path};

use bot_traits::ForwardRefToTracing;
use color_eyre::eyre::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, Tree};

pub trait ReadWriteTree {
    fn typed_get<K: Serialize, V: DeserializeOwned>(&self, key: &K) -> Result<Option<V>>;

    fn typed_merge<K: Serialize, V: DeserializeOwned + Serialize>(
        &self,
        key: &K,
        value: &V,
    ) -> Result<Option<V>>;
}

impl ReadWriteTree for Tree {
    fn typed_get<K: Serialize, V: DeserializeOwned>(&self, key: &K) -> Result<Option<V>> {
        Ok(self
            .get(bincode::serialize::<K>(key)?)?
            .map(|value| bincode::deserialize::<V>(&value))
            .transpose()?)
    }

    fn typed_merge<K: Serialize, V: DeserializeOwned + Serialize>(
        &self,
        key: &K,
        value: &V,
    ) -> Result<Option<V>> {
        Ok(self
            .merge(
                bincode::serialize::<K>(key)?,
                bincode::serialize::<V>(value)?,
            )?
            .map(|value| bincode::deserialize::<V>(&value))
            .transpose()?)
    }
}

/// Handle to the bot's sled database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StewardDb(Db);

impl StewardDb {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        sled::open(path)
            .map(Self)
            .wrap_err_with(|| format!("Failed to open database at {}", path.display()))
    }

    /// A throwaway database that lives only as long as the handle.
    pub fn temporary() -> Result<Self> {
        sled::Config::new()
            .temporary(true)
            .open()
            .map(Self)
            .wrap_err("Failed to open temporary database")
    }

    /// Applies `update_function` to the stored value (or the default when
    /// missing). On a decode failure the old bytes are kept as they were.
    fn create_update_with_deserialization<V: DeserializeOwned + Serialize + Debug>(
        old_value: Option<&[u8]>,
        update_function: impl FnMut(V) -> V,
        mut get_default_value: impl FnMut() -> V,
    ) -> Option<Vec<u8>> {
        old_value
            .map_or_else(
                || Ok(get_default_value()),
                |v| bincode::deserialize::<V>(v).wrap_err("Failed to deserialize"),
            )
            .trace_err_ok()
            .map(update_function)
            .map(|new_value| bincode::serialize::<V>(&new_value).wrap_err("Failed to serialize"))
            .transpose()
            .trace_err_ok()
            .flatten()
            .or_else(|| old_value.map(|v| v.to_vec()))
    }

    fn open_tree(&self, name: impl AsRef<[u8]>) -> Result<Tree> {
        self.0.open_tree(name).wrap_err("Failed to open tree")
    }

    fn generate_id(&self) -> Result<u64> {
        self.0.generate_id().wrap_err("Failed to generate id")
    }

    pub async fn flush(&self) -> Result<()> {
        self.0.flush_async().await.wrap_err("Failed to flush database")?;
        Ok(())
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;

/// A record type that lives in its own store family.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: Ord + Clone + fmt::Display + Send + Sync + 'static;

    /// Family name, also used for the backing file name.
    const FAMILY: &'static str;

    fn key(&self) -> Self::Key;
}

/// One key-indexed record family.
///
/// Writes hold the family lock until the backing file has been replaced, so
/// writes to a key apply in call order. A failed write rolls the in-memory map
/// back and leaves the previous file in place.
pub struct Family<T: Record> {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<T::Key, T>>,
}

impl<T: Record> Family<T> {
    pub(crate) fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) async fn open(dir: &Path) -> Self {
        let path = dir.join(format!("{}.json", T::FAMILY));
        let records = match load_file::<Vec<T>>(&path, T::FAMILY).await {
            Ok(Some(list)) => list.into_iter().map(|r| (r.key(), r)).collect(),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(family = T::FAMILY, error = %e, "Discarding unreadable store file");
                quarantine(&path).await;
                BTreeMap::new()
            }
        };
        debug!(family = T::FAMILY, count = records.len(), "Store family opened");
        Self {
            path: Some(path),
            records: Mutex::new(records),
        }
    }

    pub async fn get(&self, key: &T::Key) -> Option<T> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn get_all<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn put(&self, record: T) -> Result<(), StoreError> {
        let key = record.key();
        let mut records = self.records.lock().await;
        let previous = records.insert(key.clone(), record);
        if let Err(e) = self.persist(&records, &key).await {
            restore(&mut records, key, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Insert or replace the record at `key`, computing it from the current value.
    pub async fn upsert<F>(&self, key: T::Key, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(Option<&T>) -> T,
    {
        let mut records = self.records.lock().await;
        let next = f(records.get(&key));
        let previous = records.insert(key.clone(), next.clone());
        if let Err(e) = self.persist(&records, &key).await {
            restore(&mut records, key, previous);
            return Err(e);
        }
        Ok(next)
    }

    /// Modify an existing record in place. Returns `None` if the key is absent.
    ///
    /// The closure returns whether it changed anything; unchanged records are
    /// not written back.
    pub async fn update<F>(&self, key: &T::Key, f: F) -> Result<Option<T>, StoreError>
    where
        F: FnOnce(&mut T) -> bool,
    {
        let mut records = self.records.lock().await;
        let Some(current) = records.get(key).cloned() else {
            return Ok(None);
        };
        let mut next = current.clone();
        if !f(&mut next) {
            return Ok(Some(current));
        }
        records.insert(key.clone(), next.clone());
        if let Err(e) = self.persist(&records, key).await {
            records.insert(key.clone(), current);
            return Err(e);
        }
        Ok(Some(next))
    }

    /// Apply `f` to every record in one write. Returns how many records changed.
    pub async fn update_all<F>(&self, mut f: F) -> Result<usize, StoreError>
    where
        F: FnMut(&mut T) -> bool,
    {
        let mut records = self.records.lock().await;
        let snapshot = records.clone();
        let mut changed = 0;
        for record in records.values_mut() {
            if f(record) {
                changed += 1;
            }
        }
        if changed == 0 {
            return Ok(0);
        }
        if let Err(e) = self.persist_all(&records).await {
            *records = snapshot;
            return Err(e);
        }
        Ok(changed)
    }

    pub async fn delete(&self, key: &T::Key) -> Result<Option<T>, StoreError> {
        let mut records = self.records.lock().await;
        let Some(removed) = records.remove(key) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&records, key).await {
            records.insert(key.clone(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    /// Remove every record, returning what was removed.
    pub async fn clear(&self) -> Result<Vec<T>, StoreError> {
        let mut records = self.records.lock().await;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let snapshot = std::mem::take(&mut *records);
        if let Err(e) = self.persist_all(&records).await {
            *records = snapshot;
            return Err(e);
        }
        Ok(snapshot.into_values().collect())
    }

    async fn persist(&self, records: &BTreeMap<T::Key, T>, key: &T::Key) -> Result<(), StoreError> {
        match &self.path {
            Some(path) => write_file(path, T::FAMILY, &key.to_string(), &values(records)).await,
            None => Ok(()),
        }
    }

    async fn persist_all(&self, records: &BTreeMap<T::Key, T>) -> Result<(), StoreError> {
        match &self.path {
            Some(path) => write_file(path, T::FAMILY, "*", &values(records)).await,
            None => Ok(()),
        }
    }
}

/// A single-record document such as the settings.
pub struct Document<T> {
    name: &'static str,
    path: Option<PathBuf>,
    value: Mutex<T>,
}

impl<T> Document<T>
where
    T: Clone + Default + Serialize + DeserializeOwned + Send + Sync,
{
    pub(crate) fn in_memory(name: &'static str) -> Self {
        Self {
            name,
            path: None,
            value: Mutex::new(T::default()),
        }
    }

    pub(crate) async fn open(dir: &Path, name: &'static str) -> Self {
        let path = dir.join(format!("{}.json", name));
        let value = match load_file::<T>(&path, name).await {
            Ok(Some(v)) => v,
            Ok(None) => T::default(),
            Err(e) => {
                warn!(document = name, error = %e, "Discarding unreadable document, using defaults");
                quarantine(&path).await;
                T::default()
            }
        };
        Self {
            name,
            path: Some(path),
            value: Mutex::new(value),
        }
    }

    pub async fn get(&self) -> T {
        self.value.lock().await.clone()
    }

    pub async fn put(&self, value: T) -> Result<(), StoreError> {
        let mut current = self.value.lock().await;
        if let Some(path) = &self.path {
            write_file(path, self.name, self.name, &value).await?;
        }
        *current = value;
        Ok(())
    }

    /// Read-modify-write under the document lock.
    pub async fn modify<F, E>(&self, f: F) -> Result<(T, T), E>
    where
        F: FnOnce(&T) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut current = self.value.lock().await;
        let next = f(&current)?;
        if let Some(path) = &self.path {
            write_file(path, self.name, self.name, &next).await?;
        }
        let previous = std::mem::replace(&mut *current, next.clone());
        Ok((previous, next))
    }
}

fn values<K, T>(records: &BTreeMap<K, T>) -> Vec<&T> {
    records.values().collect()
}

fn restore<K: Ord, T>(records: &mut BTreeMap<K, T>, key: K, previous: Option<T>) {
    match previous {
        Some(p) => {
            records.insert(key, p);
        }
        None => {
            records.remove(&key);
        }
    }
}

async fn load_file<T: DeserializeOwned>(path: &Path, family: &'static str) -> Result<Option<T>, StoreError> {
    let contents = match tokio::fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                family,
                key: "*".to_string(),
                source,
            })
        }
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|source| StoreError::Corrupt { family, source })
}

/// Replace `path` with the serialized value via a temporary file and rename.
async fn write_file<T: Serialize + ?Sized>(
    path: &Path,
    family: &'static str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let contents =
        serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize { family, source })?;
    let tmp = path.with_extension("json.tmp");
    let io_err = |source| StoreError::Io {
        family,
        key: key.to_string(),
        source,
    };
    tokio::fs::write(&tmp, contents).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

async fn quarantine(path: &Path) {
    let aside = path.with_extension("json.corrupt");
    if let Err(e) = tokio::fs::rename(path, &aside).await {
        warn!(path = %path.display(), error = %e, "Failed to move unreadable file aside");
    }
}

//! File-backed volume store.
//!
//! Volumes are raw files named `<name>:<uuid>.raw` in a single directory.
//! The file name is the only metadata: listing parses it back into a
//! [`NanosVolume`] and reads size and mtime from the filesystem.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ProviderError, Result};
use crate::traits::ImageBuilder;
use crate::types::NanosVolume;
use crate::units::{human_size, parse_size, MIN_VOLUME_SIZE};

/// Separates the volume name from its id in file names.
pub const VOLUME_DELIMITER: char = ':';

const VOLUME_EXTENSION: &str = ".raw";

/// Split `<name>:<uuid>.raw` into `(name, id)`.
pub fn parse_volume_file(file_name: &str) -> Option<(&str, &str)> {
    let stem = file_name.strip_suffix(VOLUME_EXTENSION)?;
    let (name, id) = stem.rsplit_once(VOLUME_DELIMITER)?;
    if name.is_empty() || id.is_empty() {
        return None;
    }
    Some((name, id))
}

/// Volume directory on the local host.
#[derive(Debug, Clone)]
pub struct LocalVolumes {
    dir: PathBuf,
}

impl LocalVolumes {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a new volume named `name` with id `id` would occupy.
    pub fn path_for(&self, name: &str, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}{}{}", name, VOLUME_DELIMITER, id, VOLUME_EXTENSION))
    }

    /// Reserve a fresh id and path for `name`, creating the directory.
    pub async fn allocate(&self, name: &str) -> Result<(String, PathBuf)> {
        if name.is_empty() || name.contains(VOLUME_DELIMITER) || name.contains('/') {
            return Err(ProviderError::InvalidConfig(format!(
                "invalid volume name {:?}",
                name
            )));
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ProviderError::io(&self.dir, e))?;

        let id = Uuid::new_v4().to_string();
        let path = self.path_for(name, &id);
        Ok((id, path))
    }

    /// Create an empty (sparse) raw volume of `size` bytes.
    pub async fn create_blank(&self, name: &str, size: u64) -> Result<NanosVolume> {
        let (id, path) = self.allocate(name).await?;

        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ProviderError::io(&path, e))?;
        file.set_len(size)
            .await
            .map_err(|e| ProviderError::io(&path, e))?;

        info!(volume = %name, id = %id, size, "Volume created");
        self.describe(&path, name, &id).await
    }

    /// Create volume `name`. `size` is in human form and may be empty.
    ///
    /// Without `data` a blank volume of at least [`MIN_VOLUME_SIZE`] is
    /// allocated; with `data` the builder writes the directory's contents
    /// into the new file.
    pub async fn create(
        &self,
        builder: &dyn ImageBuilder,
        name: &str,
        data: Option<&Path>,
        size: &str,
    ) -> Result<NanosVolume> {
        let size = if size.trim().is_empty() {
            None
        } else {
            Some(parse_size(size)?.max(MIN_VOLUME_SIZE))
        };

        let Some(data) = data else {
            return self
                .create_blank(name, size.unwrap_or(MIN_VOLUME_SIZE))
                .await;
        };

        let (id, path) = self.allocate(name).await?;
        builder.create_volume_image(data, size, &path).await?;
        info!(volume = %name, id = %id, data = %data.display(), "Volume created from data");
        self.describe(&path, name, &id).await
    }

    /// Every volume in the directory. A missing directory holds no volumes.
    pub async fn list(&self) -> Result<Vec<NanosVolume>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::io(&self.dir, e)),
        };

        let mut volumes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProviderError::io(&self.dir, e))?
        {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some((name, id)) = parse_volume_file(file_name) else {
                debug!(file = %file_name, "Skipping non-volume file");
                continue;
            };
            volumes.push(self.describe(&entry.path(), name, id).await?);
        }

        volumes.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(volumes)
    }

    /// Resolve a volume by name or id.
    pub async fn find(&self, query: &str) -> Result<NanosVolume> {
        self.list()
            .await?
            .into_iter()
            .find(|v| v.name == query || v.id == query)
            .ok_or_else(|| ProviderError::not_found("volume", query))
    }

    /// Remove the volume matching `query` (name or id).
    pub async fn delete(&self, query: &str) -> Result<NanosVolume> {
        let volume = self.find(query).await?;
        tokio::fs::remove_file(&volume.path)
            .await
            .map_err(|e| ProviderError::io(&volume.path, e))?;
        info!(volume = %volume.name, id = %volume.id, "Volume deleted");
        Ok(volume)
    }

    async fn describe(&self, path: &Path, name: &str, id: &str) -> Result<NanosVolume> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ProviderError::io(path, e))?;
        let created_at = metadata
            .modified()
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();

        Ok(NanosVolume {
            id: id.to_string(),
            name: name.to_string(),
            label: name.to_string(),
            path: path.display().to_string(),
            size: human_size(metadata.len()),
            created_at,
            attached_to: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::testing::StubBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_parse_volume_file() {
        assert_eq!(
            parse_volume_file("data:1b4e28ba-2fa1-11d2-883f-0016d3cca427.raw"),
            Some(("data", "1b4e28ba-2fa1-11d2-883f-0016d3cca427"))
        );
        assert_eq!(parse_volume_file("data.raw"), None);
        assert_eq!(parse_volume_file("data:abc.img"), None);
        assert_eq!(parse_volume_file(":abc.raw"), None);
    }

    #[tokio::test]
    async fn test_create_list_delete_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LocalVolumes::new(dir.path().join("volumes"));

        assert!(store.list().await.unwrap().is_empty());

        let created = store.create_blank("data", 1024 * 1024).await.unwrap();
        assert_eq!(created.name, "data");
        assert_eq!(created.size, "1 MiB");

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "data");
        assert_eq!(listed[0].size, created.size);
        assert_eq!(listed[0], created);

        store.delete("data").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_from_data_uses_builder() {
        let dir = TempDir::new().unwrap();
        let store = LocalVolumes::new(dir.path());
        let builder = StubBuilder::default();

        let volume = store
            .create(&builder, "assets", Some(Path::new("/srv/assets")), "2M")
            .await
            .unwrap();

        assert_eq!(volume.size, "2 MiB");
        assert_eq!(
            builder.volumes.lock().unwrap().clone(),
            vec![(PathBuf::from("/srv/assets"), Some(2 * 1024 * 1024))]
        );
    }

    #[tokio::test]
    async fn test_create_without_size_uses_minimum() {
        let dir = TempDir::new().unwrap();
        let store = LocalVolumes::new(dir.path());

        let volume = store
            .create(&StubBuilder::default(), "scratch", None, "")
            .await
            .unwrap();
        assert_eq!(volume.size, "1 MiB");
    }

    #[tokio::test]
    async fn test_delete_by_id() {
        let dir = TempDir::new().unwrap();
        let store = LocalVolumes::new(dir.path());

        let keep = store.create_blank("logs", 4096).await.unwrap();
        let drop = store.create_blank("scratch", 4096).await.unwrap();

        store.delete(&drop.id).await.unwrap();

        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec![keep.name]);
    }

    #[tokio::test]
    async fn test_unknown_volume_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalVolumes::new(dir.path());

        let err = store.delete("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_delimiter_in_name() {
        let dir = TempDir::new().unwrap();
        let store = LocalVolumes::new(dir.path());

        assert!(store.create_blank("a:b", 4096).await.is_err());
    }
}

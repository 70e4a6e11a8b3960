use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::store::KeystoreImage;

/// On-disk layout of the keystore file. The explicit version field lets a
/// future format change detect and migrate older files instead of guessing.
#[derive(Debug, Serialize, Deserialize)]
struct KeystoreFile {
    version: u32,
    clients: KeystoreImage,
}

const FORMAT_VERSION: u32 = 1;

/// Reads the persisted keystore. A missing file and an empty file both load
/// as an empty image; so does unreadable content, with a warning, trading
/// loss detection for availability. Operators watching the log will see the
/// degraded start.
pub async fn load(path: &Path) -> Result<KeystoreImage> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(KeystoreImage::new())
        }
        Err(err) => return Err(anyhow!("read keystore file {}: {err}", path.display())),
    };

    if raw.trim().is_empty() {
        return Ok(KeystoreImage::new());
    }

    match serde_json::from_str::<KeystoreFile>(&raw) {
        Ok(file) if file.version == FORMAT_VERSION => Ok(file.clients),
        Ok(file) => {
            tracing::warn!(
                path = %path.display(),
                version = file.version,
                "keystore file has an unknown format version, starting empty"
            );
            Ok(KeystoreImage::new())
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "keystore file is unreadable, starting empty"
            );
            Ok(KeystoreImage::new())
        }
    }
}

/// Writes the image to a uniquely named temp file beside the target, syncs
/// it, then renames it over the target. An interrupted save leaves the
/// previous file intact.
pub async fn save(path: &Path, image: KeystoreImage) -> Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await?;
    }

    let raw = serde_json::to_string_pretty(&KeystoreFile {
        version: FORMAT_VERSION,
        clients: image,
    })?;

    let temp_path = temp_sibling(path);
    {
        let mut file = File::create(&temp_path)
            .await
            .map_err(|e| anyhow!("create temp keystore file {}: {}", temp_path.display(), e))?;
        file.write_all(raw.as_bytes()).await?;
        file.sync_all()
            .await
            .map_err(|e| anyhow!("flush temp keystore file {}: {}", temp_path.display(), e))?;
    }
    fs::rename(&temp_path, path).await.map_err(|e| {
        anyhow!(
            "rename temp keystore file {} -> {}: {}",
            temp_path.display(),
            path.display(),
            e
        )
    })?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("keystore.dat");
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::{load, save};
    use crate::store::Keystore;
    use anyhow::Result;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn make_tmp_dir(prefix: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("clortho-persist-{}-{}", prefix, Uuid::new_v4()));
        dir
    }

    #[tokio::test]
    async fn save_then_load_round_trips() -> Result<()> {
        let path = make_tmp_dir("roundtrip").join("clortho.dat");

        let mut store = Keystore::new();
        store.set("1.2.3.4", "greeting", "hello").unwrap();
        store.set("5.6.7.8", "color", "blue").unwrap();
        let image = store.snapshot();

        save(&path, image.clone()).await?;
        let loaded = load(&path).await?;
        assert_eq!(loaded, image);
        Ok(())
    }

    #[tokio::test]
    async fn loading_a_nonexistent_file_yields_an_empty_image() -> Result<()> {
        let path = make_tmp_dir("missing").join("clortho.dat");
        let loaded = load(&path).await?;
        assert!(loaded.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn loading_a_zero_byte_file_yields_an_empty_image() -> Result<()> {
        let dir = make_tmp_dir("empty");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("clortho.dat");
        tokio::fs::write(&path, b"").await?;

        let loaded = load(&path).await?;
        assert!(loaded.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn loading_a_truncated_file_yields_an_empty_image() -> Result<()> {
        let dir = make_tmp_dir("truncated");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("clortho.dat");
        tokio::fs::write(&path, br#"{"version": 1, "clients": {"1.2.3"#).await?;

        let loaded = load(&path).await?;
        assert!(loaded.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn loading_an_unknown_version_yields_an_empty_image() -> Result<()> {
        let dir = make_tmp_dir("version");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("clortho.dat");
        tokio::fs::write(&path, br#"{"version": 99, "clients": {}}"#).await?;

        let loaded = load(&path).await?;
        assert!(loaded.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn save_replaces_the_previous_image() -> Result<()> {
        let path = make_tmp_dir("replace").join("clortho.dat");

        let mut store = Keystore::new();
        store.set("1.2.3.4", "a", "1").unwrap();
        save(&path, store.snapshot()).await?;

        store.set("1.2.3.4", "a", "2").unwrap();
        store.set("1.2.3.4", "b", "3").unwrap();
        save(&path, store.snapshot()).await?;

        let loaded = load(&path).await?;
        assert_eq!(loaded["1.2.3.4"]["a"], "2");
        assert_eq!(loaded["1.2.3.4"]["b"], "3");
        Ok(())
    }

    #[tokio::test]
    async fn save_leaves_no_temp_files_behind() -> Result<()> {
        let dir = make_tmp_dir("tempfiles");
        let path = dir.join("clortho.dat");

        let mut store = Keystore::new();
        store.set("1.2.3.4", "a", "1").unwrap();
        save(&path, store.snapshot()).await?;
        save(&path, store.snapshot()).await?;

        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["clortho.dat".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_saves_keep_the_file_parsable() -> Result<()> {
        let path = make_tmp_dir("race").join("clortho.dat");

        let mut left = Keystore::new();
        left.set("1.2.3.4", "side", "left").unwrap();
        let mut right = Keystore::new();
        right.set("1.2.3.4", "side", "right").unwrap();

        let left_save = tokio::spawn({
            let path = path.clone();
            let image = left.snapshot();
            async move { save(&path, image).await }
        });
        let right_save = tokio::spawn({
            let path = path.clone();
            let image = right.snapshot();
            async move { save(&path, image).await }
        });
        left_save.await??;
        right_save.await??;

        let loaded = load(&path).await?;
        let side = &loaded["1.2.3.4"]["side"];
        assert!(side == "left" || side == "right");
        Ok(())
    }
}

use anyhow::Result;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Save video data into a content-addressed store and return its id. The
/// original file extension is kept on the stored name so the content type
/// can be recovered when serving. Re-uploading identical bytes lands on the
/// same id.
pub async fn save_video<P: AsRef<Path>>(base: P, data: Bytes, ext: Option<&str>) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(&data);
    let hash = format!("{:x}", hasher.finalize());
    let id = match ext {
        Some(ext) if !ext.is_empty() => format!("{hash}.{ext}"),
        _ => hash,
    };
    let sub = &id[..2];
    let dir = base.as_ref().join(sub);
    fs::create_dir_all(&dir).await?;
    let path = dir.join(&id);
    fs::write(path, data).await?;
    Ok(id)
}

/// Determine the on-disk path for a video id within the store.
pub fn video_path<P: AsRef<Path>>(base: P, id: &str) -> PathBuf {
    let sub = &id[..2.min(id.len())];
    base.as_ref().join(sub).join(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_and_paths_video() {
        let tmp = tempfile::tempdir().unwrap();
        let id = save_video(tmp.path(), Bytes::from_static(b"frames"), Some("mp4"))
            .await
            .unwrap();
        assert!(id.ends_with(".mp4"));
        let expected = video_path(tmp.path(), &id);
        assert!(expected.exists());
        let subdir = &id[..2];
        assert!(expected.parent().unwrap().ends_with(subdir));
    }

    #[tokio::test]
    async fn identical_bytes_same_id() {
        let tmp = tempfile::tempdir().unwrap();
        let a = save_video(tmp.path(), Bytes::from_static(b"same"), None)
            .await
            .unwrap();
        let b = save_video(tmp.path(), Bytes::from_static(b"same"), None)
            .await
            .unwrap();
        assert_eq!(a, b);
    }
}

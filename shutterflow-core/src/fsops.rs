use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Move a file, creating the destination's parent directories. Falls back
/// to copy-then-remove when the rename crosses filesystems (NAS mounts
/// regularly do). On failure the source is left in place.
pub async fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(source, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            if let Err(copy_err) = tokio::fs::copy(source, dest).await {
                // Drop any partial copy so a retry starts clean.
                let _ = tokio::fs::remove_file(dest).await;
                return Err(copy_err.into());
            }
            tokio::fs::remove_file(source).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// First non-existing variant of `candidate`, probing `stem_1.ext`,
/// `stem_2.ext`, ... when the plain name is taken.
pub async fn resolve_collision(candidate: &Path) -> Result<PathBuf> {
    if !tokio::fs::try_exists(candidate).await? {
        return Ok(candidate.to_path_buf());
    }

    let stem = candidate
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let extension = candidate.extension().and_then(|s| s.to_str());
    let parent = candidate
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let mut index = 1u32;
    loop {
        let name = match extension {
            Some(ext) => format!("{stem}_{index}.{ext}"),
            None => format!("{stem}_{index}"),
        };
        let probe = parent.join(name);
        if !tokio::fs::try_exists(&probe).await? {
            return Ok(probe);
        }
        index += 1;
    }
}

/// Path of `file` relative to `root`, or just its file name when it lives
/// outside the root.
pub fn relative_to_root(file: &Path, root: &Path) -> PathBuf {
    file.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| {
            file.file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("file"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn move_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.jpg");
        std::fs::write(&source, b"data").unwrap();

        let dest = dir.path().join("nested/deep/a.jpg");
        move_file(&source, &dest).await.unwrap();

        assert!(!source.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
    }

    #[tokio::test]
    async fn failed_move_leaves_source_alone() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.jpg");
        let dest = dir.path().join("out/missing.jpg");
        assert!(move_file(&missing, &dest).await.is_err());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn collision_probes_numeric_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("img.jpg");

        assert_eq!(resolve_collision(&first).await.unwrap(), first);

        std::fs::write(&first, b"1").unwrap();
        let second = resolve_collision(&first).await.unwrap();
        assert_eq!(second, dir.path().join("img_1.jpg"));

        std::fs::write(&second, b"2").unwrap();
        let third = resolve_collision(&first).await.unwrap();
        assert_eq!(third, dir.path().join("img_2.jpg"));
    }

    #[tokio::test]
    async fn collision_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw");
        std::fs::write(&path, b"1").unwrap();
        let next = resolve_collision(&path).await.unwrap();
        assert_eq!(next, dir.path().join("raw_1"));
    }

    #[test]
    fn relative_path_inside_and_outside_root() {
        let root = Path::new("/pool/source");
        assert_eq!(
            relative_to_root(Path::new("/pool/source/trip/a.jpg"), root),
            PathBuf::from("trip/a.jpg")
        );
        assert_eq!(
            relative_to_root(Path::new("/elsewhere/b.jpg"), root),
            PathBuf::from("b.jpg")
        );
    }
}

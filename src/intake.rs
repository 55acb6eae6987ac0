//! Reading a folder of bill images into batch inputs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::job::{ImageMime, JobInput};
use crate::models::report::BatchReport;

/// An input file and the job built from it.
#[derive(Debug)]
pub struct IntakeFile {
    pub path: PathBuf,
    pub input: JobInput,
}

fn is_candidate(name: &str) -> bool {
    if name.starts_with('.') || name.ends_with(".part") {
        return false;
    }
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ImageMime::from_extension)
        .is_some()
}

/// Load every png/jpg/jpeg/webp file directly under `dir`, sorted by name.
/// A missing directory yields no files.
pub async fn load_dir(dir: &Path) -> std::io::Result<Vec<IntakeFile>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(dir = %dir.display(), "Image directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        match name.to_str() {
            Some(name) if is_candidate(name) => paths.push(entry.path()),
            _ => tracing::debug!(file = ?name, "Skipping non-image file"),
        }
    }
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(&path).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let mime = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ImageMime::from_extension)
            .map(|m| m.to_string());
        files.push(IntakeFile {
            path,
            input: JobInput::new(name, bytes, mime),
        });
    }

    Ok(files)
}

/// Separate source paths from the inputs handed to the engine.
pub fn split(files: Vec<IntakeFile>) -> (Vec<PathBuf>, Vec<JobInput>) {
    files.into_iter().map(|f| (f.path, f.input)).unzip()
}

/// Paths whose bytes the batch persisted somewhere, so the input copy can go.
pub fn routed_paths(paths: &[PathBuf], report: &BatchReport) -> Vec<PathBuf> {
    let stored: HashSet<&str> = report
        .success
        .iter()
        .filter(|s| s.stored_as.is_some())
        .map(|s| s.original.as_str())
        .chain(
            report
                .failed
                .iter()
                .filter(|f| f.stored_as.is_some())
                .map(|f| f.original.as_str()),
        )
        .chain(
            report
                .pending
                .iter()
                .filter(|p| p.stored_as.is_some())
                .map(|p| p.original.as_str()),
        )
        .collect();

    paths
        .iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| stored.contains(n))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::report::{BatchStats, FailedEntry, PendingEntry};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_load_dir_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.jpg", "a.png", "notes.txt", ".hidden.png", "c.webp.part"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }
        tokio::fs::create_dir(dir.path().join("nested.png")).await.unwrap();

        let files = load_dir(dir.path()).await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.input.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.jpg"]);
        assert_eq!(files[1].input.mime_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_dir(&dir.path().join("nope")).await.unwrap().is_empty());
    }

    #[test]
    fn test_routed_paths_skip_unstored() {
        let (paths, _) = split(vec![
            IntakeFile {
                path: PathBuf::from("in/a.png"),
                input: JobInput::new("a.png", vec![], None),
            },
            IntakeFile {
                path: PathBuf::from("in/b.png"),
                input: JobInput::new("b.png", vec![], None),
            },
        ]);
        let report = BatchReport {
            batch_id: Uuid::nil(),
            success: vec![],
            failed: vec![FailedEntry {
                original: "a.png".into(),
                reason: "storage".into(),
                stored_as: None,
                attempts: 0,
            }],
            pending: vec![PendingEntry {
                original: "b.png".into(),
                reason: "quota".into(),
                stored_as: Some("pending/b.png".into()),
            }],
            stats: BatchStats::default(),
        };

        assert_eq!(routed_paths(&paths, &report), vec![PathBuf::from("in/b.png")]);
    }
}

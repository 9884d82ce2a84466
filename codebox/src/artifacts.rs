//! Artifact publisher
//!
//! Persists worker output under the artifact root with a timestamped name and
//! mints its public URL. Existing files are never overwritten. Also provides
//! the traversal-safe lookup used when serving artifacts back.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::ArtifactConfig;
use crate::error::{EngineError, EngineResult};
use crate::isolate::RawArtifact;
use crate::outcome::{Artifact, ArtifactKind};

/// Attempts at a unique name within the same millisecond.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// A file resolved for serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    pub media_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct ArtifactPublisher {
    root: PathBuf,
    public_base_url: String,
    route_prefix: String,
}

impl ArtifactPublisher {
    pub fn new(config: &ArtifactConfig) -> Self {
        let prefix = config.route_prefix.trim_end_matches('/');
        let route_prefix = if prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{}", prefix)
        };
        Self {
            root: config.root.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            route_prefix,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path under which artifacts are served, with a leading `/` and no trailing one.
    pub fn route_prefix(&self) -> &str {
        &self.route_prefix
    }

    pub fn public_url(&self, file_name: &str) -> String {
        format!("{}{}/{}", self.public_base_url, self.route_prefix, file_name)
    }

    /// Write `raw` as `<tool>_<epoch_ms>.<ext>` and return where it lives.
    pub async fn publish(
        &self,
        raw: &RawArtifact,
        kind: ArtifactKind,
        tool_name: &str,
        conversation_id: &str,
    ) -> EngineResult<Artifact> {
        fs::create_dir_all(&self.root).await?;

        let stem = match sanitize_filename(tool_name) {
            s if s.is_empty() => "artifact".to_string(),
            s => s,
        };
        let extension = match sanitize_filename(&raw.extension) {
            s if s.is_empty() => "bin".to_string(),
            s => s,
        };
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let file_name = if attempt == 0 {
                format!("{}_{}.{}", stem, millis, extension)
            } else {
                format!("{}_{}_{}.{}", stem, millis, attempt, extension)
            };
            let path = self.root.join(&file_name);
            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            let written = match file.write_all(&raw.bytes).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                drop(file);
                if let Err(cleanup) = fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), "Failed to remove partial artifact: {}", cleanup);
                }
                return Err(e.into());
            }

            let public_url = self.public_url(&file_name);
            tracing::info!(
                conversation_id,
                path = %path.display(),
                bytes = raw.bytes.len(),
                "Published artifact"
            );
            return Ok(Artifact {
                kind,
                local_path: path,
                public_url,
            });
        }

        Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free artifact name for {}_{}", stem, millis),
        )))
    }

    /// Delete an artifact published by a run that is being rolled back.
    pub async fn discard(&self, artifact: &Artifact) {
        match fs::remove_file(&artifact.local_path).await {
            Ok(()) => tracing::debug!(path = %artifact.local_path.display(), "Discarded artifact"),
            Err(e) => tracing::warn!(
                path = %artifact.local_path.display(),
                "Failed to discard artifact: {}",
                e
            ),
        }
    }

    /// Map a requested file id onto a file under the root, refusing anything
    /// that could escape it.
    pub fn resolve(&self, file_id: &str) -> EngineResult<ResolvedArtifact> {
        if file_id.is_empty()
            || file_id.contains("..")
            || file_id.contains('/')
            || file_id.contains('\\')
            || file_id.contains('\0')
        {
            return Err(EngineError::InvalidArtifactName(file_id.to_string()));
        }

        let root = std::fs::canonicalize(&self.root)
            .map_err(|_| EngineError::ArtifactNotFound(file_id.to_string()))?;
        let candidate = root.join(file_id);
        let meta = std::fs::metadata(&candidate)
            .map_err(|_| EngineError::ArtifactNotFound(file_id.to_string()))?;
        if !meta.is_file() {
            return Err(EngineError::InvalidArtifactName(file_id.to_string()));
        }
        let resolved = std::fs::canonicalize(&candidate)?;
        if !resolved.starts_with(&root) {
            return Err(EngineError::InvalidArtifactName(file_id.to_string()));
        }

        Ok(ResolvedArtifact {
            media_type: media_type(&resolved),
            path: resolved,
        })
    }
}

pub fn media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Keep alphanumerics, `-` and `_`; collapse everything else into single underscores.
fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_underscore = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            result.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }
    result.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn publisher(root: &Path) -> ArtifactPublisher {
        ArtifactPublisher::new(&ArtifactConfig {
            root: root.to_path_buf(),
            public_base_url: "http://localhost:8000/".to_string(),
            route_prefix: "api/v2/files/plots/".to_string(),
            max_artifact_bytes: 1024,
        })
    }

    fn png() -> RawArtifact {
        RawArtifact {
            extension: "png".to_string(),
            bytes: vec![0x89, b'P', b'N', b'G'],
        }
    }

    #[tokio::test]
    async fn test_publish_names_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        let artifact = publisher
            .publish(&png(), ArtifactKind::Figure, "execute_python_code", "c1")
            .await
            .unwrap();

        let name = artifact.local_path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("execute_python_code_"));
        assert!(name.ends_with(".png"));
        assert_eq!(
            artifact.public_url,
            format!("http://localhost:8000/api/v2/files/plots/{}", name)
        );
        assert_eq!(std::fs::read(&artifact.local_path).unwrap(), png().bytes);
    }

    #[tokio::test]
    async fn test_publish_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        let mut paths = std::collections::HashSet::new();
        for _ in 0..5 {
            let artifact = publisher
                .publish(&png(), ArtifactKind::Figure, "execute_python_code", "c1")
                .await
                .unwrap();
            assert!(paths.insert(artifact.local_path));
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 5);
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let err = publisher(&blocker)
            .publish(&png(), ArtifactKind::Figure, "execute_python_code", "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_discard_removes_published_file() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        let artifact = publisher
            .publish(&png(), ArtifactKind::Figure, "execute_python_code", "c1")
            .await
            .unwrap();
        publisher.discard(&artifact).await;
        assert!(!artifact.local_path.exists());
        assert!(publisher.resolve(artifact.local_path.file_name().unwrap().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        for bad in ["../secret.png", "a/b.png", "..", "a\\b.png", ""] {
            assert!(
                matches!(publisher.resolve(bad), Err(EngineError::InvalidArtifactName(_))),
                "{:?}",
                bad
            );
        }
        assert!(matches!(
            publisher.resolve("missing.png"),
            Err(EngineError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_media_types() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plot.PNG"), b"x").unwrap();
        std::fs::write(dir.path().join("page.html"), b"<p>").unwrap();
        let publisher = publisher(dir.path());
        assert_eq!(publisher.resolve("plot.PNG").unwrap().media_type, "image/png");
        assert_eq!(
            publisher.resolve("page.html").unwrap().media_type,
            "text/html; charset=utf-8"
        );
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("analyze graph/chart"), "analyze_graph_chart");
        assert_eq!(sanitize_filename("../x"), "x");
    }
}

//! Artifact storage shared with the agents: developer-defined test archives,
//! published test results and build console logs.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Relative location of a developer-defined test archive.
pub fn developer_defined_artifact_path(netapp_id: &str, name: &str) -> String {
    format!("developer-defined-tests/{netapp_id}/{name}.tar.gz")
}

/// File transfer collaborator. Paths are relative to the transfer root.
#[async_trait::async_trait]
pub trait FileTransfer: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<()>;
    async fn download(&self, path: &str) -> Result<Vec<u8>>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// [`FileTransfer`] over a local directory.
#[derive(Debug, Clone)]
pub struct LocalWarehouse {
    root: PathBuf,
}

impl LocalWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` under the root. Absolute paths and `..` are rejected.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty() {
            bail!("empty artifact path");
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("artifact path escapes the warehouse: {path}"),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl FileTransfer for LocalWarehouse {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
        tracing::debug!(path = %path, bytes = bytes.len(), "stored artifact");
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let source = self.resolve(path)?;
        tokio::fs::read(&source)
            .await
            .with_context(|| format!("failed to read {}", source.display()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target).await.unwrap_or(false))
    }
}

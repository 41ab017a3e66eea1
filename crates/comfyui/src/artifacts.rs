//! Local persistence of downloaded artifacts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::history::ArtifactReference;

/// Where fetched artifacts are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputDestination {
    /// Each artifact keeps its backend filename inside this directory.
    Directory(PathBuf),
    /// The first artifact is written to this exact path; later ones get a
    /// `_<n>` suffix before the extension.
    File(PathBuf),
}

impl Default for OutputDestination {
    fn default() -> Self {
        Self::Directory(PathBuf::from("."))
    }
}

impl OutputDestination {
    /// Interpret a user-supplied output path.
    ///
    /// `None` means the current directory. An existing directory, or a
    /// path ending in a separator, is a directory; anything else is a file.
    pub fn resolve(path: Option<&Path>) -> Self {
        match path {
            None => Self::default(),
            Some(p) if p.is_dir() || ends_with_separator(p) => Self::Directory(p.to_path_buf()),
            Some(p) => Self::File(p.to_path_buf()),
        }
    }

    /// Local path for the `index`-th artifact of a job (zero-based, in
    /// backend order).
    pub fn path_for(&self, index: usize, artifact: &ArtifactReference) -> PathBuf {
        match self {
            Self::Directory(dir) => dir.join(safe_file_name(&artifact.filename)),
            Self::File(path) if index == 0 => path.clone(),
            Self::File(path) => with_suffix(path, index),
        }
    }

    /// Like [`path_for`](Self::path_for), but never returns a path in
    /// `taken`. Same-named artifacts from different subfolders or nodes
    /// get a `_<n>` suffix instead of overwriting each other.
    pub fn unique_path_for(
        &self,
        index: usize,
        artifact: &ArtifactReference,
        taken: &HashSet<PathBuf>,
    ) -> PathBuf {
        let path = self.path_for(index, artifact);
        if !taken.contains(&path) {
            return path;
        }
        let mut n = 1;
        loop {
            let candidate = with_suffix(&path, n);
            if !taken.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// `dir/name.ext` -> `dir/name_<n>.ext`.
fn with_suffix(path: &Path, n: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{n}"),
    };
    path.with_file_name(name)
}

/// Write `bytes` to `path`, creating parent directories as needed.
pub async fn persist(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}

/// Backend filenames are untrusted; keep only the final component.
fn safe_file_name(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "artifact".to_string())
}

fn ends_with_separator(p: &Path) -> bool {
    p.as_os_str()
        .to_string_lossy()
        .ends_with(std::path::is_separator)
}

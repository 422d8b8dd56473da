use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::normalize_extensions;

/// A matching file found under the input root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub source_path: PathBuf,
    pub relative_path: PathBuf,
    pub size_bytes: Option<u64>,
}

/// Non-fatal problem met while walking the tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanWarning {
    pub path: Option<PathBuf>,
    pub message: String,
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path.display(), self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScanWarning {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanItem {
    Found(ScanEntry),
    Warning(ScanWarning),
}

/// Check if a path's extension is in the allow-list (case-insensitive).
/// `extensions` must be normalized (lower case, leading dot).
pub fn is_allowed(path: &Path, extensions: &[String]) -> bool {
    if let Some(ext) = path.extension() {
        if let Some(ext_str) = ext.to_str() {
            let dotted = format!(".{}", ext_str.to_lowercase());
            return extensions.iter().any(|e| *e == dotted);
        }
    }
    false
}

/// Recursive, deterministic walk of an input root
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    extensions: Vec<String>,
    follow_links: bool,
}

impl Scanner {
    pub fn new<I, S>(root: impl Into<PathBuf>, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            root: root.into(),
            extensions: normalize_extensions(extensions),
            follow_links: false,
        }
    }

    /// Follow symlinks; loops are then reported as warnings
    pub fn follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a fresh walk. Entries come out sorted by file name at every level.
    pub fn iter(&self) -> ScanIter<'_> {
        let walker = WalkDir::new(&self.root)
            .follow_links(self.follow_links)
            .sort_by_file_name()
            .into_iter();
        ScanIter {
            scanner: self,
            walker,
        }
    }

    /// Walk to the end, splitting entries from warnings
    pub fn collect(&self) -> (Vec<ScanEntry>, Vec<ScanWarning>) {
        let mut entries = Vec::new();
        let mut warnings = Vec::new();
        for item in self.iter() {
            match item {
                ScanItem::Found(entry) => entries.push(entry),
                ScanItem::Warning(warning) => warnings.push(warning),
            }
        }
        (entries, warnings)
    }
}

pub struct ScanIter<'a> {
    scanner: &'a Scanner,
    walker: walkdir::IntoIter,
}

impl Iterator for ScanIter<'_> {
    type Item = ScanItem;

    fn next(&mut self) -> Option<ScanItem> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let message = if err.loop_ancestor().is_some() {
                        "symlink loop detected".to_string()
                    } else {
                        err.to_string()
                    };
                    let warning = ScanWarning {
                        path: err.path().map(Path::to_path_buf),
                        message,
                    };
                    tracing::warn!(%warning, "scan warning");
                    return Some(ScanItem::Warning(warning));
                }
            };

            if !entry.file_type().is_file() || !is_allowed(entry.path(), &self.scanner.extensions) {
                continue;
            }

            let source_path = entry.path().to_path_buf();
            let relative_path = match source_path.strip_prefix(&self.scanner.root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let size_bytes = entry.metadata().ok().map(|m| m.len());

            return Some(ScanItem::Found(ScanEntry {
                source_path,
                relative_path,
                size_bytes,
            }));
        }
    }
}

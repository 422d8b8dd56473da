// Output path collision handling

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::error::EngineError;

/// Highest numeric suffix tried before giving up
pub const MAX_SUFFIX_ATTEMPTS: u32 = 1000;

/// What to do when the natural output path is already taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    #[default]
    Skip,
    Overwrite,
    Suffix,
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollisionPolicy::Skip => f.write_str("skip"),
            CollisionPolicy::Overwrite => f.write_str("overwrite"),
            CollisionPolicy::Suffix => f.write_str("suffix"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Write to the natural target path
    Proceed(PathBuf),
    /// Target exists and the policy says leave it alone
    Skip(PathBuf),
    /// Target was taken; write to this suffixed path instead
    Suffix(PathBuf),
}

impl Decision {
    pub fn output_path(&self) -> &Path {
        match self {
            Decision::Proceed(p) | Decision::Skip(p) | Decision::Suffix(p) => p,
        }
    }
}

/// `dir/name.ext` -> `dir/name (n).ext`
pub fn suffixed_path(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    };
    path.with_file_name(name)
}

/// Maps relative paths under the output root to final output paths.
///
/// Every path handed out is reserved until released, so two jobs of one
/// batch never resolve to the same file even before either exists on disk.
#[derive(Debug)]
pub struct CollisionResolver {
    output_root: PathBuf,
    policy: CollisionPolicy,
    reserved: Mutex<HashSet<PathBuf>>,
}

impl CollisionResolver {
    pub fn new(output_root: impl Into<PathBuf>, policy: CollisionPolicy) -> Self {
        Self {
            output_root: output_root.into(),
            policy,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Natural target for a relative source path
    pub fn target_for(&self, relative_path: &Path) -> PathBuf {
        self.output_root.join(relative_path)
    }

    /// Resolve against the real filesystem
    pub fn resolve(&self, relative_path: &Path) -> Result<Decision, EngineError> {
        self.resolve_with(relative_path, |p| p.exists())
    }

    /// Resolve with a caller-supplied existence check
    pub fn resolve_with<F>(&self, relative_path: &Path, exists: F) -> Result<Decision, EngineError>
    where
        F: Fn(&Path) -> bool,
    {
        let target = self.target_for(relative_path);
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        let taken = |p: &Path, reserved: &HashSet<PathBuf>| reserved.contains(p) || exists(p);

        let decision = match self.policy {
            CollisionPolicy::Overwrite => Decision::Proceed(target),
            CollisionPolicy::Skip => {
                if taken(&target, &*reserved) {
                    Decision::Skip(target)
                } else {
                    Decision::Proceed(target)
                }
            }
            CollisionPolicy::Suffix => {
                if !taken(&target, &*reserved) {
                    Decision::Proceed(target)
                } else {
                    let free = (1..=MAX_SUFFIX_ATTEMPTS)
                        .map(|n| suffixed_path(&target, n))
                        .find(|candidate| !taken(candidate.as_path(), &*reserved));
                    match free {
                        Some(path) => Decision::Suffix(path),
                        None => {
                            return Err(EngineError::Collision {
                                path: target,
                                attempts: MAX_SUFFIX_ATTEMPTS,
                            });
                        }
                    }
                }
            }
        };

        if !matches!(decision, Decision::Skip(_)) {
            reserved.insert(decision.output_path().to_path_buf());
        }
        tracing::debug!(policy = %self.policy, ?decision, "resolved output path");
        Ok(decision)
    }

    /// Drop a reservation so the path can be resolved again
    pub fn release(&self, path: &Path) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path)
    }

    pub fn is_reserved(&self, path: &Path) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }
}

/// Create the parent directories of `path`. Safe to race with other workers.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

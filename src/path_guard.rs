use crate::error::{JobError, PathKind};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// A caller path that passed every check, in canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    pub is_dir: bool,
    /// Byte size for files, `None` for directories.
    pub size: Option<u64>,
}

/// Confines caller-supplied paths to a set of permitted roots.
#[derive(Debug, Clone)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
    base: PathBuf,
    allow_any: bool,
    max_file_size: u64,
}

impl PathGuard {
    /// Relative paths are resolved against `base`.
    pub fn new(roots: &[PathBuf], base: impl Into<PathBuf>, max_file_size: u64) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let base = canonical_or_lexical(&cwd, &base.into());
        let roots = roots
            .iter()
            .map(|root| canonical_or_lexical(&base, root))
            .collect();
        Self {
            roots,
            base,
            allow_any: false,
            max_file_size,
        }
    }

    pub fn allow_any(mut self, allow_any: bool) -> Self {
        self.allow_any = allow_any;
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn validate(&self, raw: &str, expect: PathKind) -> Result<ResolvedPath, JobError> {
        let path = self.resolve(raw);

        if !self.is_allowed(&path) {
            return Err(JobError::PathNotAllowed {
                path,
                roots: self.describe_roots(),
            });
        }

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::PathNotFound { path });
            }
            Err(err) => {
                return Err(JobError::internal(format!(
                    "stat {}: {err}",
                    path.display()
                )));
            }
        };

        match expect {
            PathKind::File if !meta.is_file() => {
                return Err(JobError::WrongKind { path, expected: expect });
            }
            PathKind::Dir if !meta.is_dir() => {
                return Err(JobError::WrongKind { path, expected: expect });
            }
            _ => {}
        }

        if meta.is_file() && meta.len() > self.max_file_size {
            return Err(JobError::FileTooLarge {
                path,
                size: meta.len(),
                max: self.max_file_size,
            });
        }

        Ok(ResolvedPath {
            is_dir: meta.is_dir(),
            size: meta.is_file().then(|| meta.len()),
            path,
        })
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let expanded = expand_home(raw.trim());
        canonical_or_lexical(&self.base, &expanded)
    }

    fn is_allowed(&self, path: &Path) -> bool {
        self.allow_any || self.roots.iter().any(|root| path.starts_with(root))
    }

    fn describe_roots(&self) -> String {
        if self.roots.is_empty() {
            return "(none)".to_string();
        }
        self.roots
            .iter()
            .map(|root| root.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Symlinks are followed by the OS wherever the path exists. Only the
/// missing tail is folded lexically, so a missing path still gets a
/// containment verdict.
fn canonical_or_lexical(base: &Path, path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    match fs::canonicalize(&absolute) {
        Ok(canonical) => canonical,
        Err(_) => canonicalize_existing_prefix(&absolute),
    }
}

/// Canonicalizes the longest existing prefix, then appends the remaining
/// components. `..` inside the missing part cannot cross a symlink, so it is
/// safe to pop it textually there.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let components: Vec<Component<'_>> = path.components().collect();

    for split in (1..components.len()).rev() {
        let prefix: PathBuf = components[..split].iter().collect();
        if let Ok(mut resolved) = fs::canonicalize(&prefix) {
            fold(&mut resolved, &components[split..]);
            return resolved;
        }
    }

    let mut resolved = PathBuf::new();
    fold(&mut resolved, &components);
    resolved
}

fn fold(out: &mut PathBuf, components: &[Component<'_>]) {
    for component in components {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(raw)
}

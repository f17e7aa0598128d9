//! Input source resolution.
//!
//! A single user-supplied input (text, path, glob, command, list) normalizes
//! into an ordered sequence of [`Source`]s. A source that decomposes (a
//! directory, a glob with several matches) yields multiple entries; `read`
//! applies the first according to the multi-source strategy, `iread` walks
//! them all.

use std::path::{Path, PathBuf};

use crate::buffer::Buffer;
use crate::error::{DtError, DtResult};

/// How `read()` treats an input that resolved to several sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiSourceStrategy {
    /// Silently read the first source.
    One,
    /// Read the first source and warn about the rest.
    #[default]
    Warn,
    /// Raise an error.
    Error,
    /// Read every source (only meaningful through `iread`).
    All,
}

/// A user-facing input designation.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    /// Raw CSV text.
    Text(String),
    /// A single file path.
    Path(PathBuf),
    /// Several file paths.
    Paths(Vec<PathBuf>),
    /// A glob pattern (`*` within the filename component).
    Glob(String),
    /// A shell command whose stdout is the input.
    Command(String),
    /// A URL (not supported by this engine).
    Url(String),
}

impl From<&str> for SourceSpec {
    /// Heuristic classification of a bare string, the way the generic
    /// `read(src)` entry point accepts one: embedded newlines mean raw
    /// text, URL schemes mean URLs, glob metacharacters mean globs, and
    /// anything else is a path.
    fn from(s: &str) -> SourceSpec {
        if s.contains('\n') || s.contains('\r') {
            SourceSpec::Text(s.to_string())
        } else if s.starts_with("http://") || s.starts_with("https://") || s.starts_with("ftp://") {
            SourceSpec::Url(s.to_string())
        } else if s.contains('*') || s.contains('?') {
            SourceSpec::Glob(s.to_string())
        } else {
            SourceSpec::Path(PathBuf::from(s))
        }
    }
}

impl From<String> for SourceSpec {
    fn from(s: String) -> SourceSpec {
        SourceSpec::from(s.as_str())
    }
}

impl From<&Path> for SourceSpec {
    fn from(p: &Path) -> SourceSpec {
        SourceSpec::Path(p.to_path_buf())
    }
}

impl From<PathBuf> for SourceSpec {
    fn from(p: PathBuf) -> SourceSpec {
        SourceSpec::Path(p)
    }
}

/// One concrete input to feed through the reader.
#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    kind: SourceKind,
}

#[derive(Debug, Clone)]
enum SourceKind {
    Text(String),
    File(PathBuf),
    Command(String),
}

impl Source {
    /// Load the raw bytes. Files are memory-mapped; `.zst` files are
    /// decompressed; command output is captured.
    pub fn load(&self) -> DtResult<Buffer> {
        match &self.kind {
            SourceKind::Text(t) => Ok(Buffer::from_bytes(t.as_bytes())),
            SourceKind::File(path) => {
                if path.extension().is_some_and(|e| e == "zst") {
                    let compressed = std::fs::read(path)?;
                    let decompressed = zstd::decode_all(&compressed[..])?;
                    Ok(Buffer::from_bytes(&decompressed))
                } else {
                    Buffer::mmap(path)
                }
            }
            SourceKind::Command(cmd) => {
                let output = std::process::Command::new("sh")
                    .arg("-c")
                    .arg(cmd)
                    .output()?;
                if !output.status.success() {
                    return Err(DtError::IoError(std::io::Error::other(format!(
                        "command `{cmd}` exited with {}",
                        output.status
                    ))));
                }
                Ok(Buffer::from_bytes(&output.stdout))
            }
        }
    }
}

/// Resolve a spec into its ordered sequence of sources.
pub fn resolve_sources(spec: &SourceSpec) -> DtResult<Vec<Source>> {
    match spec {
        SourceSpec::Text(t) => Ok(vec![Source {
            name: "<text>".to_string(),
            kind: SourceKind::Text(t.clone()),
        }]),
        SourceSpec::Path(p) => {
            if p.is_dir() {
                let mut paths: Vec<PathBuf> = std::fs::read_dir(p)?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect();
                paths.sort();
                if paths.is_empty() {
                    return Err(DtError::value_error(format!(
                        "directory {} contains no files",
                        p.display()
                    )));
                }
                Ok(paths.into_iter().map(file_source).collect())
            } else if p.exists() {
                Ok(vec![file_source(p.clone())])
            } else {
                Err(DtError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("file {} does not exist", p.display()),
                )))
            }
        }
        SourceSpec::Paths(ps) => {
            if ps.is_empty() {
                return Err(DtError::value_error("empty list of input files"));
            }
            Ok(ps.iter().cloned().map(file_source).collect())
        }
        SourceSpec::Glob(pattern) => {
            let paths = expand_glob(pattern)?;
            if paths.is_empty() {
                return Err(DtError::value_error(format!(
                    "no files match the pattern {pattern}"
                )));
            }
            Ok(paths.into_iter().map(file_source).collect())
        }
        SourceSpec::Command(cmd) => Ok(vec![Source {
            name: format!("<cmd: {cmd}>"),
            kind: SourceKind::Command(cmd.clone()),
        }]),
        SourceSpec::Url(url) => Err(DtError::NotImplemented(format!(
            "reading from URLs is not supported (got {url})"
        ))),
    }
}

fn file_source(path: PathBuf) -> Source {
    Source {
        name: path.display().to_string(),
        kind: SourceKind::File(path),
    }
}

/// Minimal glob: `*` and `?` within the final path component.
fn expand_glob(pattern: &str) -> DtResult<Vec<PathBuf>> {
    let path = Path::new(pattern);
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let dir = dir.unwrap_or(Path::new("."));
    let file_pat = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| DtError::value_error(format!("invalid glob pattern {pattern}")))?;
    if dir.to_str().is_some_and(|d| d.contains(['*', '?'])) {
        return Err(DtError::NotImplemented(
            "glob patterns in directory components are not supported".to_string(),
        ));
    }
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && glob_match(file_pat, name)
        {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    // iterative wildcard match with single backtrack point
    let (mut pi, mut ni) = (0usize, 0usize);
    let (mut star_p, mut star_n) = (usize::MAX, 0usize);
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star_p = pi;
            star_n = ni;
            pi += 1;
        } else if star_p != usize::MAX {
            pi = star_p + 1;
            star_n += 1;
            ni = star_n;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_spec_classification() {
        assert!(matches!(SourceSpec::from("a,b\n1,2\n"), SourceSpec::Text(_)));
        assert!(matches!(SourceSpec::from("data.csv"), SourceSpec::Path(_)));
        assert!(matches!(SourceSpec::from("*.csv"), SourceSpec::Glob(_)));
        assert!(matches!(
            SourceSpec::from("https://example.com/x.csv"),
            SourceSpec::Url(_)
        ));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.csv", "data.csv"));
        assert!(glob_match("data-?.csv", "data-1.csv"));
        assert!(!glob_match("*.csv", "data.tsv"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn test_url_not_implemented() {
        let err = resolve_sources(&SourceSpec::from("http://x/y.csv")).unwrap_err();
        assert!(matches!(err, DtError::NotImplemented(_)));
    }

    #[test]
    fn test_directory_decomposes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.csv", "a.csv"] {
            let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
            writeln!(f, "x\n1").unwrap();
        }
        let sources = resolve_sources(&SourceSpec::Path(dir.path().to_path_buf())).unwrap();
        assert_eq!(sources.len(), 2);
        assert!(sources[0].name.ends_with("a.csv"));
    }

    #[test]
    fn test_zst_source_decompresses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv.zst");
        let compressed = zstd::encode_all(&b"x\n5\n"[..], 3).unwrap();
        std::fs::write(&path, compressed).unwrap();
        let sources = resolve_sources(&SourceSpec::Path(path)).unwrap();
        let buf = sources[0].load().unwrap();
        assert_eq!(buf.as_bytes(), b"x\n5\n");
    }
}

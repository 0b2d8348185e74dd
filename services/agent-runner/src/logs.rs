//! Log file access for the observability endpoint

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Default log file when no name is given
pub const DEFAULT_LOG_FILE: &str = "agent.log";

#[derive(Error, Debug)]
pub enum LogError {
    #[error("invalid log name '{0}'")]
    InvalidName(String),

    #[error("log file '{0}' not found")]
    NotFound(String),

    #[error("log read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How much of a log file to return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLimit {
    Last(usize),
    All,
}

impl LogLimit {
    /// Parse a `limit` query value: a line count or `all`
    pub fn parse(raw: Option<&str>, default: usize) -> Result<Self, String> {
        match raw.map(str::trim) {
            None | Some("") => Ok(LogLimit::Last(default)),
            Some(v) if v.eq_ignore_ascii_case("all") => Ok(LogLimit::All),
            Some(v) => v
                .parse()
                .map(LogLimit::Last)
                .map_err(|_| format!("invalid limit '{}'", v)),
        }
    }
}

/// Resolve a bare file name inside `log_dir`
///
/// Anything that is not a single plain path component is rejected, so
/// requests cannot climb out of the log directory.
pub fn resolve(log_dir: &Path, name: &str) -> Result<PathBuf, LogError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(file)), None) if !name.contains('\\') => Ok(log_dir.join(file)),
        _ => Err(LogError::InvalidName(name.to_string())),
    }
}

/// Read the last lines of a log file
pub async fn tail_lines(path: &Path, limit: LogLimit) -> Result<Vec<String>, LogError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LogError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<String> = text.lines().map(str::to_string).collect();
    Ok(match limit {
        LogLimit::All => lines,
        LogLimit::Last(n) => {
            let skip = lines.len().saturating_sub(n);
            lines.into_iter().skip(skip).collect()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = Path::new("/var/log/agent");
        assert_eq!(resolve(dir, "agent.log").unwrap(), dir.join("agent.log"));
        for bad in ["../secrets", "/etc/passwd", "a/b.log", "..", ".", "", "..\\x"] {
            assert!(resolve(dir, bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_limit_parsing() {
        assert_eq!(LogLimit::parse(None, 200), Ok(LogLimit::Last(200)));
        assert_eq!(LogLimit::parse(Some("ALL"), 200), Ok(LogLimit::All));
        assert_eq!(LogLimit::parse(Some("15"), 200), Ok(LogLimit::Last(15)));
        assert!(LogLimit::parse(Some("-3"), 200).is_err());
    }

    #[tokio::test]
    async fn test_tail_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        tokio::fs::write(&path, "one\ntwo\nthree\n").await.unwrap();

        assert_eq!(tail_lines(&path, LogLimit::Last(2)).await.unwrap(), vec!["two", "three"]);
        assert_eq!(tail_lines(&path, LogLimit::All).await.unwrap().len(), 3);
        assert!(matches!(
            tail_lines(&dir.path().join("missing.log"), LogLimit::All).await,
            Err(LogError::NotFound(_))
        ));
    }
}

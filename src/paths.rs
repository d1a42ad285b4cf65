use std::path::{Path, PathBuf};

use crate::config::CONFIG_DIR;

/// `.shellrun/logs/` under the project base directory.
pub fn logs_dir(base: &Path) -> PathBuf {
    base.join(CONFIG_DIR).join("logs")
}

/// Execution log for one session: `.shellrun/logs/<session-id>.jsonl`.
pub fn session_log_path(base: &Path, session_id: &str) -> PathBuf {
    let name: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let name = if name.is_empty() { "session".to_string() } else { name };
    logs_dir(base).join(format!("{name}.jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_live_under_shellrun_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(logs_dir(tmp.path()), tmp.path().join(".shellrun").join("logs"));
    }

    #[test]
    fn session_log_is_named_after_session() {
        let base = Path::new("/work/app");
        assert_eq!(
            session_log_path(base, "4f1c2a9e-77b0-4c5e-9d7e-0c1a2b3c4d5e"),
            PathBuf::from("/work/app/.shellrun/logs/4f1c2a9e-77b0-4c5e-9d7e-0c1a2b3c4d5e.jsonl")
        );
    }

    #[test]
    fn session_ids_cannot_escape_the_logs_dir() {
        let base = Path::new("/work/app");
        let path = session_log_path(base, "../../etc/passwd");
        assert_eq!(path.parent().unwrap(), logs_dir(base));
        assert_eq!(session_log_path(base, ""), logs_dir(base).join("session.jsonl"));
    }
}

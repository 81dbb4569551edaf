use std::io::{BufRead, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::protocol::FinishedRequest;

/// Largest accepted WAL line: a FinishedRequest with a base64 diff of up
/// to ~1.4 MB must fit.
const MAX_LINE_BYTES: usize = 2 * 1024 * 1024;

/// One JSONL line in the finished WAL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    #[serde(rename = "ts")]
    pub timestamp: String,
    pub directive_id: String,
    /// The directive token is persisted in plaintext for replay; the file
    /// is 0600 inside a 0700 directory and tokens are short-lived JWTs.
    pub token: String,
    pub request: FinishedRequest,
}

/// Append-only JSONL log of FinishedRequest payloads that failed to post.
/// Replayed and truncated on the next startup; the only persistent state
/// the daemon owns.
pub struct FinishedWal {
    path: PathBuf,
    lock: std::sync::Mutex<()>,
}

impl FinishedWal {
    pub fn new(work_dir: &std::path::Path) -> std::io::Result<Self> {
        let dir = work_dir.join(".nexus");
        create_dir_0700(&dir)?;
        Ok(Self {
            path: dir.join("finished.wal"),
            lock: std::sync::Mutex::new(()),
        })
    }

    pub fn append(&self, entry: &WalEntry) -> std::io::Result<()> {
        let _guard = self.lock.lock().expect("wal mutex poisoned");

        let mut file = open_append_0600(&self.path)?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)
    }

    /// Read all entries. Corrupt or oversized lines are skipped with a
    /// warning so one bad record never blocks recovery of the rest.
    pub fn replay(&self) -> std::io::Result<Vec<WalEntry>> {
        let _guard = self.lock.lock().expect("wal mutex poisoned");

        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        let reader = std::io::BufReader::new(file);
        for (idx, line) in reader.split(b'\n').enumerate() {
            let line_num = idx + 1;
            let line = line?;
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_LINE_BYTES {
                tracing::warn!(line = line_num, bytes = line.len(), "WAL: skipping oversized entry");
                continue;
            }
            match serde_json::from_slice::<WalEntry>(&line) {
                Ok(e) => entries.push(e),
                Err(e) => {
                    tracing::warn!(line = line_num, error = %e, "WAL: skipping corrupt entry");
                }
            }
        }
        Ok(entries)
    }

    /// Empty the WAL. A missing file counts as success.
    pub fn truncate(&self) -> std::io::Result<()> {
        let _guard = self.lock.lock().expect("wal mutex poisoned");

        match std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn create_dir_0700(dir: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(dir).or_else(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            Ok(())
        } else {
            Err(e)
        }
    })
}

fn open_append_0600(path: &std::path::Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RunStatus;

    fn entry(id: &str) -> WalEntry {
        WalEntry {
            timestamp: crate::protocol::now_rfc3339(),
            directive_id: id.to_string(),
            token: "tok".to_string(),
            request: FinishedRequest {
                exit_code: Some(0),
                status: RunStatus::Succeeded,
                ..Default::default()
            },
        }
    }

    #[test]
    fn append_replay_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FinishedWal::new(dir.path()).unwrap();

        wal.append(&entry("d-1")).unwrap();
        wal.append(&entry("d-2")).unwrap();
        wal.append(&entry("d-3")).unwrap();

        let entries = wal.replay().unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.directive_id.as_str()).collect();
        assert_eq!(ids, vec!["d-1", "d-2", "d-3"]);
    }

    #[test]
    fn replay_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FinishedWal::new(dir.path()).unwrap();
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn corrupt_line_does_not_block_valid_ones() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FinishedWal::new(dir.path()).unwrap();

        wal.append(&entry("d-1")).unwrap();
        {
            let mut f = open_append_0600(wal.path()).unwrap();
            f.write_all(b"{not json at all\n").unwrap();
        }
        wal.append(&entry("d-2")).unwrap();

        let entries = wal.replay().unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.directive_id.as_str()).collect();
        assert_eq!(ids, vec!["d-1", "d-2"]);
    }

    #[test]
    fn truncate_empties_file_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FinishedWal::new(dir.path()).unwrap();

        // Missing file: success.
        wal.truncate().unwrap();

        wal.append(&entry("d-1")).unwrap();
        wal.truncate().unwrap();
        assert_eq!(std::fs::metadata(wal.path()).unwrap().len(), 0);
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn entry_roundtrips_payload() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FinishedWal::new(dir.path()).unwrap();

        let mut e = entry("d-7");
        e.request.exit_code = Some(124);
        e.request.status = RunStatus::TimedOut;
        e.request.diff_base64 = "ZGlmZg==".to_string();
        wal.append(&e).unwrap();

        let got = &wal.replay().unwrap()[0];
        assert_eq!(got.directive_id, "d-7");
        assert_eq!(got.token, "tok");
        assert_eq!(got.request.exit_code, Some(124));
        assert_eq!(got.request.status, RunStatus::TimedOut);
        assert_eq!(got.request.diff_base64, "ZGlmZg==");
    }

    #[test]
    fn file_permissions_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let wal = FinishedWal::new(dir.path()).unwrap();
        wal.append(&entry("d-1")).unwrap();

        let dir_mode = std::fs::metadata(dir.path().join(".nexus")).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = std::fs::metadata(wal.path()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}

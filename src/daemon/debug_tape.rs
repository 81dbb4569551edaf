use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;

use crate::protocol::now_rfc3339;

/// One event on the local debug tape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TapeLine {
    pub ts: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub directive_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub facility_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub profile: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub driver: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

struct TapeInner {
    file: Option<std::fs::File>,
    bytes: u64,
}

/// Rotating local JSONL event log for offline forensics. When the file
/// would exceed `max_bytes` it is renamed to `<path>.1` and a fresh file
/// is started.
pub struct DebugTape {
    path: PathBuf,
    max_bytes: u64,
    inner: std::sync::Mutex<TapeInner>,
}

impl DebugTape {
    pub fn new(path: PathBuf, max_bytes: u64) -> std::io::Result<Self> {
        if path.as_os_str().is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "debug tape path is required",
            ));
        }
        if max_bytes == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "debug tape max_bytes must be >= 1",
            ));
        }

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let bytes = file.metadata().map(|m| m.len()).unwrap_or(0);

        let tape = Self {
            path,
            max_bytes,
            inner: std::sync::Mutex::new(TapeInner {
                file: Some(file),
                bytes,
            }),
        };

        {
            let mut inner = tape.inner.lock().expect("tape mutex poisoned");
            if inner.bytes > tape.max_bytes {
                tape.rotate_locked(&mut inner)?;
            }
        }

        Ok(tape)
    }

    /// Record one event; best-effort, never fails the caller.
    pub fn record(&self, mut line: TapeLine) {
        if line.event.is_empty() {
            return;
        }
        if line.ts.is_empty() {
            line.ts = now_rfc3339();
        }

        let Ok(mut serialized) = serde_json::to_vec(&line) else {
            return;
        };
        serialized.push(b'\n');

        let mut inner = self.inner.lock().expect("tape mutex poisoned");
        if inner.file.is_none() {
            return;
        }

        if inner.bytes + serialized.len() as u64 > self.max_bytes
            && self.rotate_locked(&mut inner).is_err()
        {
            return;
        }

        if let Some(file) = inner.file.as_mut() {
            if file.write_all(&serialized).is_ok() {
                inner.bytes += serialized.len() as u64;
            }
        }
    }

    fn rotate_locked(&self, inner: &mut TapeInner) -> std::io::Result<()> {
        inner.file = None;

        let rotated = self.path.with_extension(rotated_extension(&self.path));
        let _ = std::fs::remove_file(&rotated);
        match std::fs::rename(&self.path, &rotated) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        inner.file = Some(file);
        inner.bytes = 0;
        Ok(())
    }
}

/// `tape.jsonl` rotates to `tape.jsonl.1`.
fn rotated_extension(path: &std::path::Path) -> String {
    match path.extension() {
        Some(ext) => format!("{}.1", ext.to_string_lossy()),
        None => "1".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn event(name: &str) -> TapeLine {
        TapeLine {
            directive_id: "d-1".into(),
            event: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn records_jsonl_with_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape.jsonl");
        let tape = DebugTape::new(path.clone(), 1 << 20).unwrap();

        tape.record(event("directive_claimed"));
        tape.record(TapeLine {
            event: "run_finished".into(),
            detail: Some(serde_json::json!({"exit_code": 0})),
            ..Default::default()
        });

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "directive_claimed");
        assert_eq!(lines[0]["directive_id"], "d-1");
        assert!(!lines[0]["ts"].as_str().unwrap().is_empty());
        assert_eq!(lines[1]["detail"]["exit_code"], 0);
    }

    #[test]
    fn empty_event_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape.jsonl");
        let tape = DebugTape::new(path.clone(), 1 << 20).unwrap();
        tape.record(TapeLine::default());
        assert!(read_lines(&path).is_empty());
    }

    #[test]
    fn rotation_moves_full_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape.jsonl");
        let tape = DebugTape::new(path.clone(), 200).unwrap();

        // Fill past the limit, then write the record that triggers rotation.
        tape.record(event("one"));
        tape.record(event("two"));
        tape.record(event("three"));
        tape.record(event("four"));

        let rotated = dir.path().join("tape.jsonl.1");
        assert!(rotated.exists(), "rotated file missing");

        // No record is lost across the rotation, and the active file only
        // holds what came after it.
        let fresh = read_lines(&path);
        let old = read_lines(&rotated);
        assert!(!old.is_empty());
        assert!(fresh.len() < 4);
        assert_eq!(old.len() + fresh.len(), 4);
        assert_eq!(fresh.last().unwrap()["event"], "four");
    }

    #[test]
    fn oversized_existing_file_rotates_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape.jsonl");
        std::fs::write(&path, vec![b'x'; 500]).unwrap();

        let tape = DebugTape::new(path.clone(), 100).unwrap();
        tape.record(event("fresh"));

        assert!(dir.path().join("tape.jsonl.1").exists());
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event"], "fresh");
    }

    #[test]
    fn invalid_construction_args() {
        assert!(DebugTape::new(PathBuf::new(), 100).is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(DebugTape::new(dir.path().join("t.jsonl"), 0).is_err());
    }
}

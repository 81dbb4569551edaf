/// Scans serial-console output for the per-execution exit-code marker
/// (`NEXUS_EXIT_<nonce>=<code>`).
///
/// Data arrives in arbitrary chunks; partial lines are buffered with a
/// 4 KiB tail bound, and only the last matching line is kept.
pub struct ExitCodeCapture {
    marker: String,
    last_line: Option<String>,
    partial: String,
}

const MAX_PARTIAL_BYTES: usize = 4096;

impl ExitCodeCapture {
    /// `marker` is the full prefix including the trailing `=`, e.g.
    /// `NEXUS_EXIT_a1b2c3d4e5f60718=`.
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            last_line: None,
            partial: String::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.partial.push_str(&String::from_utf8_lossy(chunk));

        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            let line = line.trim_end_matches('\n');
            if line.contains(&self.marker) {
                self.last_line = Some(line.to_string());
            }
        }

        // Bound the partial buffer so one endless line cannot grow memory.
        if self.partial.len() > MAX_PARTIAL_BYTES {
            let keep_from = self.partial.len() - MAX_PARTIAL_BYTES;
            // Stay on a char boundary for the tail.
            let keep_from = (keep_from..self.partial.len())
                .find(|i| self.partial.is_char_boundary(*i))
                .unwrap_or(self.partial.len());
            self.partial = self.partial[keep_from..].to_string();
        }
    }

    /// Process any trailing partial line; call after the stream ends.
    pub fn flush(&mut self) {
        if !self.partial.is_empty() && self.partial.contains(&self.marker) {
            self.last_line = Some(std::mem::take(&mut self.partial));
        }
        self.partial.clear();
    }

    /// The exit code from the last marker line, if one was seen.
    pub fn exit_code(&self) -> Option<i32> {
        let line = self.last_line.as_deref()?;
        let idx = line.find(&self.marker)?;
        let digits: String = line[idx + self.marker.len()..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }
}

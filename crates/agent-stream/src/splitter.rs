//! Blank-line record framing over decoded text.

/// Splits decoded text into blank-line-delimited records, keeping the
/// incomplete trailing fragment for the next push.
#[derive(Debug, Default)]
pub struct RecordSplitter {
    buf: String,
    // Offset before which no delimiter can start; avoids rescanning long
    // records on every push.
    scan_from: usize,
}

impl RecordSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `text` and returns every record whose delimiter has now been
    /// seen, in input order. Empty records are skipped.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut records = Vec::new();
        let mut start = 0;
        let mut scan_from = self.scan_from;
        while let Some((idx, delim_len)) = find_record_delimiter(self.buf.as_bytes(), scan_from) {
            let record = &self.buf[start..idx];
            if !record.trim().is_empty() {
                records.push(record.to_string());
            }
            start = idx + delim_len;
            scan_from = start;
        }
        if start > 0 {
            self.buf.drain(..start);
        }
        // A delimiter is at most 4 bytes, so only the last 3 can begin one
        // that the next push completes.
        self.scan_from = self.buf.len().saturating_sub(3);
        records
    }

    /// Takes whatever is left at end of stream. Returns `None` when the
    /// remainder is blank. The remainder is not a complete record.
    pub fn finish(&mut self) -> Option<String> {
        self.scan_from = 0;
        let rest = std::mem::take(&mut self.buf);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

fn find_record_delimiter(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

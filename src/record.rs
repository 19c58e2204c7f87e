use anyhow::{bail, Result};
use std::sync::atomic::{AtomicI64, Ordering};

/// Bytes held by all live [`SimpleRead`]s across the process, plus a fixed
/// per-record overhead. Readers consult this to pause when too much input is
/// in flight (see the pipeline modules); it is a soft bound, since a reader
/// may overshoot by one record before its next check.
pub static READ_BYTES_IN_MEM: AtomicI64 = AtomicI64::new(0);

const RECORD_OVERHEAD: usize = std::mem::size_of::<SimpleRead>();

/// One FASTQ record as a single owned byte blob.
///
/// `data` holds the four lines exactly as read, including their newlines
/// (and any `\r` before them), so a record routed without barcode excision
/// is written back byte-identical. The offsets index the interesting spans:
/// lengths exclude a trailing `\r`, which stays in `data`. The `+` separator
/// line is not indexed; it is reproduced verbatim on output.
///
/// A record is created once by a reader, handed through the pipeline by
/// ownership, and dropped by the writer (or by the demuxer when undecoded
/// reads are discarded).
#[derive(Debug)]
pub struct SimpleRead {
    data: Vec<u8>,
    name_len: usize,
    seq_start: usize,
    seq_len: usize,
    qual_start: usize,
    qual_len: usize,
}

impl SimpleRead {
    /// Consume a buffer holding the four lines of one record and locate the
    /// line spans. The final newline may be absent (end of file).
    pub fn from_raw(data: Vec<u8>) -> Result<Self> {
        if data.first() != Some(&b'@') {
            bail!("record does not start with '@'");
        }

        let nl = match find_newline(&data, 1) {
            Some(p) => p,
            None => bail!("name line has no line break"),
        };
        let mut name_len = nl;
        if data[nl - 1] == b'\r' {
            name_len -= 1;
        }
        let seq_start = nl + 1;

        let nl = match find_newline(&data, seq_start) {
            Some(p) => p,
            None => bail!("sequence line has no line break"),
        };
        let mut seq_len = nl - seq_start;
        if data[nl - 1] == b'\r' {
            seq_len -= 1;
        }

        let nl = match find_newline(&data, nl + 1) {
            Some(p) => p,
            None => bail!("separator line has no line break"),
        };
        let qual_start = nl + 1;

        // the quality line may end at EOF instead of a newline
        let end = find_newline(&data, qual_start).unwrap_or(data.len());
        let mut qual_len = end - qual_start;
        if qual_len > 0 && data[qual_start + qual_len - 1] == b'\r' {
            qual_len -= 1;
        }

        READ_BYTES_IN_MEM.fetch_add((data.len() + RECORD_OVERHEAD) as i64, Ordering::AcqRel);

        Ok(SimpleRead {
            data,
            name_len,
            seq_start,
            seq_len,
            qual_start,
            qual_len,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn name_len(&self) -> usize {
        self.name_len
    }

    pub fn seq_start(&self) -> usize {
        self.seq_start
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn qual_start(&self) -> usize {
        self.qual_start
    }

    pub fn qual_len(&self) -> usize {
        self.qual_len
    }

    /// The sequence line, without its line break.
    pub fn seq(&self) -> &[u8] {
        &self.data[self.seq_start..self.seq_start + self.seq_len]
    }

    /// The quality line, without its line break.
    pub fn qual(&self) -> &[u8] {
        &self.data[self.qual_start..self.qual_start + self.qual_len]
    }

    /// Scan the name line backwards from its end to the last `:`, recording
    /// the `+` closest to that colon and the base character closest to the
    /// end. Returns `(colon, plus, last_base)` positions, or `None` when no
    /// colon exists. The scan is bounded at offset zero.
    fn scan_name_tokens(&self) -> Option<(usize, Option<usize>, Option<usize>)> {
        let mut p = self.seq_start - 1;
        let mut plus = None;
        let mut last_base = None;
        loop {
            match self.data[p] {
                b':' => return Some((p, plus, last_base)),
                b'+' => plus = Some(p),
                b'A' | b'T' | b'C' | b'G' if last_base.is_none() => last_base = Some(p),
                _ => {}
            }
            if p == 0 {
                return None;
            }
            p -= 1;
        }
    }

    /// `(start, len)` of the Illumina index1 token: the span between the
    /// last `:` of the name line and the `+` (dual index) or the last base
    /// character (single index).
    pub fn illumina_index1_span(&self) -> Option<(usize, usize)> {
        let (colon, plus, last_base) = self.scan_name_tokens()?;
        let start = colon + 1;
        let len = match (plus, last_base) {
            (Some(p), _) if p > start => p - start,
            (_, Some(b)) if b >= start => b - start + 1,
            _ => return None,
        };
        Some((start, len))
    }

    /// `(start, len)` of the Illumina index2 token: the span between the `+`
    /// and the last base character of the name line.
    pub fn illumina_index2_span(&self) -> Option<(usize, usize)> {
        let (_, plus, last_base) = self.scan_name_tokens()?;
        match (plus, last_base) {
            (Some(p), Some(b)) if b > p => Some((p + 1, b - p)),
            _ => None,
        }
    }

    /// Both index spans of a dual-index name line.
    #[allow(clippy::type_complexity)]
    pub fn illumina_both_index_spans(&self) -> Option<((usize, usize), (usize, usize))> {
        let (colon, plus, last_base) = self.scan_name_tokens()?;
        match (plus, last_base) {
            (Some(p), Some(b)) if b > p => {
                let start1 = colon + 1;
                Some(((start1, p - start1), (p + 1, b - p)))
            }
            _ => None,
        }
    }
}

impl Drop for SimpleRead {
    fn drop(&mut self) {
        READ_BYTES_IN_MEM.fetch_sub(
            (self.data.len() + RECORD_OVERHEAD) as i64,
            Ordering::AcqRel,
        );
    }
}

fn find_newline(data: &[u8], from: usize) -> Option<usize> {
    data[from..].iter().position(|&b| b == b'\n').map(|p| p + from)
}

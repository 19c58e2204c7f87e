use crate::error::DemuxError;
use crate::record::SimpleRead;
use flate2::read::MultiGzDecoder;
use log::warn;
use std::fs::File;
use std::io::{self, BufReader, Read};

/// FASTQ scan buffer: records are sliced out of this window.
const FQ_BUF_SIZE: usize = 1 << 23;
/// Private input buffer feeding the gzip inflater.
const GZ_IN_BUF_SIZE: usize = 1 << 22;

enum ByteSource {
    Plain(File),
    Stdin(io::Stdin),
    /// Streaming inflate. `MultiGzDecoder` resets at member boundaries, so
    /// concatenated gzip files decode as one continuous stream.
    Gzip(MultiGzDecoder<BufReader<File>>),
}

impl ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ByteSource::Plain(f) => f.read(buf),
            ByteSource::Stdin(s) => s.read(buf),
            ByteSource::Gzip(g) => g.read(buf),
        }
    }
}

/// Streaming FASTQ reader producing one [`SimpleRead`] blob per record.
///
/// Bytes are pulled into a single 8 MiB window and scanned forward for the
/// four newlines of a record; the record's bytes are copied exactly once,
/// into the blob that travels through the pipeline. A record spanning the
/// window boundary grows its blob across refills. Not safe to share: one
/// reader, one thread.
pub struct FastqReader {
    path: String,
    source: ByteSource,
    zipped: bool,
    buf: Vec<u8>,
    buf_data_len: usize,
    buf_used_len: usize,
    reached_eof: bool,
    has_no_terminal_newline: bool,
    last_byte: u8,
    counter: u64,
}

impl FastqReader {
    /// Open a FASTQ file; `.gz` suffixes select the inflate path, and `-` or
    /// `/dev/stdin` reads standard input.
    pub fn new(path: &str) -> Result<Self, DemuxError> {
        let (source, zipped) = if crate::options::Options::is_stdin_input(path) {
            (ByteSource::Stdin(io::stdin()), false)
        } else {
            let file = File::open(path).map_err(|e| DemuxError::InputIo {
                path: path.to_string(),
                source: e,
            })?;
            if path.ends_with(".gz") {
                let buffered = BufReader::with_capacity(GZ_IN_BUF_SIZE, file);
                (ByteSource::Gzip(MultiGzDecoder::new(buffered)), true)
            } else {
                (ByteSource::Plain(file), false)
            }
        };

        let mut reader = FastqReader {
            path: path.to_string(),
            source,
            zipped,
            buf: vec![0; FQ_BUF_SIZE],
            buf_data_len: 0,
            buf_used_len: 0,
            reached_eof: false,
            has_no_terminal_newline: false,
            last_byte: b'\n',
            counter: 0,
        };
        reader.fill_buf()?;
        Ok(reader)
    }

    pub fn is_zipped(&self) -> bool {
        self.zipped
    }

    /// True when the input ended without a final line break; the last record
    /// is then complete at EOF rather than at a newline.
    pub fn has_no_terminal_newline(&self) -> bool {
        self.has_no_terminal_newline
    }

    /// Refill the window, pulling until at least one byte arrives or the
    /// source is exhausted.
    fn fill_buf(&mut self) -> Result<(), DemuxError> {
        self.buf_data_len = 0;
        self.buf_used_len = 0;
        while self.buf_data_len == 0 && !self.reached_eof {
            match self.source.read(&mut self.buf) {
                Ok(0) => self.reached_eof = true,
                Ok(n) => {
                    self.buf_data_len = n;
                    self.last_byte = self.buf[n - 1];
                }
                Err(e) => return Err(self.read_error(e)),
            }
        }
        if self.reached_eof && self.last_byte != b'\n' {
            self.has_no_terminal_newline = true;
        }
        Ok(())
    }

    fn read_error(&self, e: io::Error) -> DemuxError {
        if self.zipped {
            DemuxError::CorruptGzip {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        } else {
            DemuxError::InputIo {
                path: self.path.clone(),
                source: e,
            }
        }
    }

    fn buffer_finished(&self) -> bool {
        self.reached_eof
    }

    /// Pull the next record, or `None` at end of input. A partial record at
    /// true EOF (fewer than three newlines) is dropped with a warning.
    pub fn read(&mut self) -> Result<Option<SimpleRead>, DemuxError> {
        if self.buf_used_len >= self.buf_data_len && self.reached_eof {
            return Ok(None);
        }

        let start = self.buf_used_len;
        if self.buf[start] != b'@' {
            return Err(DemuxError::MalformedRecord {
                path: self.path.clone(),
                record: self.counter,
                reason: format!(
                    "FASTQ record should start with '@', not '{}'",
                    self.buf[start] as char
                ),
            });
        }

        let mut line_breaks = 0;
        let mut end = start;
        scan_lines(&self.buf[..self.buf_data_len], &mut end, &mut line_breaks);

        // common case: the whole record sits inside the window
        if line_breaks == 4 || self.buffer_finished() {
            let data = self.buf[start..end].to_vec();
            self.buf_used_len = end;
            if self.buf_used_len == self.buf_data_len {
                self.fill_buf()?;
            }
            return self.finish_record(data, line_breaks);
        }

        // the record straddles the window boundary: keep growing its blob
        let mut data = self.buf[start..end].to_vec();
        loop {
            self.fill_buf()?;
            let mut end = 0;
            scan_lines(&self.buf[..self.buf_data_len], &mut end, &mut line_breaks);
            data.extend_from_slice(&self.buf[..end]);
            if line_breaks == 4 || self.buffer_finished() {
                self.buf_used_len = end;
                if self.buf_used_len == self.buf_data_len && !self.reached_eof {
                    self.fill_buf()?;
                }
                return self.finish_record(data, line_breaks);
            }
        }
    }

    fn finish_record(
        &mut self,
        data: Vec<u8>,
        line_breaks: u32,
    ) -> Result<Option<SimpleRead>, DemuxError> {
        let index = self.counter;
        self.counter += 1;
        if line_breaks < 3 {
            warn!(
                "dropping partial record {} at the end of {}",
                index, self.path
            );
            return Ok(None);
        }
        match SimpleRead::from_raw(data) {
            Ok(read) => Ok(Some(read)),
            Err(e) => Err(DemuxError::MalformedRecord {
                path: self.path.clone(),
                record: index,
                reason: e.to_string(),
            }),
        }
    }
}

/// Advance `end` until four line breaks have been counted or the window is
/// exhausted.
fn scan_lines(buf: &[u8], end: &mut usize, line_breaks: &mut u32) {
    while *end < buf.len() {
        if buf[*end] == b'\n' {
            *end += 1;
            *line_breaks += 1;
            if *line_breaks == 4 {
                return;
            }
        } else {
            *end += 1;
        }
    }
}

/// Average `(seq_len, data_len)` over up to the first 100 000 records of an
/// input. Used only to size the paired-end skew limit.
pub fn estimate_record_len(path: &str) -> Result<(usize, usize), DemuxError> {
    let mut reader = FastqReader::new(path)?;
    let mut records = 0usize;
    let mut seq_total = 0usize;
    let mut data_total = 0usize;
    while records < 100_000 {
        match reader.read()? {
            Some(r) => {
                seq_total += r.seq_len();
                data_total += r.data_len();
                records += 1;
            }
            None => break,
        }
    }
    if records == 0 {
        return Ok((0, 0));
    }
    Ok((seq_total / records, data_total / records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use indoc::indoc;
    use std::io::Write;

    fn write_file(name: &str, bytes: &[u8]) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    fn drain(path: &str) -> Vec<SimpleRead> {
        let mut reader = FastqReader::new(path).unwrap();
        let mut out = Vec::new();
        while let Some(r) = reader.read().unwrap() {
            out.push(r);
        }
        out
    }

    const TWO_RECORDS: &str = indoc! {"
        @r1
        ACGTACGT
        +
        FFFFFFFF
        @r2
        TTTTACGT
        +
        ,,,,,,,,
    "};

    #[test]
    fn reads_all_records_from_plain_text() {
        let (_dir, path) = write_file("two.fastq", TWO_RECORDS.as_bytes());
        let reads = drain(&path);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].seq(), b"ACGTACGT");
        assert_eq!(reads[1].qual(), b",,,,,,,,");
    }

    #[test]
    fn record_bytes_are_preserved_exactly() {
        let (_dir, path) = write_file("two.fastq", TWO_RECORDS.as_bytes());
        let reads = drain(&path);
        let rejoined: Vec<u8> = reads.iter().flat_map(|r| r.data().to_vec()).collect();
        assert_eq!(rejoined, TWO_RECORDS.as_bytes());
    }

    #[test]
    fn empty_input_yields_nothing() {
        let (_dir, path) = write_file("empty.fastq", b"");
        assert!(drain(&path).is_empty());
    }

    #[test]
    fn final_record_without_terminal_newline_is_complete() {
        let (_dir, path) = write_file("tail.fastq", b"@r1\nACGT\n+\nFFFF");
        let mut reader = FastqReader::new(&path).unwrap();
        let r = reader.read().unwrap().unwrap();
        assert_eq!(r.qual(), b"FFFF");
        assert!(reader.read().unwrap().is_none());
        assert!(reader.has_no_terminal_newline());
    }

    #[test]
    fn partial_tail_is_dropped() {
        let (_dir, path) = write_file("partial.fastq", b"@r1\nACGT\n+\nFFFF\n@r2\nACGT\n");
        let mut reader = FastqReader::new(&path).unwrap();
        assert!(reader.read().unwrap().is_some());
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn non_at_record_start_is_fatal() {
        let (_dir, path) = write_file("bad.fastq", b"@r1\nACGT\n+\nFFFF\nr2\nACGT\n+\nFFFF\n");
        let mut reader = FastqReader::new(&path).unwrap();
        assert!(reader.read().unwrap().is_some());
        let err = reader.read().unwrap_err();
        assert!(matches!(err, DemuxError::MalformedRecord { record: 1, .. }));
    }

    #[test]
    fn gzip_input_roundtrips() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(TWO_RECORDS.as_bytes()).unwrap();
        let (_dir, path) = write_file("two.fastq.gz", &enc.finish().unwrap());

        let mut reader = FastqReader::new(&path).unwrap();
        assert!(reader.is_zipped());
        drop(reader);
        let reads = drain(&path);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].seq(), b"ACGTACGT");
    }

    #[test]
    fn concatenated_gzip_members_decode_as_one_stream() {
        let mut bytes = Vec::new();
        for chunk in [
            "@r1\nACGT\n+\nFFFF\n",
            "@r2\nTTTT\n+\nFFFF\n@r3\nCCCC\n+\nFFFF\n",
        ] {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(chunk.as_bytes()).unwrap();
            bytes.extend_from_slice(&enc.finish().unwrap());
        }
        let (_dir, path) = write_file("multi.fastq.gz", &bytes);
        let reads = drain(&path);
        assert_eq!(reads.len(), 3);
        assert_eq!(reads[2].seq(), b"CCCC");
    }

    #[test]
    fn corrupt_gzip_is_reported() {
        let (_dir, path) = write_file("broken.fastq.gz", b"\x1f\x8b\x08\x00not really gzip");
        let mut failed = false;
        match FastqReader::new(&path) {
            Err(DemuxError::CorruptGzip { .. }) => failed = true,
            Err(other) => panic!("unexpected error: {other}"),
            Ok(mut reader) => loop {
                match reader.read() {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(DemuxError::CorruptGzip { .. }) => {
                        failed = true;
                        break;
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            },
        }
        assert!(failed);
    }

    #[test]
    fn records_spanning_the_window_boundary_stay_intact() {
        // a sequence long enough that each record crosses the 8 MiB window
        let long_seq = "A".repeat(6 << 20);
        let qual = "F".repeat(long_seq.len());
        let mut input = Vec::new();
        for i in 0..2 {
            input.extend_from_slice(format!("@r{i}\n{long_seq}\n+\n{qual}\n").as_bytes());
        }
        let (_dir, path) = write_file("long.fastq", &input);
        let reads = drain(&path);
        assert_eq!(reads.len(), 2);
        for r in &reads {
            assert_eq!(r.seq_len(), long_seq.len());
            assert_eq!(r.qual_len(), qual.len());
        }
    }

    #[test]
    fn estimate_record_len_averages_the_input() {
        let (_dir, path) = write_file("two.fastq", TWO_RECORDS.as_bytes());
        let (seq_len, data_len) = estimate_record_len(&path).unwrap();
        assert_eq!(seq_len, 8);
        assert_eq!(data_len, 24);
        let (_dir2, empty) = write_file("empty.fastq", b"");
        assert_eq!(estimate_record_len(&empty).unwrap(), (0, 0));
    }
}

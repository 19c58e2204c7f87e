use crate::error::DemuxError;
use crate::options::{BarcodePlace, Options};
use crate::record::SimpleRead;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Write as IoWrite;
use std::path::PathBuf;

/// Buffered writer for one output file.
///
/// Records accumulate in an owned buffer; each flush goes to the file as one
/// write, and on the gzip path as one independent gzip member, so the output
/// is a legal multi-member gzip file. When the barcode lives inside the read
/// sequence, the writer splices it out of both the sequence and the quality
/// line; for index-based barcodes the record is written verbatim.
pub struct Writer {
    path: PathBuf,
    file: File,
    buf: Vec<u8>,
    buf_size: usize,
    compression: Compression,
    zipped: bool,
    excise: bool,
    barcode_start: usize,
    barcode_length: usize,
    finished: bool,
}

impl Writer {
    pub fn create(
        opts: &Options,
        path: PathBuf,
        is_read2: bool,
        is_undetermined: bool,
    ) -> Result<Self, DemuxError> {
        let file = File::create(&path).map_err(|e| DemuxError::OutputIo {
            path: path.display().to_string(),
            source: e,
        })?;
        let zipped = path.extension().is_some_and(|e| e == "gz");

        // the barcode is cut out only from the read that carries it, and
        // never from the undetermined sink
        let excise = !is_undetermined
            && ((opts.barcode_place == BarcodePlace::Read1 && !is_read2)
                || (opts.barcode_place == BarcodePlace::Read2 && is_read2));

        Ok(Writer {
            path,
            file,
            buf: Vec::with_capacity(opts.writer_buffer_size),
            buf_size: opts.writer_buffer_size,
            compression: Compression::new(opts.compression.min(9)),
            zipped,
            excise,
            barcode_start: opts.barcode_start,
            barcode_length: opts.barcode_length,
            finished: false,
        })
    }

    pub fn is_zipped(&self) -> bool {
        self.zipped
    }

    /// Append one record to the output.
    pub fn write_read(&mut self, read: &SimpleRead) -> Result<(), DemuxError> {
        if self.excise {
            let cut = (self.barcode_length as i64)
                .min(read.seq_len() as i64 - self.barcode_start as i64);
            if cut > 0 {
                let cut = cut as usize;
                let data = read.data();
                let seq_cut = read.seq_start() + self.barcode_start;
                let qual_cut = read.qual_start() + self.barcode_start;
                self.append(&data[..seq_cut])?;
                self.append(&data[seq_cut + cut..qual_cut])?;
                if qual_cut + cut < data.len() {
                    self.append(&data[qual_cut + cut..])?;
                }
                return Ok(());
            }
        }
        self.append(read.data())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), DemuxError> {
        if self.buf.len() + bytes.len() > self.buf_size {
            self.flush()?;
        }
        if bytes.len() > self.buf_size {
            // too large to ever buffer; goes straight out
            self.write_chunk(bytes)
        } else {
            self.buf.extend_from_slice(bytes);
            Ok(())
        }
    }

    /// Push the buffered bytes to the file, as one gzip member when
    /// compressing.
    pub fn flush(&mut self) -> Result<(), DemuxError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.buf);
        let result = self.write_chunk(&chunk);
        self.buf = chunk;
        self.buf.clear();
        result
    }

    fn write_chunk(&mut self, bytes: &[u8]) -> Result<(), DemuxError> {
        let io_result = if self.zipped {
            let mut encoder = GzEncoder::new(&mut self.file, self.compression);
            encoder
                .write_all(bytes)
                .and_then(|()| encoder.finish().map(|_| ()))
        } else {
            self.file.write_all(bytes)
        };
        io_result.map_err(|e| DemuxError::OutputIo {
            path: self.path.display().to_string(),
            source: e,
        })
    }

    /// Final flush. Must be called once writing is done; `Drop` only makes a
    /// best-effort attempt for abandoned writers.
    pub fn finish(&mut self) -> Result<(), DemuxError> {
        self.flush()?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.flush();
        }
    }
}

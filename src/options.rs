use crate::error::DemuxError;
use crate::samplesheet;
use anyhow::{Context, Result};
use clap::ValueEnum;
use log::debug;
use std::path::PathBuf;

/// Where the sample barcode is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BarcodePlace {
    /// within the read1 sequence, at a fixed offset
    Read1,
    /// within the read2 sequence, at a fixed offset
    Read2,
    /// the Illumina index1 token of the name line
    Index1,
    /// the Illumina index2 token of the name line
    Index2,
    /// both Illumina index tokens, concatenated
    BothIndex,
}

/// One sample from the sheet. The order of samples assigns the stable
/// sample ids used throughout the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sample {
    pub file: String,
    pub index1: String,
    pub index2: String,
}

pub const MAX_BARCODE_LEN: usize = 30;

const DEFAULT_WRITER_BUFFER: usize = 1 << 20;
const DEFAULT_READ_BUFFER_LIMIT: i64 = 1 << 33;
const DEFAULT_PE_GAP_LIMIT: u64 = 1 << 23;

/// The validated run configuration. Everything below the CLI takes this and
/// nothing else.
#[derive(Debug)]
pub struct Options {
    pub in1: String,
    pub in2: String,
    pub samplesheet: String,
    pub out_folder: PathBuf,
    pub undecoded_name: String,
    pub discard_undecoded: bool,
    /// 0 disables gzip output; 1..=12 accepted, clamped to the codec's
    /// maximum on write.
    pub compression: u32,
    pub mismatch: u32,
    pub barcode_place: BarcodePlace,
    /// zero-based within the read (read1/read2 modes only)
    pub barcode_start: usize,
    pub barcode_length: usize,
    pub thread_num: usize,
    pub paired_end: bool,
    pub index_reverse_complement: bool,
    pub samples: Vec<Sample>,
    pub writer_buffer_size: usize,
    pub memory_limit_bytes: u64,
    pub read_buffer_limit_bytes: i64,
    pub pe_gap_limit: u64,
    pub report: Option<PathBuf>,
}

impl Options {
    pub fn new() -> Self {
        Options {
            in1: String::new(),
            in2: String::new(),
            samplesheet: String::new(),
            out_folder: PathBuf::from("."),
            undecoded_name: "undecoded".to_string(),
            discard_undecoded: false,
            compression: 6,
            mismatch: 0,
            barcode_place: BarcodePlace::Read1,
            barcode_start: 0,
            barcode_length: 0,
            thread_num: 0,
            paired_end: false,
            index_reverse_complement: false,
            samples: Vec::new(),
            writer_buffer_size: DEFAULT_WRITER_BUFFER,
            memory_limit_bytes: 0,
            read_buffer_limit_bytes: DEFAULT_READ_BUFFER_LIMIT,
            pe_gap_limit: DEFAULT_PE_GAP_LIMIT,
            report: None,
        }
    }

    /// `in1` values that mean "read standard input".
    pub fn is_stdin_input(path: &str) -> bool {
        path == "-" || path == "/dev/stdin"
    }

    /// Check the configuration, create the output folder, parse the sample
    /// sheet and derive the buffer sizes. Called once, before any thread is
    /// spawned.
    pub fn validate(&mut self) -> Result<()> {
        if self.in1.is_empty() {
            if !self.in2.is_empty() {
                return Err(invalid(
                    "read2 input is specified by --in2, but read1 input is not specified by --in1",
                ));
            }
            return Err(invalid("read1 input should be specified by --in1"));
        }
        if !Self::is_stdin_input(&self.in1) {
            check_input_file(&self.in1)?;
        }

        if !self.in2.is_empty() {
            check_input_file(&self.in2)?;
            self.paired_end = true;
        }

        if !self.out_folder.exists() {
            std::fs::create_dir_all(&self.out_folder).with_context(|| {
                format!("cannot create output folder {}", self.out_folder.display())
            })?;
        }
        if !self.out_folder.is_dir() {
            return Err(invalid(format!(
                "{} is not a directory",
                self.out_folder.display()
            )));
        }

        self.samples = samplesheet::parse(&self.samplesheet, self.index_reverse_complement)?;
        if self.samples.is_empty() {
            return Err(invalid(
                "no sample found, did you provide a valid sample sheet by --index?",
            ));
        }

        if self.thread_num > 0 {
            if self.paired_end && self.thread_num < 5 {
                return Err(invalid("at least 5 threads must be set for PE mode"));
            }
            if self.thread_num < 4 {
                return Err(invalid("at least 4 threads must be set"));
            }
        } else {
            // auto threading: one thread per core, but never fewer than 5
            self.thread_num = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(5);
        }

        if self.mismatch > 2 {
            return Err(invalid("allowed mismatch should be 0 ~ 2"));
        }
        if self.compression > 12 {
            return Err(invalid("compression setting should be 0 ~ 12"));
        }

        if matches!(self.barcode_place, BarcodePlace::Read1 | BarcodePlace::Read2) {
            if self.barcode_length == 0 {
                return Err(invalid(
                    "if barcode_place is read1 or read2, the barcode length should be specified by --barcode-length",
                ));
            }
            if self.barcode_length > MAX_BARCODE_LEN {
                return Err(invalid("barcode length should be <= 30bp"));
            }
        }
        if self.barcode_place == BarcodePlace::Read2 && self.in2.is_empty() {
            return Err(invalid(
                "if barcode_place is read2, the read2 input file should be specified by --in2",
            ));
        }

        // PE reading is throttled by record-count skew; estimate how many
        // bytes one record occupies so the skew limit tracks the memory cap
        let avg_data_len = if self.paired_end {
            let (_, len1) = crate::reader::estimate_record_len(&self.in1)?;
            let (_, len2) = crate::reader::estimate_record_len(&self.in2)?;
            if len2 > 0 {
                (len1 + len2) / 2
            } else {
                len1
            }
        } else {
            0
        };
        self.adjust_writer_buffer_size(avg_data_len);

        Ok(())
    }

    /// Derive the writer buffer size, the read buffer limit and the PE gap
    /// limit from the memory cap and the estimated record size.
    fn adjust_writer_buffer_size(&mut self, avg_data_len: usize) {
        if self.memory_limit_bytes > 0 {
            // a quarter of the cap is shared between the write buffers
            let pool = self.memory_limit_bytes / 4;
            let mut buf = pool / (self.samples.len() as u64 + 1);
            if self.paired_end {
                buf /= 2;
            }
            buf = (buf / 128) * 128;
            self.writer_buffer_size = buf.clamp(8192, 1 << 22) as usize;

            // half of the cap may sit in the input queues
            let limit = (self.memory_limit_bytes / 2).clamp(1 << 30, 1 << 36);
            self.read_buffer_limit_bytes = limit as i64;
        }

        if avg_data_len > 0 {
            self.pe_gap_limit = (self.read_buffer_limit_bytes as u64 / 8) / avg_data_len as u64;
        }

        debug!("read buffer limit: {} bytes", self.read_buffer_limit_bytes);
        debug!("pe read gap limit: {} records", self.pe_gap_limit);
        debug!("writer buffer size: {} bytes", self.writer_buffer_size);
    }
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    DemuxError::ConfigInvalid(msg.into()).into()
}

fn check_input_file(path: &str) -> Result<()> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("cannot access input file {path}"))?;
    if meta.is_dir() {
        return Err(invalid(format!("{path} is a directory, not a file")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sheet(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("samples.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "A,ACGT").unwrap();
        writeln!(f, "B,TTGA").unwrap();
        path.to_string_lossy().into_owned()
    }

    fn fastq(dir: &tempfile::TempDir, name: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, "@r1\nACGTAAAA\n+\nFFFFFFFF\n").unwrap();
        path.to_string_lossy().into_owned()
    }

    fn base_options(dir: &tempfile::TempDir) -> Options {
        let mut opts = Options::new();
        opts.in1 = fastq(dir, "in1.fastq");
        opts.samplesheet = sheet(dir);
        opts.out_folder = dir.path().join("out");
        opts.barcode_place = BarcodePlace::Read1;
        opts.barcode_start = 0;
        opts.barcode_length = 4;
        opts
    }

    #[test]
    fn validate_accepts_a_minimal_se_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = base_options(&dir);
        opts.validate().unwrap();
        assert_eq!(opts.samples.len(), 2);
        assert!(!opts.paired_end);
        assert!(opts.thread_num >= 5);
        assert!(opts.out_folder.is_dir());
    }

    #[test]
    fn validate_rejects_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = base_options(&dir);
        opts.in1 = String::new();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn validate_rejects_low_thread_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = base_options(&dir);
        opts.thread_num = 3;
        assert!(opts.validate().is_err());

        let mut opts = base_options(&dir);
        opts.in2 = fastq(&dir, "in2.fastq");
        opts.thread_num = 4;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn validate_rejects_read2_barcode_without_read2_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = base_options(&dir);
        opts.barcode_place = BarcodePlace::Read2;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn validate_rejects_overlong_barcode() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = base_options(&dir);
        opts.barcode_length = 31;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn memory_cap_shrinks_the_write_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = base_options(&dir);
        opts.memory_limit_bytes = 1 << 30; // 1 GB
        opts.validate().unwrap();
        // pool = 256 MiB over 3 outputs, clamped to the 4 MiB ceiling
        assert_eq!(opts.writer_buffer_size, 1 << 22);
        assert_eq!(opts.read_buffer_limit_bytes, 1 << 30);
        assert_eq!(opts.writer_buffer_size % 128, 0);
    }
}

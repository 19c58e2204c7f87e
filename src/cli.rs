use crate::error::DemuxError;
use crate::options::{BarcodePlace, Options, MAX_BARCODE_LEN};
use anyhow::Result;
use clap::builder::styling::AnsiColor;
use clap::builder::Styles;
use clap::Parser;
use std::path::PathBuf;

const fn extra_build_info() -> &'static str {
    match option_env!("CARGO_BUILD_DESC") {
        Some(desc) => desc,
        None => env!("CARGO_PKG_VERSION"),
    }
}
pub const VERSION: &str = extra_build_info();

const AFTER_STRING: &str = "
   ──────────────────────────────────
   multi-threaded FASTQ demultiplexing by sample barcode";

// colouring of the help
const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Yellow.on_default().bold())
    .usage(AnsiColor::BrightMagenta.on_default().bold())
    .literal(AnsiColor::BrightMagenta.on_default())
    .placeholder(AnsiColor::White.on_default());

#[derive(Parser)]
#[command(
    version = VERSION,
    about = format!("fqdemux {}{}", VERSION, AFTER_STRING),
    arg_required_else_help = true,
    styles = STYLES
)]
pub struct Cli {
    /// input file name for read1; use - for stdin, .gz for gzip input
    #[arg(short = '1', long)]
    pub in1: String,

    /// input file name for read2; providing it enables paired-end mode
    #[arg(short = '2', long, default_value = "")]
    pub in2: String,

    /// where the barcode lives: within the read sequence (read1/read2) or
    /// in the Illumina name-line indexes (index1/index2/both-index)
    #[arg(short = 'b', long, value_enum)]
    pub barcode_place: BarcodePlace,

    /// 1-based barcode start within the read (read1/read2 places only)
    #[arg(short = 's', long, default_value_t = 0)]
    pub barcode_start: usize,

    /// barcode length in bp, at most 30 (read1/read2 places only)
    #[arg(short = 'l', long, default_value_t = 0)]
    pub barcode_length: usize,

    /// sample sheet: CSV/TSV with filename,index1[,index2] columns, or a
    /// FASTA file of barcodes named by sample
    #[arg(short = 'i', long)]
    pub index: String,

    /// the sheet's barcodes are reverse complement; undo that
    #[arg(short = 'r', long, action)]
    pub reverse_complement: bool,

    /// output folder, created if absent
    #[arg(short = 'o', long, default_value = ".")]
    pub out_folder: PathBuf,

    /// file name stem for undetermined reads, or "discard" to drop them
    #[arg(short = 'u', long, default_value = "undecoded")]
    pub undecoded: String,

    /// gzip level for output (0 ~ 12); 0 disables compression, values above
    /// the codec maximum of 9 are clamped
    #[arg(short = 'z', long, default_value_t = 6)]
    pub compression: u32,

    /// allowed barcode mismatches (0 ~ 2)
    #[arg(short = 'a', long, default_value_t = 0)]
    pub allowed_mismatch: u32,

    /// number of threads, at least 4 for SE and 5 for PE; 0 means one
    /// thread per core
    #[arg(short = 'n', long, default_value_t = 0)]
    pub thread: usize,

    /// memory limit in GB (1 ~ 10000); 0 means unlimited
    #[arg(short = 'm', long, default_value_t = 0)]
    pub memory: u64,

    /// write a JSON run report to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// print debug information
    #[arg(long, action)]
    pub debug: bool,
}

impl Cli {
    /// Turn the parsed arguments into a validated [`Options`].
    pub fn into_options(self) -> Result<Options> {
        let mut opts = Options::new();
        opts.in1 = self.in1;
        opts.in2 = self.in2;
        opts.samplesheet = self.index;
        opts.out_folder = self.out_folder;
        opts.index_reverse_complement = self.reverse_complement;
        opts.compression = self.compression;
        opts.mismatch = self.allowed_mismatch;
        opts.thread_num = self.thread;
        opts.report = self.report;

        if self.undecoded == "discard" {
            opts.discard_undecoded = true;
        } else {
            opts.undecoded_name = self.undecoded;
        }

        if self.memory > 0 {
            if self.memory > 10000 {
                return Err(DemuxError::ConfigInvalid(format!(
                    "memory limit cannot be larger than 10000GB, you specified {}GB",
                    self.memory
                ))
                .into());
            }
            opts.memory_limit_bytes = self.memory * 1024 * 1024 * 1024;
        }

        opts.barcode_place = self.barcode_place;
        if matches!(self.barcode_place, BarcodePlace::Read1 | BarcodePlace::Read2) {
            if self.barcode_start == 0 {
                return Err(DemuxError::ConfigInvalid(
                    "if barcode_place is read1 or read2, the 1-based barcode starting position \
                     should be specified by --barcode-start"
                        .to_string(),
                )
                .into());
            }
            if self.barcode_length == 0 || self.barcode_length > MAX_BARCODE_LEN {
                return Err(DemuxError::ConfigInvalid(
                    "if barcode_place is read1 or read2, the barcode length should be specified \
                     by --barcode-length and be at most 30bp"
                        .to_string(),
                )
                .into());
            }
            // 1-based on the command line, zero-based inside
            opts.barcode_start = self.barcode_start - 1;
            opts.barcode_length = self.barcode_length;
        }

        opts.validate()?;
        Ok(opts)
    }
}

use crate::options::Options;
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Routing tallies collected by the demuxer stage. In SE mode the unit is a
/// record; in PE mode it is a read pair.
pub struct Tally {
    pub per_sample: Vec<u64>,
    pub undecoded: u64,
    pub discarded: u64,
    pub total: u64,
}

impl Tally {
    pub fn new(samples: usize) -> Self {
        Tally {
            per_sample: vec![0; samples],
            undecoded: 0,
            discarded: 0,
            total: 0,
        }
    }

    /// Every record is accounted for exactly once: routed to a sample,
    /// routed to the undecoded sink, or discarded.
    pub fn routed(&self) -> u64 {
        self.per_sample.iter().sum::<u64>() + self.undecoded + self.discarded
    }
}

#[derive(Serialize)]
struct SampleReport {
    name: String,
    barcode: String,
    reads: u64,
}

/// The end-of-run summary, logged and optionally written as JSON.
#[derive(Serialize)]
pub struct RunReport {
    version: String,
    read1: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    read2: Option<String>,
    samples: Vec<SampleReport>,
    undecoded_reads: u64,
    discarded_reads: u64,
    total_reads: u64,
    elapsed_secs: f64,
}

impl RunReport {
    pub fn new(opts: &Options, tally: &Tally, elapsed: Duration) -> Self {
        let samples = opts
            .samples
            .iter()
            .zip(&tally.per_sample)
            .map(|(s, &reads)| SampleReport {
                name: s.file.clone(),
                barcode: if s.index2.is_empty() {
                    s.index1.clone()
                } else {
                    format!("{}+{}", s.index1, s.index2)
                },
                reads,
            })
            .collect();

        RunReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            read1: opts.in1.clone(),
            read2: if opts.in2.is_empty() {
                None
            } else {
                Some(opts.in2.clone())
            },
            samples,
            undecoded_reads: tally.undecoded,
            discarded_reads: tally.discarded,
            total_reads: tally.total,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    pub fn log(&self, paired: bool) {
        let unit = if paired { "read pairs" } else { "reads" };
        info!("{} {} demultiplexed in {:.2}s", self.total_reads, unit, self.elapsed_secs);
        for s in &self.samples {
            info!("  {} ({}): {} {}", s.name, s.barcode, s.reads, unit);
        }
        if self.discarded_reads > 0 {
            info!("  discarded: {} {}", self.discarded_reads, unit);
        } else {
            info!("  undecoded: {} {}", self.undecoded_reads, unit);
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("cannot write run report to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Sample;

    #[test]
    fn tally_conserves_counts() {
        let mut tally = Tally::new(2);
        tally.per_sample[0] = 5;
        tally.per_sample[1] = 3;
        tally.undecoded = 2;
        tally.discarded = 1;
        tally.total = 11;
        assert_eq!(tally.routed(), tally.total);
    }

    #[test]
    fn report_serializes_sample_counts() {
        let mut opts = Options::new();
        opts.in1 = "r1.fastq".to_string();
        opts.samples = vec![
            Sample {
                file: "A".into(),
                index1: "ACGT".into(),
                index2: "".into(),
            },
            Sample {
                file: "B".into(),
                index1: "TTGA".into(),
                index2: "CCAA".into(),
            },
        ];
        let mut tally = Tally::new(2);
        tally.per_sample[0] = 7;
        tally.total = 7;

        let report = RunReport::new(&opts, &tally, Duration::from_millis(1500));
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"name\":\"A\""));
        assert!(json.contains("\"barcode\":\"TTGA+CCAA\""));
        assert!(json.contains("\"reads\":7"));
        assert!(json.contains("\"total_reads\":7"));
        // SE runs have no read2 field at all
        assert!(!json.contains("read2"));
    }
}

use crate::error::{fatal, DemuxError};
use crate::options::{BarcodePlace, Options, Sample, MAX_BARCODE_LEN};
use crate::record::SimpleRead;
use anyhow::Result;
use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const SIEVE_LEN: usize = 1 << 26;
/// Odd multiplier, chosen to spread 2-bit-packed keys across the sieve.
const SIEVE_MULTIPLIER: u64 = 0x6622_5D4B;
const SLOT_EMPTY: i32 = -1;
const SLOT_COLLISION: i32 = -2;

const BASES: [u8; 4] = [b'A', b'T', b'C', b'G'];

/// Pack a nucleotide string of up to 30 bases into a signed 2-bit key
/// (`A=0, T=1, C=2, G=3`). `None` for anything that cannot form a valid
/// key: a non-ACGT base, or a span too long to pack.
pub fn barcode_key(bases: &[u8]) -> Option<i64> {
    if bases.len() > MAX_BARCODE_LEN {
        return None;
    }
    fold_key(0, bases)
}

/// Pack the concatenation of two spans, for dual-index lookups. The spans
/// are never copied side by side; the key is folded across both.
pub fn barcode_key_two_parts(first: &[u8], second: &[u8]) -> Option<i64> {
    if first.len() + second.len() > MAX_BARCODE_LEN {
        return None;
    }
    fold_key(0, first).and_then(|k| fold_key(k, second))
}

fn fold_key(mut key: i64, bases: &[u8]) -> Option<i64> {
    for &b in bases {
        let val = match b {
            b'A' => 0,
            b'T' => 1,
            b'C' => 2,
            b'G' => 3,
            _ => return None,
        };
        key = (key << 2) | val;
    }
    Some(key)
}

fn sieve_slot(key: i64) -> usize {
    ((key as u64).wrapping_mul(SIEVE_MULTIPLIER) & (SIEVE_LEN as u64 - 1)) as usize
}

/// The barcode classifier: maps a barcode-bearing read to a sample id in
/// O(1), tolerating up to two mismatches.
///
/// Two cooperating structures, built once and immutable afterwards so
/// lookups need no synchronisation. `exact` maps every generated key (each
/// sample's barcode plus its Hamming <= mismatch neighborhood) to its sample
/// id. `sieve` is a dense probe table over a hash of the key: a slot that
/// only one sample's keys ever hashed to answers the lookup directly; a
/// contended slot falls through to `exact`.
///
/// When two samples generate the same key (overlapping mismatch
/// neighborhoods), the later sample wins. Construction warns once per
/// affected sample pair so operators can fix their sheet.
pub struct Demuxer {
    opts: Arc<Options>,
    sieve: Vec<i32>,
    exact: HashMap<i64, usize>,
}

impl Demuxer {
    pub fn new(opts: Arc<Options>) -> Result<Self> {
        let mut demuxer = Demuxer {
            sieve: vec![SLOT_EMPTY; SIEVE_LEN],
            exact: HashMap::new(),
            opts,
        };
        demuxer.build()?;
        Ok(demuxer)
    }

    fn build(&mut self) -> Result<()> {
        let opts = Arc::clone(&self.opts);
        let mut warned: HashSet<(usize, usize)> = HashSet::new();

        for (id, sample) in opts.samples.iter().enumerate() {
            let barcode = dictionary_barcode(&opts, sample)?;
            let bytes = barcode.as_bytes();

            let key = barcode_key(bytes).ok_or_else(|| {
                DemuxError::ConfigInvalid(format!(
                    "barcode can only contain A/T/C/G: {barcode} (sample {})",
                    sample.file
                ))
            })?;
            self.insert(key, id, &opts, &mut warned);

            if opts.mismatch >= 1 {
                // every single-substitution mutant
                let mut mutant = bytes.to_vec();
                for p in 0..bytes.len() {
                    for base in BASES {
                        if base == bytes[p] {
                            continue;
                        }
                        mutant[p] = base;
                        let key = barcode_key(&mutant).expect("mutant of a valid barcode");
                        self.insert(key, id, &opts, &mut warned);
                    }
                    mutant[p] = bytes[p];
                }
            }

            if opts.mismatch == 2 {
                // every double-substitution mutant over distinct positions;
                // together with the single-substitution set above this is
                // the full Hamming <= 2 ball
                let mut mutant = bytes.to_vec();
                for p in 0..bytes.len() {
                    for q in 0..bytes.len() {
                        if p == q {
                            continue;
                        }
                        for bp in BASES {
                            if bp == bytes[p] {
                                continue;
                            }
                            for bq in BASES {
                                if bq == bytes[q] {
                                    continue;
                                }
                                mutant[p] = bp;
                                mutant[q] = bq;
                                let key =
                                    barcode_key(&mutant).expect("mutant of a valid barcode");
                                self.insert(key, id, &opts, &mut warned);
                            }
                        }
                        mutant[p] = bytes[p];
                        mutant[q] = bytes[q];
                    }
                }
            }
        }
        Ok(())
    }

    fn insert(
        &mut self,
        key: i64,
        sample: usize,
        opts: &Options,
        warned: &mut HashSet<(usize, usize)>,
    ) {
        if let Some(&prev) = self.exact.get(&key) {
            if prev != sample && warned.insert((prev.min(sample), prev.max(sample))) {
                warn!(
                    "samples {} and {} share a barcode within {} mismatch(es); \
                     reads on the overlap go to {}",
                    opts.samples[prev].file,
                    opts.samples[sample].file,
                    opts.mismatch,
                    opts.samples[sample].file
                );
            }
        }
        self.exact.insert(key, sample);

        let slot = sieve_slot(key);
        self.sieve[slot] = if self.sieve[slot] == SLOT_EMPTY {
            sample as i32
        } else {
            SLOT_COLLISION
        };
    }

    /// Classify one read. `None` means undecoded: no sample within the
    /// configured mismatch tolerance, a barcode span outside the sequence,
    /// or a span that contains a non-ACGT base.
    pub fn classify(&self, read: &SimpleRead) -> Option<usize> {
        let key = match self.opts.barcode_place {
            BarcodePlace::Read1 | BarcodePlace::Read2 => {
                let start = self.opts.barcode_start;
                let len = self.opts.barcode_length;
                if start + len > read.seq_len() {
                    return None;
                }
                barcode_key(&read.seq()[start..start + len])
            }
            BarcodePlace::Index1 => {
                let (s, l) = read
                    .illumina_index1_span()
                    .unwrap_or_else(|| fatal(DemuxError::IndexUnavailable("index1")));
                barcode_key(&read.data()[s..s + l])
            }
            BarcodePlace::Index2 => {
                let (s, l) = read
                    .illumina_index2_span()
                    .unwrap_or_else(|| fatal(DemuxError::IndexUnavailable("index2")));
                barcode_key(&read.data()[s..s + l])
            }
            BarcodePlace::BothIndex => {
                let ((s1, l1), (s2, l2)) = read
                    .illumina_both_index_spans()
                    .unwrap_or_else(|| fatal(DemuxError::IndexUnavailable("dual indexes")));
                barcode_key_two_parts(&read.data()[s1..s1 + l1], &read.data()[s2..s2 + l2])
            }
        }?;

        match self.sieve[sieve_slot(key)] {
            SLOT_EMPTY => None,
            SLOT_COLLISION => self.exact.get(&key).copied(),
            id => Some(id as usize),
        }
    }

    /// Classify a pair: the read carrying the barcode depends on the
    /// configured location, and the verdict routes both mates.
    pub fn classify_pair(&self, r1: &SimpleRead, r2: &SimpleRead) -> Option<usize> {
        if self.opts.barcode_place == BarcodePlace::Read2 {
            self.classify(r2)
        } else {
            self.classify(r1)
        }
    }
}

/// The dictionary barcode of one sample: `index1`, or the concatenation of
/// both indexes in dual-index mode.
fn dictionary_barcode(opts: &Options, sample: &Sample) -> Result<String> {
    if sample.index1.is_empty() {
        return Err(DemuxError::ConfigInvalid(format!(
            "sample {} has no barcode",
            sample.file
        ))
        .into());
    }
    let barcode = if opts.barcode_place == BarcodePlace::BothIndex {
        if sample.index2.is_empty() {
            return Err(DemuxError::ConfigInvalid(format!(
                "barcode_place is both_index but sample {} has no index2",
                sample.file
            ))
            .into());
        }
        format!("{}{}", sample.index1, sample.index2)
    } else {
        sample.index1.clone()
    };
    if barcode.len() > MAX_BARCODE_LEN {
        return Err(DemuxError::ConfigInvalid(format!(
            "barcode length should be <= 30bp: {barcode}"
        ))
        .into());
    }
    Ok(barcode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{BarcodePlace, Options, Sample};

    fn sample(file: &str, index1: &str) -> Sample {
        Sample {
            file: file.to_string(),
            index1: index1.to_string(),
            index2: String::new(),
        }
    }

    fn read_with_seq(seq: &str) -> SimpleRead {
        let text = format!("@r\n{seq}\n+\n{}\n", "F".repeat(seq.len()));
        SimpleRead::from_raw(text.into_bytes()).unwrap()
    }

    fn read_with_name(name: &str) -> SimpleRead {
        SimpleRead::from_raw(format!("@{name}\nACGT\n+\nFFFF\n").into_bytes()).unwrap()
    }

    fn demuxer(samples: Vec<Sample>, place: BarcodePlace, len: usize, mismatch: u32) -> Demuxer {
        let mut opts = Options::new();
        opts.samples = samples;
        opts.barcode_place = place;
        opts.barcode_start = 0;
        opts.barcode_length = len;
        opts.mismatch = mismatch;
        Demuxer::new(Arc::new(opts)).unwrap()
    }

    #[test]
    fn key_packing() {
        assert_eq!(barcode_key(b"A"), Some(0));
        assert_eq!(barcode_key(b"T"), Some(1));
        assert_eq!(barcode_key(b"AT"), Some(1));
        assert_eq!(barcode_key(b"GA"), Some(12));
        assert_eq!(barcode_key(b"ACGN"), None);
        // 30 bases is the packing ceiling
        assert!(barcode_key(&[b'G'; 30]).is_some());
        assert_eq!(barcode_key(&[b'G'; 31]), None);
    }

    #[test]
    fn two_part_key_matches_concatenation() {
        assert_eq!(
            barcode_key_two_parts(b"ACGT", b"TTGA"),
            barcode_key(b"ACGTTTGA")
        );
        assert_eq!(barcode_key_two_parts(&[b'A'; 20], &[b'C'; 11]), None);
    }

    #[test]
    fn exact_match_routes_to_the_right_sample() {
        let d = demuxer(
            vec![sample("A", "ACGT"), sample("B", "TTGA")],
            BarcodePlace::Read1,
            4,
            0,
        );
        assert_eq!(d.classify(&read_with_seq("ACGTAAAA")), Some(0));
        assert_eq!(d.classify(&read_with_seq("TTGAAAAA")), Some(1));
        assert_eq!(d.classify(&read_with_seq("CCCCAAAA")), None);
    }

    #[test]
    fn exact_mode_rejects_single_mismatch() {
        let d = demuxer(vec![sample("A", "ACGT")], BarcodePlace::Read1, 4, 0);
        assert_eq!(d.classify(&read_with_seq("ACGGAAAA")), None);
    }

    #[test]
    fn one_mismatch_neighborhood() {
        let d = demuxer(vec![sample("A", "ACGT")], BarcodePlace::Read1, 4, 1);
        assert_eq!(d.classify(&read_with_seq("ACGTAAAA")), Some(0));
        assert_eq!(d.classify(&read_with_seq("ACGGAAAA")), Some(0));
        assert_eq!(d.classify(&read_with_seq("TCGTAAAA")), Some(0));
        // two substitutions are out of reach
        assert_eq!(d.classify(&read_with_seq("TCGGAAAA")), None);
    }

    #[test]
    fn two_mismatch_neighborhood_includes_one_mismatch() {
        let d = demuxer(vec![sample("A", "ACGTACGT")], BarcodePlace::Read1, 8, 2);
        assert_eq!(d.classify(&read_with_seq("ACGTACGT")), Some(0));
        assert_eq!(d.classify(&read_with_seq("TCGTACGT")), Some(0));
        assert_eq!(d.classify(&read_with_seq("TCGTACGA")), Some(0));
        assert_eq!(d.classify(&read_with_seq("TCTTACGA")), None);
    }

    #[test]
    fn ambiguous_neighborhood_is_deterministic_last_insert_wins() {
        // ACGA is 1 mismatch from both ACGT and ACGG; sample B was inserted
        // later, so the overlap belongs to B
        let d = demuxer(
            vec![sample("A", "ACGT"), sample("B", "ACGG")],
            BarcodePlace::Read1,
            4,
            1,
        );
        assert_eq!(d.classify(&read_with_seq("ACGAAAAA")), Some(1));
        // unambiguous neighbors still resolve to their own sample
        assert_eq!(d.classify(&read_with_seq("TCGTAAAA")), Some(0));
        assert_eq!(d.classify(&read_with_seq("TCGGAAAA")), Some(1));
    }

    #[test]
    fn barcode_span_past_end_of_sequence_is_undecoded() {
        let d = demuxer(vec![sample("A", "ACGT")], BarcodePlace::Read1, 4, 0);
        assert_eq!(d.classify(&read_with_seq("ACG")), None);
    }

    #[test]
    fn non_acgt_in_span_is_undecoded() {
        let d = demuxer(vec![sample("A", "ACGT")], BarcodePlace::Read1, 4, 0);
        assert_eq!(d.classify(&read_with_seq("ACNTAAAA")), None);
    }

    #[test]
    fn offset_barcode_span() {
        let mut opts = Options::new();
        opts.samples = vec![sample("A", "CGTA")];
        opts.barcode_place = BarcodePlace::Read1;
        opts.barcode_start = 1;
        opts.barcode_length = 4;
        let d = Demuxer::new(Arc::new(opts)).unwrap();
        assert_eq!(d.classify(&read_with_seq("ACGTAAAA")), Some(0));
    }

    #[test]
    fn illumina_index1_lookup() {
        let d = demuxer(vec![sample("A", "GATCAG")], BarcodePlace::Index1, 0, 0);
        let r = read_with_name("NB:1:N:0:GATCAG+AATACG");
        assert_eq!(d.classify(&r), Some(0));
    }

    #[test]
    fn illumina_dual_index_lookup() {
        let mut s = sample("A", "ACGT");
        s.index2 = "TTGA".to_string();
        let d = demuxer(vec![s], BarcodePlace::BothIndex, 0, 0);
        let hit = read_with_name("RUN:1:1:1:1 1:N:0:ACGT+TTGA");
        assert_eq!(d.classify(&hit), Some(0));
        let miss = read_with_name("RUN:1:1:1:1 1:N:0:ACGT+TTGG");
        assert_eq!(d.classify(&miss), None);
    }

    #[test]
    fn dual_index_requires_index2_in_the_sheet() {
        let mut opts = Options::new();
        opts.samples = vec![sample("A", "ACGT")];
        opts.barcode_place = BarcodePlace::BothIndex;
        assert!(Demuxer::new(Arc::new(opts)).is_err());
    }

    #[test]
    fn thirty_base_dual_index_builds() {
        let mut s = sample("A", "ACGTACGTACGTACG");
        s.index2 = "TGCATGCATGCATGC".to_string();
        let d = demuxer(vec![s], BarcodePlace::BothIndex, 0, 0);
        let r = read_with_name("X:0:ACGTACGTACGTACG+TGCATGCATGCATGC");
        assert_eq!(d.classify(&r), Some(0));
    }

    #[test]
    fn pair_dispatch_follows_barcode_place() {
        let d1 = demuxer(vec![sample("A", "ACGT")], BarcodePlace::Read1, 4, 0);
        let r1 = read_with_seq("ACGTAAAA");
        let r2 = read_with_seq("TTTTTTTT");
        assert_eq!(d1.classify_pair(&r1, &r2), Some(0));

        let d2 = demuxer(vec![sample("A", "TTTT")], BarcodePlace::Read2, 4, 0);
        assert_eq!(d2.classify_pair(&r1, &r2), Some(0));
    }

    #[test]
    fn rejects_non_acgt_barcode_in_sheet() {
        let mut opts = Options::new();
        opts.samples = vec![sample("A", "ACGN")];
        opts.barcode_place = BarcodePlace::Read1;
        opts.barcode_length = 4;
        assert!(Demuxer::new(Arc::new(opts)).is_err());
    }
}

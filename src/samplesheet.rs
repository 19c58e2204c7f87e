use crate::options::Sample;
use crate::seq::reverse_complement;
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use log::debug;

/// Parse a sample sheet into the ordered sample list.
///
/// `.fasta`/`.fa` sheets use each record id as the output file stem and the
/// sequence as `index1`. Everything else is a delimited table,
/// `filename,index1[,index2]`, with the separator auto-detected from the
/// first `,` or `\t` in the file; `#` lines are comments and rows with fewer
/// than two columns are skipped. With `rc` set, every parsed barcode is
/// reverse-complemented.
pub fn parse(path: &str, rc: bool) -> Result<Vec<Sample>> {
    debug!("parsing sample sheet: {path}");
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("cannot read sample sheet {path}"))?;

    let samples = if path.ends_with(".fasta") || path.ends_with(".fa") {
        parse_fasta(&contents, rc)
    } else {
        parse_table(&contents, rc)?
    };

    for s in &samples {
        debug!("{}: {}{}{}", s.file, s.index1, if s.index2.is_empty() { "" } else { "+" }, s.index2);
    }
    Ok(samples)
}

fn parse_table(contents: &str, rc: bool) -> Result<Vec<Sample>> {
    // the first separator byte seen anywhere decides the format
    let delimiter = match contents.bytes().find(|b| *b == b',' || *b == b'\t') {
        Some(b) => b,
        None => return Ok(Vec::new()),
    };

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(contents.as_bytes());

    let mut samples = Vec::new();
    for row in reader.records() {
        let row = row.context("cannot parse sample sheet row")?;
        if row.len() < 2 || row[0].is_empty() {
            continue;
        }
        let mut sample = Sample {
            file: row[0].to_string(),
            index1: row[1].to_string(),
            index2: row.get(2).unwrap_or("").to_string(),
        };
        if rc {
            sample.index1 = reverse_complement(&sample.index1);
            if !sample.index2.is_empty() {
                sample.index2 = reverse_complement(&sample.index2);
            }
        }
        samples.push(sample);
    }
    Ok(samples)
}

fn parse_fasta(contents: &str, rc: bool) -> Vec<Sample> {
    let mut samples: Vec<Sample> = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(id) = line.strip_prefix('>') {
            samples.push(Sample {
                file: id.trim().to_string(),
                index1: String::new(),
                index2: String::new(),
            });
        } else if let Some(current) = samples.last_mut() {
            current.index1.push_str(line);
        }
    }
    if rc {
        for s in &mut samples {
            s.index1 = reverse_complement(&s.index1);
        }
    }
    samples
}

use crate::demux::Demuxer;
use crate::error::fatal;
use crate::options::Options;
use crate::pipeline::{writer_thread_count, MEM_CHECK_MASK};
use crate::reader::FastqReader;
use crate::record::{SimpleRead, READ_BYTES_IN_MEM};
use crate::spsc::SpscQueue;
use crate::stats::Tally;
use crate::worker::WriterThread;
use anyhow::Result;
use log::{debug, error, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Paired-end topology: two readers -> one demuxer that zips the streams by
/// arrival order -> interleaved R1/R2 output queues drained by W writer
/// threads. Queue `2s` carries sample `s`'s read1, queue `2s+1` its read2;
/// pair integrity holds as long as the two inputs are paired one-to-one,
/// which is assumed, not verified.
pub struct PairedEndPipeline {
    opts: Arc<Options>,
}

impl PairedEndPipeline {
    pub fn new(opts: Arc<Options>) -> Self {
        PairedEndPipeline { opts }
    }

    pub fn run(&self) -> Result<Tally> {
        let opts = &self.opts;
        let demuxer = Demuxer::new(Arc::clone(opts))?;

        let sample_count = opts.samples.len();
        let output_count = sample_count * 2 + if opts.discard_undecoded { 0 } else { 2 };
        let writer_count = writer_thread_count(opts.thread_num, output_count);
        info!("raising {writer_count} writer threads");

        let output_queues: Vec<Arc<SpscQueue<SimpleRead>>> =
            (0..output_count).map(|_| Arc::new(SpscQueue::new())).collect();

        let mut writers: Vec<WriterThread> =
            (0..writer_count).map(WriterThread::new).collect();
        for (i, queue) in output_queues.iter().enumerate() {
            let target = &mut writers[i % writer_count];
            let is_read2 = i % 2 != 0;
            let suffix = if is_read2 { ".R2" } else { ".R1" };
            if i < sample_count * 2 {
                let stem = format!("{}{}", opts.samples[i / 2].file, suffix);
                target.add_task(opts, &stem, Arc::clone(queue), is_read2, false)?;
            } else {
                let stem = format!("{}{}", opts.undecoded_name, suffix);
                target.add_task(opts, &stem, Arc::clone(queue), is_read2, true)?;
            }
        }

        let r1_queue = Arc::new(SpscQueue::new());
        let r2_queue = Arc::new(SpscQueue::new());
        let r1_loaded = AtomicU64::new(0);
        let r2_loaded = AtomicU64::new(0);

        let tally = crossbeam::thread::scope(|scope| {
            {
                let opts = Arc::clone(opts);
                let queue = Arc::clone(&r1_queue);
                let loaded = &r1_loaded;
                let other = &r2_loaded;
                scope.spawn(move |_| reader_task(&opts, &opts.in1, &queue, loaded, other, "reader1"));
            }
            {
                let opts = Arc::clone(opts);
                let queue = Arc::clone(&r2_queue);
                let loaded = &r2_loaded;
                let other = &r1_loaded;
                scope.spawn(move |_| reader_task(&opts, &opts.in2, &queue, loaded, other, "reader2"));
            }
            for writer in writers {
                scope.spawn(move |_| writer.run());
            }
            let demux_handle = {
                let opts = Arc::clone(opts);
                let r1 = Arc::clone(&r1_queue);
                let r2 = Arc::clone(&r2_queue);
                let outputs = &output_queues;
                scope.spawn(move |_| demux_task(&opts, &demuxer, &r1, &r2, outputs))
            };
            demux_handle.join().expect("demuxer thread panicked")
        })
        .unwrap_or_else(|e| {
            error!("caught a panic which is unrecoverable");
            std::panic::resume_unwind(e)
        });

        Ok(tally)
    }
}

fn reader_task(
    opts: &Options,
    path: &str,
    queue: &SpscQueue<SimpleRead>,
    loaded: &AtomicU64,
    other_loaded: &AtomicU64,
    label: &str,
) {
    let mut reader = FastqReader::new(path).unwrap_or_else(|e| fatal(e));
    let mut count: u64 = 0;
    let mut mem_sleeps: u64 = 0;
    let mut skew_sleeps: u64 = 0;
    loop {
        let read = match reader.read() {
            Ok(Some(read)) => read,
            Ok(None) => break,
            Err(e) => fatal(e),
        };
        queue.produce(read);
        loaded.fetch_add(1, Ordering::Release);
        count += 1;
        if count & MEM_CHECK_MASK == MEM_CHECK_MASK {
            // too many bytes in flight across the process
            if READ_BYTES_IN_MEM.load(Ordering::Acquire) > opts.read_buffer_limit_bytes {
                mem_sleeps += 1;
                debug!("{label} sleeping, {mem_sleeps} time(s): input queues hold too many bytes");
                std::thread::sleep(Duration::from_secs(1));
            }
            // this reader has run ahead of its mate
            let mine = loaded.load(Ordering::Acquire);
            let other = other_loaded.load(Ordering::Acquire);
            if mine > other && mine - other > opts.pe_gap_limit {
                skew_sleeps += 1;
                debug!("{label} sleeping, {skew_sleeps} time(s): it loads too fast");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    queue.set_producer_finished();
    debug!("{label} thread exited after reading {count} records, {} sleeps", mem_sleeps + skew_sleeps);
}

fn demux_task(
    opts: &Options,
    demuxer: &Demuxer,
    r1_input: &SpscQueue<SimpleRead>,
    r2_input: &SpscQueue<SimpleRead>,
    outputs: &[Arc<SpscQueue<SimpleRead>>],
) -> Tally {
    let sample_count = opts.samples.len();
    let mut tally = Tally::new(sample_count);
    let mut idle_sleeps: u64 = 0;
    loop {
        while r1_input.can_be_consumed() && r2_input.can_be_consumed() {
            let (r1, r2) = match (r1_input.consume(), r2_input.consume()) {
                (Some(r1), Some(r2)) => (r1, r2),
                // sole consumer of both queues; cannot happen
                _ => break,
            };
            tally.total += 1;
            match demuxer.classify_pair(&r1, &r2) {
                Some(sample) => {
                    tally.per_sample[sample] += 1;
                    outputs[sample * 2].produce(r1);
                    outputs[sample * 2 + 1].produce(r2);
                }
                None if opts.discard_undecoded => {
                    tally.discarded += 1;
                    // both mates are destroyed together
                }
                None => {
                    tally.undecoded += 1;
                    outputs[sample_count * 2].produce(r1);
                    outputs[sample_count * 2 + 1].produce(r2);
                }
            }
        }
        if r1_input.is_producer_finished() && !r1_input.can_be_consumed() {
            break;
        }
        if r2_input.is_producer_finished() && !r2_input.can_be_consumed() {
            break;
        }
        std::thread::sleep(Duration::from_micros(1));
        idle_sleeps += 1;
    }
    r1_input.set_consumer_finished();
    r2_input.set_consumer_finished();
    for queue in outputs {
        queue.set_producer_finished();
    }
    debug!("demuxer thread exited after {idle_sleeps} idle sleeps");
    tally
}

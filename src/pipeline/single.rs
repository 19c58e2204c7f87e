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
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Single-end topology: one reader -> one demuxer -> N output queues drained
/// by W writer threads. Output `i` is owned by writer thread `i % W`.
pub struct SingleEndPipeline {
    opts: Arc<Options>,
}

impl SingleEndPipeline {
    pub fn new(opts: Arc<Options>) -> Self {
        SingleEndPipeline { opts }
    }

    pub fn run(&self) -> Result<Tally> {
        let opts = &self.opts;
        let demuxer = Demuxer::new(Arc::clone(opts))?;

        let sample_count = opts.samples.len();
        let output_count = sample_count + usize::from(!opts.discard_undecoded);
        let writer_count = writer_thread_count(opts.thread_num, output_count);
        info!("raising {writer_count} writer threads");

        let output_queues: Vec<Arc<SpscQueue<SimpleRead>>> =
            (0..output_count).map(|_| Arc::new(SpscQueue::new())).collect();

        let mut writers: Vec<WriterThread> =
            (0..writer_count).map(WriterThread::new).collect();
        for (i, queue) in output_queues.iter().enumerate() {
            let target = &mut writers[i % writer_count];
            if i < sample_count {
                let stem = format!("{}.R1", opts.samples[i].file);
                target.add_task(opts, &stem, Arc::clone(queue), false, false)?;
            } else {
                let stem = format!("{}.R1", opts.undecoded_name);
                target.add_task(opts, &stem, Arc::clone(queue), false, true)?;
            }
        }

        let input_queue = Arc::new(SpscQueue::new());

        let tally = crossbeam::thread::scope(|scope| {
            {
                let opts = Arc::clone(opts);
                let input = Arc::clone(&input_queue);
                scope.spawn(move |_| reader_task(&opts, &input));
            }
            for writer in writers {
                scope.spawn(move |_| writer.run());
            }
            let demux_handle = {
                let opts = Arc::clone(opts);
                let input = Arc::clone(&input_queue);
                let outputs = &output_queues;
                scope.spawn(move |_| demux_task(&opts, &demuxer, &input, outputs))
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

fn reader_task(opts: &Options, input: &SpscQueue<SimpleRead>) {
    let mut reader = FastqReader::new(&opts.in1).unwrap_or_else(|e| fatal(e));
    let mut count: u64 = 0;
    let mut mem_sleeps: u64 = 0;
    loop {
        let read = match reader.read() {
            Ok(Some(read)) => read,
            Ok(None) => break,
            Err(e) => fatal(e),
        };
        input.produce(read);
        count += 1;
        // every 256 records, pause while too much input is in flight
        if count & MEM_CHECK_MASK == MEM_CHECK_MASK
            && READ_BYTES_IN_MEM.load(Ordering::Acquire) > opts.read_buffer_limit_bytes
        {
            mem_sleeps += 1;
            debug!("reader sleeping, {mem_sleeps} time(s): input queues hold too many bytes");
            std::thread::sleep(Duration::from_secs(1));
        }
    }
    input.set_producer_finished();
    debug!("reader thread exited after reading {count} records, {mem_sleeps} sleeps");
}

fn demux_task(
    opts: &Options,
    demuxer: &Demuxer,
    input: &SpscQueue<SimpleRead>,
    outputs: &[Arc<SpscQueue<SimpleRead>>],
) -> Tally {
    let sample_count = opts.samples.len();
    let mut tally = Tally::new(sample_count);
    let mut idle_sleeps: u64 = 0;
    loop {
        while let Some(read) = input.consume() {
            tally.total += 1;
            match demuxer.classify(&read) {
                Some(sample) => {
                    tally.per_sample[sample] += 1;
                    outputs[sample].produce(read);
                }
                None if opts.discard_undecoded => {
                    tally.discarded += 1;
                    // dropping the record releases its bytes immediately
                }
                None => {
                    tally.undecoded += 1;
                    outputs[sample_count].produce(read);
                }
            }
        }
        if input.is_producer_finished() {
            if !input.can_be_consumed() {
                break;
            }
        } else {
            std::thread::sleep(Duration::from_micros(1));
            idle_sleeps += 1;
        }
    }
    input.set_consumer_finished();
    for queue in outputs {
        queue.set_producer_finished();
    }
    debug!("demuxer thread exited after {idle_sleeps} idle sleeps");
    tally
}

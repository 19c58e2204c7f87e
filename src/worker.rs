use crate::error::{fatal, DemuxError};
use crate::options::Options;
use crate::record::SimpleRead;
use crate::spsc::SpscQueue;
use crate::writer::Writer;
use log::debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

struct WriteTask {
    queue: Arc<SpscQueue<SimpleRead>>,
    writer: Writer,
}

/// The work assigned to one writer thread: a set of (queue, writer) pairs
/// that the thread alone consumes. Each queue belongs to exactly one
/// `WriterThread`, preserving the single-consumer discipline.
pub struct WriterThread {
    id: usize,
    tasks: Vec<WriteTask>,
    input_completed: bool,
    sleep_count: u64,
}

impl WriterThread {
    pub fn new(id: usize) -> Self {
        WriterThread {
            id,
            tasks: Vec::new(),
            input_completed: false,
            sleep_count: 0,
        }
    }

    /// Attach one output: `stem` becomes `<out_folder>/<stem>.fastq[.gz]`.
    pub fn add_task(
        &mut self,
        opts: &Options,
        stem: &str,
        queue: Arc<SpscQueue<SimpleRead>>,
        is_read2: bool,
        is_undetermined: bool,
    ) -> Result<(), DemuxError> {
        let mut name = format!("{stem}.fastq");
        if opts.compression > 0 {
            name.push_str(".gz");
        }
        let path: PathBuf = opts.out_folder.join(name);
        let writer = Writer::create(opts, path, is_read2, is_undetermined)?;
        self.tasks.push(WriteTask { queue, writer });
        Ok(())
    }

    /// Drain until every queue reports its producer finished and empty, then
    /// drain once more: the completion observation is not atomic across
    /// queues, so a final pass catches records that slipped in between
    /// checks.
    pub fn run(mut self) {
        loop {
            if self.input_completed {
                self.output();
                break;
            }
            self.output();
        }
        for task in &self.tasks {
            task.queue.set_consumer_finished();
        }
        for task in &mut self.tasks {
            if let Err(e) = task.writer.finish() {
                fatal(e);
            }
        }
        debug!(
            "writer thread {} exited after {} idle sleeps",
            self.id, self.sleep_count
        );
    }

    /// One pass over all assigned queues, writing whatever is available.
    fn output(&mut self) {
        let mut has_data = false;
        let mut completed = true;
        for task in &mut self.tasks {
            while let Some(read) = task.queue.consume() {
                if let Err(e) = task.writer.write_read(&read) {
                    fatal(e);
                }
                has_data = true;
            }
            if completed && (!task.queue.is_producer_finished() || task.queue.can_be_consumed()) {
                completed = false;
            }
        }
        if !has_data {
            std::thread::sleep(Duration::from_millis(1));
            self.sleep_count += 1;
            if self.sleep_count % 1000 == 0 {
                debug!(
                    "writer thread {} has slept {} times",
                    self.id, self.sleep_count
                );
            }
        }
        self.input_completed = completed;
    }
}

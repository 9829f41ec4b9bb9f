//! Parallel block uploads.
//!
//! A fan-out sink hands each stored block to one of N worker threads. Every
//! worker owns its own clone of the inner sink. The first failing store stops
//! every worker; the error surfaces on the next store, or on flush.

use std::panic;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::{BlockLocation, BlockSink};
use crate::container::Container;
use crate::error::{Result, SuturaError};

type Job = (BlockLocation, Vec<u8>);

/// First error raised by any worker.
type Failure = Arc<Mutex<Option<SuturaError>>>;

/// Sink that stores blocks on a pool of worker threads.
pub struct FanOutSink {
    template: Box<dyn BlockSink>,
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<Result<()>>>,
    failure: Failure,
    failed: bool,
}

impl FanOutSink {
    /// Store into clones of `sink` from `workers` threads (at least one).
    #[must_use]
    pub fn new(sink: Box<dyn BlockSink>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = sync_channel::<Job>(workers);
        let receiver = Arc::new(Mutex::new(receiver));
        let failure = Failure::default();
        let handles = (0..workers)
            .map(|id| {
                let worker = sink.clone_sink();
                let receiver = Arc::clone(&receiver);
                let failure = Arc::clone(&failure);
                thread::spawn(move || run_worker(id, worker, &receiver, &failure))
            })
            .collect();
        debug!(workers, "started fan-out sink");
        Self {
            template: sink,
            sender: Some(sender),
            workers: handles,
            failure,
            failed: false,
        }
    }

    fn take_failure(&self) -> Option<SuturaError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Close the queue and wait for every worker. Returns the first error.
    fn join(&mut self) -> Result<()> {
        self.sender = None;
        let mut first = match self.take_failure() {
            Some(err) => Err(err),
            None if self.failed => Err(SuturaError::Cancelled),
            None => Ok(()),
        };
        for handle in self.workers.drain(..) {
            let result = match handle.join() {
                Ok(result) => result,
                Err(payload) => panic::resume_unwind(payload),
            };
            if let Err(err) = result {
                if first.is_ok() {
                    first = Err(err);
                } else {
                    warn!(error = %err, "additional fan-out worker failure");
                }
            }
        }
        if first.is_err() {
            self.failed = true;
        }
        first
    }
}

fn run_worker(
    id: usize,
    mut sink: Box<dyn BlockSink>,
    receiver: &Mutex<Receiver<Job>>,
    failure: &Mutex<Option<SuturaError>>,
) -> Result<()> {
    loop {
        let job = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok((location, data)) = job else {
            break;
        };
        if failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            debug!(worker = id, "fan-out worker stopping after a failure");
            return Ok(());
        }
        if let Err(err) = sink.store(location, &data) {
            warn!(worker = id, error = %err, "fan-out store failed, stopping");
            failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert(err);
            return Ok(());
        }
    }
    debug!(worker = id, "fan-out worker done");
    sink.flush()
}

impl BlockSink for FanOutSink {
    fn store(&mut self, location: BlockLocation, data: &[u8]) -> Result<()> {
        if self.failed {
            return Err(SuturaError::Cancelled);
        }
        let Some(sender) = &self.sender else {
            return Err(SuturaError::Usage("store after fan-out sink was flushed".into()));
        };
        let stopped = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if stopped || sender.send((location, data.to_vec())).is_err() {
            self.join()?;
            return Err(SuturaError::Cancelled);
        }
        Ok(())
    }

    fn container(&self) -> &Container {
        self.template.container()
    }

    fn big_block_size(&self) -> u64 {
        self.template.big_block_size()
    }

    fn clone_sink(&self) -> Box<dyn BlockSink> {
        self.template.clone_sink()
    }

    fn flush(&mut self) -> Result<()> {
        self.join()
    }
}

impl Drop for FanOutSink {
    fn drop(&mut self) {
        self.sender = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockpool::tests::{container_of, MapBlocks};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FailingSink {
        container: Container,
    }

    impl BlockSink for FailingSink {
        fn store(&mut self, _: BlockLocation, _: &[u8]) -> Result<()> {
            Err(SuturaError::Malformed("refused".into()))
        }

        fn container(&self) -> &Container {
            &self.container
        }

        fn big_block_size(&self) -> u64 {
            crate::signature::BLOCK_SIZE as u64
        }

        fn clone_sink(&self) -> Box<dyn BlockSink> {
            Box::new(Self {
                container: self.container.clone(),
            })
        }
    }

    #[test]
    fn every_block_is_stored_once() {
        let blocks = MapBlocks::new(container_of(&[1; 40]));
        let mut sink = FanOutSink::new(Box::new(blocks.clone()), 4);
        for i in 0..40 {
            sink.store(BlockLocation::new(i, 0), &[i as u8]).unwrap();
        }
        sink.flush().unwrap();

        let mut stored: Vec<_> = blocks.blocks.lock().unwrap().iter().map(|b| b.0).collect();
        stored.sort();
        let expected: Vec<_> = (0..40).map(|i| BlockLocation::new(i, 0)).collect();
        assert_eq!(stored, expected);
    }

    /// Refuses block 0 and slowly stores everything else.
    struct RefuseFirstSink {
        container: Container,
        stored: Arc<AtomicUsize>,
    }

    impl BlockSink for RefuseFirstSink {
        fn store(&mut self, location: BlockLocation, _: &[u8]) -> Result<()> {
            if location == BlockLocation::new(0, 0) {
                return Err(SuturaError::Malformed("refused block 0".into()));
            }
            thread::sleep(Duration::from_millis(2));
            self.stored.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn container(&self) -> &Container {
            &self.container
        }

        fn big_block_size(&self) -> u64 {
            crate::signature::BLOCK_SIZE as u64
        }

        fn clone_sink(&self) -> Box<dyn BlockSink> {
            Box::new(Self {
                container: self.container.clone(),
                stored: Arc::clone(&self.stored),
            })
        }
    }

    #[test]
    fn first_failure_stops_the_upload() {
        let stored = Arc::new(AtomicUsize::new(0));
        let refusing = RefuseFirstSink {
            container: container_of(&[1; 200]),
            stored: Arc::clone(&stored),
        };
        let mut sink = FanOutSink::new(Box::new(refusing), 4);

        let failed_at = (0..200).find(|&i| sink.store(BlockLocation::new(i, 0), &[1]).is_err());
        let failed_at = failed_at.expect("store never reported the failure");
        assert!(failed_at < 50, "failure noticed only at store {failed_at}");
        assert!(stored.load(Ordering::SeqCst) < 50);

        assert!(sink.flush().is_err());
        assert!(matches!(
            sink.store(BlockLocation::new(199, 0), &[1]),
            Err(SuturaError::Cancelled)
        ));
    }

    #[test]
    fn worker_error_surfaces_on_flush() {
        let failing = FailingSink {
            container: container_of(&[1]),
        };
        let mut sink = FanOutSink::new(Box::new(failing), 2);
        // the store itself may or may not see the failure yet
        let stored = sink.store(BlockLocation::new(0, 0), &[1]);
        let flushed = sink.flush();
        assert!(stored.is_err() || flushed.is_err());
    }

    #[test]
    fn store_after_flush_is_refused() {
        let blocks = MapBlocks::new(container_of(&[1]));
        let mut sink = FanOutSink::new(Box::new(blocks), 1);
        sink.flush().unwrap();
        assert!(matches!(
            sink.store(BlockLocation::new(0, 0), &[1]),
            Err(SuturaError::Usage(_))
        ));
    }
}

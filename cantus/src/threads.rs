/// Worker scheduling and the script feeder.
///
/// Each top-level evaluation runs on a cooperatively-abortable worker
/// thread. Cancellation is a shared flag checked by the statement engine
/// at line boundaries; aborted workers are removed from the registry and
/// the evaluator state stays as observed at the abort point.
use crate::statements::LineSource;
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Shared cancellation flag for one worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Worker {
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

/// Registry of running evaluation workers.
#[derive(Default)]
pub struct ThreadManager {
    workers: DashMap<usize, Worker>,
    next_id: AtomicUsize,
}

impl ThreadManager {
    pub fn new() -> Self {
        ThreadManager {
            workers: DashMap::new(),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn allocate(&self) -> (usize, CancelToken) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelToken::new();
        self.workers.insert(
            id,
            Worker {
                cancel: cancel.clone(),
                handle: None,
            },
        );
        (id, cancel)
    }

    pub fn attach(&self, id: usize, handle: JoinHandle<()>) {
        if let Some(mut w) = self.workers.get_mut(&id) {
            w.handle = Some(handle);
        }
    }

    pub fn deregister(&self, id: usize) {
        self.workers.remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    /// Abort every worker except an optional merciful one.
    pub fn stop_all(&self, spare: Option<usize>) {
        let ids: Vec<usize> = self
            .workers
            .iter()
            .map(|e| *e.key())
            .filter(|id| Some(*id) != spare)
            .collect();
        for id in ids {
            if let Some((_, worker)) = self.workers.remove(&id) {
                debug!(worker = id, "aborting");
                worker.cancel.cancel();
                drop(worker.handle);
            }
        }
    }
}

/// Single-producer/single-consumer line pipe. Producers append source
/// lines; the evaluator consumes them in order, blocking on an empty
/// queue until the feeder signals more work or end-of-stream. The queue
/// is unbounded.
pub struct ScriptFeeder {
    sender: Mutex<Option<Sender<String>>>,
    receiver: Receiver<String>,
}

impl Default for ScriptFeeder {
    fn default() -> Self {
        ScriptFeeder::new()
    }
}

impl ScriptFeeder {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        ScriptFeeder {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Append a chunk of source; each line becomes one queue entry.
    pub fn append(&self, text: &str) {
        if let Some(sender) = &*self.sender.lock() {
            for line in text.lines() {
                let _ = sender.send(line.to_string());
            }
        }
    }

    /// Signal end-of-stream; the consumer drains what remains, then sees
    /// `None`.
    pub fn end(&self) {
        self.sender.lock().take();
    }

    pub fn is_ended(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Blocking consume; `None` only after `end()` drained the queue.
    pub fn take_line(&self) -> Option<String> {
        self.receiver.recv().ok()
    }
}

/// A feeder is directly usable as a statement-engine line source.
pub struct FeederSource(pub Arc<ScriptFeeder>);

impl LineSource for FeederSource {
    fn next_line(&mut self) -> Option<String> {
        self.0.take_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn stop_all_spares_the_merciful_worker() {
        let mgr = ThreadManager::new();
        let (a, ta) = mgr.allocate();
        let (_b, tb) = mgr.allocate();
        mgr.stop_all(Some(a));
        assert!(!ta.is_cancelled());
        assert!(tb.is_cancelled());
        assert_eq!(mgr.active_count(), 1);
    }

    #[test]
    fn feeder_delivers_lines_in_order_and_blocks() {
        let feeder = Arc::new(ScriptFeeder::new());
        let consumer = Arc::clone(&feeder);
        let handle = thread::spawn(move || {
            let mut lines = Vec::new();
            while let Some(line) = consumer.take_line() {
                lines.push(line);
            }
            lines
        });
        feeder.append("a = 1\nb = 2");
        thread::sleep(Duration::from_millis(20));
        feeder.append("c = 3");
        feeder.end();
        let lines = handle.join().expect("consumer");
        assert_eq!(lines, vec!["a = 1", "b = 2", "c = 3"]);
    }
}

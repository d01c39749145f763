use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::JoinHandle;
#[cfg(test)]
use std::time::Duration;
use std::time::Instant;

use image::RgbaImage;

use crate::error::{WarpError, WarpResult};
use crate::state::{RequestId, WarpRequest, WarpResponse};

use super::warp;

pub const DEFAULT_POOL_SIZE: usize = 10;

type Outcome = WarpResult<WarpResponse>;
type PendingTable = Arc<Mutex<HashMap<RequestId, mpsc::Sender<Outcome>>>>;
type Notifier = Arc<dyn Fn() + Send + Sync>;

struct WorkerReply {
    id: RequestId,
    outcome: WarpResult<RgbaImage>,
}

struct Worker {
    jobs: mpsc::Sender<WarpRequest>,
    /// Jobs sent to this worker and not yet answered.
    queued: Arc<AtomicUsize>,
    thread: JoinHandle<()>,
}

/// Runs CPU warps on a fixed set of worker threads.
///
/// Every worker owns a FIFO queue and handles one job at a time. Submission
/// rotates a cursor like plain round-robin but skips past busy workers, so a
/// job only queues behind another when the whole pool is busy. Replies are
/// routed back to callers by request id.
pub struct WarpDispatcher {
    workers: Vec<Worker>,
    cursor: AtomicUsize,
    pending: PendingTable,
    router: Option<JoinHandle<()>>,
}

impl WarpDispatcher {
    pub fn new(size: usize) -> WarpResult<Self> {
        Self::build(size, None)
    }

    /// Like [`WarpDispatcher::new`], calling `notify` after each routed reply.
    pub fn with_notifier(
        size: usize,
        notify: impl Fn() + Send + Sync + 'static,
    ) -> WarpResult<Self> {
        Self::build(size, Some(Arc::new(notify)))
    }

    fn build(size: usize, notify: Option<Notifier>) -> WarpResult<Self> {
        let size = size.max(1);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (reply_tx, reply_rx) = mpsc::channel();

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let (jobs, job_rx) = mpsc::channel();
            let queued = Arc::new(AtomicUsize::new(0));
            let replies = reply_tx.clone();
            let counter = Arc::clone(&queued);
            let thread = std::thread::Builder::new()
                .name(format!("warp-worker-{index}"))
                .spawn(move || run_worker(index, job_rx, replies, counter))
                .map_err(|e| anyhow::anyhow!("failed to spawn warp worker {index}: {e}"))?;
            workers.push(Worker {
                jobs,
                queued,
                thread,
            });
        }
        // Workers hold the only reply senders; the router stops once they exit.
        drop(reply_tx);

        let table = Arc::clone(&pending);
        let router = std::thread::Builder::new()
            .name("warp-router".to_string())
            .spawn(move || route_replies(reply_rx, table, notify))
            .map_err(|e| anyhow::anyhow!("failed to spawn warp router: {e}"))?;

        tracing::debug!(workers = size, "warp dispatcher started");
        Ok(Self {
            workers,
            cursor: AtomicUsize::new(0),
            pending,
            router: Some(router),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Requests submitted and not yet delivered to their caller.
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Queue a warp. The request, including its source handle, moves into
    /// the worker; the returned handle resolves with the matching response.
    pub fn submit(&self, request: WarpRequest) -> WarpResult<PendingWarp> {
        let id = request.id;
        let (tx, rx) = mpsc::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&id) {
                return Err(WarpError::DuplicateRequest(id));
            }
            pending.insert(id, tx);
        }

        let index = self.pick_worker();
        let worker = &self.workers[index];
        worker.queued.fetch_add(1, Ordering::AcqRel);
        if worker.jobs.send(request).is_err() {
            worker.queued.fetch_sub(1, Ordering::AcqRel);
            lock(&self.pending).remove(&id);
            return Err(WarpError::WorkerUnavailable(index));
        }
        tracing::trace!(%id, worker = index, "warp submitted");
        Ok(PendingWarp { id, rx })
    }

    /// First idle worker at or after the cursor, else the shortest queue.
    fn pick_worker(&self) -> usize {
        let n = self.workers.len();
        let start = self.cursor.load(Ordering::Relaxed) % n;
        let mut best = start;
        let mut best_load = usize::MAX;
        for step in 0..n {
            let index = (start + step) % n;
            let load = self.workers[index].queued.load(Ordering::Acquire);
            if load < best_load {
                best = index;
                best_load = load;
                if load == 0 {
                    break;
                }
            }
        }
        self.cursor.store((best + 1) % n, Ordering::Relaxed);
        best
    }
}

impl Drop for WarpDispatcher {
    fn drop(&mut self) {
        for (index, worker) in self.workers.drain(..).enumerate() {
            drop(worker.jobs);
            if worker.thread.join().is_err() {
                tracing::warn!(worker = index, "warp worker panicked");
            }
        }
        if let Some(router) = self.router.take() {
            let _ = router.join();
        }
        tracing::debug!("warp dispatcher stopped");
    }
}

/// Caller's side of a submitted warp.
pub struct PendingWarp {
    id: RequestId,
    rx: mpsc::Receiver<Outcome>,
}

impl PendingWarp {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Blocks until the response arrives.
    pub fn wait(self) -> Outcome {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(WarpError::Disconnected(self.id)))
    }

    #[cfg(test)]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Some(Err(WarpError::Disconnected(self.id)))
            }
        }
    }

    /// Non-blocking poll; `None` while the job is still running.
    pub fn try_take(&self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(WarpError::Disconnected(self.id))),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_worker(
    index: usize,
    jobs: mpsc::Receiver<WarpRequest>,
    replies: mpsc::Sender<WorkerReply>,
    queued: Arc<AtomicUsize>,
) {
    while let Ok(request) = jobs.recv() {
        let id = request.id;
        let started = Instant::now();
        let outcome = warp::run_request(request).map(|response| response.image);
        queued.fetch_sub(1, Ordering::AcqRel);
        match &outcome {
            Ok(_) => tracing::trace!(
                %id,
                worker = index,
                elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                "warp finished"
            ),
            Err(err) => tracing::debug!(%id, worker = index, "warp failed: {err}"),
        }
        if replies.send(WorkerReply { id, outcome }).is_err() {
            break;
        }
    }
}

fn route_replies(
    replies: mpsc::Receiver<WorkerReply>,
    pending: PendingTable,
    notify: Option<Notifier>,
) {
    for WorkerReply { id, outcome } in replies {
        let waiter = lock(&pending).remove(&id);
        let Some(waiter) = waiter else {
            tracing::debug!(%id, "dropping reply with no pending request");
            continue;
        };
        let _ = waiter.send(outcome.map(|image| WarpResponse { id, image }));
        if let Some(notify) = notify.as_ref() {
            notify();
        }
    }
    // Remaining callers see a disconnect instead of waiting forever.
    lock(&pending).clear();
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::time::Duration;

    use image::{ImageBuffer, Rgba, RgbaImage};

    use crate::error::WarpError;
    use crate::geometry::{Point, Quad};
    use crate::state::{RequestId, ResultSpec, SourceImage, WarpRequest};

    use super::{WarpDispatcher, WorkerReply, route_replies};

    /// One-row strip where pixel `x` has red = `x`.
    fn strip(len: u32) -> Arc<SourceImage> {
        Arc::new(
            SourceImage::new(ImageBuffer::from_fn(len, 1, |x, _| {
                Rgba([x as u8, 0, 0, 255])
            }))
            .unwrap(),
        )
    }

    /// Collapsed quad: every output pixel samples `(x, 0)`.
    fn point_quad(x: f64) -> Quad {
        let p = Point::new(x, 0.0);
        Quad::new(p, p, p, p)
    }

    fn request(id: u64, source: &Arc<SourceImage>, size: u32) -> WarpRequest {
        WarpRequest {
            id: RequestId(id),
            quad: point_quad(id as f64),
            result: ResultSpec::new(size, size).unwrap(),
            source: Arc::clone(source),
        }
    }

    #[test]
    fn fifty_requests_on_ten_workers_resolve_to_their_callers() {
        let dispatcher = WarpDispatcher::new(10).unwrap();
        assert_eq!(dispatcher.size(), 10);
        let source = strip(64);

        // Mixed sizes so completion order differs from submission order.
        let handles: Vec<_> = (0..50_u64)
            .map(|id| {
                let size = if id % 3 == 0 { 96 } else { 4 };
                dispatcher.submit(request(id, &source, size)).unwrap()
            })
            .collect();

        let mut seen = Vec::new();
        for handle in handles {
            let expected = handle.id();
            let response = handle.wait().unwrap();
            assert_eq!(response.id, expected);
            assert_eq!(response.image.get_pixel(0, 0)[0] as u64, expected.0);
            seen.push(response.id.0);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn duplicate_pending_id_is_rejected() {
        let dispatcher = WarpDispatcher::new(1).unwrap();
        let source = strip(8);
        let (tx, _rx) = mpsc::channel();
        dispatcher.pending.lock().unwrap().insert(RequestId(3), tx);
        let err = match dispatcher.submit(request(3, &source, 4)) {
            Err(err) => err,
            Ok(_) => panic!("duplicate id should be rejected"),
        };
        assert!(matches!(err, WarpError::DuplicateRequest(RequestId(3))));
        dispatcher.pending.lock().unwrap().remove(&RequestId(3));
        assert!(dispatcher.submit(request(3, &source, 4)).unwrap().wait().is_ok());
    }

    #[test]
    fn idle_workers_are_preferred() {
        let dispatcher = WarpDispatcher::new(3).unwrap();
        let source = strip(8);
        let a = dispatcher.submit(request(0, &source, 4)).unwrap();
        a.wait().unwrap();
        // All idle: assignment keeps rotating.
        assert_eq!(dispatcher.pick_worker(), 1);
        assert_eq!(dispatcher.pick_worker(), 2);
        assert_eq!(dispatcher.pick_worker(), 0);
        // A busy worker at the cursor is skipped.
        dispatcher.workers[1].queued.fetch_add(1, Ordering::AcqRel);
        assert_eq!(dispatcher.pick_worker(), 2);
        dispatcher.workers[1].queued.fetch_sub(1, Ordering::AcqRel);
    }

    #[test]
    fn saturated_pool_queues_on_shortest_worker() {
        let dispatcher = WarpDispatcher::new(2).unwrap();
        dispatcher.workers[0].queued.fetch_add(3, Ordering::AcqRel);
        dispatcher.workers[1].queued.fetch_add(1, Ordering::AcqRel);
        assert_eq!(dispatcher.pick_worker(), 1);
        dispatcher.workers[0].queued.fetch_sub(3, Ordering::AcqRel);
        dispatcher.workers[1].queued.fetch_sub(1, Ordering::AcqRel);
    }

    #[test]
    fn invalid_job_reports_error_to_its_caller() {
        let dispatcher = WarpDispatcher::new(2).unwrap();
        let source = strip(8);
        let mut bad = request(1, &source, 4);
        bad.quad = point_quad(f64::INFINITY);
        let bad = dispatcher.submit(bad).unwrap();
        let good = dispatcher.submit(request(2, &source, 4)).unwrap();
        assert!(matches!(bad.wait(), Err(WarpError::InvalidGeometry(_))));
        assert_eq!(good.wait().unwrap().id, RequestId(2));
    }

    #[test]
    fn notifier_fires_per_reply() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let dispatcher = WarpDispatcher::with_notifier(2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let source = strip(8);
        let handles: Vec<_> = (0..4)
            .map(|id| dispatcher.submit(request(id, &source, 2)).unwrap())
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }
        drop(dispatcher);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn unmatched_replies_are_dropped() {
        let (reply_tx, reply_rx) = mpsc::channel();
        let (caller_tx, caller_rx) = mpsc::channel();
        let pending = Arc::new(Mutex::new(HashMap::from([(RequestId(5), caller_tx)])));

        reply_tx
            .send(WorkerReply {
                id: RequestId(99),
                outcome: Ok(RgbaImage::new(1, 1)),
            })
            .unwrap();
        reply_tx
            .send(WorkerReply {
                id: RequestId(5),
                outcome: Ok(RgbaImage::new(2, 2)),
            })
            .unwrap();
        drop(reply_tx);

        route_replies(reply_rx, Arc::clone(&pending), None);
        let delivered = caller_rx.recv().unwrap().unwrap();
        assert_eq!(delivered.id, RequestId(5));
        assert_eq!(delivered.image.dimensions(), (2, 2));
        assert!(caller_rx.recv().is_err());
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn try_take_and_timeout_poll_without_blocking_forever() {
        let dispatcher = WarpDispatcher::new(2).unwrap();
        let source = strip(8);

        let timed = dispatcher.submit(request(1, &source, 8)).unwrap();
        let outcome = timed
            .wait_timeout(Duration::from_secs(10))
            .expect("small warp should finish");
        assert_eq!(outcome.unwrap().id, RequestId(1));

        let polled = dispatcher.submit(request(2, &source, 8)).unwrap();
        let mut outcome = None;
        for _ in 0..1000 {
            outcome = polled.try_take();
            if outcome.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(outcome.expect("poll timed out").unwrap().id, RequestId(2));
    }

    #[test]
    fn dropping_dispatcher_disconnects_unresolved_callers() {
        let (tx, rx) = mpsc::channel();
        let pending = Arc::new(Mutex::new(HashMap::from([(RequestId(8), tx)])));
        let (reply_tx, reply_rx) = mpsc::channel::<WorkerReply>();
        drop(reply_tx);
        route_replies(reply_rx, Arc::clone(&pending), None);
        let handle = super::PendingWarp {
            id: RequestId(8),
            rx,
        };
        assert!(matches!(
            handle.wait(),
            Err(WarpError::Disconnected(RequestId(8)))
        ));
    }
}

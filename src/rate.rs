//! Global rate-limited I/O scheduler
//!
//! One [`RateController`] per process paces reads and writes for every
//! registered peer socket across all sessions. It knows nothing about the
//! protocol: each tick it computes upload and download byte budgets from
//! the configured limits and the elapsed time, then splits each budget
//! round-robin across the sockets that still have work, redistributing the
//! share of any socket that cannot use its own.
//!
//! Sockets are abstracted behind [`ThrottledIo`] so the distribution logic
//! is testable without a network stack.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Opportunistic rescheduling interval while work is pending
const RESCHEDULE_INTERVAL: Duration = Duration::from_millis(50);

/// Cap on the elapsed time credited to one tick, so an idle period does not
/// bank a burst
const MAX_TICK_ELAPSED: Duration = Duration::from_secs(1);

/// Read-ahead sizing when the download limit is unlimited
const DEFAULT_READ_AHEAD: usize = 256 * 1024;

/// A socket whose transfers the controller paces.
///
/// `transfer_*` must be non-blocking: move up to `budget` bytes and report
/// how many actually moved. Zero means the socket has nothing left (or the
/// kernel would block) and it drops out of the current tick.
pub trait ThrottledIo: Send + Sync {
    /// Bytes queued for transmission and not yet written
    fn pending_upload(&self) -> usize;

    /// Room left in the receive path (read-ahead budget)
    fn download_room(&self) -> usize;

    /// Write up to `budget` queued bytes to the network
    fn transfer_upload(&self, budget: usize) -> usize;

    /// Read up to `budget` bytes from the network
    fn transfer_download(&self, budget: usize) -> usize;

    /// Resize the receive read-ahead window
    fn set_read_ahead(&self, bytes: usize);

    /// Cap on queued-unwritten upload bytes (0 = uncapped)
    fn set_upload_cap(&self, bytes: usize);
}

/// What one tick moved, and whether another tick should be scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub uploaded: usize,
    pub downloaded: usize,
    pub work_remaining: bool,
}

/// Process-wide transfer scheduler
pub struct RateController {
    sockets: Mutex<Vec<Arc<dyn ThrottledIo>>>,
    /// Bytes/sec, 0 = unlimited
    upload_limit: AtomicU64,
    /// Bytes/sec, 0 = unlimited
    download_limit: AtomicU64,
    last_tick: Mutex<Instant>,
    work: Notify,
}

impl RateController {
    pub fn new(upload_limit: u64, download_limit: u64) -> Self {
        Self {
            sockets: Mutex::new(Vec::new()),
            upload_limit: AtomicU64::new(upload_limit),
            download_limit: AtomicU64::new(download_limit),
            last_tick: Mutex::new(Instant::now()),
            work: Notify::new(),
        }
    }

    /// Add a socket to the pool, sizing its read-ahead to roughly twice the
    /// download limit and capping its outstanding writes at twice the
    /// upload limit
    pub fn register(&self, socket: Arc<dyn ThrottledIo>) {
        self.apply_limits_to(&*socket);
        self.sockets.lock().push(socket);
        self.work.notify_one();
    }

    pub fn unregister(&self, socket: &Arc<dyn ThrottledIo>) {
        // compare data addresses, vtable pointers are not stable
        let target = Arc::as_ptr(socket) as *const ();
        self.sockets
            .lock()
            .retain(|s| Arc::as_ptr(s) as *const () != target);
    }

    /// Change the limits; resizes every registered socket's windows
    pub fn set_limits(&self, upload_limit: u64, download_limit: u64) {
        self.upload_limit.store(upload_limit, Ordering::Relaxed);
        self.download_limit.store(download_limit, Ordering::Relaxed);
        for socket in self.sockets.lock().iter() {
            self.apply_limits_to(&**socket);
        }
    }

    fn apply_limits_to(&self, socket: &dyn ThrottledIo) {
        let download = self.download_limit.load(Ordering::Relaxed);
        let upload = self.upload_limit.load(Ordering::Relaxed);
        socket.set_read_ahead(if download == 0 {
            DEFAULT_READ_AHEAD
        } else {
            (download as usize).saturating_mul(2)
        });
        socket.set_upload_cap(if upload == 0 {
            0
        } else {
            (upload as usize).saturating_mul(2)
        });
    }

    /// Wake the scheduler because a socket gained pending work
    pub fn notify_work(&self) {
        self.work.notify_one();
    }

    /// Run one tick against the wall clock
    pub fn tick(&self) -> TickSummary {
        let elapsed = {
            let mut last = self.last_tick.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(*last).min(MAX_TICK_ELAPSED);
            *last = now;
            elapsed
        };
        self.tick_with_elapsed(elapsed)
    }

    /// Run one tick crediting exactly `elapsed` of limit time
    pub fn tick_with_elapsed(&self, elapsed: Duration) -> TickSummary {
        let sockets: Vec<Arc<dyn ThrottledIo>> = self.sockets.lock().clone();
        let elapsed = elapsed.min(MAX_TICK_ELAPSED);

        let up_budget = budget(self.upload_limit.load(Ordering::Relaxed), elapsed);
        let down_budget = budget(self.download_limit.load(Ordering::Relaxed), elapsed);

        let uploaded = distribute(
            up_budget,
            &sockets,
            |s| s.pending_upload() > 0,
            |s, n| s.transfer_upload(n),
        );
        let downloaded = distribute(
            down_budget,
            &sockets,
            |s| s.download_room() > 0,
            |s, n| s.transfer_download(n),
        );

        TickSummary {
            uploaded,
            downloaded,
            work_remaining: sockets.iter().any(|s| s.pending_upload() > 0),
        }
    }

    fn any_work(&self) -> bool {
        self.sockets
            .lock()
            .iter()
            .any(|s| s.pending_upload() > 0 || s.download_room() > 0)
    }

    /// Scheduler loop: sleep until a socket reports work, then tick at the
    /// reschedule interval until the pool goes idle
    pub async fn run(self: Arc<Self>) {
        loop {
            self.work.notified().await;
            loop {
                self.tick();
                if !self.any_work() {
                    break;
                }
                tokio::time::sleep(RESCHEDULE_INTERVAL).await;
            }
        }
    }
}

fn budget(limit: u64, elapsed: Duration) -> usize {
    if limit == 0 {
        usize::MAX
    } else {
        (limit as u128 * elapsed.as_millis() / 1000) as usize
    }
}

/// Split `budget` round-robin across the sockets that have work. Each pass
/// gives every remaining socket an equal share; a socket that cannot use
/// its full share drops out and later passes redistribute what is left.
fn distribute(
    budget: usize,
    sockets: &[Arc<dyn ThrottledIo>],
    has_work: impl Fn(&dyn ThrottledIo) -> bool,
    transfer: impl Fn(&dyn ThrottledIo, usize) -> usize,
) -> usize {
    let mut remaining = budget;
    let mut active: Vec<&Arc<dyn ThrottledIo>> =
        sockets.iter().filter(|s| has_work(&***s)).collect();
    let mut total = 0;

    while remaining > 0 && !active.is_empty() {
        let share = (remaining / active.len()).max(1);
        let mut kept = Vec::with_capacity(active.len());
        for socket in active {
            if remaining == 0 {
                break;
            }
            let quota = share.min(remaining);
            let moved = transfer(&**socket, quota);
            remaining -= moved;
            total += moved;
            if moved == quota && has_work(&**socket) {
                kept.push(socket);
            }
        }
        active = kept;
    }

    total
}

//! Background search scheduling
//!
//! Each bus master gets one task that sweeps the bus at the master's search
//! cadence. The loop itself is a generic pausable periodic task; power
//! management only needs [`TaskControl::pause`] and [`TaskControl::resume`]
//! plus the master's re-verify hook.

use axon_bus::SearchError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::MasterRef;

/// Pause, wake and shutdown signals of one periodic task
#[derive(Debug)]
pub struct TaskControl {
    paused: watch::Sender<bool>,
    wake: Notify,
    cancel: CancellationToken,
}

impl TaskControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop starting new runs until [`TaskControl::resume`]
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Cut the current sleep short; remembered if the task is busy
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Request shutdown; a scheduled search stops at its next bit
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `work` every `period()` until cancelled
///
/// `period` returning `None` means "idle until woken". While paused no work
/// is started; resuming, waking, or cancelling interrupts any sleep.
pub async fn run_pausable<P, PF, W, WF>(control: &TaskControl, mut period: P, mut work: W)
where
    P: FnMut() -> PF,
    PF: Future<Output = Option<Duration>>,
    W: FnMut() -> WF,
    WF: Future<Output = ()>,
{
    let mut paused_rx = control.paused.subscribe();

    loop {
        if control.cancel.is_cancelled() {
            break;
        }

        let paused = *paused_rx.borrow_and_update();
        let interval = period().await;

        if !paused && interval.is_some() {
            work().await;
        }

        if control.cancel.is_cancelled() {
            break;
        }

        let sleep = async {
            match interval {
                Some(duration) if !paused => tokio::time::sleep(duration).await,
                _ => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = control.cancel.cancelled() => break,
            _ = control.wake.notified() => {}
            _ = paused_rx.changed() => {}
            _ = sleep => {}
        }
    }
}

/// Handle to a master's background sweep task
pub struct Scheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Start sweeping `master` in the background; the task keeps its
    /// reference until it exits.
    pub fn spawn(master: MasterRef) -> Self {
        let cancel = master.control().cancel_token().clone();
        let task = tokio::spawn(run(master));
        Self { cancel, task }
    }

    /// Cancel the task and wait for it to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Bus scheduler task failed");
        }
    }
}

async fn run(master: MasterRef) {
    let id = master.id();
    info!(master = id, "Bus scheduler started");

    let bus = &*master;
    run_pausable(
        bus.control(),
        move || async move {
            match bus.search_cadence().await {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            }
        },
        move || async move {
            match bus.sweep(None, Some(bus.control().cancel_token())).await {
                Ok(report) => debug!(
                    master = id,
                    found = report.found,
                    total = report.total,
                    "Scheduled sweep complete"
                ),
                Err(SearchError::Cancelled) => debug!(master = id, "Scheduled sweep cancelled"),
                Err(e) => warn!(master = id, error = %e, "Bus sweep failed, retrying next tick"),
            }
        },
    )
    .await;

    info!(master = id, "Bus scheduler stopped");
}

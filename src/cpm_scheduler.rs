// Periodic refresh timers for the board and the map
use crate::cpm_models::{CPMError, Result};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub type PollFuture<T> = BoxFuture<'static, Result<T>>;

type Waiter<R> = oneshot::Sender<Result<R>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Failed,
}

/// Runs a poll job on a fixed period with at most one poll in flight.
///
/// The first tick fires immediately. A tick that arrives while the previous
/// poll is still running is skipped, and every completed poll (successful or
/// not) restarts the period. Successful results are handed to `publish`,
/// which is the only writer for whatever the timer feeds. Polls requested
/// through a [`RefreshHandle`] go through the same loop.
pub struct RefreshTimer<R = ()> {
    label: &'static str,
    state: watch::Receiver<PollState>,
    requests: mpsc::UnboundedSender<Waiter<R>>,
    handle: JoinHandle<()>,
}

/// Asks a running timer for an immediate poll.
#[derive(Clone)]
pub struct RefreshHandle<R = ()> {
    label: &'static str,
    requests: mpsc::UnboundedSender<Waiter<R>>,
}

impl<R: Clone + Send + 'static> RefreshTimer<R> {
    pub fn spawn<T, J, S>(label: &'static str, period: Duration, job: J, mut publish: S) -> Self
    where
        T: Send + 'static,
        J: Fn() -> PollFuture<T> + Send + 'static,
        S: FnMut(T) -> Result<R> + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(PollState::Idle);
        let (requests, mut request_rx) = mpsc::unbounded_channel::<Waiter<R>>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let (done_tx, mut done_rx) = mpsc::channel::<Result<T>>(1);
            let mut in_flight = false;
            let mut waiters: Vec<Waiter<R>> = Vec::new();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if in_flight {
                            debug!("{} refresh still in flight, skipping tick", label);
                            continue;
                        }
                        in_flight = true;
                        state_tx.send_replace(PollState::Polling);
                        launch(job(), &done_tx);
                    }
                    Some(waiter) = request_rx.recv() => {
                        waiters.push(waiter);
                        if in_flight {
                            debug!("{} refresh requested, joining the poll in flight", label);
                            continue;
                        }
                        in_flight = true;
                        state_tx.send_replace(PollState::Polling);
                        launch(job(), &done_tx);
                    }
                    Some(outcome) = done_rx.recv() => {
                        in_flight = false;
                        let reply = match outcome {
                            Ok(snapshot) => {
                                let published = publish(snapshot);
                                if let Err(e) = &published {
                                    debug!("Discarding {} result: {}", label, e);
                                }
                                state_tx.send_replace(PollState::Idle);
                                published
                            }
                            Err(e) => {
                                warn!("{} refresh failed, keeping previous data: {}", label, e);
                                state_tx.send_replace(PollState::Failed);
                                Err(e)
                            }
                        };
                        for waiter in waiters.drain(..) {
                            let _ = waiter.send(reply.clone());
                        }
                        ticker.reset();
                    }
                }
            }
        });

        info!("Started {} refresh every {}s", label, period.as_secs());

        RefreshTimer {
            label,
            state: state_rx,
            requests,
            handle,
        }
    }
}

impl<R> RefreshTimer<R> {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PollState> {
        self.state.clone()
    }

    pub fn handle(&self) -> RefreshHandle<R> {
        RefreshHandle {
            label: self.label,
            requests: self.requests.clone(),
        }
    }
}

impl<R> RefreshHandle<R> {
    /// Polls right away, or waits for the poll already in flight.
    ///
    /// Fails with `StaleSelection` when the timer stops before answering.
    pub async fn poll_now(&self) -> Result<R> {
        let stopped = || CPMError::StaleSelection(format!("{} refresh was stopped", self.label));

        let (waiter, answer) = oneshot::channel();
        self.requests.send(waiter).map_err(|_| stopped())?;
        answer.await.unwrap_or_else(|_| Err(stopped()))
    }
}

fn launch<T: Send + 'static>(poll: PollFuture<T>, done_tx: &mpsc::Sender<Result<T>>) {
    let done_tx = done_tx.clone();
    tokio::spawn(async move {
        // The receiver is gone once the timer is torn down.
        let _ = done_tx.send(poll.await).await;
    });
}

impl<R> Drop for RefreshTimer<R> {
    fn drop(&mut self) {
        self.handle.abort();
        debug!("Stopped {} refresh", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpm_models::CPMError;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct JobStats {
        launched: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    fn slow_job(stats: Arc<JobStats>, duration: Duration) -> impl Fn() -> PollFuture<usize> + Send + 'static {
        move || {
            let stats = stats.clone();
            async move {
                let n = stats.launched.fetch_add(1, Ordering::SeqCst) + 1;
                let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(duration).await;
                stats.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(n)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_poll_never_overlaps_the_next_tick() {
        let stats = Arc::new(JobStats::default());
        let published = Arc::new(AtomicUsize::new(0));

        let sink = published.clone();
        let timer = RefreshTimer::spawn(
            "map",
            Duration::from_secs(10),
            slow_job(stats.clone(), Duration::from_secs(15)),
            move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        drop(timer);

        assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
        // Polls start at 0s, 25s and 50s.
        assert_eq!(stats.launched.load(Ordering::SeqCst), 3);
        assert_eq!(published.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn two_timers_run_independently() {
        let board = Arc::new(JobStats::default());
        let map = Arc::new(JobStats::default());

        let _board = RefreshTimer::spawn(
            "board",
            Duration::from_secs(30),
            slow_job(board.clone(), Duration::from_secs(25)),
            |_| Ok(()),
        );
        let _map = RefreshTimer::spawn(
            "map",
            Duration::from_secs(10),
            slow_job(map.clone(), Duration::from_millis(100)),
            |_| Ok(()),
        );

        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(board.launched.load(Ordering::SeqCst), 1);
        assert!(map.launched.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_recorded_and_the_next_tick_heals() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let published = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let sink = published.clone();
        let timer = RefreshTimer::spawn(
            "board",
            Duration::from_secs(30),
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(CPMError::UpstreamTimeout("first poll".to_string()))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            },
            move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(timer.state(), PollState::Failed);
        assert_eq!(published.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(timer.state(), PollState::Idle);
        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn requested_poll_shares_the_in_flight_limit() {
        let stats = Arc::new(JobStats::default());
        let timer = RefreshTimer::spawn(
            "board",
            Duration::from_secs(30),
            slow_job(stats.clone(), Duration::from_secs(5)),
            |n: usize| Ok(n * 10),
        );
        let handle = timer.handle();

        // Joins the first tick's poll instead of starting another.
        assert_eq!(handle.poll_now().await, Ok(10));
        assert_eq!(stats.launched.load(Ordering::SeqCst), 1);

        // Nothing in flight now, so the request starts a poll of its own.
        assert_eq!(handle.poll_now().await, Ok(20));
        assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(timer.state(), PollState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_the_timer_answers_pending_requests() {
        let stats = Arc::new(JobStats::default());
        let timer = RefreshTimer::spawn(
            "board",
            Duration::from_secs(30),
            slow_job(stats.clone(), Duration::from_secs(5)),
            |n: usize| Ok(n),
        );
        let handle = timer.handle();

        let (answer, _) = tokio::join!(handle.poll_now(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(timer);
        });
        assert!(matches!(answer, Err(CPMError::StaleSelection(_))));
        assert!(matches!(handle.poll_now().await, Err(CPMError::StaleSelection(_))));
    }

    #[tokio::test]
    async fn rejected_publish_is_reported_to_the_requester() {
        let timer = RefreshTimer::spawn(
            "map",
            Duration::from_secs(3600),
            || async { Ok(()) }.boxed(),
            |_| -> Result<usize> { Err(CPMError::StaleSelection("old context".to_string())) },
        );

        assert!(matches!(timer.handle().poll_now().await, Err(CPMError::StaleSelection(_))));
        assert_eq!(timer.state(), PollState::Idle);
    }
}

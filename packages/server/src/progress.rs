//! Simulated upload progress.
//!
//! [`ProgressState`] holds the counter and decides what each tick reports.
//! [`ProgressTimer`] is the repeating task that drives the ticks. It does not
//! touch the state itself, it only calls back into its owner, which keeps
//! every mutation on the owner's task.

use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

pub const MAX_PROGRESS: u8 = 100;
pub const MIN_INCREMENT: u8 = 1;
pub const MAX_INCREMENT: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The counter advanced to this value.
    Progress(u8),
    /// The counter was already at [`MAX_PROGRESS`].
    Complete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressState {
    progress: u8,
}

impl ProgressState {
    #[must_use]
    pub const fn progress(&self) -> u8 {
        self.progress
    }

    pub const fn reset(&mut self) {
        self.progress = 0;
    }

    /// Advances the counter by a random increment in
    /// `[MIN_INCREMENT, MAX_INCREMENT]`, clamped to [`MAX_PROGRESS`].
    ///
    /// A tick on a saturated counter leaves it untouched and reports
    /// [`TickOutcome::Complete`].
    pub fn tick(&mut self, rng: &mut impl Rng) -> TickOutcome {
        if self.progress >= MAX_PROGRESS {
            return TickOutcome::Complete;
        }

        let increment = rng.random_range(MIN_INCREMENT..=MAX_INCREMENT);
        self.progress = self.progress.saturating_add(increment).min(MAX_PROGRESS);

        TickOutcome::Progress(self.progress)
    }
}

/// A running repeating timer. Dropping it stops the ticks.
#[derive(Debug)]
pub struct ProgressTimer {
    generation: u64,
    token: CancellationToken,
}

impl ProgressTimer {
    /// Spawns a task that calls `on_tick` every `period`, starting one
    /// `period` from now, until the timer is dropped or `on_tick` returns
    /// `false`.
    ///
    /// # Panics
    ///
    /// * If `period` is zero
    #[must_use]
    pub fn start(
        generation: u64,
        period: Duration,
        mut on_tick: impl FnMut() -> bool + Send + 'static,
    ) -> Self {
        let token = CancellationToken::new();

        tokio::spawn({
            let token = token.clone();
            async move {
                let mut interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        () = token.cancelled() => {
                            log::trace!("Progress timer generation={generation} cancelled");
                            break;
                        }
                        _ = interval.tick() => {
                            if !on_tick() {
                                log::trace!("Progress timer generation={generation} receiver closed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self { generation, token }
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ProgressTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use pretty_assertions::assert_eq;
    use rand::{SeedableRng as _, rngs::StdRng};

    use super::*;

    #[test_log::test]
    fn progress_is_non_decreasing_and_saturates() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = ProgressState::default();
        let mut last = 0;

        loop {
            match state.tick(&mut rng) {
                TickOutcome::Progress(progress) => {
                    let increment = progress - last;
                    assert!(progress <= MAX_PROGRESS);
                    assert!(increment >= MIN_INCREMENT);
                    assert!(increment <= MAX_INCREMENT || progress == MAX_PROGRESS);
                    last = progress;
                }
                TickOutcome::Complete => break,
            }
        }

        assert_eq!(last, MAX_PROGRESS);
        assert_eq!(state.progress(), MAX_PROGRESS);
    }

    #[test_log::test]
    fn saturated_counter_keeps_reporting_complete() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut state = ProgressState { progress: 100 };

        assert_eq!(state.tick(&mut rng), TickOutcome::Complete);
        assert_eq!(state.tick(&mut rng), TickOutcome::Complete);
        assert_eq!(state.progress(), 100);
    }

    #[test_log::test]
    fn increment_is_clamped_to_max() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut state = ProgressState { progress: 99 };

        assert_eq!(state.tick(&mut rng), TickOutcome::Progress(100));
    }

    #[test_log::test]
    fn first_increment_is_within_bounds() {
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut state = ProgressState::default();

            let TickOutcome::Progress(progress) = state.tick(&mut rng) else {
                panic!("fresh counter must advance");
            };
            assert!((MIN_INCREMENT..=MAX_INCREMENT).contains(&progress));
        }
    }

    #[test_log::test]
    fn reset_returns_to_zero() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut state = ProgressState::default();
        state.tick(&mut rng);
        state.tick(&mut rng);

        state.reset();

        assert_eq!(state.progress(), 0);
    }

    fn counting_timer(period: Duration) -> (ProgressTimer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let timer = ProgressTimer::start(1, period, {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        (timer, count)
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn timer_first_fires_after_one_period() {
        let (_timer, count) = counting_timer(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn dropping_timer_stops_ticks() {
        let (timer, count) = counting_timer(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        drop(timer);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn timer_stops_when_callback_returns_false() {
        let count = Arc::new(AtomicUsize::new(0));
        let _timer = ProgressTimer::start(1, Duration::from_secs(1), {
            let count = count.clone();
            move || count.fetch_add(1, Ordering::SeqCst) < 1
        });

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}

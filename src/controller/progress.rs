//! Progress reporting: a one-writer/many-reader
//! broadcast of the *latest* value, not an observer callback chain.
//! Progress never decreases in the normal path; reaching a stage
//! classified as [`StageKind::Finished`] or [`StageKind::Aborted`] pins
//! the reported percentage at 100 regardless of which intermediate
//! stages were skipped.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Whether a stage is an ordinary waypoint or a terminal outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StageKind {
    Normal,
    Finished,
    Aborted,
}

/// One stage in a long operation's ordered progress sequence.
pub trait ProgressStage: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    /// Position in the ordered stage list, 0-based.
    fn ordinal(self) -> usize;
    /// Total stage count, used to scale `ordinal` to a percentage.
    fn total(self) -> usize;
    fn kind(self) -> StageKind;
}

/// A snapshot of a long operation's progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProgressUpdate<S> {
    pub stage: S,
    pub percent: u8,
}

/// Single-writer handle; construct with [`ProgressReporter::new`] and keep
/// the paired [`watch::Receiver`] for `progressFlow`.
pub struct ProgressReporter<S: ProgressStage> {
    tx: watch::Sender<ProgressUpdate<S>>,
    high_water: AtomicU8,
}

impl<S: ProgressStage> ProgressReporter<S> {
    #[must_use]
    pub fn new(initial: S) -> (Arc<Self>, watch::Receiver<ProgressUpdate<S>>) {
        let percent = Self::raw_percent(initial);
        let (tx, rx) = watch::channel(ProgressUpdate { stage: initial, percent });
        (
            Arc::new(Self { tx, high_water: AtomicU8::new(percent) }),
            rx,
        )
    }

    fn raw_percent(stage: S) -> u8 {
        match stage.kind() {
            StageKind::Finished | StageKind::Aborted => 100,
            StageKind::Normal => {
                let total = stage.total().max(1) as u64;
                ((stage.ordinal() as u64 * 100) / total).min(100) as u8
            }
        }
    }

    /// Advances to `stage`. The reported percentage is clamped to never
    /// regress versus the previous update, except that terminal stages
    /// always force it to 100.
    pub fn set_stage(&self, stage: S) {
        let raw = Self::raw_percent(stage);
        let percent = match stage.kind() {
            StageKind::Finished | StageKind::Aborted => 100,
            StageKind::Normal => {
                let prev = self.high_water.load(Ordering::SeqCst);
                raw.max(prev)
            }
        };
        self.high_water.store(percent, Ordering::SeqCst);
        let _ = self.tx.send(ProgressUpdate { stage, percent });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    enum Demo {
        A,
        B,
        C,
        Finished,
        Aborted,
    }

    impl ProgressStage for Demo {
        fn ordinal(self) -> usize {
            match self {
                Self::A => 0,
                Self::B => 1,
                Self::C => 2,
                Self::Finished | Self::Aborted => 3,
            }
        }
        fn total(self) -> usize {
            4
        }
        fn kind(self) -> StageKind {
            match self {
                Self::Finished => StageKind::Finished,
                Self::Aborted => StageKind::Aborted,
                _ => StageKind::Normal,
            }
        }
    }

    #[test]
    fn percent_advances_with_stage() {
        let (reporter, rx) = ProgressReporter::new(Demo::A);
        assert_eq!(rx.borrow().percent, 0);
        reporter.set_stage(Demo::B);
        assert_eq!(rx.borrow().percent, 25);
        reporter.set_stage(Demo::C);
        assert_eq!(rx.borrow().percent, 50);
    }

    #[test]
    fn terminal_stage_pins_percent_at_100_even_from_early_stage() {
        let (reporter, rx) = ProgressReporter::new(Demo::A);
        reporter.set_stage(Demo::Aborted);
        assert_eq!(rx.borrow().percent, 100);
    }

    #[test]
    fn percent_never_regresses_on_the_normal_path() {
        let (reporter, rx) = ProgressReporter::new(Demo::C);
        assert_eq!(rx.borrow().percent, 50);
        reporter.set_stage(Demo::A);
        assert_eq!(rx.borrow().percent, 50, "must not regress below high water mark");
    }
}

use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::ThreadPool;
use rayon::prelude::*;
use std::fmt;
use std::io::IsTerminal;

/// Parallel stages reported during a screening run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScreeningStage {
    Loocv,
    OutOfSample,
    AugmentedFits,
}

impl ScreeningStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Loocv => "leave-one-out refits",
            Self::OutOfSample => "out-of-sample scoring",
            Self::AugmentedFits => "augmented influence fits",
        }
    }
}

impl fmt::Display for ScreeningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress through the parallel stages.
///
/// Callbacks are always made from the thread that drives the run, never from
/// worker threads.
pub trait ScreeningProgressObserver {
    fn on_stage_start(&mut self, stage: ScreeningStage, total_units: usize) {
        let _ = (stage, total_units);
    }
    fn on_stage_advance(&mut self, stage: ScreeningStage, completed_units: usize) {
        let _ = (stage, completed_units);
    }
    fn on_stage_finish(&mut self, stage: ScreeningStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopScreeningProgress;

impl ScreeningProgressObserver for NoopScreeningProgress {}

/// Terminal progress bar, drawn only when stderr is a terminal.
#[derive(Default)]
pub struct ProgressBarObserver {
    bar: Option<ProgressBar>,
}

impl ProgressBarObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

impl ScreeningProgressObserver for ProgressBarObserver {
    fn on_stage_start(&mut self, stage: ScreeningStage, total_units: usize) {
        self.bar = Some(create_progress_bar(total_units as u64, stage.describe()));
    }

    fn on_stage_advance(&mut self, stage: ScreeningStage, completed_units: usize) {
        let _ = stage;
        if let Some(bar) = &self.bar {
            bar.set_position(completed_units as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: ScreeningStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} done"));
        }
    }
}

/// Runs `work` over `units` on `pool`, reporting each finished unit to
/// `progress` as it arrives. Results keep the order of `units`.
pub fn run_stage<T, R, F>(
    pool: &ThreadPool,
    stage: ScreeningStage,
    units: &[T],
    progress: &mut dyn ScreeningProgressObserver,
    work: F,
) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    progress.on_stage_start(stage, units.len());
    let (tx, rx) = unbounded::<(usize, R)>();
    let mut slots: Vec<Option<R>> = units.iter().map(|_| None).collect();

    std::thread::scope(|scope| {
        let work = &work;
        scope.spawn(move || {
            pool.install(|| {
                units
                    .par_iter()
                    .enumerate()
                    .for_each_with(tx, |tx, (slot, unit)| {
                        // The receiver outlives every worker.
                        let _ = tx.send((slot, work(unit)));
                    });
            });
        });

        let mut finished = 0;
        for (slot, result) in rx.iter() {
            slots[slot] = Some(result);
            finished += 1;
            progress.on_stage_advance(stage, finished);
        }
    });

    progress.on_stage_finish(stage);
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<(ScreeningStage, usize)>,
    }

    impl ScreeningProgressObserver for Recorder {
        fn on_stage_advance(&mut self, stage: ScreeningStage, completed_units: usize) {
            self.events.push((stage, completed_units));
        }
    }

    #[test]
    fn default_methods_are_optional() {
        let mut recorder = Recorder::default();
        recorder.on_stage_start(ScreeningStage::Loocv, 3);
        recorder.on_stage_advance(ScreeningStage::Loocv, 1);
        recorder.on_stage_finish(ScreeningStage::Loocv);
        assert_eq!(recorder.events, vec![(ScreeningStage::Loocv, 1)]);
        assert_eq!(ScreeningStage::AugmentedFits.to_string(), "augmented influence fits");
    }

    #[test]
    fn stage_reports_every_unit_and_keeps_order() {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(3)
            .build()
            .unwrap();
        let units: Vec<u32> = (0..25).collect();
        let mut recorder = Recorder::default();
        let squares = run_stage(
            &pool,
            ScreeningStage::AugmentedFits,
            &units,
            &mut recorder,
            |u| u * u,
        );
        assert_eq!(squares, units.iter().map(|u| u * u).collect::<Vec<_>>());
        let counts: Vec<usize> = recorder.events.iter().map(|(_, n)| *n).collect();
        assert_eq!(counts, (1..=25).collect::<Vec<_>>());
        assert!(
            recorder
                .events
                .iter()
                .all(|(stage, _)| *stage == ScreeningStage::AugmentedFits)
        );
    }

    #[test]
    fn hidden_bar_tracks_position() {
        let mut observer = ProgressBarObserver::new();
        observer.on_stage_start(ScreeningStage::OutOfSample, 10);
        observer.on_stage_advance(ScreeningStage::OutOfSample, 4);
        assert_eq!(observer.bar.as_ref().map(|b| b.position()), Some(4));
        observer.on_stage_finish(ScreeningStage::OutOfSample);
        assert!(observer.bar.is_none());
    }
}

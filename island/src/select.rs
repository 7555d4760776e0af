//! Selection policies for migration.
//!
//! The same small interface picks emigrants before breeding and picks the
//! resident slots immigrants overwrite after breeding. Policies are resolved
//! once at startup from typed configuration — no runtime lookup by name.

use archipelago_protocol::Slot;
use rand::{Rng, RngCore};

/// Chooses indices into one subpopulation.
///
/// `prepare` is called once per subpopulation before a burst of `select`
/// calls; `finish` closes the burst. Repeated `select` calls may return the
/// same index — the caller deduplicates where the protocol requires distinct
/// slots.
pub trait SelectionPolicy<I>: Send + Sync {
    fn prepare(&mut self, subpop: &[Slot<I>]);

    /// # Panics
    /// Panics if prepared on an empty subpopulation; callers skip those.
    fn select(&mut self, rng: &mut dyn RngCore) -> usize;

    fn finish(&mut self) {}
}

/// Uniform random choice. The default for both emigrants and eviction slots.
#[derive(Debug, Default)]
pub struct RandomSelection {
    len: usize,
}

impl RandomSelection {
    pub fn new() -> Self {
        RandomSelection { len: 0 }
    }
}

impl<I> SelectionPolicy<I> for RandomSelection {
    fn prepare(&mut self, subpop: &[Slot<I>]) {
        self.len = subpop.len();
    }

    fn select(&mut self, rng: &mut dyn RngCore) -> usize {
        assert!(self.len > 0, "cannot select from empty subpopulation");
        rng.random_range(0..self.len)
    }
}

/// Tournament selection over a caller-supplied score.
///
/// Lower scores are better (minimization, as in the rest of the stack). The
/// `best` form favors low scores and suits emigrant choice; the `worst` form
/// favors high scores and suits picking residents to evict.
pub struct TournamentSelection<I> {
    size: usize,
    key: fn(&I) -> f64,
    prefer_max: bool,
    scores: Vec<f64>,
}

impl<I> TournamentSelection<I> {
    pub fn best(size: usize, key: fn(&I) -> f64) -> Self {
        TournamentSelection { size: size.max(1), key, prefer_max: false, scores: Vec::new() }
    }

    pub fn worst(size: usize, key: fn(&I) -> f64) -> Self {
        TournamentSelection { size: size.max(1), key, prefer_max: true, scores: Vec::new() }
    }
}

impl<I: Send> SelectionPolicy<I> for TournamentSelection<I> {
    fn prepare(&mut self, subpop: &[Slot<I>]) {
        self.scores.clear();
        self.scores
            .extend(subpop.iter().map(|slot| (self.key)(&slot.individual)));
    }

    fn select(&mut self, rng: &mut dyn RngCore) -> usize {
        let n = self.scores.len();
        assert!(n > 0, "cannot select from empty subpopulation");
        let mut winner = rng.random_range(0..n);
        for _ in 1..self.size {
            let contender = rng.random_range(0..n);
            let better = if self.prefer_max {
                self.scores[contender] > self.scores[winner]
            } else {
                self.scores[contender] < self.scores[winner]
            };
            if better {
                winner = contender;
            }
        }
        winner
    }

    fn finish(&mut self) {
        self.scores.clear();
    }
}

/// Typed policy configuration, resolved once at startup.
#[derive(Debug, Clone, Copy)]
pub enum SelectionKind {
    Random,
    /// Tournament of the given size favoring low scores (emigrants).
    TournamentBest(usize),
    /// Tournament of the given size favoring high scores (eviction).
    TournamentWorst(usize),
}

/// Explicit factory for the configured policy kinds.
pub fn build_policy<I: Send + 'static>(
    kind: SelectionKind,
    key: fn(&I) -> f64,
) -> Box<dyn SelectionPolicy<I>> {
    match kind {
        SelectionKind::Random => Box::new(RandomSelection::new()),
        SelectionKind::TournamentBest(size) => Box::new(TournamentSelection::best(size, key)),
        SelectionKind::TournamentWorst(size) => Box::new(TournamentSelection::worst(size, key)),
    }
}

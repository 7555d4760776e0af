//! The slice of evolutionary state the exchange subsystem touches.
//!
//! The host loop owns breeding and evaluation; this subsystem only needs the
//! subpopulation arrays, the per-individual `evaluated` flag (cleared on
//! immigration so the host re-evaluates arrivals), and the generation counter
//! the host passes into each exchange call.

/// One resident of a subpopulation.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot<I> {
    pub individual: I,
    /// Cleared when an immigrant lands in this slot; the host evolutionary
    /// loop is expected to re-evaluate before the next selection.
    pub evaluated: bool,
}

impl<I> Slot<I> {
    /// A slot whose individual still needs evaluation.
    pub fn new(individual: I) -> Self {
        Slot { individual, evaluated: false }
    }

    pub fn evaluated(individual: I) -> Self {
        Slot { individual, evaluated: true }
    }
}

/// The host population: one array of slots per subpopulation.
#[derive(Debug, Clone, Default)]
pub struct Population<I> {
    pub subpops: Vec<Vec<Slot<I>>>,
}

impl<I> Population<I> {
    pub fn new(subpops: Vec<Vec<Slot<I>>>) -> Self {
        Population { subpops }
    }

    /// Build `num_subpops` subpopulations of `size` unevaluated individuals.
    pub fn from_fn(
        num_subpops: usize,
        size: usize,
        mut f: impl FnMut(usize, usize) -> I,
    ) -> Self {
        let subpops = (0..num_subpops)
            .map(|s| (0..size).map(|i| Slot::new(f(s, i))).collect())
            .collect();
        Population { subpops }
    }

    pub fn num_subpops(&self) -> usize {
        self.subpops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fn_builds_unevaluated_slots() {
        let population = Population::from_fn(2, 3, |s, i| (s, i));
        assert_eq!(population.num_subpops(), 2);
        assert_eq!(population.subpops[1].len(), 3);
        assert!(population.subpops.iter().flatten().all(|slot| !slot.evaluated));
        assert_eq!(population.subpops[1][2].individual, (1, 2));
    }
}

use kioku_core::model::{Facet, QueueItem, SchedulingState, Unit, UnitError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Turns units into queue items. Owns the RNG used to pick cloze examples.
#[derive(Debug, Clone)]
pub struct ItemBuilder<R = StdRng> {
    rng: R,
}

impl ItemBuilder<StdRng> {
    /// Deterministic builder for tests and reproducible runs.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    #[must_use]
    pub fn from_os_rng() -> Self {
        Self::new(StdRng::from_os_rng())
    }

    /// Seeded when `seed` is set, OS entropy otherwise.
    #[must_use]
    pub fn from_seed_option(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_os_rng, Self::seeded)
    }
}

impl<R: Rng> ItemBuilder<R> {
    #[must_use]
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Builds the item for one facet, carrying `state` as its snapshot.
    ///
    /// # Errors
    ///
    /// Returns `UnitError::UnsupportedFacet` if the unit does not study `facet`.
    pub fn build(
        &mut self,
        unit: &Unit,
        facet: Facet,
        state: SchedulingState,
    ) -> Result<QueueItem, UnitError> {
        let example = match (facet, unit.example_count()) {
            (Facet::Cloze, count) if count > 0 => Some(self.rng.random_range(0..count)),
            _ => None,
        };
        QueueItem::build(unit, facet, state, example)
    }

    /// Items for every facet of a unit that has never been studied.
    ///
    /// # Errors
    ///
    /// Propagates `UnitError` from item construction.
    pub fn build_new(&mut self, unit: &Unit) -> Result<Vec<QueueItem>, UnitError> {
        unit.facets()
            .into_iter()
            .map(|facet| self.build(unit, facet, SchedulingState::new_facet()))
            .collect()
    }
}

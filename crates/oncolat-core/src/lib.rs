//! Core engine of the oncolat workspace: a continuous-time, event-driven
//! simulation of tumor growth on a regular lattice.
//!
//! A [`Tissue`] owns the extant cell population (a slot-map arena), the
//! position index, and the event queue. Each cell carries its own event
//! rates, shared copy-on-write along lineages, and a link to an immutable
//! ancestor snapshot from which the full genealogy can be reconstructed.

use oncolat_lattice::{Coord, Lattice, LatticeError, LatticeKind};
use ordered_float::OrderedFloat;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::SmallRng;
use rand::seq::{SliceRandom, index};
use rand::{Rng, SeedableRng};
use rand_distr::{Exp, Gamma, Normal, Poisson};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fmt::Write as _;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info};

new_key_type! {
    /// Stable handle for extant cells backed by a generational slot map.
    pub struct CellKey;
}

/// Cap on the number of directions probed by the nearest-empty search.
const DIRECTION_SEARCH_MAX: usize = 26;

/// TSV header shared by the population and snapshot tables.
pub const CELL_TSV_HEADER: &str =
    "x\ty\tz\tid\tancestor\tbirth\tdeath\tbeta\tdelta\talpha\trho\ttype\tomega";

/// Errors raised when assembling a tissue from configuration.
#[derive(Debug, Error)]
pub enum TissueError {
    #[error(transparent)]
    Lattice(#[from] LatticeError),
    /// The local-density effect and displacement path do not combine.
    #[error(
        "invalid policy combination -L {density} -P {path}; choose from: \
         -L const -P {{random, mindrag, minstraight, roulette, stroll}}; \
         -L step -P {{random, mindrag}}; -L linear -P {{random, mindrag}}"
    )]
    IncompatiblePolicy {
        density: LocalDensity,
        path: DisplacementPath,
    },
    /// Driver effect sizes are Gaussian; the deviation must be sane.
    #[error("invalid driver effect distribution (mean {mean}, sd {sd})")]
    InvalidDriverEffect { mean: f64, sd: f64 },
}

/// Cell lineage compartment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CellType {
    Stem = 0,
    Nonstem = 1,
}

/// The event a cell is scheduled to perform next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Birth,
    Death,
    Migration,
}

/// Trait perturbed by a driver mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Birth,
    Death,
    Migra,
}

impl DriverKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Birth => "birth",
            Self::Death => "death",
            Self::Migra => "migra",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One driver hit, recorded in division order.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverRecord {
    /// Id of the cell the hit landed on.
    pub cell_id: u32,
    pub kind: DriverKind,
    /// Effect size `s`; the trait is multiplied by `1 + s`.
    pub coef: f64,
}

/// One row of the periodic population snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub time: f64,
    pub cell: Cell,
}

/// Per-cell event rates, shared by handle along a lineage until a driver
/// mutation copies them on write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRates {
    /// β, birth rate.
    pub birth_rate: f64,
    /// δ, death rate.
    pub death_rate: f64,
    /// α, death probability on a division attempt.
    pub death_prob: f64,
    /// ρ, migration rate.
    pub migra_rate: f64,
}

impl Default for EventRates {
    fn default() -> Self {
        Self {
            birth_rate: 1.0,
            death_rate: 0.0,
            death_prob: 0.0,
            migra_rate: 0.0,
        }
    }
}

/// Parameters shared by every cell of a tissue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellParams {
    /// k, shape of the gamma-distributed birth waiting time.
    pub gamma_shape: f64,
    /// p_s, probability that a stem division is symmetric.
    pub prob_symmetric_division: f64,
    /// ω_max, divisions available to a non-stem cell.
    pub max_proliferation_capacity: u8,
}

impl Default for CellParams {
    fn default() -> Self {
        Self {
            gamma_shape: 1.0,
            prob_symmetric_division: 1.0,
            max_proliferation_capacity: 10,
        }
    }
}

/// Driver-mutation rates and effect-size distributions per trait.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverParams {
    pub rate_birth: f64,
    pub rate_death: f64,
    pub rate_migra: f64,
    pub mean_birth: f64,
    pub mean_death: f64,
    pub mean_migra: f64,
    pub sd_birth: f64,
    pub sd_death: f64,
    pub sd_migra: f64,
}

/// Validated effect-size distributions, built once per tissue.
#[derive(Debug, Clone)]
pub struct DriverDistributions {
    rate_birth: f64,
    rate_death: f64,
    rate_migra: f64,
    gauss_birth: Normal<f64>,
    gauss_death: Normal<f64>,
    gauss_migra: Normal<f64>,
}

impl DriverDistributions {
    pub fn new(params: &DriverParams) -> Result<Self, TissueError> {
        let gauss = |mean: f64, sd: f64| {
            Normal::new(mean, sd).map_err(|_| TissueError::InvalidDriverEffect { mean, sd })
        };
        Ok(Self {
            rate_birth: params.rate_birth,
            rate_death: params.rate_death,
            rate_migra: params.rate_migra,
            gauss_birth: gauss(params.mean_birth, params.sd_birth)?,
            gauss_death: gauss(params.mean_death, params.sd_death)?,
            gauss_migra: gauss(params.mean_migra, params.sd_migra)?,
        })
    }
}

/// Local crowding rule gating a birth insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalDensity {
    /// Insertion always succeeds.
    #[default]
    Const,
    /// Insertion requires at least one empty neighbor.
    Step,
    /// Insertion succeeds with probability equal to the empty fraction.
    Linear,
}

impl LocalDensity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Const => "const",
            Self::Step => "step",
            Self::Linear => "linear",
        }
    }
}

impl fmt::Display for LocalDensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geometric rule displacing neighbors to make room for a daughter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplacementPath {
    /// Push a straight chain along a uniformly drawn direction.
    #[default]
    Random,
    /// Re-aim at the nearest empty site on every step of the chain.
    MinDrag,
    /// Push a straight chain toward the nearest empty site.
    MinStraight,
    /// Direction weighted by the reciprocal chain length.
    Roulette,
    /// Walk one direction, trying to slip into any free neighbor.
    Stroll,
}

impl DisplacementPath {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::MinDrag => "mindrag",
            Self::MinStraight => "minstraight",
            Self::Roulette => "roulette",
            Self::Stroll => "stroll",
        }
    }
}

impl fmt::Display for DisplacementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insertion strategy resolved once at construction from the
/// (local density, displacement path) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertStrategy {
    ConstRandom,
    ConstMinDrag,
    ConstMinStraight,
    ConstRoulette,
    ConstStroll,
    StepRandom,
    StepMinDrag,
    LinearRandom,
    LinearMinDrag,
}

impl InsertStrategy {
    fn resolve(density: LocalDensity, path: DisplacementPath) -> Result<Self, TissueError> {
        use DisplacementPath as P;
        use LocalDensity as L;
        match (density, path) {
            (L::Const, P::Random) => Ok(Self::ConstRandom),
            (L::Const, P::MinDrag) => Ok(Self::ConstMinDrag),
            (L::Const, P::MinStraight) => Ok(Self::ConstMinStraight),
            (L::Const, P::Roulette) => Ok(Self::ConstRoulette),
            (L::Const, P::Stroll) => Ok(Self::ConstStroll),
            (L::Step, P::Random) => Ok(Self::StepRandom),
            (L::Step, P::MinDrag) => Ok(Self::StepMinDrag),
            (L::Linear, P::Random) => Ok(Self::LinearRandom),
            (L::Linear, P::MinDrag) => Ok(Self::LinearMinDrag),
            _ => Err(TissueError::IncompatiblePolicy { density, path }),
        }
    }
}

/// Static configuration for a tissue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TissueConfig {
    /// Number of cells packed into a ball at time zero.
    pub initial_size: usize,
    /// Lattice dimensionality, 2 or 3.
    pub dimensions: u32,
    pub coord: LatticeKind,
    pub local_density_effect: LocalDensity,
    pub displacement_path: DisplacementPath,
    /// Rates seeded into the founder lineage.
    pub init_rates: EventRates,
    pub cell: CellParams,
    pub driver: DriverParams,
    /// Simulated-time spacing of periodic snapshots.
    pub snapshot_interval: f64,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for TissueConfig {
    fn default() -> Self {
        Self {
            initial_size: 1,
            dimensions: 3,
            coord: LatticeKind::Moore,
            local_density_effect: LocalDensity::Const,
            displacement_path: DisplacementPath::Random,
            init_rates: EventRates::default(),
            cell: CellParams::default(),
            driver: DriverParams::default(),
            snapshot_interval: f64::INFINITY,
            rng_seed: None,
        }
    }
}

/// Termination and recording bounds for one growth phase.
#[derive(Debug, Clone, Copy)]
pub struct GrowthBounds {
    /// Stop once the population reaches this size.
    pub max_size: usize,
    /// Stop once simulated time passes this value.
    pub max_time: f64,
    /// Snapshot after every change while the population is below this size.
    pub recording_early_growth: usize,
    /// Force a driver on the first daughter born above this size.
    pub mutation_timing: usize,
}

impl Default for GrowthBounds {
    fn default() -> Self {
        Self {
            max_size: usize::MAX,
            max_time: f64::INFINITY,
            recording_early_growth: 0,
            mutation_timing: usize::MAX,
        }
    }
}

/// Bernoulli trial that leaves the RNG stream untouched at p ≤ 0 and p ≥ 1.
fn bernoulli<R: Rng + ?Sized>(p: f64, rng: &mut R) -> bool {
    p >= 1.0 || (p > 0.0 && rng.random::<f64>() < p)
}

/// A cancer cell: position, rates, lineage identity, and its next event.
#[derive(Debug, Clone)]
pub struct Cell {
    coord: Coord,
    rates: Rc<EventRates>,
    cell_type: CellType,
    /// ω, remaining divisions for a non-stem cell.
    proliferation_capacity: u8,
    id: u32,
    /// Immutable snapshot of the parent taken at the division that
    /// produced this cell. `None` only for the founder.
    ancestor: Option<Rc<Cell>>,
    time_of_birth: f64,
    time_of_death: Option<f64>,
    next_event: Event,
    /// Dwell time accumulated across migrations since the last birth draw.
    elapsed: f64,
}

impl Cell {
    /// Founder cell at `coord` with the given rates handle.
    #[must_use]
    pub fn new(coord: Coord, id: u32, rates: Rc<EventRates>, params: &CellParams) -> Self {
        Self {
            coord,
            rates,
            cell_type: CellType::Stem,
            proliferation_capacity: params.max_proliferation_capacity,
            id,
            ancestor: None,
            time_of_birth: 0.0,
            time_of_death: None,
            next_event: Event::Birth,
            elapsed: 0.0,
        }
    }

    /// Division copy: shares the rates handle and identity of the mother,
    /// then rolls the asymmetric-differentiation trial on stem copies.
    #[must_use]
    pub fn daughter<R: Rng + ?Sized>(&self, params: &CellParams, rng: &mut R) -> Self {
        let mut cell = Self {
            coord: self.coord,
            rates: Rc::clone(&self.rates),
            cell_type: self.cell_type,
            proliferation_capacity: self.proliferation_capacity,
            id: self.id,
            ancestor: self.ancestor.clone(),
            time_of_birth: self.time_of_birth,
            time_of_death: None,
            next_event: Event::Birth,
            elapsed: 0.0,
        };
        if cell.cell_type == CellType::Stem && !bernoulli(params.prob_symmetric_division, rng) {
            cell.cell_type = CellType::Nonstem;
        }
        cell
    }

    #[must_use]
    pub const fn coord(&self) -> Coord {
        self.coord
    }

    pub const fn set_coord(&mut self, coord: Coord) {
        self.coord = coord;
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Id of the archived parent snapshot, 0 for the founder.
    #[must_use]
    pub fn ancestor_id(&self) -> u32 {
        self.ancestor.as_ref().map_or(0, |a| a.id)
    }

    #[must_use]
    pub fn ancestor(&self) -> Option<&Rc<Cell>> {
        self.ancestor.as_ref()
    }

    #[must_use]
    pub const fn cell_type(&self) -> CellType {
        self.cell_type
    }

    #[must_use]
    pub const fn proliferation_capacity(&self) -> u8 {
        self.proliferation_capacity
    }

    #[must_use]
    pub const fn time_of_birth(&self) -> f64 {
        self.time_of_birth
    }

    #[must_use]
    pub const fn time_of_death(&self) -> Option<f64> {
        self.time_of_death
    }

    #[must_use]
    pub const fn next_event(&self) -> Event {
        self.next_event
    }

    #[must_use]
    pub fn rates(&self) -> &EventRates {
        &self.rates
    }

    #[must_use]
    pub fn birth_rate(&self) -> f64 {
        self.rates.birth_rate
    }

    #[must_use]
    pub fn death_rate(&self) -> f64 {
        self.rates.death_rate
    }

    #[must_use]
    pub fn death_prob(&self) -> f64 {
        self.rates.death_prob
    }

    #[must_use]
    pub fn migra_rate(&self) -> f64 {
        self.rates.migra_rate
    }

    /// Stamp a freshly divided cell: new id, ancestor link, birth time.
    /// Non-stem cells spend one unit of proliferation capacity.
    pub fn set_time_of_birth(&mut self, time: f64, id: u32, ancestor: &Rc<Cell>) {
        self.time_of_birth = time;
        self.id = id;
        self.ancestor = Some(Rc::clone(ancestor));
        if self.cell_type == CellType::Nonstem {
            self.proliferation_capacity = self.proliferation_capacity.saturating_sub(1);
        }
    }

    pub const fn set_time_of_death(&mut self, time: f64) {
        self.time_of_death = Some(time);
    }

    pub const fn set_elapsed(&mut self, elapsed: f64) {
        self.elapsed = elapsed;
    }

    /// Independent driver trials on β, δ, and ρ. A hit clones the shared
    /// rates before writing; a death hit scales α by the same factor.
    pub fn mutate<R: Rng + ?Sized>(
        &mut self,
        drivers: &DriverDistributions,
        rng: &mut R,
    ) -> Vec<DriverRecord> {
        let mut hits = Vec::new();
        if bernoulli(drivers.rate_birth, rng) {
            let s = drivers.gauss_birth.sample(rng);
            Rc::make_mut(&mut self.rates).birth_rate *= 1.0 + s;
            hits.push(DriverRecord {
                cell_id: self.id,
                kind: DriverKind::Birth,
                coef: s,
            });
        }
        if bernoulli(drivers.rate_death, rng) {
            let s = drivers.gauss_death.sample(rng);
            let rates = Rc::make_mut(&mut self.rates);
            rates.death_rate *= 1.0 + s;
            rates.death_prob *= 1.0 + s;
            hits.push(DriverRecord {
                cell_id: self.id,
                kind: DriverKind::Death,
                coef: s,
            });
        }
        if bernoulli(drivers.rate_migra, rng) {
            let s = drivers.gauss_migra.sample(rng);
            Rc::make_mut(&mut self.rates).migra_rate *= 1.0 + s;
            hits.push(DriverRecord {
                cell_id: self.id,
                kind: DriverKind::Migra,
                coef: s,
            });
        }
        hits
    }

    /// Unconditional driver on all three traits; used to inject a
    /// guaranteed driver once the population crosses a configured size.
    pub fn force_mutate<R: Rng + ?Sized>(
        &mut self,
        drivers: &DriverDistributions,
        rng: &mut R,
    ) -> Vec<DriverRecord> {
        let s_birth = drivers.gauss_birth.sample(rng);
        let s_death = drivers.gauss_death.sample(rng);
        let s_migra = drivers.gauss_migra.sample(rng);
        let rates = Rc::make_mut(&mut self.rates);
        rates.birth_rate *= 1.0 + s_birth;
        rates.death_rate *= 1.0 + s_death;
        rates.death_prob *= 1.0 + s_death;
        rates.migra_rate *= 1.0 + s_migra;
        vec![
            DriverRecord {
                cell_id: self.id,
                kind: DriverKind::Birth,
                coef: s_birth,
            },
            DriverRecord {
                cell_id: self.id,
                kind: DriverKind::Death,
                coef: s_death,
            },
            DriverRecord {
                cell_id: self.id,
                kind: DriverKind::Migra,
                coef: s_migra,
            },
        ]
    }

    /// Raise δ to β so the expected per-cell population change is zero.
    pub fn increase_death_rate(&mut self) {
        let rates = Rc::make_mut(&mut self.rates);
        rates.death_rate = rates.birth_rate;
    }

    /// Impose cycle-dependent death probability `p` and re-roll whether the
    /// pending division attempt dies instead of dividing.
    pub fn set_cycle_dependent_death<R: Rng + ?Sized>(&mut self, p: f64, rng: &mut R) {
        Rc::make_mut(&mut self.rates).death_prob = p;
        self.next_event = if bernoulli(p, rng) {
            Event::Death
        } else {
            Event::Birth
        };
    }

    /// Sample the waiting time to this cell's next event and record which
    /// event it is. `positional_value` scales the birth rate in place.
    pub fn delta_time<R: Rng + ?Sized>(
        &mut self,
        positional_value: f64,
        params: &CellParams,
        rng: &mut R,
    ) -> f64 {
        let mut t_birth = f64::INFINITY;
        let mut t_death = f64::INFINITY;
        let mut t_migra = f64::INFINITY;
        if self.proliferation_capacity > 0 && self.birth_rate() > 0.0 && positional_value > 0.0 {
            let mean = 1.0 / self.birth_rate() / positional_value - self.elapsed;
            let scale = (mean / params.gamma_shape).max(0.0);
            // A clamped scale of zero means the birth clock already ran out.
            t_birth = if scale > 0.0 {
                Gamma::new(params.gamma_shape, scale)
                    .map(|gamma| gamma.sample(rng))
                    .unwrap_or(0.0)
            } else {
                0.0
            };
        }
        if self.death_rate() > 0.0 {
            t_death = Exp::new(self.death_rate())
                .map(|exp| exp.sample(rng))
                .unwrap_or(f64::INFINITY);
        }
        if self.migra_rate() > 0.0 {
            t_migra = Exp::new(self.migra_rate())
                .map(|exp| exp.sample(rng))
                .unwrap_or(f64::INFINITY);
        }

        if t_birth < t_death && t_birth < t_migra {
            self.next_event = if bernoulli(self.death_prob(), rng) {
                Event::Death
            } else {
                Event::Birth
            };
            self.elapsed = 0.0;
            t_birth
        } else if t_death <= t_migra {
            self.next_event = Event::Death;
            t_death
        } else {
            self.next_event = Event::Migration;
            // The birth clock keeps running across migrations.
            self.elapsed += t_migra;
            t_migra
        }
    }

    /// Ids along the ancestor chain, the cell's own included.
    #[must_use]
    pub fn traceback(&self) -> HashSet<u32> {
        let mut genealogy = HashSet::new();
        genealogy.insert(self.id);
        let mut parent = self.ancestor.as_deref();
        while let Some(cell) = parent {
            genealogy.insert(cell.id);
            parent = cell.ancestor.as_deref();
        }
        genealogy
    }

    /// 0/1 membership of each mutant id in this cell's ancestry.
    #[must_use]
    pub fn has_mutations_of(&self, mutants: &[u32]) -> Vec<u8> {
        let genealogy = self.traceback();
        mutants
            .iter()
            .map(|id| u8::from(genealogy.contains(id)))
            .collect()
    }

    /// Number of divisions separating two cells through their most recent
    /// common ancestor.
    #[must_use]
    pub fn branch_length(&self, other: &Cell) -> usize {
        if self.id == other.id {
            return 0;
        }
        let genealogy = self.traceback();
        let mut length = 2usize;
        let mut mrca = 1u32;
        let mut parent = other.ancestor.as_deref();
        while let Some(cell) = parent {
            if genealogy.contains(&cell.id) {
                mrca = cell.id;
                break;
            }
            length += 1;
            parent = cell.ancestor.as_deref();
        }
        let mut parent = self.ancestor.as_deref();
        while let Some(cell) = parent {
            if cell.id <= mrca {
                break;
            }
            length += 1;
            parent = cell.ancestor.as_deref();
        }
        length
    }

    /// The canonical 13-column TSV row. Cells that have not died print a
    /// death time of zero.
    #[must_use]
    pub fn tsv_row(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.coord.x,
            self.coord.y,
            self.coord.z,
            self.id,
            self.ancestor_id(),
            self.time_of_birth,
            self.time_of_death.unwrap_or(0.0),
            self.birth_rate(),
            self.death_rate(),
            self.death_prob(),
            self.migra_rate(),
            self.cell_type as u8,
            self.proliferation_capacity,
        )
    }
}

/// Time-ordered event queue. Entries at equal times dispatch in insertion
/// order; the sequence number makes the tie-break explicit and stable.
#[derive(Debug, Default)]
pub struct EventQueue {
    entries: BTreeMap<(OrderedFloat<f64>, u64), CellKey>,
    seq: u64,
}

impl EventQueue {
    /// Schedule `cell` at absolute time `time`.
    pub fn push(&mut self, time: f64, cell: CellKey) {
        self.entries.insert((OrderedFloat(time), self.seq), cell);
        self.seq += 1;
    }

    /// Earliest entry without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<(f64, CellKey)> {
        self.entries
            .first_key_value()
            .map(|(&(time, _), &cell)| (time.into_inner(), cell))
    }

    /// Remove and return the earliest entry.
    pub fn pop(&mut self) -> Option<(f64, CellKey)> {
        self.entries
            .pop_first()
            .map(|((time, _), cell)| (time.into_inner(), cell))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cells in dispatch order; the deterministic ordering used when a
    /// collection must be materialized before shuffling.
    pub fn cells_in_order(&self) -> impl Iterator<Item = CellKey> + '_ {
        self.entries.values().copied()
    }
}

/// Position index over extant cells. Keyed purely by coordinate; at most
/// one cell per site, enforced by rejection on insert.
#[derive(Debug, Default)]
pub struct Occupancy {
    sites: HashMap<Coord, CellKey>,
}

impl Occupancy {
    #[must_use]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    #[must_use]
    pub fn occupant(&self, coord: Coord) -> Option<CellKey> {
        self.sites.get(&coord).copied()
    }

    #[must_use]
    pub fn is_vacant(&self, coord: Coord) -> bool {
        !self.sites.contains_key(&coord)
    }

    /// Insert if the site is free; `false` when already taken.
    pub fn try_insert(&mut self, coord: Coord, cell: CellKey) -> bool {
        match self.sites.entry(coord) {
            Entry::Vacant(entry) => {
                entry.insert(cell);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Claim the site for `cell`, returning the displaced occupant if any.
    pub fn place(&mut self, coord: Coord, cell: CellKey) -> Option<CellKey> {
        self.sites.insert(coord, cell)
    }

    pub fn remove(&mut self, coord: Coord) -> Option<CellKey> {
        self.sites.remove(&coord)
    }
}

/// Population of cells on a lattice with its scheduler and recorders.
pub struct Tissue {
    lattice: Lattice,
    strategy: InsertStrategy,
    cell_params: CellParams,
    driver_distr: DriverDistributions,
    /// Extant cells; iteration order is deterministic for a fixed history
    /// of inserts and removals, which keeps seeded runs reproducible.
    cells: SlotMap<CellKey, Cell>,
    occupancy: Occupancy,
    queue: EventQueue,
    time: f64,
    /// Incremented when a new cell is born; ids are never reused.
    id_tail: u32,
    i_snapshot: u32,
    snapshot_interval: f64,
    /// Every archived cell: division snapshots and the dead.
    history: Vec<Rc<Cell>>,
    snapshots: Vec<SnapshotRow>,
    drivers: Vec<DriverRecord>,
    rng: SmallRng,
}

impl fmt::Debug for Tissue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tissue")
            .field("kind", &self.lattice.kind())
            .field("dimensions", &self.lattice.dimensions())
            .field("size", &self.cells.len())
            .field("time", &self.time)
            .field("id_tail", &self.id_tail)
            .finish()
    }
}

impl Tissue {
    /// Build a tissue and pack `initial_size` founder-lineage cells into a
    /// ball around the origin by synthetic zero-time divisions.
    pub fn new(config: TissueConfig) -> Result<Self, TissueError> {
        let lattice = Lattice::new(config.coord, config.dimensions)?;
        let strategy =
            InsertStrategy::resolve(config.local_density_effect, config.displacement_path)?;
        let driver_distr = DriverDistributions::new(&config.driver)?;
        let rng = match config.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        };
        let mut tissue = Self {
            lattice,
            strategy,
            cell_params: config.cell,
            driver_distr,
            cells: SlotMap::with_key(),
            occupancy: Occupancy::default(),
            queue: EventQueue::default(),
            time: 0.0,
            id_tail: 0,
            i_snapshot: 1,
            snapshot_interval: config.snapshot_interval,
            history: Vec::new(),
            snapshots: Vec::new(),
            drivers: Vec::new(),
            rng,
        };
        tissue.seed(config.initial_size.max(1), Rc::new(config.init_rates));
        Ok(tissue)
    }

    fn seed(&mut self, initial_size: usize, rates: Rc<EventRates>) {
        let coords = self.lattice.sphere(initial_size);
        self.history.reserve(initial_size * 2);
        self.id_tail += 1;
        let founder = Cell::new(coords[0], self.id_tail, rates, &self.cell_params);
        let key = self.cells.insert(founder);
        self.occupancy.try_insert(coords[0], key);
        'packing: while self.cells.len() < initial_size {
            let mothers: Vec<CellKey> = self.cells.keys().collect();
            for mother in mothers {
                let mut daughter = self.cells[mother].daughter(&self.cell_params, &mut self.rng);
                let archived = {
                    let mut snapshot = self.cells[mother].clone();
                    snapshot.set_time_of_death(0.0);
                    Rc::new(snapshot)
                };
                self.history.push(Rc::clone(&archived));
                self.id_tail += 1;
                self.cells[mother].set_time_of_birth(0.0, self.id_tail, &archived);
                self.id_tail += 1;
                daughter.set_time_of_birth(0.0, self.id_tail, &archived);
                daughter.set_coord(coords[self.cells.len()]);
                let coord = daughter.coord();
                let key = self.cells.insert(daughter);
                self.occupancy.try_insert(coord, key);
                if self.cells.len() >= initial_size {
                    break 'packing;
                }
            }
        }
        let extant: Vec<CellKey> = self.cells.keys().collect();
        for key in extant {
            self.queue_push(key);
        }
    }

    /// Number of extant cells.
    #[must_use]
    pub fn size(&self) -> usize {
        self.cells.len()
    }

    /// Current simulated time.
    #[must_use]
    pub const fn time(&self) -> f64 {
        self.time
    }

    #[must_use]
    pub const fn dimensions(&self) -> u32 {
        self.lattice.dimensions()
    }

    #[must_use]
    pub const fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    /// Largest id issued so far.
    #[must_use]
    pub const fn id_tail(&self) -> u32 {
        self.id_tail
    }

    /// Scheduled entries; equals [`Tissue::size`] between events.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Occupied sites; equals [`Tissue::size`] between events.
    #[must_use]
    pub fn occupancy_len(&self) -> usize {
        self.occupancy.len()
    }

    /// Extant cells in deterministic arena order.
    pub fn extant(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    /// Archived cells in recording order.
    pub fn history(&self) -> impl Iterator<Item = &Cell> {
        self.history.iter().map(Rc::as_ref)
    }

    /// Every recorded cell: history first, then the extant population.
    pub fn population(&self) -> impl Iterator<Item = &Cell> {
        self.history().chain(self.extant())
    }

    #[must_use]
    pub fn snapshots(&self) -> &[SnapshotRow] {
        &self.snapshots
    }

    #[must_use]
    pub fn drivers(&self) -> &[DriverRecord] {
        &self.drivers
    }

    /// Run the event loop until a bound in `bounds` is hit. Returns `true`
    /// on a size or time exit, `false` when the population went extinct.
    pub fn grow(&mut self, bounds: GrowthBounds) -> bool {
        let GrowthBounds {
            max_size,
            max_time,
            mut recording_early_growth,
            mut mutation_timing,
        } = bounds;
        if recording_early_growth > 0 {
            self.append_snapshot();
        }
        if let Some(total) = max_size.checked_mul(2) {
            self.history.reserve(total.saturating_sub(self.history.len()));
        }
        let mut time_snapshot = f64::from(self.i_snapshot) * self.snapshot_interval;
        let mut success = false;
        let mut dispatched: u64 = 0;
        loop {
            let Some((event_time, key)) = self.queue.peek() else {
                break;
            };
            self.time = event_time;
            if self.time > max_time || self.cells.len() >= max_size {
                success = true;
                break;
            }
            if self.time > time_snapshot {
                self.append_snapshot();
                self.i_snapshot += 1;
                time_snapshot = f64::from(self.i_snapshot) * self.snapshot_interval;
            }
            self.queue.pop();
            dispatched += 1;
            if dispatched.is_multiple_of(1_000) {
                debug!(size = self.cells.len(), time = self.time, "growth progress");
            }
            match self.cells[key].next_event() {
                Event::Birth => {
                    let daughter = self.cells[key].daughter(&self.cell_params, &mut self.rng);
                    if let Some(daughter_key) = self.insert_daughter(daughter) {
                        let archived = {
                            let mut snapshot = self.cells[key].clone();
                            snapshot.set_time_of_death(self.time);
                            Rc::new(snapshot)
                        };
                        self.history.push(Rc::clone(&archived));
                        self.id_tail += 1;
                        self.cells[key].set_time_of_birth(self.time, self.id_tail, &archived);
                        self.id_tail += 1;
                        self.cells[daughter_key].set_time_of_birth(
                            self.time,
                            self.id_tail,
                            &archived,
                        );
                        let hits = self.cells[key].mutate(&self.driver_distr, &mut self.rng);
                        self.drivers.extend(hits);
                        let hits =
                            self.cells[daughter_key].mutate(&self.driver_distr, &mut self.rng);
                        self.drivers.extend(hits);
                        if self.cells.len() > mutation_timing {
                            // Injected once per run.
                            mutation_timing = usize::MAX;
                            let hits = self.cells[daughter_key]
                                .force_mutate(&self.driver_distr, &mut self.rng);
                            self.drivers.extend(hits);
                        }
                        self.queue_push(key);
                        self.queue_push(daughter_key);
                    } else {
                        // Crowded out; the mother simply tries again later.
                        self.queue_push(key);
                        continue;
                    }
                }
                Event::Death => {
                    if let Some(mut cell) = self.cells.remove(key) {
                        cell.set_time_of_death(self.time);
                        self.occupancy.remove(cell.coord());
                        self.history.push(Rc::new(cell));
                    }
                    if self.cells.is_empty() {
                        break;
                    }
                }
                Event::Migration => {
                    self.migrate(key);
                    self.queue_push(key);
                }
            }
            if self.cells.len() < recording_early_growth {
                self.append_snapshot();
            } else {
                // Cell death must not re-trigger early-growth recording.
                recording_early_growth = 0;
            }
        }
        debug!(
            size = self.cells.len(),
            time = self.time,
            success,
            "growth finished"
        );
        success
    }

    /// Moran-like turnover: raise δ to β on every extant cell, reset the
    /// migration dwell, and run for `duration` more simulated time.
    pub fn plateau(&mut self, duration: f64) {
        info!(duration, size = self.cells.len(), "entering plateau");
        self.queue.clear();
        let extant: Vec<CellKey> = self.cells.keys().collect();
        for key in extant {
            self.cells[key].increase_death_rate();
            self.cells[key].set_elapsed(0.0);
            self.queue_push(key);
        }
        self.grow(GrowthBounds {
            max_time: self.time + duration,
            ..GrowthBounds::default()
        });
    }

    /// Impose cycle-dependent death on all but `num_resistant` cells and
    /// run until the population shrinks out or regrows past a margin.
    pub fn treatment(&mut self, death_prob: f64, num_resistant: usize) {
        info!(
            death_prob,
            num_resistant,
            size = self.cells.len(),
            "applying treatment"
        );
        let original_size = self.cells.len();
        // Materialize scheduler order before shuffling for reproducibility.
        let mut cells: Vec<CellKey> = self.queue.cells_in_order().collect();
        cells.shuffle(&mut self.rng);
        for key in cells.into_iter().skip(num_resistant) {
            self.cells[key].set_cycle_dependent_death(death_prob, &mut self.rng);
        }
        let margin = 10 * num_resistant + 10;
        self.grow(GrowthBounds {
            max_size: original_size + margin,
            ..GrowthBounds::default()
        });
    }

    /// Positional contribution to the birth rate. Uniform for now; this is
    /// the single hook where microenvironment effects would enter.
    #[allow(clippy::unused_self)]
    fn positional_value(&self, _coord: Coord) -> f64 {
        1.0
    }

    fn queue_push(&mut self, key: CellKey) {
        let positional = self.positional_value(self.cells[key].coord());
        let dt = self.cells[key].delta_time(positional, &self.cell_params, &mut self.rng);
        self.queue.push(self.time + dt, key);
    }

    fn append_snapshot(&mut self) {
        let time = self.time;
        for cell in self.cells.values() {
            self.snapshots.push(SnapshotRow {
                time,
                cell: cell.clone(),
            });
        }
    }

    /// Place a daughter according to the configured strategy. `None` means
    /// the division was refused by the local-density rule.
    fn insert_daughter(&mut self, daughter: Cell) -> Option<CellKey> {
        match self.strategy {
            InsertStrategy::ConstRandom => {
                let dir = self.lattice.random_direction(&mut self.rng);
                Some(self.push(daughter, dir))
            }
            InsertStrategy::ConstMinDrag => Some(self.push_minimum_drag(daughter)),
            InsertStrategy::ConstMinStraight => {
                let dir = self.to_nearest_empty(daughter.coord(), DIRECTION_SEARCH_MAX);
                Some(self.push(daughter, dir))
            }
            InsertStrategy::ConstRoulette => {
                let dir = self.roulette_direction(daughter.coord());
                Some(self.push(daughter, dir))
            }
            InsertStrategy::ConstStroll => {
                let dir = self.lattice.random_direction(&mut self.rng);
                Some(self.stroll(daughter, dir))
            }
            InsertStrategy::StepRandom => {
                if self.num_empty_neighbors(daughter.coord()) == 0 {
                    return None;
                }
                let dir = self.lattice.random_direction(&mut self.rng);
                Some(self.push(daughter, dir))
            }
            InsertStrategy::StepMinDrag => {
                let key = self.cells.insert(daughter);
                if self.insert_adjacent(key) {
                    Some(key)
                } else {
                    self.cells.remove(key);
                    None
                }
            }
            InsertStrategy::LinearRandom => {
                let prob = self.proportion_empty_neighbors(daughter.coord());
                if self.rng.random::<f64>() < prob {
                    let dir = self.lattice.random_direction(&mut self.rng);
                    Some(self.push(daughter, dir))
                } else {
                    None
                }
            }
            InsertStrategy::LinearMinDrag => {
                let target = self.lattice.random_neighbor(daughter.coord(), &mut self.rng);
                let mut daughter = daughter;
                daughter.set_coord(target);
                let key = self.cells.insert(daughter);
                if self.occupancy.try_insert(target, key) {
                    Some(key)
                } else {
                    self.cells.remove(key);
                    None
                }
            }
        }
    }

    /// Insert `daughter` one step along `dir`, pushing the chain of
    /// displaced residents outward until one lands on an empty site.
    fn push(&mut self, daughter: Cell, dir: Coord) -> CellKey {
        let key = self.cells.insert(daughter);
        let mut moving = key;
        loop {
            let next = self.cells[moving].coord() + dir;
            self.cells[moving].set_coord(next);
            match self.occupancy.place(next, moving) {
                None => break,
                Some(displaced) => moving = displaced,
            }
        }
        key
    }

    /// As [`Tissue::push`] but re-aimed at the nearest empty site on every
    /// step, producing the globally shortest chain.
    fn push_minimum_drag(&mut self, daughter: Cell) -> CellKey {
        let key = self.cells.insert(daughter);
        let mut moving = key;
        loop {
            let current = self.cells[moving].coord();
            let dir = self.to_nearest_empty(current, DIRECTION_SEARCH_MAX);
            let next = current + dir;
            self.cells[moving].set_coord(next);
            match self.occupancy.place(next, moving) {
                None => break,
                Some(displaced) => moving = displaced,
            }
        }
        key
    }

    /// Walk along `dir`, trying to slip the moving cell into any free
    /// neighbor at each step; swap with the resident when all are full.
    fn stroll(&mut self, daughter: Cell, dir: Coord) -> CellKey {
        let key = self.cells.insert(daughter);
        let mut moving = key;
        while !self.insert_adjacent(moving) {
            let next = self.cells[moving].coord() + dir;
            self.cells[moving].set_coord(next);
            match self.occupancy.place(next, moving) {
                None => break,
                Some(displaced) => moving = displaced,
            }
        }
        key
    }

    /// Place the cell at a random free neighbor; fails iff none exist.
    fn insert_adjacent(&mut self, key: CellKey) -> bool {
        let mut neighbors = self.lattice.neighbors(self.cells[key].coord());
        neighbors.shuffle(&mut self.rng);
        for coord in neighbors {
            if self.occupancy.try_insert(coord, key) {
                self.cells[key].set_coord(coord);
                return true;
            }
        }
        false
    }

    /// Move a cell to a random neighbor, swapping positions with the
    /// resident when the target is occupied.
    fn migrate(&mut self, key: CellKey) {
        let origin = self.cells[key].coord();
        self.occupancy.remove(origin);
        let target = self.lattice.random_neighbor(origin, &mut self.rng);
        if let Some(resident) = self.occupancy.place(target, key) {
            self.cells[resident].set_coord(origin);
            self.occupancy.try_insert(origin, resident);
        }
        self.cells[key].set_coord(target);
    }

    /// Occupied sites along the ray from `current` in `dir` before the
    /// first empty one; a free neighbor counts zero.
    fn steps_to_empty(&self, mut current: Coord, dir: Coord) -> usize {
        let mut steps = 0;
        loop {
            current += dir;
            if self.occupancy.is_vacant(current) {
                return steps;
            }
            steps += 1;
        }
    }

    /// Direction whose ray reaches an empty site in the fewest steps,
    /// probing a shuffled subset of at most `search_max` directions.
    fn to_nearest_empty(&mut self, current: Coord, search_max: usize) -> Coord {
        let mut directions = self.lattice.directions().to_vec();
        directions.shuffle(&mut self.rng);
        directions.truncate(search_max);
        let mut best = directions[0];
        let mut least = usize::MAX;
        for dir in directions {
            let steps = self.steps_to_empty(current, dir);
            if steps < least {
                least = steps;
                best = dir;
            }
        }
        best
    }

    /// Direction drawn with probability proportional to the reciprocal
    /// chain length; a free neighbor short-circuits the draw.
    fn roulette_direction(&mut self, current: Coord) -> Coord {
        let mut directions = self.lattice.directions().to_vec();
        directions.shuffle(&mut self.rng);
        let mut weights = Vec::with_capacity(directions.len());
        for &dir in &directions {
            let steps = self.steps_to_empty(current, dir);
            if steps == 0 {
                return dir;
            }
            weights.push(1.0 / steps as f64);
        }
        match WeightedIndex::new(&weights) {
            Ok(roulette) => directions[roulette.sample(&mut self.rng)],
            Err(_) => directions[0],
        }
    }

    fn num_empty_neighbors(&self, coord: Coord) -> usize {
        self.lattice
            .directions()
            .iter()
            .filter(|&&dir| self.occupancy.is_vacant(coord + dir))
            .count()
    }

    fn proportion_empty_neighbors(&self, coord: Coord) -> f64 {
        self.num_empty_neighbors(coord) as f64 / self.lattice.max_neighbors() as f64
    }

    /// Uniform sample of extant cells without replacement.
    pub fn sample_random(&mut self, n: usize) -> Vec<Cell> {
        let pool: Vec<&Cell> = self.cells.values().collect();
        let amount = n.min(pool.len());
        index::sample(&mut self.rng, pool.len(), amount)
            .iter()
            .map(|i| pool[i].clone())
            .collect()
    }

    /// Uniform sample from the z = 0 cross section. On a planar lattice
    /// every cell qualifies.
    pub fn sample_section(&mut self, n: usize) -> Vec<Cell> {
        let pool: Vec<&Cell> = self
            .cells
            .values()
            .filter(|cell| cell.coord().z == 0)
            .collect();
        let amount = n.min(pool.len());
        index::sample(&mut self.rng, pool.len(), amount)
            .iter()
            .map(|i| pool[i].clone())
            .collect()
    }

    /// The `n` extant cells closest to `center` in Euclidean distance.
    #[must_use]
    pub fn sample_bulk(&self, center: Coord, n: usize) -> Vec<Cell> {
        let mut pool: Vec<&Cell> = self.cells.values().collect();
        pool.sort_by_key(|cell| {
            (
                OrderedFloat(self.lattice.euclidean_distance(cell.coord() - center)),
                cell.id(),
            )
        });
        pool.into_iter().take(n).cloned().collect()
    }

    /// Medoids of an `n`-cluster partitioning of the extant coordinates.
    pub fn sample_medoids(&mut self, n: usize) -> Vec<Cell> {
        let coords: Vec<Coord> = self.cells.values().map(Cell::coord).collect();
        if coords.is_empty() || n == 0 {
            return Vec::new();
        }
        let medoids = pam_medoids(&self.lattice, &coords, n.min(coords.len()), &mut self.rng);
        let pool: Vec<&Cell> = self.cells.values().collect();
        medoids.into_iter().map(|i| pool[i].clone()).collect()
    }

    /// Sprinkle neutral mutations over the recorded genealogy: Poisson many
    /// uniform draws from the issued ids, optionally preceded by one
    /// guaranteed mutation per division. Duplicates are distinct sites.
    pub fn generate_neutral_mutations(&mut self, mu: f64, ensure_nonzero: bool) -> Vec<u32> {
        let lambda = mu * f64::from(self.id_tail);
        let num_mutants = if lambda > 0.0 {
            Poisson::new(lambda)
                .map(|poisson| poisson.sample(&mut self.rng) as u64)
                .unwrap_or(0)
        } else {
            0
        };
        let mut mutants = Vec::with_capacity(
            num_mutants as usize + if ensure_nonzero { self.id_tail as usize } else { 0 },
        );
        if ensure_nonzero {
            mutants.extend(1..=self.id_tail);
        }
        for _ in 0..num_mutants {
            mutants.push(self.rng.random_range(1..=self.id_tail));
        }
        mutants
    }

    /// TSV of genealogical, graph, and Euclidean distances over `npair`
    /// random disjoint pairs.
    pub fn pairwise_distance(&mut self, npair: usize) -> String {
        let mut out = String::from("genealogy\tgraph\teuclidean\n");
        if npair == 0 {
            return out;
        }
        let mut samples = self.sample_random(2 * npair);
        samples.shuffle(&mut self.rng);
        for pair in samples.chunks_exact(2) {
            let diff = pair[0].coord() - pair[1].coord();
            let _ = writeln!(
                out,
                "{}\t{}\t{}",
                pair[0].branch_length(&pair[1]),
                self.lattice.graph_distance(diff),
                self.lattice.euclidean_distance(diff),
            );
        }
        out
    }
}

/// ms-like segregating-site block for `samples` given mutant ids. Sites
/// fixed or absent in the sample are dropped.
#[must_use]
pub fn segregating_sites(samples: &[Cell], mutants: &[u32]) -> String {
    let sample_size = samples.len();
    let flags: Vec<Vec<u8>> = samples
        .iter()
        .map(|cell| cell.has_mutations_of(mutants))
        .collect();
    let mut sites: Vec<Vec<u8>> = Vec::new();
    for site in 0..mutants.len() {
        let column: Vec<u8> = flags.iter().map(|row| row[site]).collect();
        let daf: usize = column.iter().map(|&v| usize::from(v)).sum();
        if daf > 0 && daf < sample_size {
            sites.push(column);
        }
    }
    let s = sites.len();
    let mut out = String::new();
    let _ = write!(out, "\n//\nsegsites: {s}\n");
    if s > 0 {
        out.push_str("positions: ");
        out.push_str(&vec!["0"; s].join(" "));
        out.push('\n');
        for sample in 0..sample_size {
            for column in &sites {
                out.push(if column[sample] == 1 { '1' } else { '0' });
            }
            out.push('\n');
        }
    } else {
        out.push('\n');
    }
    out
}

/// Partitioning-around-medoids over lattice coordinates: random build,
/// then greedy swaps until the total within-cluster distance stops
/// improving.
fn pam_medoids(lattice: &Lattice, points: &[Coord], k: usize, rng: &mut SmallRng) -> Vec<usize> {
    let total = points.len();
    let dist = |i: usize, j: usize| lattice.euclidean_distance(points[i] - points[j]);
    let cost = |medoids: &[usize]| -> f64 {
        (0..total)
            .map(|i| {
                medoids
                    .iter()
                    .map(|&m| dist(i, m))
                    .fold(f64::INFINITY, f64::min)
            })
            .sum()
    };
    let mut medoids: Vec<usize> = index::sample(rng, total, k).into_vec();
    let mut best_cost = cost(&medoids);
    loop {
        let mut improved = false;
        for slot in 0..k {
            for candidate in 0..total {
                if medoids.contains(&candidate) {
                    continue;
                }
                let previous = medoids[slot];
                medoids[slot] = candidate;
                let swapped = cost(&medoids);
                if swapped + 1e-12 < best_cost {
                    best_cost = swapped;
                    improved = true;
                } else {
                    medoids[slot] = previous;
                }
            }
        }
        if !improved {
            break;
        }
    }
    medoids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng(seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }

    fn founder(id: u32, rates: EventRates) -> Cell {
        Cell::new(
            Coord::ORIGIN,
            id,
            Rc::new(rates),
            &CellParams::default(),
        )
    }

    #[test]
    fn bernoulli_short_circuits_without_consuming_the_stream() {
        let mut rng_a = rng(11);
        let rng_b = rng_a.clone();
        assert!(!bernoulli(0.0, &mut rng_a));
        assert!(bernoulli(1.0, &mut rng_a));
        assert!(!bernoulli(-0.5, &mut rng_a));
        assert!(bernoulli(2.0, &mut rng_a));
        let mut rng_b = rng_b;
        assert_eq!(rng_a.random::<u64>(), rng_b.random::<u64>());
    }

    #[test]
    fn rates_are_shared_until_a_driver_hit() {
        let mut rng = rng(3);
        let params = CellParams::default();
        let mother = founder(1, EventRates::default());
        let mut daughter = mother.daughter(&params, &mut rng);
        assert!(Rc::ptr_eq(&mother.rates, &daughter.rates));

        let drivers = DriverDistributions::new(&DriverParams {
            rate_birth: 1.0,
            mean_birth: 0.5,
            ..DriverParams::default()
        })
        .expect("drivers");
        let hits = daughter.mutate(&drivers, &mut rng);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, DriverKind::Birth);
        assert!((hits[0].coef - 0.5).abs() < 1e-12);
        assert!(!Rc::ptr_eq(&mother.rates, &daughter.rates));
        assert!((daughter.birth_rate() - 1.5).abs() < 1e-12);
        assert!((mother.birth_rate() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn force_mutate_perturbs_all_three_traits() {
        let mut rng = rng(4);
        let mut cell = founder(
            7,
            EventRates {
                birth_rate: 1.0,
                death_rate: 0.5,
                death_prob: 0.2,
                migra_rate: 0.1,
            },
        );
        let drivers = DriverDistributions::new(&DriverParams {
            mean_birth: 0.1,
            mean_death: -0.2,
            mean_migra: 0.3,
            ..DriverParams::default()
        })
        .expect("drivers");
        let hits = cell.force_mutate(&drivers, &mut rng);
        let kinds: Vec<DriverKind> = hits.iter().map(|hit| hit.kind).collect();
        assert_eq!(
            kinds,
            vec![DriverKind::Birth, DriverKind::Death, DriverKind::Migra]
        );
        assert!(hits.iter().all(|hit| hit.cell_id == 7));
        assert!((cell.birth_rate() - 1.1).abs() < 1e-12);
        assert!((cell.death_rate() - 0.4).abs() < 1e-12);
        assert!((cell.death_prob() - 0.16).abs() < 1e-12);
        assert!((cell.migra_rate() - 0.13).abs() < 1e-12);
    }

    #[test]
    fn delta_time_without_capacity_falls_back_to_death() {
        let mut rng = rng(5);
        let params = CellParams {
            max_proliferation_capacity: 0,
            ..CellParams::default()
        };
        let mut cell = Cell::new(
            Coord::ORIGIN,
            1,
            Rc::new(EventRates {
                birth_rate: 1.0,
                death_rate: 2.0,
                death_prob: 0.0,
                migra_rate: 0.0,
            }),
            &params,
        );
        let dt = cell.delta_time(1.0, &params, &mut rng);
        assert_eq!(cell.next_event(), Event::Death);
        assert!(dt.is_finite() && dt > 0.0);
    }

    #[test]
    fn delta_time_migration_accumulates_elapsed() {
        let mut rng = rng(6);
        let params = CellParams::default();
        let mut cell = founder(
            1,
            EventRates {
                birth_rate: 1e-6,
                death_rate: 0.0,
                death_prob: 0.0,
                migra_rate: 1e6,
            },
        );
        let mut total = 0.0;
        for _ in 0..4 {
            let dt = cell.delta_time(1.0, &params, &mut rng);
            assert_eq!(cell.next_event(), Event::Migration);
            total += dt;
        }
        assert!((cell.elapsed - total).abs() < 1e-12);
    }

    #[test]
    fn cycle_dependent_death_converts_birth_into_death() {
        let mut rng = rng(7);
        let params = CellParams::default();
        let mut cell = founder(
            1,
            EventRates {
                birth_rate: 1.0,
                death_rate: 0.0,
                death_prob: 1.0,
                migra_rate: 0.0,
            },
        );
        let dt = cell.delta_time(1.0, &params, &mut rng);
        assert_eq!(cell.next_event(), Event::Death);
        assert!(dt.is_finite());
        assert_eq!(cell.elapsed, 0.0);
    }

    fn three_generation_family() -> (Cell, Cell, Cell) {
        let mut rng = rng(8);
        let params = CellParams::default();
        let root = founder(1, EventRates::default());
        let root_snapshot = Rc::new(root.clone());
        let mut a = root.daughter(&params, &mut rng);
        a.set_time_of_birth(1.0, 2, &root_snapshot);
        let mut b = root.daughter(&params, &mut rng);
        b.set_time_of_birth(1.0, 3, &root_snapshot);
        let a_snapshot = Rc::new(a.clone());
        let mut c = a.daughter(&params, &mut rng);
        c.set_time_of_birth(2.0, 4, &a_snapshot);
        (a, b, c)
    }

    #[test]
    fn traceback_collects_ancestor_ids() {
        let (a, b, c) = three_generation_family();
        assert_eq!(a.traceback(), HashSet::from([1, 2]));
        assert_eq!(b.traceback(), HashSet::from([1, 3]));
        assert_eq!(c.traceback(), HashSet::from([1, 2, 4]));
        assert_eq!(c.has_mutations_of(&[2, 3]), vec![1, 0]);
    }

    #[test]
    fn branch_length_is_symmetric_through_the_mrca() {
        let (a, b, c) = three_generation_family();
        assert_eq!(a.branch_length(&a), 0);
        assert_eq!(a.branch_length(&b), 2);
        assert_eq!(b.branch_length(&a), 2);
        assert_eq!(c.branch_length(&b), 3);
        assert_eq!(b.branch_length(&c), 3);
    }

    #[test]
    fn nonstem_division_spends_capacity() {
        let mut rng = rng(9);
        let params = CellParams {
            prob_symmetric_division: 0.0,
            ..CellParams::default()
        };
        let root = founder(1, EventRates::default());
        let snapshot = Rc::new(root.clone());
        let mut daughter = root.daughter(&params, &mut rng);
        assert_eq!(daughter.cell_type(), CellType::Nonstem);
        daughter.set_time_of_birth(1.0, 2, &snapshot);
        assert_eq!(
            daughter.proliferation_capacity(),
            params.max_proliferation_capacity - 1
        );
    }

    #[test]
    fn queue_orders_by_time_then_insertion() {
        let mut cells: SlotMap<CellKey, u8> = SlotMap::with_key();
        let first = cells.insert(0);
        let second = cells.insert(1);
        let third = cells.insert(2);
        let mut queue = EventQueue::default();
        queue.push(5.0, first);
        queue.push(3.0, second);
        queue.push(5.0, third);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek(), Some((3.0, second)));
        assert_eq!(queue.pop(), Some((3.0, second)));
        assert_eq!(queue.pop(), Some((5.0, first)));
        assert_eq!(queue.pop(), Some((5.0, third)));
        assert!(queue.is_empty());
    }

    #[test]
    fn occupancy_enforces_one_cell_per_site() {
        let mut cells: SlotMap<CellKey, u8> = SlotMap::with_key();
        let first = cells.insert(0);
        let second = cells.insert(1);
        let site = Coord::new(1, 2, 3);
        let mut occupancy = Occupancy::default();
        assert!(occupancy.try_insert(site, first));
        assert!(!occupancy.try_insert(site, second));
        assert_eq!(occupancy.occupant(site), Some(first));
        assert_eq!(occupancy.place(site, second), Some(first));
        assert_eq!(occupancy.remove(site), Some(second));
        assert!(occupancy.is_vacant(site));
    }

    #[test]
    fn incompatible_policies_are_rejected_with_the_valid_listing() {
        let config = TissueConfig {
            local_density_effect: LocalDensity::Step,
            displacement_path: DisplacementPath::Stroll,
            ..TissueConfig::default()
        };
        let err = Tissue::new(config).expect_err("policy must be rejected");
        let message = err.to_string();
        assert!(message.contains("-L step"));
        assert!(message.contains("stroll"));
        assert!(message.contains("mindrag"));
    }

    #[test]
    fn seeding_packs_a_ball_and_records_the_genealogy() {
        let config = TissueConfig {
            initial_size: 10,
            dimensions: 2,
            rng_seed: Some(21),
            ..TissueConfig::default()
        };
        let tissue = Tissue::new(config).expect("tissue");
        assert_eq!(tissue.size(), 10);
        assert_eq!(tissue.occupancy_len(), 10);
        assert_eq!(tissue.queue_len(), 10);
        // One archived snapshot per synthetic division.
        assert_eq!(tissue.history().count(), 9);
        assert_eq!(tissue.id_tail(), 19);
        let coords: HashSet<Coord> = tissue.extant().map(Cell::coord).collect();
        assert_eq!(coords.len(), 10);
        for cell in tissue.extant() {
            assert!(cell.time_of_death().is_none());
            assert!(cell.ancestor_id() < cell.id());
        }
    }

    #[test]
    fn step_density_refuses_a_surrounded_mother() {
        // sphere(9) on a planar Moore lattice is the full 3x3 block, so the
        // founder at the origin has no empty neighbor.
        let config = TissueConfig {
            initial_size: 9,
            dimensions: 2,
            local_density_effect: LocalDensity::Step,
            displacement_path: DisplacementPath::MinDrag,
            rng_seed: Some(5),
            ..TissueConfig::default()
        };
        let mut tissue = Tissue::new(config).expect("tissue");
        let center = tissue
            .extant()
            .find(|cell| cell.coord() == Coord::ORIGIN)
            .expect("center cell")
            .clone();
        assert_eq!(tissue.num_empty_neighbors(Coord::ORIGIN), 0);
        let daughter = {
            let params = tissue.cell_params;
            center.daughter(&params, &mut tissue.rng)
        };
        assert!(tissue.insert_daughter(daughter).is_none());
        assert_eq!(tissue.size(), 9);
        assert_eq!(tissue.occupancy_len(), 9);
    }

    #[test]
    fn push_displaces_a_chain_outward() {
        let config = TissueConfig {
            initial_size: 2,
            dimensions: 2,
            coord: LatticeKind::Neumann,
            rng_seed: Some(13),
            ..TissueConfig::default()
        };
        let mut tissue = Tissue::new(config).expect("tissue");
        let occupied: Vec<Coord> = tissue.extant().map(Cell::coord).collect();
        let mother = tissue
            .extant()
            .find(|cell| cell.coord() == occupied[0])
            .expect("mother")
            .clone();
        let dir = occupied[1] - occupied[0];
        let daughter = {
            let params = tissue.cell_params;
            mother.daughter(&params, &mut tissue.rng)
        };
        tissue.push(daughter, dir);
        assert_eq!(tissue.size(), 3);
        assert_eq!(tissue.occupancy_len(), 3);
        let coords: HashSet<Coord> = tissue.extant().map(Cell::coord).collect();
        assert_eq!(coords.len(), 3, "chain must not stack cells");
        assert!(coords.contains(&(occupied[0] + dir)));
        assert!(coords.contains(&(occupied[1] + dir)), "resident pushed on");
    }

    #[test]
    fn migrate_swaps_with_the_resident() {
        let config = TissueConfig {
            initial_size: 2,
            dimensions: 2,
            coord: LatticeKind::Neumann,
            rng_seed: Some(17),
            ..TissueConfig::default()
        };
        let mut tissue = Tissue::new(config).expect("tissue");
        let before: HashSet<Coord> = tissue.extant().map(Cell::coord).collect();
        let keys: Vec<CellKey> = tissue.cells.keys().collect();
        for key in keys {
            tissue.migrate(key);
            assert_eq!(tissue.occupancy_len(), 2);
            let after: HashSet<Coord> = tissue.extant().map(Cell::coord).collect();
            assert_eq!(after.len(), 2);
            for coord in &after {
                assert!(
                    before.contains(coord)
                        || before
                            .iter()
                            .any(|b| tissue.lattice.graph_distance(*coord - *b) == 1)
                );
            }
        }
    }

    #[test]
    fn neutral_mutations_cover_every_division_when_ensured() {
        let config = TissueConfig {
            initial_size: 4,
            dimensions: 2,
            rng_seed: Some(2),
            ..TissueConfig::default()
        };
        let mut tissue = Tissue::new(config).expect("tissue");
        assert_eq!(tissue.id_tail(), 7);
        let ensured = tissue.generate_neutral_mutations(0.0, true);
        assert_eq!(ensured, (1..=7).collect::<Vec<u32>>());
        let sparse = tissue.generate_neutral_mutations(0.0, false);
        assert!(sparse.is_empty());
        let dense = tissue.generate_neutral_mutations(10.0, false);
        assert!(dense.iter().all(|&id| (1..=7).contains(&id)));
    }

    #[test]
    fn segregating_sites_drops_fixed_and_absent_sites() {
        let (a, b, c) = three_generation_family();
        let samples = vec![a, b, c];
        // id 1 is ancestral to everyone (fixed), id 2 segregates, id 99 is
        // absent.
        let block = segregating_sites(&samples, &[1, 2, 99]);
        assert!(block.contains("segsites: 1\n"));
        assert!(block.contains("positions: 0\n"));
        let rows: Vec<&str> = block.trim_end().lines().rev().take(3).collect();
        let digits: HashSet<&str> = rows.into_iter().collect();
        assert_eq!(digits, HashSet::from(["1", "0"]));
    }

    #[test]
    fn segregating_sites_handles_the_empty_block() {
        let (a, b, _) = three_generation_family();
        let block = segregating_sites(&[a, b], &[1]);
        assert_eq!(block, "\n//\nsegsites: 0\n\n");
    }

    #[test]
    fn known_tree_yields_balanced_segsites_matrix() {
        // Four sampled leaves, two subtrees labeled by mutants 2 and 3.
        let mut rng = rng(10);
        let params = CellParams::default();
        let root = founder(1, EventRates::default());
        let root_snapshot = Rc::new(root.clone());
        let mut left = root.daughter(&params, &mut rng);
        left.set_time_of_birth(1.0, 2, &root_snapshot);
        let mut right = root.daughter(&params, &mut rng);
        right.set_time_of_birth(1.0, 3, &root_snapshot);
        let left_snapshot = Rc::new(left.clone());
        let right_snapshot = Rc::new(right.clone());
        let mut samples = Vec::new();
        for (i, snapshot) in [(0u32, &left_snapshot), (2, &right_snapshot)] {
            for j in 0..2 {
                let mut leaf = root.daughter(&params, &mut rng);
                leaf.set_time_of_birth(2.0, 4 + i + j, snapshot);
                samples.push(leaf);
            }
        }
        let block = segregating_sites(&samples, &[2, 3]);
        assert!(block.contains("segsites: 2\n"));
        let rows: Vec<&str> = block
            .lines()
            .filter(|line| line.chars().all(|c| c == '0' || c == '1') && !line.is_empty())
            .collect();
        assert_eq!(rows, vec!["10", "10", "01", "01"]);
        for site in 0..2 {
            let sum: u32 = rows
                .iter()
                .map(|row| row.as_bytes()[site] as u32 - u32::from(b'0'))
                .sum();
            assert!(sum > 0 && sum < 4);
        }
    }

    #[test]
    fn bulk_sampling_returns_the_nearest_cells() {
        let config = TissueConfig {
            initial_size: 25,
            dimensions: 2,
            rng_seed: Some(31),
            ..TissueConfig::default()
        };
        let tissue = Tissue::new(config).expect("tissue");
        let bulk = tissue.sample_bulk(Coord::ORIGIN, 5);
        assert_eq!(bulk.len(), 5);
        let max_sampled = bulk
            .iter()
            .map(|cell| tissue.lattice.euclidean_distance(cell.coord()))
            .fold(0.0f64, f64::max);
        let sampled: HashSet<u32> = bulk.iter().map(Cell::id).collect();
        for cell in tissue.extant() {
            if !sampled.contains(&cell.id()) {
                assert!(tissue.lattice.euclidean_distance(cell.coord()) >= max_sampled - 1e-9);
            }
        }
    }

    #[test]
    fn medoid_sampling_partitions_the_population() {
        let config = TissueConfig {
            initial_size: 30,
            dimensions: 2,
            rng_seed: Some(37),
            ..TissueConfig::default()
        };
        let mut tissue = Tissue::new(config).expect("tissue");
        let medoids = tissue.sample_medoids(3);
        assert_eq!(medoids.len(), 3);
        let ids: HashSet<u32> = medoids.iter().map(Cell::id).collect();
        assert_eq!(ids.len(), 3, "medoids must be distinct cells");
    }

    #[test]
    fn section_sampling_stays_in_the_plane() {
        let config = TissueConfig {
            initial_size: 40,
            rng_seed: Some(41),
            ..TissueConfig::default()
        };
        let mut tissue = Tissue::new(config).expect("tissue");
        let section = tissue.sample_section(8);
        assert!(!section.is_empty());
        assert!(section.iter().all(|cell| cell.coord().z == 0));
    }

    #[test]
    fn pairwise_distance_emits_one_row_per_pair() {
        let config = TissueConfig {
            initial_size: 16,
            dimensions: 2,
            rng_seed: Some(43),
            ..TissueConfig::default()
        };
        let mut tissue = Tissue::new(config).expect("tissue");
        let table = tissue.pairwise_distance(4);
        let lines: Vec<&str> = table.trim_end().lines().collect();
        assert_eq!(lines[0], "genealogy\tgraph\teuclidean");
        assert_eq!(lines.len(), 5);
        for line in &lines[1..] {
            assert_eq!(line.split('\t').count(), 3);
        }
        assert_eq!(tissue.pairwise_distance(0), "genealogy\tgraph\teuclidean\n");
    }

    #[test]
    fn tsv_row_has_thirteen_columns() {
        let cell = founder(1, EventRates::default());
        assert_eq!(CELL_TSV_HEADER.split('\t').count(), 13);
        assert_eq!(cell.tsv_row().split('\t').count(), 13);
        assert!(cell.tsv_row().starts_with("0\t0\t0\t1\t0\t"));
    }
}

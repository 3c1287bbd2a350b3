//! Lattice geometries backing neighborhood queries in the oncolat workspace.
//!
//! A [`Lattice`] couples a direction table with the distance functions of one
//! of three packings: von Neumann (axial neighbors), Moore (axial plus
//! diagonal), or hexagonal (triangular in 2-D, hcp-like in 3-D). All three
//! share one interface so the simulation core never branches on the variant.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub};
use thiserror::Error;

/// Errors emitted when constructing a lattice.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LatticeError {
    /// The simulator only supports planar and volumetric lattices.
    #[error("invalid dimensions {0}; choose 2 or 3")]
    InvalidDimensions(u32),
}

/// Integer lattice position. Planar lattices keep `z` pinned to zero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Coord {
    /// Lattice origin.
    pub const ORIGIN: Self = Self::new(0, 0, 0);

    /// Construct a new coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Squared Euclidean norm as an exact integer.
    #[must_use]
    pub const fn norm_sq(self) -> i64 {
        let (x, y, z) = (self.x as i64, self.y as i64, self.z as i64);
        x * x + y * y + z * z
    }
}

impl Add for Coord {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Coord {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Coord {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Neg for Coord {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Supported lattice packings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatticeKind {
    /// Axial neighbors only; Manhattan graph distance.
    Neumann,
    /// Axial plus diagonal neighbors; Chebyshev graph distance.
    #[default]
    Moore,
    /// Triangular packing in 2-D, ABA close packing in 3-D.
    #[serde(rename = "hex")]
    Hexagonal,
}

impl LatticeKind {
    /// Stable lowercase name used in configuration and the CLI.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Neumann => "neumann",
            Self::Moore => "moore",
            Self::Hexagonal => "hex",
        }
    }
}

impl fmt::Display for LatticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lattice geometry with its precomputed direction table.
#[derive(Debug, Clone)]
pub struct Lattice {
    kind: LatticeKind,
    dimensions: u32,
    directions: Vec<Coord>,
}

impl Lattice {
    /// Build the direction table for `kind` in `dimensions` ∈ {2, 3}.
    pub fn new(kind: LatticeKind, dimensions: u32) -> Result<Self, LatticeError> {
        if !(2..=3).contains(&dimensions) {
            return Err(LatticeError::InvalidDimensions(dimensions));
        }
        let directions = match kind {
            LatticeKind::Neumann => neumann_directions(dimensions),
            LatticeKind::Moore => moore_directions(dimensions),
            LatticeKind::Hexagonal => hexagonal_directions(dimensions),
        };
        Ok(Self {
            kind,
            dimensions,
            directions,
        })
    }

    /// The packing variant.
    #[must_use]
    pub const fn kind(&self) -> LatticeKind {
        self.kind
    }

    /// Number of spatial dimensions (2 or 3).
    #[must_use]
    pub const fn dimensions(&self) -> u32 {
        self.dimensions
    }

    /// Ordered unit displacements toward every neighbor.
    #[must_use]
    pub fn directions(&self) -> &[Coord] {
        &self.directions
    }

    /// Size of the neighborhood.
    #[must_use]
    pub fn max_neighbors(&self) -> usize {
        self.directions.len()
    }

    /// Draw one direction uniformly.
    pub fn random_direction<R: Rng + ?Sized>(&self, rng: &mut R) -> Coord {
        self.directions[rng.random_range(0..self.directions.len())]
    }

    /// A uniformly drawn neighbor of `p`.
    pub fn random_neighbor<R: Rng + ?Sized>(&self, p: Coord, rng: &mut R) -> Coord {
        p + self.random_direction(rng)
    }

    /// All neighbors of `p` in direction-table order.
    #[must_use]
    pub fn neighbors(&self, p: Coord) -> Vec<Coord> {
        self.directions.iter().map(|&d| p + d).collect()
    }

    /// Graph distance of the displacement `diff`.
    #[must_use]
    pub fn graph_distance(&self, diff: Coord) -> u32 {
        let (x, y, z) = (diff.x.abs(), diff.y.abs(), diff.z.abs());
        let d = match self.kind {
            LatticeKind::Neumann => x + y + z,
            LatticeKind::Moore => x.max(y).max(z),
            LatticeKind::Hexagonal => {
                // max over {|x|, |y|, |z|, |x+y|, |x+z|}; the extra terms
                // reduce to the planar formula when z == 0.
                x.max(y)
                    .max(z)
                    .max((diff.x + diff.y).abs())
                    .max((diff.x + diff.z).abs())
            }
        };
        d as u32
    }

    /// Euclidean distance of the displacement `diff`.
    ///
    /// Hexagonal lattices define this equal to their graph distance; the
    /// simulator only ever reasons about hex coordinates through the graph.
    #[must_use]
    pub fn euclidean_distance(&self, diff: Coord) -> f64 {
        match self.kind {
            LatticeKind::Hexagonal => f64::from(self.graph_distance(diff)),
            _ => (diff.norm_sq() as f64).sqrt(),
        }
    }

    /// The `n` lattice points closest to the origin, ordered by
    /// non-decreasing distance, ties broken lexicographically.
    #[must_use]
    pub fn sphere(&self, n: usize) -> Vec<Coord> {
        if n == 0 {
            return Vec::new();
        }
        let mut radius = 1i32;
        loop {
            let mut candidates = self.cube(radius);
            candidates.sort_by_key(|&c| (self.distance_rank(c), c.x, c.y, c.z));
            if candidates.len() >= n {
                // A cube of half-width r covers every point at rank <= r, so
                // the prefix is final once the n-th point fits inside.
                let bound = match self.kind {
                    LatticeKind::Hexagonal => i64::from(radius),
                    _ => i64::from(radius) * i64::from(radius),
                };
                if self.distance_rank(candidates[n - 1]) <= bound {
                    candidates.truncate(n);
                    return candidates;
                }
            }
            radius += 1;
        }
    }

    /// Monotone integer stand-in for the Euclidean distance from origin.
    fn distance_rank(&self, c: Coord) -> i64 {
        match self.kind {
            LatticeKind::Hexagonal => i64::from(self.graph_distance(c)),
            _ => c.norm_sq(),
        }
    }

    fn cube(&self, radius: i32) -> Vec<Coord> {
        let planar = self.dimensions == 2;
        let z_range = if planar { 0..=0 } else { -radius..=radius };
        let mut points = Vec::new();
        for x in -radius..=radius {
            for y in -radius..=radius {
                for z in z_range.clone() {
                    points.push(Coord::new(x, y, z));
                }
            }
        }
        points
    }
}

fn neumann_directions(dimensions: u32) -> Vec<Coord> {
    // Positive axes first, then the mirrored negatives.
    let mut dirs = vec![Coord::new(0, 1, 0), Coord::new(1, 0, 0)];
    if dimensions == 3 {
        dirs.insert(0, Coord::new(0, 0, 1));
    }
    let negatives: Vec<Coord> = dirs.iter().rev().map(|&d| -d).collect();
    dirs.extend(negatives);
    dirs
}

fn moore_directions(dimensions: u32) -> Vec<Coord> {
    let planar = dimensions == 2;
    let mut dirs = Vec::with_capacity(if planar { 8 } else { 26 });
    for x in -1..=1 {
        for y in -1..=1 {
            if planar {
                if x == 0 && y == 0 {
                    continue;
                }
                dirs.push(Coord::new(x, y, 0));
                continue;
            }
            for z in -1..=1 {
                if x == 0 && y == 0 && z == 0 {
                    continue;
                }
                dirs.push(Coord::new(x, y, z));
            }
        }
    }
    dirs
}

fn hexagonal_directions(dimensions: u32) -> Vec<Coord> {
    // In-plane neighbors are the six permutations of (-1, 0, 1) projected on
    // the first two axes.
    let mut dirs = vec![
        Coord::new(-1, 0, 0),
        Coord::new(-1, 1, 0),
        Coord::new(0, -1, 0),
        Coord::new(0, 1, 0),
        Coord::new(1, -1, 0),
        Coord::new(1, 0, 0),
    ];
    if dimensions == 3 {
        // ABA close-packed layer offsets, three per adjacent plane.
        dirs.extend([
            Coord::new(0, 0, -1),
            Coord::new(1, 0, -1),
            Coord::new(1, -1, -1),
            Coord::new(0, 0, 1),
            Coord::new(-1, 0, 1),
            Coord::new(-1, 1, 1),
        ]);
    }
    dirs
}

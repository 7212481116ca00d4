use bitvec::vec::BitVec;
use glam::DVec3;
use parking_lot::Mutex;
use pointree_lib::{cell::Cell, math_enums::Corner3};
use rayon::prelude::*;

/// Buckets of at least this many points are binned and recursed into in parallel.
pub(crate) const PARALLEL_THRESHOLD: usize = 16384;

/// The exponent of the bins that keep at most one point each.
pub(crate) fn bin_exponent(min_dist: f64) -> i32 {
    min_dist.log2().ceil() as i32
}

/// Selects one point per bin of edge `2^bin_exponent(min_dist)` within the octree below `cell`.
///
/// The first point of each bin in input order survives.
pub(crate) fn select(positions: &[DVec3], cell: Cell, min_dist: f64) -> BitVec {
    let mut keep = BitVec::repeat(false, positions.len());
    if positions.is_empty() {
        return keep;
    }
    let smallest = bin_exponent(min_dist);
    let binner = Binner { positions, smallest };
    let indices = (0..positions.len()).collect();
    for index in binner.kept(cell, indices) {
        keep.set(index, true);
    }
    keep
}

struct Binner<'a> {
    positions: &'a [DVec3],
    smallest: i32,
}

impl Binner<'_> {
    fn octant(&self, center: DVec3, index: usize) -> Corner3 {
        let p = self.positions[index];
        Corner3::from_upper_halves(p.x >= center.x, p.y >= center.y, p.z >= center.z)
    }

    fn bucket(&self, cell: Cell, indices: Vec<usize>) -> [Vec<usize>; 8] {
        let center = cell.center();
        if indices.len() < PARALLEL_THRESHOLD {
            let mut buckets: [Vec<usize>; 8] = Default::default();
            for index in indices {
                buckets[self.octant(center, index).index()].push(index);
            }
            return buckets;
        }

        let buckets: [Mutex<Vec<usize>>; 8] = array_init::array_init(|_| Mutex::default());
        indices.par_chunks(PARALLEL_THRESHOLD / 8).for_each(|chunk| {
            let mut local: [Vec<usize>; 8] = Default::default();
            for &index in chunk {
                local[self.octant(center, index).index()].push(index);
            }
            for (bucket, local) in buckets.iter().zip(local) {
                bucket.lock().extend(local);
            }
        });
        buckets.map(|bucket| {
            let mut bucket = bucket.into_inner();
            // chunks finish in any order
            bucket.sort_unstable();
            bucket
        })
    }

    fn kept(&self, cell: Cell, indices: Vec<usize>) -> Vec<usize> {
        if indices.len() <= 1 {
            return indices;
        }
        if cell.exponent() <= self.smallest {
            return vec![indices[0]];
        }

        let parallel = indices.len() >= PARALLEL_THRESHOLD;
        let children = Corner3::ALL.into_iter().zip(self.bucket(cell, indices));
        if parallel {
            children
                .collect::<Vec<_>>()
                .into_par_iter()
                .flat_map_iter(|(corner, bucket)| self.kept(cell.octant(corner), bucket))
                .collect()
        } else {
            children
                .flat_map(|(corner, bucket)| self.kept(cell.octant(corner), bucket))
                .collect()
        }
    }
}

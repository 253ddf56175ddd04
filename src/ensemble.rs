//! Domain decomposition: a cartesian grid of ensembles, each possibly
//! replicated across several ranks.
//!
//! An **Ensemble** is one cartesian cell. It carries an intra-communicator
//! grouping every replica of that cell, and,
//! on the chief replica only, a handle to the cart communicator connecting
//! all ensembles. Guard-cell copy-sync and J merge-sync are the two
//! collective operations that keep neighboring ensembles consistent.

use crate::field::{Component, DGRID};
use crate::grid::Mesh;
use crate::transport::Transport;
use crate::Float;
use ndarray::Array2;

/// Linearizes D-dimensional cartesian coordinates into an ensemble label,
/// row-major (last axis fastest), matching `Grid1D::divide`'s own
/// row-major convention.
pub fn coords_to_label(coords: [usize; DGRID], dims: [usize; DGRID]) -> u32 {
    let mut label = 0usize;
    for k in 0..DGRID {
        label = label * dims[k] + coords[k];
    }
    label as u32
}

pub fn label_to_coords(mut label: u32, dims: [usize; DGRID]) -> [usize; DGRID] {
    let mut coords = [0usize; DGRID];
    for k in (0..DGRID).rev() {
        coords[k] = (label as usize) % dims[k];
        label /= dims[k] as u32;
    }
    coords
}

/// One cartesian cell of the domain decomposition, held by every replica of
/// that cell. Exactly one primary (chief) exists per label.
#[derive(Clone)]
pub struct Ensemble<T: Transport> {
    pub label: u32,
    pub cart_coords: [usize; DGRID],
    pub cart_dims: [usize; DGRID],
    pub periodic: [bool; DGRID],
    /// Communicator grouping every replica of this cell.
    pub intra: T,
    /// Rank, within `intra`, of the chief replica.
    pub chief: usize,
    /// Present only on the chief: the communicator connecting all
    /// ensembles' chiefs.
    pub cart: Option<T>,
}

impl<T: Transport> Ensemble<T> {
    pub fn is_chief(&self) -> bool {
        self.intra.rank() == self.chief
    }

    /// Builds the single-ensemble, single-replica topology: useful as the
    /// degenerate base case and for tests run under [`crate::transport::LocalTransport`].
    pub fn singleton(transport: T, periodic: [bool; DGRID]) -> Ensemble<T> {
        Ensemble {
            label: 0,
            cart_coords: [0; DGRID],
            cart_dims: [1; DGRID],
            periodic,
            intra: transport.clone(),
            chief: 0,
            cart: Some(transport),
        }
    }

    /// Coordinates of the neighbor one step along `axis` in direction `dir`
    /// (`-1` or `+1`), or `None` if that step runs off a non-periodic
    /// boundary.
    fn neighbor_coords(&self, axis: usize, dir: i32) -> Option<[usize; DGRID]> {
        let dim = self.cart_dims[axis] as i32;
        let mut c = self.cart_coords[axis] as i32 + dir;
        if c < 0 || c >= dim {
            if !self.periodic[axis] {
                return None;
            }
            c = c.rem_euclid(dim);
        }
        let mut coords = self.cart_coords;
        coords[axis] = c as usize;
        Some(coords)
    }

    fn neighbor_label(&self, axis: usize, dir: i32) -> Option<u32> {
        self.neighbor_coords(axis, dir)
            .map(|c| coords_to_label(c, self.cart_dims))
    }

    /// Sends `comp`'s full backing array from the chief to every other
    /// replica of this ensemble. No-op on a singleton ensemble.
    fn broadcast_component_from_chief(&self, comp: &mut Component) {
        if self.intra.size() <= 1 {
            return;
        }
        if self.is_chief() {
            let payload = bincode::serialize(&comp.data).expect("component data serializes");
            for replica in 0..self.intra.size() {
                if replica != self.chief {
                    self.intra.send(replica, 9400, &payload);
                }
            }
        } else {
            let bytes = self.intra.recv(self.chief, 9400);
            comp.data = bincode::deserialize(&bytes).expect("component data deserializes");
        }
    }

    /// Sends `vec` from the chief to every other replica of this ensemble.
    /// No-op on a singleton ensemble.
    fn broadcast_vec_from_chief(&self, vec: &mut Vec<Float>) {
        if self.intra.size() <= 1 {
            return;
        }
        if self.is_chief() {
            let payload = bincode::serialize(vec).expect("vector serializes");
            for replica in 0..self.intra.size() {
                if replica != self.chief {
                    self.intra.send(replica, 9401, &payload);
                }
            }
        } else {
            let bytes = self.intra.recv(self.chief, 9401);
            *vec = bincode::deserialize(&bytes).expect("vector deserializes");
        }
    }

    /// Sums `comp`'s full backing array across every replica of this
    /// ensemble. Each replica deposits into its own private copy whenever
    /// the balancer has split an ensemble's particles across more than one
    /// replica, so field state must be reduced before it is write-once
    /// across the cartesian topology. No-op on a singleton ensemble.
    pub fn allreduce_sum_over_replicas(&self, comp: &mut Component) {
        if self.intra.size() <= 1 {
            return;
        }
        let payload = bincode::serialize(&comp.data).expect("component data serializes");
        let gathered = self.intra.allgather(&payload);
        let mut sum: Array2<Float> = comp.data.clone();
        sum.fill(0.0);
        for bytes in &gathered {
            let other: Array2<Float> = bincode::deserialize(bytes).expect("component data deserializes");
            for (d, s) in sum.iter_mut().zip(other.iter()) {
                *d += s;
            }
        }
        comp.data = sum;
    }

    /// Copies each axis's boundary bulk slab from the appropriate neighbor
    /// into this rank's guard cells, overwriting whatever was there. Must be
    /// called by every replica of every ensemble in lockstep: the chief
    /// performs the cross-ensemble exchange, then broadcasts the result to
    /// its own non-chief replicas.
    pub fn guard_sync(&self, comp: &mut Component, mesh: &Mesh<DGRID>) {
        if self.is_chief() {
            let cart = self.cart.as_ref().expect("chief always holds cart");
            for axis in 0..DGRID {
                if self.cart_dims[axis] <= 1 {
                    continue;
                }
                for &dir in &[-1i32, 1i32] {
                    let Some(dest_label) = self.neighbor_label(axis, dir) else {
                        continue;
                    };
                    let outgoing = comp.pack_boundary_slab(mesh, axis, dir);
                    let payload = bincode::serialize(&outgoing).expect("guard slab serializes");
                    cart.send(dest_label as usize, 9000 + axis as i32, &payload);
                    let incoming_bytes = cart.recv(dest_label as usize, 9000 + axis as i32);
                    let incoming: Vec<Float> =
                        bincode::deserialize(&incoming_bytes).expect("guard slab deserializes");
                    comp.unpack_guard_slab(mesh, axis, dir, &incoming);
                }
            }
        }
        self.broadcast_component_from_chief(comp);
    }

    /// Sums each axis's guard contribution into the neighbor's bulk edge,
    /// then copy-syncs the merged edge back out, so deposited current that
    /// landed in a guard cell is folded into the owning rank's bulk and
    /// every replica of every ensemble ends up bit-for-bit equal.
    pub fn merge_sync_j(&self, comp: &mut Component, mesh: &Mesh<DGRID>) {
        if self.is_chief() {
            let cart = self.cart.as_ref().expect("chief always holds cart");
            for axis in 0..DGRID {
                if self.cart_dims[axis] <= 1 {
                    continue;
                }
                for &dir in &[-1i32, 1i32] {
                    let Some(dest_label) = self.neighbor_label(axis, dir) else {
                        continue;
                    };
                    let outgoing = comp.pack_guard_slab(mesh, axis, dir);
                    let payload = bincode::serialize(&outgoing).expect("guard slab serializes");
                    cart.send(dest_label as usize, 9100 + axis as i32, &payload);
                    let incoming_bytes = cart.recv(dest_label as usize, 9100 + axis as i32);
                    let incoming: Vec<Float> =
                        bincode::deserialize(&incoming_bytes).expect("guard slab deserializes");
                    comp.add_into_boundary_slab(mesh, axis, dir, &incoming);
                }
            }
        }
        self.guard_sync(comp, mesh);
    }

    /// Sequential inclusive prefix sum of `local_totals` (one entry per
    /// radial row) along `axis` of the cartesian topology: each ensemble's
    /// chief receives the running sums from its lower neighbor, and
    /// forwards its own running totals to its upper neighbor, then
    /// broadcasts the result to its own non-chief replicas. Returns the
    /// exclusive prefix contributed by every lower-numbered ensemble, which
    /// is what the `Flux` export quantity's "exclusive-scan...then
    /// inclusive cross-rank scan" resolves to once added to the rank-local
    /// exclusive scan.
    pub fn scan_along_axis(&self, axis: usize, local_totals: &[Float]) -> Vec<Float> {
        let mut prev = if self.is_chief() {
            let cart = self.cart.as_ref().expect("chief always holds cart");
            let prev: Vec<Float> = if let Some(lower) = self.neighbor_label(axis, -1) {
                let bytes = cart.recv(lower as usize, 9300 + axis as i32);
                bincode::deserialize(&bytes).expect("flux prefix deserializes")
            } else {
                vec![0.0; local_totals.len()]
            };
            if let Some(upper) = self.neighbor_label(axis, 1) {
                let running: Vec<Float> = prev.iter().zip(local_totals).map(|(p, l)| p + l).collect();
                let payload = bincode::serialize(&running).expect("flux prefix serializes");
                cart.send(upper as usize, 9300 + axis as i32, &payload);
            }
            prev
        } else {
            vec![0.0; local_totals.len()]
        };
        self.broadcast_vec_from_chief(&mut prev);
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    #[test]
    fn label_coords_roundtrip() {
        let dims = [3, 4];
        for label in 0..12u32 {
            let coords = label_to_coords(label, dims);
            assert_eq!(coords_to_label(coords, dims), label);
        }
    }

    #[test]
    fn singleton_ensemble_has_no_off_rank_neighbors() {
        let ens = Ensemble::singleton(LocalTransport, [false, false]);
        assert!(ens.is_chief());
        assert_eq!(ens.neighbor_label(0, 1), None);
        assert_eq!(ens.neighbor_label(0, -1), None);
    }

    /// A singleton ensemble's replica-reduce/broadcast helpers must never
    /// touch `LocalTransport::send`/`recv` (which panic: there is no peer),
    /// since `intra.size() == 1` there is nothing to reduce or broadcast.
    #[test]
    fn replica_collectives_are_noops_on_a_singleton_ensemble() {
        use crate::grid::{Grid1D, Mesh};

        let ens = Ensemble::singleton(LocalTransport, [false, false]);
        let mesh = Mesh::new([Grid1D::new(0.0, 1.0, 4), Grid1D::new(0.0, 1.0, 4)], 2);
        let mut comp = Component::zeros(&mesh, crate::field::yee_e_offset(0));
        comp.set(0, 0, 3.5);

        ens.allreduce_sum_over_replicas(&mut comp);
        assert_eq!(comp.get(0, 0), 3.5, "no other replica to sum in, value is untouched");

        let prefix = ens.scan_along_axis(0, &[1.0, 2.0]);
        assert_eq!(prefix, vec![0.0, 0.0], "no lower neighbor, so the exclusive prefix is zero");
    }
}

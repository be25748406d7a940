//! Parameter sampling and simulation id layout
//!
//! An independent group `g` owns simulation id `g`. A Sobol' group with `n`
//! parameters owns the `n + 2` contiguous ids starting at `g * (n + 2)`:
//!
//! ```text
//! +0      A
//! +1      B
//! +2+i    A with coordinate i taken from B
//! ```
//!
//! Ids are `u32`; a layout that does not fit yields `None`.

use melissa_core::{GroupId, SimulationId};
use rand::Rng;

/// Uniform draw in `[0, 1)^nb_parameters`
pub fn uniform_parameter_set<R: Rng + ?Sized>(rng: &mut R, nb_parameters: u32) -> Vec<f64> {
    (0..nb_parameters).map(|_| rng.gen_range(0.0..1.0)).collect()
}

fn group_width(sobol: bool, nb_parameters: u32) -> Option<u32> {
    if sobol { nb_parameters.checked_add(2) } else { Some(1) }
}

/// Number of simulation ids a study of `sampling_size` groups needs
pub fn simulation_count(sampling_size: usize, sobol: bool, nb_parameters: u32) -> Option<u32> {
    u32::try_from(sampling_size)
        .ok()?
        .checked_mul(group_width(sobol, nb_parameters)?)
}

/// Simulation ids owned by `group`
pub fn simulation_ids(group: GroupId, sobol: bool, nb_parameters: u32) -> Option<Vec<SimulationId>> {
    let width = group_width(sobol, nb_parameters)?;
    let first = group.0.checked_mul(width)?;
    let end = first.checked_add(width)?;
    Some((first..end).map(SimulationId).collect())
}

/// Group owning `id`
pub fn group_of(id: SimulationId, sobol: bool, nb_parameters: u32) -> GroupId {
    if sobol {
        let group = u64::from(id.0) / (u64::from(nb_parameters) + 2);
        GroupId(u32::try_from(group).unwrap_or(u32::MAX))
    } else {
        GroupId(id.0)
    }
}

/// The `n + 2` parameter vectors of a Sobol' group
pub fn sobol_parameter_sets(a: &[f64], b: &[f64]) -> Vec<Vec<f64>> {
    let mut sets = Vec::with_capacity(a.len() + 2);
    sets.push(a.to_vec());
    sets.push(b.to_vec());
    for i in 0..a.len() {
        let mut mixed = a.to_vec();
        if let Some(value) = b.get(i) {
            mixed[i] = *value;
        }
        sets.push(mixed);
    }
    sets
}

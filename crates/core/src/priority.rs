// SPDX-License-Identifier: Apache-2.0

//! Borrow-order computation.
//!
//! Every borrow walks a pre-computed ordering of candidate CPUs: the
//! own CPUs first (cheapest to reactivate), then foreign CPUs ranked by
//! locality. Without a topology oracle the node is modeled as two
//! halves (the common dual-socket layout): a foreign CPU is "nearby"
//! when it shares a half with some CPU of the process mask.

use dynres_config::LendPriority;
use dynres_shmem::CpuSet;

/// Computes the CPU walk order for a process.
pub(crate) fn compute(system_size: usize, process_mask: &CpuSet, priority: LendPriority) -> Vec<usize> {
    let mut order: Vec<usize> = process_mask.iter().filter(|&c| c < system_size).collect();
    let foreign: Vec<usize> = (0..system_size).filter(|c| !process_mask.contains(*c)).collect();
    match priority {
        LendPriority::Any => order.extend(foreign),
        LendPriority::NearbyFirst => {
            let (near, far): (Vec<usize>, Vec<usize>) =
                foreign.into_iter().partition(|&c| is_nearby(system_size, process_mask, c));
            order.extend(near);
            order.extend(far);
        }
        LendPriority::NearbyOnly => {
            order.extend(foreign.into_iter().filter(|&c| is_nearby(system_size, process_mask, c)));
        }
    }
    order
}

fn is_nearby(system_size: usize, process_mask: &CpuSet, cpuid: usize) -> bool {
    let half = (system_size / 2).max(1);
    let my_half = cpuid / half;
    process_mask.iter().any(|c| c / half == my_half)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mask(s: &str) -> CpuSet {
        s.parse().expect("valid mask")
    }

    #[test]
    fn own_cpus_come_first() {
        let order = compute(8, &mask("2-3"), LendPriority::Any);
        assert_eq!(order, vec![2, 3, 0, 1, 4, 5, 6, 7]);
    }

    #[test]
    fn nearby_first_prefers_the_same_half() {
        // Mask in the lower half of an 8-CPU node: CPUs 0-3 are near.
        let order = compute(8, &mask("2-3"), LendPriority::NearbyFirst);
        assert_eq!(order, vec![2, 3, 0, 1, 4, 5, 6, 7]);

        // Mask in the upper half: 4-7 are near, 0-3 come last.
        let order = compute(8, &mask("6-7"), LendPriority::NearbyFirst);
        assert_eq!(order, vec![6, 7, 4, 5, 0, 1, 2, 3]);
    }

    #[test]
    fn nearby_only_drops_the_far_half() {
        let order = compute(8, &mask("6-7"), LendPriority::NearbyOnly);
        assert_eq!(order, vec![6, 7, 4, 5]);
    }

    #[test]
    fn mask_spanning_both_halves_is_near_everything() {
        let order = compute(4, &mask("0,3"), LendPriority::NearbyOnly);
        assert_eq!(order, vec![0, 3, 1, 2]);
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Two descriptors sharing one instance: the first lends half of its
//! CPUs, the second borrows them, the first reclaims, and the second
//! honors the revocation.
//!
//! Both descriptors live in this process (each with a synthesized pid),
//! which is exactly how two separate processes would interact through
//! the shared tables.

#![allow(clippy::print_stdout)]

use dynres_config::{Options, Policy};
use dynres_core::error::Error;
use dynres_core::spd::{next_subprocess_id, SubProcess};
use dynres_shmem::CpuSet;

fn main() -> Result<(), Error> {
    let options = Options {
        policy: Policy::LewiMask,
        system_size: 4,
        shm_key: format!("demo-{}", std::process::id()),
        ..Options::default()
    };

    let first = SubProcess::init(
        next_subprocess_id(),
        Some("0-1".parse::<CpuSet>().expect("mask")),
        options.clone(),
    )?;
    let second = SubProcess::init(
        next_subprocess_id(),
        Some("2-3".parse::<CpuSet>().expect("mask")),
        options,
    )?;

    second.set_callbacks(|registry| {
        registry.on_enable_cpu(|cpuid| println!("second: may now run on CPU {cpuid}"));
        registry.on_disable_cpu(|cpuid| println!("second: must leave CPU {cpuid}"));
    });

    println!("first lends CPU 1: {:?}", first.lend_cpu(1)?);
    println!("second borrows:    {:?}", second.borrow_cpus(1)?);
    println!("second active:     {}", second.active_mask());

    println!("first reclaims:    {:?}", first.reclaim()?);
    // The revocation reaches the borrower on its next reconciliation.
    second.reconcile();
    println!("second active:     {}", second.active_mask());

    second.finalize()?;
    first.finalize()?;
    Ok(())
}

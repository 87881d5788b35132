/* fairsched fairness tests
 *
 * Proportional sharing observed end to end: share ratios, minimum
 * reservations, maximum caps, and equal treatment of equals.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

mod common;

use common::Rig;
use fairsched::groups::{Alloc, AllocUnits, MAX_NONE};
use fairsched::platform::PcpuMask;

/* two uniprocessor VMs with a 1:3 share split pinned to one CPU get
   CPU time in that proportion */
#[test]
fn share_ratio_one_to_three()
{
    let rig = Rig::new(1, 1);
    rig.add_vm_pinned(100, 1, 1000, PcpuMask::single(0));
    rig.add_vm_pinned(200, 1, 3000, PcpuMask::single(0));
    rig.settle();

    rig.run_ms(10000);

    let small = rig.run_cycles(100);
    let large = rig.run_cycles(200);
    assert!(large > 0 && small > 0);

    /* expected ratio 1/3. the switching hysteresis (1 ms dispatch
       granularity plus the 2 ms preemption bonus) offsets each handover
       by a few milliseconds but doesn't bias the long-run rate, so ten
       seconds settles well inside the observed band */
    let ratio_permille = small * 1000 / large;
    assert!(ratio_permille >= 310 && ratio_permille <= 350,
            "small:large ratio was {}/1000", ratio_permille);

    /* and the CPU was kept busy throughout */
    let total = small + large;
    let capacity = fairsched::sim::SIM_HZ * 10;
    assert!(total >= capacity * 95 / 100, "machine went idle: {} of {}", total, capacity);
}

/* N identical CPU-bound VMs on N CPUs end up with equal charges */
#[test]
fn identical_vms_share_equally()
{
    let rig = Rig::new(4, 1);
    for vm in 0..4
    {
        rig.add_vm(100 + vm * 100, 1, 1000);
    }
    rig.settle();

    rig.run_ms(5000);

    let mut low = u64::MAX;
    let mut high = 0;
    for vm in 0..4
    {
        let cycles = rig.run_cycles(100 + vm * 100);
        low = low.min(cycles);
        high = high.max(cycles);
    }

    assert!(low > 0);
    /* within a few percent of each other over a long window */
    assert!(high - low <= high / 10,
            "unequal split: low {} high {}", low, high);
}

/* a reservation backed by tiny shares still gets its minimum */
#[test]
fn minimum_reservation_honored()
{
    let rig = Rig::new(4, 1);

    /* one share, but 80 base shares reserved: a fifth of the machine */
    rig.add_vm_config(500, fairsched::world::WorldConfig::vm(
        "reserved", 1, Alloc::new(80, MAX_NONE, 1, AllocUnits::Bshares)));
    for vm in 0..4
    {
        rig.add_vm(100 + vm * 100, 1, 1000);
    }
    rig.settle();

    rig.run_ms(5000);

    /* 80 of 400 base shares is 200 permille of the machine */
    let share = rig.machine_share_permille(500, 5000);
    assert!(share >= 170, "reserved VM got only {} permille", share);
    assert!(share <= 260, "reserved VM got {} permille, past its backing", share);
}

/* a capped VM alone on the machine cannot exceed its maximum */
#[test]
fn maximum_cap_enforced()
{
    let rig = Rig::new(1, 1);

    /* max 25 percent of the one CPU, nothing else runnable */
    rig.add_vm_config(100, fairsched::world::WorldConfig::vm(
        "capped", 1, Alloc::new(0, 25, 1000, AllocUnits::Percent)));
    rig.settle();

    rig.run_ms(10000);

    let share = rig.machine_share_permille(100, 10000);
    assert!(share <= 280, "capped VM got {} permille", share);
    assert!(share >= 180, "capped VM starved at {} permille", share);
}

/* the cap releases the CPU to whoever else wants it */
#[test]
fn cap_yields_to_uncapped_competitor()
{
    let rig = Rig::new(1, 1);
    rig.add_vm_config(100, fairsched::world::WorldConfig::vm(
        "capped", 1, Alloc::new(0, 25, 10000, AllocUnits::Percent)));
    rig.add_vm(200, 1, 100);
    rig.settle();

    rig.run_ms(10000);

    let capped = rig.machine_share_permille(100, 10000);
    let hungry = rig.machine_share_permille(200, 10000);

    /* despite 100x the shares, the cap pins the first VM near 25% */
    assert!(capped <= 280, "capped VM got {} permille", capped);
    assert!(hungry >= 650, "competitor got only {} permille", hungry);
}

/* charges across the machine stay within an accounting envelope of
   real time: nothing is double-billed beyond the HT/system slack */
#[test]
fn total_charge_bounded_by_capacity()
{
    let rig = Rig::new(2, 1);
    rig.add_vm(100, 1, 1000);
    rig.add_vm(200, 1, 1000);
    rig.add_vm(300, 2, 2000);
    rig.settle();

    rig.run_ms(3000);

    let charged = rig.sched.total_group_charge();
    let capacity = fairsched::sim::SIM_HZ / 1000 * 3000 * 2;
    assert!(charged <= capacity * 110 / 100,
            "charged {} against capacity {}", charged, capacity);
}

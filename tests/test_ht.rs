/* fairsched hyperthreading tests
 *
 * Package sharing constraints, the machine-clear quarantine and
 * halt-aware charging, observed end to end on a simulated
 * two-threads-per-package machine.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

mod common;

use std::collections::HashSet;
use common::Rig;
use fairsched::config::SchedConfig;
use fairsched::groups::Alloc;
use fairsched::platform::WorldID;
use fairsched::vsmp::HtSharing;
use fairsched::world::WorldConfig;

fn vm_with_sharing(name: &str, nvcpus: u32, sharing: HtSharing) -> WorldConfig
{
    let mut config = WorldConfig::vm(name, nvcpus, Alloc::shares_only(1000));
    config.ht_sharing = sharing;
    config
}

/* which VMs occupy each package right now */
fn packages_with_two_vms(rig: &Rig) -> usize
{
    let mut mixed = 0;
    for package in 0..rig.npcpus / 2
    {
        let mut owners: HashSet<WorldID> = HashSet::new();
        for thread in 0..2
        {
            if let Some(world) = rig.sched.running_world(package * 2 + thread)
            {
                owners.insert(rig.sched.vsmp_leader(world).unwrap());
            }
        }
        if owners.len() > 1
        {
            mixed = mixed + 1;
        }
    }
    mixed
}

/* a VM demanding whole packages is never co-resident on a package
   with another VM */
#[test]
fn sharing_none_owns_its_packages()
{
    let rig = Rig::new(4, 2);
    rig.add_vm_config(100, vm_with_sharing("greedy", 2, HtSharing::None));
    rig.add_vm_config(300, vm_with_sharing("easy", 2, HtSharing::Any));
    rig.settle();

    let mut violations = 0;
    for _ in 0..2000
    {
        rig.step_ms_halting();

        /* no package may hold the greedy VM and anyone else */
        for package in 0..2
        {
            let a = rig.sched.running_world(package * 2);
            let b = rig.sched.running_world(package * 2 + 1);
            if let (Some(a), Some(b)) = (a, b)
            {
                let la = rig.sched.vsmp_leader(a).unwrap();
                let lb = rig.sched.vsmp_leader(b).unwrap();
                if la == 100 || lb == 100
                {
                    violations = violations + 1;
                }
            }
        }
    }

    assert_eq!(violations, 0);

    /* neither VM starved */
    assert!(rig.run_cycles(100) > 0);
    assert!(rig.run_cycles(300) > 0);
}

/* two easy-going VMs do share packages */
#[test]
fn sharing_any_fills_both_threads()
{
    let rig = Rig::new(2, 2);
    rig.add_vm_config(100, vm_with_sharing("a", 1, HtSharing::Any));
    rig.add_vm_config(300, vm_with_sharing("b", 1, HtSharing::Any));
    rig.settle();

    let mut shared = 0;
    for _ in 0..500
    {
        rig.step_ms();
        shared = shared + packages_with_two_vms(&rig);
    }

    assert!(shared > 400, "package shared only {} of 500 samples", shared);
}

/* internal sharing lets a VM pair its own vCPUs on a package but
   keeps strangers off */
#[test]
fn sharing_internally_pairs_own_vcpus()
{
    let rig = Rig::new(2, 2);
    rig.add_vm_config(100, vm_with_sharing("pair", 2, HtSharing::Internally));
    rig.add_vm_config(300, vm_with_sharing("other", 1, HtSharing::Any));
    rig.settle();

    let mut own_pairs = 0;
    let mut mixed = 0;
    for _ in 0..1000
    {
        rig.step_ms();
        let a = rig.sched.running_world(0);
        let b = rig.sched.running_world(1);
        if let (Some(a), Some(b)) = (a, b)
        {
            let la = rig.sched.vsmp_leader(a).unwrap();
            let lb = rig.sched.vsmp_leader(b).unwrap();
            if la == lb
            {
                own_pairs = own_pairs + 1;
            }
            else
            {
                mixed = mixed + 1;
            }
        }
    }

    assert!(own_pairs > 0, "the pair VM never co-resided with itself");
    assert_eq!(mixed, 0, "a stranger shared the package {} times", mixed);
}

/* a machine-clear storm quarantines the VM away from package sharing,
   and calm releases it */
#[test]
fn quarantine_stops_sharing()
{
    let mut config = SchedConfig::default();
    config.machine_clear_thresh = 100;

    let rig = Rig::with_config(2, 2, config);
    rig.add_vm_config(100, vm_with_sharing("stormy", 1, HtSharing::Any));
    rig.add_vm_config(300, vm_with_sharing("victim", 1, HtSharing::Any));
    rig.settle();

    /* quiet at first: the two share the package */
    let mut shared_before = 0;
    for _ in 0..200
    {
        rig.step_ms();
        shared_before = shared_before + packages_with_two_vms(&rig);
    }
    assert!(shared_before > 100, "no sharing even before the storm");

    /* the storm: a huge machine-clear count lands on the next sample */
    rig.sim.set_machine_clears(100, 1 << 40);
    rig.run_ms(100);

    let mut shared_during = 0;
    for _ in 0..500
    {
        rig.step_ms();
        shared_during = shared_during + packages_with_two_vms(&rig);
    }
    assert_eq!(shared_during, 0, "quarantined VM still shared its package");
}

/* a thread whose partner halts is charged for the free ride */
#[test]
fn partner_halt_inflates_charge()
{
    let rig = Rig::new(2, 2);
    rig.add_vm_pinned(100, 1, 1000, fairsched::platform::PcpuMask::single(0));
    rig.settle();

    /* CPU 1 has nothing to do: halt it for the duration */
    rig.run_ms(5);
    rig.sched.halt(1, 0).unwrap();
    rig.run_ms(1000);

    let usage = rig.sched.vsmp_usage(100).unwrap();
    assert!(usage.run_cycles > 0);

    /* charged roughly double the run time: own cycles plus the halted
       partner's */
    assert!(usage.charged_cycles >= usage.run_cycles * 15 / 10,
            "charge {} vs run {}", usage.charged_cycles, usage.run_cycles);

    /* the halt itself shows up in the partner's accounting */
    let partner = rig.sched.pcpu_usage(1).unwrap();
    assert!(partner.halted_cycles > 0);
}

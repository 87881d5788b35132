/* fairsched co-scheduling tests
 *
 * SMP guests reaching and holding the co-run state, sibling handoff
 * placement, and the strict-mode skew machinery end to end.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

mod common;

use common::Rig;
use fairsched::config::SchedConfig;
use fairsched::platform::PcpuMask;
use fairsched::vsmp::CoRunState;

/* a 2-vCPU VM sharing one CPU with a uniprocessor VM co-runs within
   a couple hundred milliseconds and stays that way */
#[test]
fn smp_vm_reaches_corun()
{
    let rig = Rig::new(2, 1);
    rig.add_vm_pinned(100, 2, 1000, PcpuMask::first_n(2));
    rig.add_vm_pinned(300, 1, 1000, PcpuMask::single(0));
    rig.settle();

    rig.run_ms(200);

    assert_eq!(rig.sched.vsmp_corun(100).unwrap(), CoRunState::CoRun);
    assert_eq!(rig.sched.vsmp_corun(300).unwrap(), CoRunState::CoNone);

    /* both of the VM's vCPUs actually got CPU time */
    rig.run_ms(800);
    let usage = rig.sched.vsmp_usage(100).unwrap();
    assert!(usage.run_cycles > 0);

    /* the uniprocessor competitor wasn't locked out of CPU 0 */
    assert!(rig.run_cycles(300) > 0);

    assert!(rig.sched.vsmp_check_counters(100).unwrap());
}

/* dispatching one vCPU of a strict VM reserves CPUs for its siblings
   through the handoff path */
#[test]
fn strict_dispatch_places_siblings()
{
    let mut config = SchedConfig::default();
    config.relaxed_cosched = false;

    let rig = Rig::with_config(2, 1, config);
    rig.add_vm(100, 2, 1000);
    rig.settle();

    /* one dispatch on CPU 0 runs a vCPU and hands its sibling to CPU 1 */
    rig.sched.dispatch(0);
    assert!(rig.sched.running_world(0).is_some());

    rig.sched.dispatch(1);
    assert!(rig.sched.running_world(1).is_some());

    /* both on-CPU worlds belong to the same VM, which is now co-running */
    let a = rig.sched.running_world(0).unwrap();
    let b = rig.sched.running_world(1).unwrap();
    assert_eq!(rig.sched.vsmp_leader(a).unwrap(), 100);
    assert_eq!(rig.sched.vsmp_leader(b).unwrap(), 100);
    assert_ne!(a, b);
    assert_eq!(rig.sched.vsmp_corun(100).unwrap(), CoRunState::CoRun);
}

/* under strict co-scheduling with competition, the VM is repeatedly
   co-stopped and regrouped rather than letting one vCPU race ahead */
#[test]
fn strict_mode_keeps_siblings_together()
{
    let mut config = SchedConfig::default();
    config.relaxed_cosched = false;

    let rig = Rig::with_config(2, 1, config);
    rig.add_vm(100, 2, 1000);
    rig.add_vm(300, 1, 1000);
    rig.settle();

    rig.run_ms(3000);

    /* the counters survived all the transitions */
    assert!(rig.sched.vsmp_check_counters(100).unwrap());

    /* every party made progress */
    let smp = rig.sched.vsmp_usage(100).unwrap();
    assert!(smp.run_cycles > 0);
    assert!(rig.run_cycles(300) > 0);

    /* the co-run state is a legal one */
    let corun = rig.sched.vsmp_corun(100).unwrap();
    assert!(corun == CoRunState::CoRun || corun == CoRunState::CoReady
            || corun == CoRunState::CoStop);
}

/* a VM whose sibling blocks on a lock-kind wait cannot be
   co-descheduled out from under the lock holder */
#[test]
fn lock_waiters_pin_the_vm()
{
    let rig = Rig::new(2, 1);
    rig.add_vm(100, 2, 1000);
    rig.settle();
    rig.run_ms(10);

    /* vCPU 1 blocks on a kernel lock its sibling may hold */
    rig.sched.wait(101, 0x900, fairsched::vcpu::WaitKind::Lock).unwrap();
    rig.run_ms(5);

    let (_, nwait, _) = rig.sched.vsmp_counters(100).unwrap();
    assert_eq!(nwait, 1);

    /* still co-running: the lock wait disabled co-deschedule */
    assert_eq!(rig.sched.vsmp_corun(100).unwrap(), CoRunState::CoRun);

    rig.sched.wakeup(0x900);
    assert_eq!(rig.sched.vsmp_counters(100).unwrap().1, 0);
    assert!(rig.sched.vsmp_check_counters(100).unwrap());
}

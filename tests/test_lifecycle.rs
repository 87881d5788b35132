/* fairsched world lifecycle tests
 *
 * Admission, waits and wakeups, death, and teardown of a VM whose
 * vCPUs are mid-flight.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

mod common;

use common::Rig;
use fairsched::error::Cause;
use fairsched::vcpu::WaitKind;
use fairsched::world::KillLevel;

/* a wakeup releases every matching waiter, exactly once */
#[test]
fn wakeup_releases_matching_waiters()
{
    let rig = Rig::new(2, 1);
    rig.add_vm(100, 2, 1000);
    rig.add_vm(300, 1, 1000);
    rig.settle();
    rig.run_ms(10);

    rig.sched.wait(100, 0x1234, WaitKind::Request).unwrap();
    rig.sched.wait(101, 0x1234, WaitKind::Request).unwrap();
    rig.sched.wait(300, 0x9999, WaitKind::Request).unwrap();
    rig.run_ms(2);

    /* both waiters on the event wake; the third sleeps on */
    assert_eq!(rig.sched.wakeup(0x1234), 2);
    assert_eq!(rig.sched.vsmp_counters(100).unwrap().1, 0);
    assert_eq!(rig.sched.vsmp_counters(300).unwrap().1, 1);

    /* nobody is left waiting on the woken event */
    assert_eq!(rig.sched.wakeup(0x1234), 0);

    /* a wakeup with no waiters at all is quietly fine */
    assert_eq!(rig.sched.wakeup(0xdead), 0);
}

/* a timed wait fires through its one-shot timer */
#[test]
fn timed_wait_expires()
{
    let rig = Rig::new(1, 1);
    rig.add_vm(100, 1, 1000);
    rig.settle();
    rig.run_ms(5);

    rig.sched.timed_wait(100, 0x40, WaitKind::Request, 20).unwrap();
    rig.run_ms(5);
    assert_eq!(rig.sched.vsmp_counters(100).unwrap().1, 1);

    /* past the deadline the timer has woken it */
    rig.run_ms(30);
    assert_eq!(rig.sched.vsmp_counters(100).unwrap().1, 0);
}

/* sleeps ignore wakeups that arrive before the deadline */
#[test]
fn sleep_ignores_spurious_wakeups()
{
    let rig = Rig::new(1, 1);
    rig.add_vm(100, 1, 1000);
    rig.settle();
    rig.run_ms(5);

    rig.sched.sleep(100, 50).unwrap();
    rig.run_ms(5);

    /* a stray wakeup on the sleep event does nothing */
    assert_eq!(rig.sched.wakeup(fairsched::events::sleep_event(100)), 0);
    assert_eq!(rig.sched.vsmp_counters(100).unwrap().1, 1);

    /* the deadline releases it */
    rig.run_ms(60);
    assert_eq!(rig.sched.vsmp_counters(100).unwrap().1, 0);
}

/* a demanded death surfaces from wait as DeathPending, never OK */
#[test]
fn death_pending_surfaces_from_wait()
{
    let rig = Rig::new(1, 1);
    rig.add_vm(100, 1, 1000);
    rig.settle();
    rig.run_ms(5);

    rig.sched.world_kill(100, KillLevel::Demand).unwrap();
    assert_eq!(rig.sched.wait(100, 0x50, WaitKind::Request), Err(Cause::DeathPending));
}

/* killing an MP VM with one vCPU waiting and one running: removal is
   Busy while anything is on a CPU, then succeeds and releases all
   traces of the VM */
#[test]
fn remove_busy_then_clean()
{
    let rig = Rig::new(2, 1);
    rig.add_vm(100, 2, 1000);
    rig.settle();
    rig.run_ms(20);

    /* vCPU 1 parks in a wait; vCPU 0 keeps running */
    rig.sched.wait(101, 0x700, WaitKind::Request).unwrap();
    rig.run_ms(2);
    assert_eq!(rig.sched.vsmp_counters(100).unwrap().1, 1);

    /* something is still on a CPU: removal must refuse */
    assert_eq!(rig.sched.world_remove(100), Err(Cause::WorldRemoveBusy));

    /* one dispatch round releases the running vCPU */
    rig.step_ms();
    rig.sched.world_remove(100).expect("second removal should succeed");

    /* every trace is gone */
    assert!(rig.sched.vsmp_usage(100).is_err());
    assert!(rig.sched.world_entry(100).is_err());
    assert!(rig.sched.world_entry(101).is_err());
    assert_eq!(rig.sched.wakeup(0x700), 0);
    assert_eq!(rig.sched.running_world(0), None);
    assert_eq!(rig.sched.running_world(1), None);

    /* removing an unmanaged world fast-paths to Ok */
    assert_eq!(rig.sched.world_remove(100), Ok(()));
    assert_eq!(rig.sched.world_remove(424242), Ok(()));
}

/* an unconditional kill yanks the world off its CPU at the next
   dispatch and the VM reaps once every sibling is dead */
#[test]
fn unconditional_kill_reaps()
{
    let rig = Rig::new(1, 1);
    rig.add_vm(100, 1, 1000);
    rig.settle();
    rig.run_ms(5);
    assert_eq!(rig.sched.running_world(0), Some(100));

    rig.sched.world_kill(100, KillLevel::Unconditional).unwrap();
    rig.step_ms();

    assert_eq!(rig.sched.running_world(0), None);
    assert!(rig.sched.world_entry(100).is_err());
}

/* affinity changes take effect and bad masks are refused */
#[test]
fn affinity_setter()
{
    let rig = Rig::new(2, 1);
    rig.add_vm(100, 1, 1000);
    rig.settle();
    rig.run_ms(5);

    assert_eq!(rig.sched.world_set_affinity(100, fairsched::platform::PcpuMask::EMPTY),
               Err(Cause::VcpuBadAffinity));

    rig.sched.world_set_affinity(100, fairsched::platform::PcpuMask::single(1)).unwrap();
    rig.run_ms(20);

    /* the VM now only ever runs on CPU 1 */
    assert_eq!(rig.sched.running_world(0), None);
    assert_eq!(rig.sched.running_world(1), Some(100));
}

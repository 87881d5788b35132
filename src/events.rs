/* fairsched wait and wakeup
 *
 * Worlds block on opaque event keys. A wait is a state transition
 * committed under the event-queue lock, the owning cell's lock and
 * finally the world's action leaf lock, in that order; the leaf lock
 * closes the race between deciding to sleep and a remote CPU posting
 * an action. Wakeups release every waiter on the event. Sleeps hang
 * off one-shot timers and refuse to be shortened by stray wakeups.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use alloc::vec::Vec;
use hashbrown::hash_map::HashMap;
use super::CpuSched;
use super::config::ReschedOpt;
use super::error::Cause;
use super::lock::Mutex;
use super::platform::{ms_to_cycles, PcpuID, WorldID};
use super::runq::VcpuRef;
use super::vcpu::{EventID, RunState, WaitKind, WaitState};
use super::vsmp::CoRunState;
use super::vtime::context_compare;
use super::cell::CellState;

/* sleep events are per-world keys carved out of the top of the space */
const SLEEP_EVENT_BASE: EventID = 0xffff_0000_0000_0000;

pub fn sleep_event(world: WorldID) -> EventID
{
    SLEEP_EVENT_BASE + world as EventID
}

/* a pending one-shot wakeup */
struct SleepTimer
{
    deadline: u64,
    world: WorldID,
    event: EventID,

    /* sleeps ignore early wakeups; plain timed waits don't */
    strict_deadline: bool
}

pub struct EventTable
{
    waiters: Mutex<HashMap<EventID, Vec<WorldID>>>,
    timers: Mutex<Vec<SleepTimer>>
}

impl EventTable
{
    pub fn new() -> EventTable
    {
        EventTable
        {
            waiters: Mutex::new("event queue", HashMap::new()),
            timers: Mutex::new("sleep timers", Vec::new())
        }
    }

    fn enqueue(&self, event: EventID, world: WorldID)
    {
        let mut waiters = self.waiters.lock();
        waiters.entry(event).or_insert_with(Vec::new).push(world);
    }

    fn unqueue(&self, event: EventID, world: WorldID)
    {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(&event)
        {
            list.retain(|w| *w != world);
            if list.is_empty()
            {
                waiters.remove(&event);
            }
        }
    }

    /* does this world still have a sleep timer that hasn't expired? */
    fn sleep_pending(&self, world: WorldID, now: u64) -> bool
    {
        self.timers.lock().iter()
            .any(|t| t.world == world && t.strict_deadline && t.deadline > now)
    }

    fn add_timer(&self, timer: SleepTimer)
    {
        self.timers.lock().push(timer);
    }

    fn remove_timers(&self, world: WorldID)
    {
        self.timers.lock().retain(|t| t.world != world);
    }

    /* forget everything a departing world had pending */
    pub(crate) fn purge_world(&self, world: WorldID)
    {
        let mut waiters = self.waiters.lock();
        let mut empty = Vec::new();
        for (event, list) in waiters.iter_mut()
        {
            list.retain(|w| *w != world);
            if list.is_empty()
            {
                empty.push(*event);
            }
        }
        for event in empty
        {
            waiters.remove(&event);
        }
        drop(waiters);

        self.remove_timers(world);
    }

    /* pull out every timer due at `now` */
    fn take_due(&self, now: u64) -> Vec<(WorldID, EventID)>
    {
        let mut timers = self.timers.lock();
        let mut due = Vec::new();
        timers.retain(|t|
        {
            if t.deadline <= now
            {
                due.push((t.world, t.event));
                false
            }
            else
            {
                true
            }
        });
        due
    }
}

impl CpuSched
{
    /* block the calling world on an event
       => world = the world going to sleep; must be on the CPU now
          event = opaque key a matching wakeup() will use
          kind = what the wait is for; drives idle/co-deschedule policy
       <= Ok once the wait is committed (the caller then yields into
          the dispatcher), or DeathPending if the world is being killed */
    pub fn wait(&self, world: WorldID, event: EventID, kind: WaitKind) -> Result<(), Cause>
    {
        let entry = self.world_entry(world)?;
        if entry.info.death_pending()
        {
            return Err(Cause::DeathPending);
        }

        /* join the event's queue first so no wakeup window is lost */
        self.events.enqueue(event, world);

        let commit = (|| -> Result<bool, Cause>
        {
            let (_, mut state) = self.lock_vsmp_cell(entry.vsmp)?;

            /* the action leaf lock closes the race against a concurrent
               action post: either we see the action and refuse to sleep,
               or the poster sees us asleep and wakes us */
            entry.info.action_lock.lock();
            if entry.info.vmm && entry.info.actions_pending()
            {
                entry.info.action_lock.unlock();
                return Ok(false);
            }

            let now = state.now;
            state.queue_remove(VcpuRef { vsmp: entry.vsmp, idx: entry.idx });
            if let Some(vsmp) = state.vsmp_mut(entry.vsmp)
            {
                vsmp.set_wait_state(entry.idx, WaitState::Waiting { event, kind });
                vsmp.set_run_state(entry.idx, RunState::Wait, now);
            }
            entry.info.action_lock.unlock();

            /* the CPU this world sat on must pick someone else */
            let pcpu = state.vsmp(entry.vsmp)
                .map(|vsmp| vsmp.vcpus[entry.idx].pcpu);
            if let Some(pcpu) = pcpu
            {
                if let Some(shadow) = state.pcpu_mut(pcpu)
                {
                    shadow.mark_reschedule();
                }
            }
            Ok(true)
        })();

        match commit
        {
            Ok(true) => Ok(()),
            Ok(false) =>
            {
                /* actions beat us to it: never went to sleep */
                self.events.unqueue(event, world);
                Ok(())
            },
            Err(e) =>
            {
                self.events.unqueue(event, world);
                Err(e)
            }
        }
    }

    /* wait entered from interrupt context: same commit, the caller is
       responsible for having masked further interrupts */
    pub fn wait_irq(&self, world: WorldID, event: EventID, kind: WaitKind) -> Result<(), Cause>
    {
        self.wait(world, event, kind)
    }

    /* reader/writer lock waits: both are lock-kind waits and pin their
       VSMP on CPU so a running sibling can release the lock */
    pub fn wait_rwlock_read(&self, world: WorldID, event: EventID) -> Result<(), Cause>
    {
        self.wait(world, event, WaitKind::Lock)
    }

    pub fn wait_rwlock_write(&self, world: WorldID, event: EventID) -> Result<(), Cause>
    {
        self.wait(world, event, WaitKind::Lock)
    }

    /* wait with a deadline: a one-shot timer wakes the event if nothing
       else has by then */
    pub fn timed_wait(&self, world: WorldID, event: EventID, kind: WaitKind, ms: u64) -> Result<(), Cause>
    {
        let deadline = self.platform.now_cycles() + ms_to_cycles(&*self.platform, ms);
        self.events.add_timer(SleepTimer
        {
            deadline,
            world,
            event,
            strict_deadline: false
        });

        match self.wait(world, event, kind)
        {
            Ok(()) => Ok(()),
            Err(e) =>
            {
                self.events.remove_timers(world);
                Err(e)
            }
        }
    }

    /* sleep for at least `ms`. wakeups before the deadline are
       ignored; only the deadline timer (or death) releases the world */
    pub fn sleep(&self, world: WorldID, ms: u64) -> Result<(), Cause>
    {
        let deadline = self.platform.now_cycles() + ms_to_cycles(&*self.platform, ms);
        self.events.add_timer(SleepTimer
        {
            deadline,
            world,
            event: sleep_event(world),
            strict_deadline: true
        });

        match self.wait(world, sleep_event(world), WaitKind::Sleep)
        {
            Ok(()) => Ok(()),
            Err(e) =>
            {
                self.events.remove_timers(world);
                Err(e)
            }
        }
    }

    /* release every waiter on an event.
       <= how many worlds were woken. waking an event nobody waits on
          is quietly fine */
    pub fn wakeup(&self, event: EventID) -> usize
    {
        let waiting: Vec<WorldID> =
        {
            let waiters = self.events.waiters.lock();
            match waiters.get(&event)
            {
                Some(list) => list.clone(),
                None => return 0
            }
        };

        let mut woken = 0;
        for world in waiting
        {
            if self.wake_world(world, Some(event), false)
            {
                woken = woken + 1;
            }
        }
        woken
    }

    /* wake a specific world out of whatever it waits on, events be
       damned. used for death, actions and other out-of-band pokes */
    pub fn force_wakeup(&self, world: WorldID) -> bool
    {
        self.wake_world(world, None, true)
    }

    /* the common wake path
       => expected_event = only wake if waiting on this event
          force = ignore an unexpired sleep deadline
       <= true if the world actually left its wait */
    fn wake_world(&self, world: WorldID, expected_event: Option<EventID>, force: bool) -> bool
    {
        let entry = match self.world_entry(world)
        {
            Ok(entry) => entry,
            Err(_) => return false
        };

        let (cellid, mut state) = match self.lock_vsmp_cell(entry.vsmp)
        {
            Ok(locked) => locked,
            Err(_) => return false
        };

        let now = state.now;

        /* confirm the world is still waiting as expected */
        let event = match state.vsmp(entry.vsmp)
        {
            Some(vsmp) =>
            {
                let vcpu = &vsmp.vcpus[entry.idx];
                if vcpu.run_state.is_waiting() == false
                {
                    return false;
                }
                match (vcpu.wait_state.event(), expected_event)
                {
                    (Some(actual), Some(wanted)) if actual != wanted => return false,
                    (Some(actual), _) => actual,
                    (None, _) => return false
                }
            },
            None => return false
        };

        /* sleeps hold their deadline against spurious wakeups */
        if force == false && self.events.sleep_pending(world, self.platform.now_cycles())
        {
            return false;
        }

        let (released, parked, is_mp) = match state.vsmp_mut(entry.vsmp)
        {
            Some(vsmp) =>
            {
                vsmp.set_run_state(entry.idx, RunState::Ready, now);
                vsmp.set_wait_state(entry.idx, WaitState::None);

                /* a wakeup can be what finally releases a co-stop */
                let released = vsmp.corun_note_wakeup();

                /* a VM still co-stopped parks the fresh waker with its siblings */
                let parked = if vsmp.corun == CoRunState::CoStop
                {
                    vsmp.set_run_state(entry.idx, RunState::ReadyCostop, now);
                    true
                }
                else
                {
                    false
                };

                (released, parked, vsmp.is_mp())
            },
            None => return false
        };

        self.events.unqueue(event, world);
        self.events.remove_timers(world);

        if released
        {
            state.requeue_siblings(entry.vsmp);
        }

        if parked == false
        {
            let vref = VcpuRef { vsmp: entry.vsmp, idx: entry.idx };

            /* MP wakeups get a shot at an idle package before queueing */
            if is_mp
            {
                self.try_idle_migration(&mut state, vref);
            }

            state.queue_add(vref);
            self.resched_on_wakeup(&mut state, vref, cellid);
        }

        true
    }

    /* place a woken vCPU onto an idle CPU if its own is busy: prefer a
       CPU whose whole package idles, settle for any idle one */
    fn try_idle_migration(&self, state: &mut CellState, vref: VcpuRef)
    {
        let (current, affinity) = match state.vsmp(vref.vsmp)
        {
            Some(vsmp) =>
            {
                let vcpu = &vsmp.vcpus[vref.idx];
                (vcpu.pcpu, vcpu.affinity)
            },
            None => return
        };

        let busy = state.pcpu(current).map(|s| s.running.is_some()).unwrap_or(false);
        if busy == false
        {
            return;
        }

        let mut fallback = None;
        let mut whole_idle = None;
        for (id, shadow) in state.pcpus.iter()
        {
            if affinity.contains(*id) == false || shadow.running.is_some()
            {
                continue;
            }
            let partner_idle = match shadow.partner
            {
                Some(partner) => state.pcpu(partner).map(|p| p.running.is_none()).unwrap_or(true),
                None => true
            };
            if partner_idle
            {
                whole_idle = Some(*id);
                break;
            }
            if fallback.is_none()
            {
                fallback = Some(*id);
            }
        }

        if let Some(target) = whole_idle.or(fallback)
        {
            if let Some(vsmp) = state.vsmp_mut(vref.vsmp)
            {
                vsmp.vcpus[vref.idx].pcpu = target;
            }
        }
    }

    /* tell the woken vCPU's CPU about it, per the configured policy */
    fn resched_on_wakeup(&self, state: &mut CellState, vref: VcpuRef, _cell: usize)
    {
        let pcpu = match state.vsmp(vref.vsmp)
        {
            Some(vsmp) => vsmp.vcpus[vref.idx].pcpu,
            None => return
        };

        let kick = match self.config.resched_opt
        {
            ReschedOpt::Always => true,
            ReschedOpt::Preemptible => self.wakeup_preempts(state, vref, pcpu),
            ReschedOpt::Defer | ReschedOpt::None => false
        };

        if kick
        {
            if let Some(shadow) = state.pcpu_mut(pcpu)
            {
                shadow.mark_reschedule();
            }
            self.platform.send_resched_ipi(pcpu);
        }
    }

    /* would the woken VM preempt whatever the target CPU last picked? */
    fn wakeup_preempts(&self, state: &CellState, vref: VcpuRef, pcpu: PcpuID) -> bool
    {
        let shadow = match state.pcpu(pcpu)
        {
            Some(shadow) => shadow,
            None => return false
        };

        /* an idle CPU is always worth kicking */
        if shadow.running.is_none()
        {
            return true;
        }

        if shadow.snap.valid == false
        {
            return false;
        }

        let woken_ctx = match state.vsmp(vref.vsmp)
        {
            Some(vsmp) => vsmp.vtime,
            None => return false
        };

        context_compare(&woken_ctx, 0,
                        &shadow.snap.ctx, shadow.snap.bonus_cycles,
                        false, |_| (0, 0)) < 0
    }

    /* fire every due one-shot: called from the timer path */
    pub(crate) fn fire_due_timers(&self, now: u64)
    {
        for (world, event) in self.events.take_due(now)
        {
            self.wake_world(world, Some(event), true);
        }
    }

    /* ---- busy-waiting ---- */

    /* convert a blocked world to busy-waiting on the same event: legal
       only when the host can't take the preemption (interrupts already
       committed elsewhere) and the configuration allows polling */
    pub fn busy_wait_convert(&self, world: WorldID) -> Result<(), Cause>
    {
        if self.config.busy_wait_allowed == false
        {
            return Err(Cause::NotSupported);
        }

        let entry = self.world_entry(world)?;
        let (_, mut state) = self.lock_vsmp_cell(entry.vsmp)?;
        let now = state.now;

        let pcpu = match state.vsmp_mut(entry.vsmp)
        {
            Some(vsmp) =>
            {
                if vsmp.vcpus[entry.idx].run_state != RunState::Wait
                {
                    return Err(Cause::WaitBadEvent);
                }
                vsmp.set_run_state(entry.idx, RunState::BusyWait, now);
                vsmp.vcpus[entry.idx].pcpu
            },
            None => return Err(Cause::WorldBadID)
        };

        /* the poller is keeping its CPU: the deschedule request the
           wait posted is withdrawn */
        if let Some(shadow) = state.pcpu_mut(pcpu)
        {
            shadow.clear_reschedule();
        }
        Ok(())
    }

    /* one poll of a busy-wait loop: should the world stop polling?
       exits on wakeup (no longer waiting), a pending action, or the
       local reschedule flag */
    pub fn busy_wait_should_exit(&self, world: WorldID, pcpu: PcpuID) -> bool
    {
        let entry = match self.world_entry(world)
        {
            Ok(entry) => entry,
            Err(_) => return true
        };

        if entry.info.actions_pending() || entry.info.death_pending()
        {
            return true;
        }

        let (_, state) = match self.lock_vsmp_cell(entry.vsmp)
        {
            Ok(locked) => locked,
            Err(_) => return true
        };

        let still_waiting = state.vsmp(entry.vsmp)
            .map(|vsmp| vsmp.vcpus[entry.idx].run_state == RunState::BusyWait)
            .unwrap_or(false);
        if still_waiting == false
        {
            return true;
        }

        state.pcpu(pcpu).map(|shadow| shadow.resched).unwrap_or(true)
    }

    /* ---- actions ---- */

    /* post action bits to a world and wake it if it wants to know */
    pub fn action_notify_vcpu(&self, world: WorldID, bits: u64) -> Result<(), Cause>
    {
        let entry = self.world_entry(world)?;
        entry.info.post_action(bits);

        if entry.info.action_notify()
        {
            self.force_wakeup(world);
        }
        Ok(())
    }

    /* asynchronous action check: a conservative, lock-free peek that
       forces a wakeup only when there's something to deliver */
    pub fn async_check_actions(&self, world: WorldID)
    {
        if let Ok(entry) = self.world_entry(world)
        {
            if entry.info.actions_pending()
            {
                self.force_wakeup(world);
            }
        }
    }

    /* ---- directed yield ---- */

    /* give up the CPU in favor of a specific target world: the donor
       waits on the event, and the donor's CPU will dispatch the target
       next if it is acceptable, inheriting the donor's quantum. the
       hint is consumed at most once */
    pub fn wait_directed_yield(&self, world: WorldID, event: EventID, kind: WaitKind,
                               target: WorldID) -> Result<(), Cause>
    {
        let donor = self.world_entry(world)?;
        let target_entry = self.world_entry(target).map_err(|_| Cause::YieldBadTarget)?;

        {
            let (_, mut state) = self.lock_vsmp_cell(donor.vsmp)?;

            /* the hint only helps if the target lives in the same cell */
            if state.vsmps.contains_key(&target_entry.vsmp)
            {
                let pcpu = state.vsmp(donor.vsmp)
                    .map(|vsmp| vsmp.vcpus[donor.idx].pcpu);
                let quantum = state.vsmp(donor.vsmp).map(|vsmp| vsmp.quantum_expire);

                if let Some(pcpu) = pcpu
                {
                    if let Some(shadow) = state.pcpu_mut(pcpu)
                    {
                        shadow.yield_to = Some(VcpuRef
                        {
                            vsmp: target_entry.vsmp,
                            idx: target_entry.idx
                        });
                        shadow.yield_quantum = quantum;
                    }
                }
            }
        }

        self.wait(world, event, kind)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn sleep_events_are_per_world()
    {
        assert!(sleep_event(1) != sleep_event(2));
        assert!(sleep_event(0) >= SLEEP_EVENT_BASE);
    }

    #[test]
    fn event_table_queueing()
    {
        let table = EventTable::new();
        table.enqueue(7, 100);
        table.enqueue(7, 101);
        table.unqueue(7, 100);

        let waiters = table.waiters.lock();
        assert_eq!(waiters.get(&7).map(|l| l.len()), Some(1));
    }

    #[test]
    fn due_timers_split_off()
    {
        let table = EventTable::new();
        table.add_timer(SleepTimer { deadline: 100, world: 1, event: 5, strict_deadline: false });
        table.add_timer(SleepTimer { deadline: 200, world: 2, event: 6, strict_deadline: false });

        let due = table.take_due(150);
        assert_eq!(due, alloc::vec![(1, 5)]);
        assert_eq!(due.len(), 1);

        /* the later timer still pends */
        assert_eq!(table.take_due(250), alloc::vec![(2, 6)]);
    }

    #[test]
    fn sleep_deadline_blocks_spurious_wakeups()
    {
        let table = EventTable::new();
        table.add_timer(SleepTimer { deadline: 1000, world: 3, event: sleep_event(3), strict_deadline: true });
        assert!(table.sleep_pending(3, 500));
        assert!(!table.sleep_pending(3, 1500));
        assert!(!table.sleep_pending(4, 500));
    }
}

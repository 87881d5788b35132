/* fairsched dispatcher
 *
 * Every physical CPU runs this dispatch path against its own cell:
 * update the clocks, charge whoever just ran, pick the next virtual
 * CPU by bonus-adjusted virtual time, honor co-scheduling and
 * hyperthread constraints, and switch. The common case takes exactly
 * one cell lock. Remote cells are only ever try-locked from the scan
 * path, and a cross-cell migration re-acquires both locks in
 * ascending id order before moving the VSMP.
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
use super::platform::{PcpuID, PcpuMask, WorldID, WORLD_ID_NONE};
use super::cell::{lock_two, sync_time, CellState};
use super::cosched::{can_coschedule, must_cosched_set, skew_sample};
use super::groups::{GroupID, GroupVtime, GROUP_ID_INVALID, GROUP_PATH_LEN};
use super::ht;
use super::pcpu::PreemptSnap;
use super::runq::{QueueKind, VcpuRef};
use super::vcpu::RunState;
use super::vsmp::{CellID, CoRunState, VsmpID};
use super::vtime::{self, context_compare, Stride, Vtime, VtimeContext};

/* spinning on a remote switch-in-progress flag longer than this is a hang */
const SWITCH_DRAIN_SPINS_MAX: u64 = 100000000;

/* a quantum overshoot worth a whole minute of cycles means the
   accounting went off the rails */
const OVERSHOOT_PANIC_SECONDS: u64 = 60;

/* a dispatch candidate, copied out of the tables so selection can
   run without holding borrows open */
#[derive(Clone, Copy)]
struct Cand
{
    vref: VcpuRef,
    ctx: VtimeContext,
    bonus: i64
}

/* what the choose pass decided */
enum Choice
{
    /* run this vCPU, optionally inheriting a donor's quantum expiry */
    Local(VcpuRef, Option<u64>),

    /* a better candidate sits in another cell: migrate its VSMP here */
    Remote(CellID, VsmpID),

    /* nothing runnable beats idling */
    Idle
}

impl CpuSched
{
    /* ---- reschedule flags ---- */

    /* raise a CPU's local reschedule flag and poke it */
    pub fn mark_reschedule(&self, pcpu: PcpuID)
    {
        if let Ok(cell) = self.cell_of_pcpu(pcpu)
        {
            let mut state = cell.state.lock();
            if let Some(shadow) = state.pcpu_mut(pcpu)
            {
                shadow.mark_reschedule();
            }
        }
        self.platform.send_resched_ipi(pcpu);
    }

    pub fn need_resched(&self, pcpu: PcpuID) -> bool
    {
        match self.cell_of_pcpu(pcpu)
        {
            Ok(cell) => cell.state.lock().pcpu(pcpu).map(|s| s.resched).unwrap_or(false),
            Err(_) => false
        }
    }

    /* ---- the timer tick ---- */

    /* called from every physical CPU's timer interrupt: quantum expiry,
       the skew sampler, machine-clear sampling and global housekeeping */
    pub fn timer_tick(&self, pcpu: PcpuID)
    {
        let mut kick: Vec<PcpuID> = Vec::new();

        if let Ok(cell) = self.cell_of_pcpu(pcpu)
        {
            let mut state = cell.state.lock();
            state.update_time(self.platform.now_cycles());
            self.vtime_reset_check(&mut state);
            let now = state.now;

            /* quantum expiry, or deferred-resched pickup of queued work */
            let running = state.pcpu(pcpu).and_then(|s| s.running);
            let mark = match running
            {
                Some(entry) => match state.vsmp(entry.vsmp)
                {
                    Some(vsmp) => now > vsmp.quantum_expire,
                    None => true
                },
                None => state.pcpu(pcpu).map(|s| s.queues.total() > 0).unwrap_or(false)
            };
            let mark = mark || (self.config.resched_opt == ReschedOpt::Defer
                                && state.pcpu(pcpu).map(|s| s.queues.total() > 0).unwrap_or(false));
            if mark
            {
                if let Some(shadow) = state.pcpu_mut(pcpu)
                {
                    shadow.mark_reschedule();
                }
            }

            /* the skew sampler runs every skew_sample period per CPU */
            let due = state.pcpu(pcpu)
                .map(|s| now.saturating_sub(s.last_skew_sample) >= self.tun.skew_sample)
                .unwrap_or(false);
            if due
            {
                if let Some(shadow) = state.pcpu_mut(pcpu)
                {
                    shadow.last_skew_sample = now;
                }

                let prev_running = state.pcpu(pcpu).and_then(|s| s.running)
                    .and_then(|entry| state.vsmp(entry.vsmp)
                        .map(|vsmp| vsmp.vcpus[entry.idx].run_state == RunState::Run))
                    .unwrap_or(false);

                let verdict = skew_sample(&mut state, pcpu, &self.config,
                                          self.platform.ht_enabled(), prev_running);
                for target in verdict.mark
                {
                    if let Some(shadow) = state.pcpu_mut(target)
                    {
                        shadow.mark_reschedule();
                    }
                    kick.push(target);
                }
            }

            /* machine-clear sampling for the quarantine */
            self.ht_event_sample(&mut state, pcpu);
        }

        for target in kick
        {
            self.platform.send_resched_ipi(target);
        }

        self.poll_timers(pcpu);
    }

    /* sample the running vCPU's machine-clear counter once enough used
       time has passed, and move its VM in or out of quarantine */
    fn ht_event_sample(&self, state: &mut CellState, pcpu: PcpuID)
    {
        if self.config.machine_clear_thresh == 0
        {
            return;
        }

        let entry = match state.pcpu(pcpu).and_then(|s| s.running)
        {
            Some(entry) => entry,
            None => return
        };

        let world = match state.vsmp(entry.vsmp)
        {
            Some(vsmp) => vsmp.vcpus[entry.idx].world,
            None => return
        };

        let counter = self.platform.read_machine_clears(world);

        let changed = match state.vsmp_mut(entry.vsmp)
        {
            Some(vsmp) =>
            {
                let vcpu = &mut vsmp.vcpus[entry.idx];
                let used = vcpu.run_cycles.saturating_sub(vcpu.mc_used_cycles);
                if used < self.tun.ht_event
                {
                    return;
                }
                vcpu.mc_used_cycles = vcpu.run_cycles;

                if let Some(count) = counter
                {
                    ht::quarantine_sample(vcpu, count, used);
                }
                ht::quarantine_update(vsmp, &self.config)
            },
            None => None
        };

        /* a quarantine transition stales the partner's last-pick snapshot */
        if changed.is_some()
        {
            let partner = state.pcpu(pcpu).and_then(|s| s.partner);
            if let Some(partner) = partner
            {
                if let Some(shadow) = state.pcpu_mut(partner)
                {
                    shadow.snap.valid = false;
                }
            }
        }
    }

    /* ---- idle halting ---- */

    /* halt an idle CPU until something marks it for reschedule. the
       timeout is advisory: the host's timer will tick us regardless */
    pub fn halt(&self, pcpu: PcpuID, _timeout_us: u64) -> Result<(), Cause>
    {
        if self.config.halting_idle == false
        {
            return Ok(());
        }

        let cell = self.cell_of_pcpu(pcpu)?;
        let mut state = cell.state.lock();
        let now = state.now;

        match state.pcpu_mut(pcpu)
        {
            Some(shadow) =>
            {
                if shadow.running.is_some() || shadow.halted
                {
                    return Err(Cause::PcpuBadID);
                }
                shadow.halted = true;
                shadow.halt.begin(now);
                Ok(())
            },
            None => Err(Cause::PcpuBadID)
        }
    }

    /* wake a halted CPU: close its halt interval */
    pub fn unhalt(&self, pcpu: PcpuID)
    {
        if let Ok(cell) = self.cell_of_pcpu(pcpu)
        {
            let mut state = cell.state.lock();
            let now = state.now;
            if let Some(shadow) = state.pcpu_mut(pcpu)
            {
                if shadow.halted
                {
                    shadow.halted = false;
                    shadow.halt.end(now);
                }
            }
        }
    }

    /* ---- the dispatcher ---- */

    /* run one scheduling decision on a CPU and world-switch into the
       winner. returns the world now on the CPU, or None for idle */
    pub fn dispatch(&self, pcpu: PcpuID) -> Option<WorldID>
    {
        let mut pulled: Option<(CellID, VsmpID)> = None;

        loop
        {
            /* a remote candidate chosen last pass is migrated first,
               then the choice re-runs locally */
            if let Some((remote, vsmp)) = pulled.take()
            {
                self.migrate_vsmp(pcpu, remote, vsmp);
            }

            let cell = match self.cell_of_pcpu(pcpu)
            {
                Ok(cell) => cell,
                Err(_) => return None
            };

            let mut state = cell.state.lock();
            state.update_time(self.platform.now_cycles());
            self.vtime_reset_check(&mut state);
            let now = state.now;

            if let Some(shadow) = state.pcpu_mut(pcpu)
            {
                shadow.clear_reschedule();

                /* a fresh decision invalidates the cached group clocks */
                shadow.cache.invalidate();
            }

            /* a runner under an unconditional kill dies right here: its
               interrupt-return path never goes back to the guest */
            if let Some(prev) = state.pcpu(pcpu).and_then(|s| s.running)
            {
                let doomed = state.vsmp(prev.vsmp)
                    .map(|v| v.vcpus[prev.idx].info.kill_level()
                         == super::world::KillLevel::Unconditional)
                    .unwrap_or(false);
                if doomed
                {
                    let world = state.vsmp(prev.vsmp)
                        .map(|v| v.vcpus[prev.idx].world)
                        .unwrap_or(WORLD_ID_NONE);
                    self.charge_vcpu(&mut state, pcpu, prev);
                    if let Some(shadow) = state.pcpu_mut(pcpu)
                    {
                        shadow.running = None;
                    }
                    drop(state);
                    self.reap_world(world);
                    continue;
                }
            }

            /* a busy-waiting previous runner reverts to a plain wait:
               whatever it polls for hasn't arrived and it lost the CPU */
            if let Some(prev) = state.pcpu(pcpu).and_then(|s| s.running)
            {
                let polling = state.vsmp(prev.vsmp)
                    .map(|v| v.vcpus[prev.idx].run_state == RunState::BusyWait)
                    .unwrap_or(false);
                if polling
                {
                    if let Some(vsmp) = state.vsmp_mut(prev.vsmp)
                    {
                        vsmp.set_run_state(prev.idx, RunState::Wait, now);
                    }
                }
            }

            /* limbo is revisited every dispatch: caps lapse as the cell
               clock catches up */
            self.revisit_limbo(&mut state, pcpu);

            /* publish fresh preemption snapshots for the other CPUs here */
            self.refresh_snapshots(&mut state, pcpu);

            match self.choose(&mut state, pcpu)
            {
                Choice::Local(next, inherit) =>
                {
                    return self.switch_to(state, pcpu, next, inherit);
                },
                Choice::Remote(remote, vsmp) =>
                {
                    drop(state);
                    pulled = Some((remote, vsmp));
                    continue;
                },
                Choice::Idle =>
                {
                    return self.go_idle(state, pcpu);
                }
            }
        }
    }

    /* move limbo entries whose VSMP is no longer capped back to a live queue */
    fn revisit_limbo(&self, state: &mut CellState, pcpu: PcpuID)
    {
        let cell_vtime = state.vtime;

        let stuck: Vec<VcpuRef> = match state.pcpu(pcpu)
        {
            Some(shadow) => shadow.queues.iter(QueueKind::Limbo).copied().collect(),
            None => return
        };

        for entry in stuck
        {
            let freed = state.vsmp(entry.vsmp)
                .map(|vsmp| vsmp.max_limited(cell_vtime) == false)
                .unwrap_or(false);
            if freed
            {
                state.queue_remove(entry);
                state.queue_add(entry);
            }
        }
    }

    /* update the last-pick snapshots of every other CPU in the cell:
       busy CPUs publish their runner's context plus the preemption
       bonus; idle CPUs publish an idle context shaped by the partner's
       VM, the halt wakeup cost and the CPU's interrupt appetite */
    fn refresh_snapshots(&self, state: &mut CellState, pcpu: PcpuID)
    {
        let bonus = self.preempt_bonus_cycles();
        let others: Vec<PcpuID> = state.pcpus.keys().copied().filter(|id| *id != pcpu).collect();

        for other in others
        {
            let snap = match state.pcpu(other).and_then(|s| s.running)
            {
                Some(entry) => state.vsmp(entry.vsmp).map(|vsmp| PreemptSnap
                {
                    valid: true,
                    ctx: vsmp.vtime,
                    bonus_cycles: bonus
                }),
                None => Some(self.idle_snapshot(state, other))
            };

            if let Some(snap) = snap
            {
                if let Some(shadow) = state.pcpu_mut(other)
                {
                    shadow.snap = snap;
                }
            }
        }
    }

    /* the idle context of a CPU: normally infinitely preemptible, but a
       hyperthread whose partner is busy inherits the partner VM's clock
       (sharing the package isn't free), a halted CPU charges its wakeup
       penalty, and an interrupt-heavy CPU is made less attractive */
    fn idle_snapshot(&self, state: &CellState, pcpu: PcpuID) -> PreemptSnap
    {
        let mut ctx = VtimeContext::new(state.nstride, state.nstride,
                                        [GROUP_ID_INVALID; GROUP_PATH_LEN]);
        ctx.main = Vtime::max_value() / 2;

        let shadow = match state.pcpu(pcpu)
        {
            Some(shadow) => shadow,
            None => return PreemptSnap { valid: true, ctx, bonus_cycles: 0 }
        };

        if let Some(partner) = shadow.partner
        {
            if let Some(entry) = state.pcpu(partner).and_then(|s| s.running)
            {
                if let Some(vsmp) = state.vsmp(entry.vsmp)
                {
                    ctx = vsmp.vtime;
                    match ht::effective_sharing(vsmp, true)
                    {
                        super::vsmp::HtSharing::Any => (),
                        _ =>
                        {
                            /* the partner's VM resents company: make this
                               thread look expensive to wake */
                            ctx.main = ctx.main.saturating_add(
                                vtime::cycles_to_vtime(ctx.stride, self.tun.quantum));
                        }
                    }
                }
            }
        }

        let mut penalty = 0i64;
        if shadow.halted && self.config.halting_idle
        {
            penalty = penalty - self.tun.halt_penalty as i64;
        }
        if shadow.irq_count > 0
        {
            penalty = penalty - (shadow.irq_count / 64) as i64;
        }

        PreemptSnap { valid: true, ctx, bonus_cycles: penalty }
    }

    fn preempt_bonus_cycles(&self) -> i64
    {
        super::platform::ms_to_cycles(&*self.platform, self.config.preempt_bonus_ms as u64) as i64
    }

    /* ---- candidate selection ---- */

    fn choose(&self, state: &mut CellState, pcpu: PcpuID) -> Choice
    {
        let now = state.now;
        let cell_vtime = state.vtime;

        /* 1: a pending handoff wins outright */
        let handoff = state.pcpu_mut(pcpu).and_then(|s| s.handoff.take());
        if let Some(entry) = handoff
        {
            let good = state.vsmp(entry.vsmp).map(|vsmp|
            {
                let vcpu = &vsmp.vcpus[entry.idx];
                (vcpu.run_state == RunState::ReadyCorun || vcpu.run_state == RunState::Ready)
                    && vcpu.affinity.contains(pcpu)
            }).unwrap_or(false);
            let free = match state.running_on(entry)
            {
                Some(on) => on == pcpu,
                None => true
            };
            if good && free
            {
                return Choice::Local(entry, None);
            }
            if good
            {
                /* still draining elsewhere: keep the reservation */
                if let Some(shadow) = state.pcpu_mut(pcpu)
                {
                    shadow.handoff = Some(entry);
                }
            }
            else
            {
                self.unpark_corun(state, entry);
            }
        }

        /* 2: a directed-yield target, if it's still worth taking */
        let hint = state.pcpu_mut(pcpu).map(|s| (s.yield_to.take(), s.yield_quantum.take()));
        if let Some((Some(entry), quantum)) = hint
        {
            let good = state.vsmp(entry.vsmp).map(|vsmp|
            {
                let vcpu = &vsmp.vcpus[entry.idx];
                vcpu.run_state == RunState::Ready
                    && vcpu.affinity.contains(pcpu)
                    && vsmp.max_limited(cell_vtime) == false
                    && must_cosched_set(vsmp, entry.idx, &self.config).is_empty()
            }).unwrap_or(false);
            let free = match state.running_on(entry)
            {
                Some(on) => on == pcpu,
                None => true
            };
            if good && free
            {
                return Choice::Local(entry, quantum);
            }
        }

        /* migration gates: a CPU scans beyond its own queues only so
           often, with a small random chance to scan anyway so idle CPUs
           don't go blind between windows */
        let (pcpu_migrate_ok, cell_migrate_ok) = match state.pcpu_mut(pcpu)
        {
            Some(shadow) =>
            {
                let chance = self.config.migrate_chance > 0
                    && shadow.rand.below(self.config.migrate_chance as u64) == 0;
                let pcpu_ok = now >= shadow.next_pcpu_migrate || chance;
                let cell_ok = pcpu_ok && now >= shadow.next_cell_migrate;
                (pcpu_ok, cell_ok)
            },
            None => (false, false)
        };

        /* main pass, then extra pass, identical sequence */
        for use_extra in [false, true].iter()
        {
            let kind = if *use_extra { QueueKind::Extra } else { QueueKind::Main };
            let cands = self.gather(state, pcpu, kind, pcpu_migrate_ok);

            /* resolve the group clocks the extra comparison will need,
               through this CPU's cache */
            let groups = if *use_extra
            {
                self.resolve_groups(state, pcpu, &cands)
            }
            else
            {
                HashMap::new()
            };
            let nstride = state.nstride;
            let lookup = move |id: GroupID| -> (Vtime, Stride)
            {
                match groups.get(&id)
                {
                    Some(clock) => (clock.vtime, clock.stride),
                    None => (0, nstride)
                }
            };

            let mut best: Option<Cand> = None;
            for cand in cands
            {
                best = match best
                {
                    None => Some(cand),
                    Some(current) =>
                    {
                        if context_compare(&cand.ctx, cand.bonus,
                                           &current.ctx, current.bonus,
                                           *use_extra, &lookup) < 0
                        {
                            Some(cand)
                        }
                        else
                        {
                            Some(current)
                        }
                    }
                };
            }

            if let Some(winner) = best
            {
                /* the main pass also offers one randomly chosen remote
                   cell, try-locked, the chance to beat the local winner */
                if *use_extra == false && cell_migrate_ok
                {
                    if let Some((remote_cell, remote_vsmp, remote_ctx)) =
                        self.scan_remote_cell(state, pcpu)
                    {
                        if context_compare(&remote_ctx, 0, &winner.ctx, winner.bonus,
                                           false, &lookup) < 0
                        {
                            self.note_cell_scan(state, pcpu, now);
                            return Choice::Remote(remote_cell, remote_vsmp);
                        }
                    }
                }

                /* an intra-cell pull from another CPU's queue is a pcpu
                   migration: stamp the gate */
                let migrated = state.vsmp(winner.vref.vsmp)
                    .map(|vsmp| vsmp.vcpus[winner.vref.idx].pcpu != pcpu)
                    .unwrap_or(false);
                if migrated
                {
                    if let Some(shadow) = state.pcpu_mut(pcpu)
                    {
                        let period = shadow.rand.jitter(self.tun.pcpu_migrate);
                        shadow.next_pcpu_migrate = now + period;
                    }
                }

                return Choice::Local(winner.vref, None);
            }

            /* main pass found nothing at all: the remote cell is still
               worth a look before falling through to extra */
            if *use_extra == false && cell_migrate_ok
            {
                if let Some((remote_cell, remote_vsmp, _)) = self.scan_remote_cell(state, pcpu)
                {
                    self.note_cell_scan(state, pcpu, now);
                    return Choice::Remote(remote_cell, remote_vsmp);
                }
            }
        }

        /* nothing runnable suits this CPU. if the current runner is
           being squeezed by its partner's policy, try pushing it away
           rather than spinning here */
        self.try_runner_move(state, pcpu, now);

        Choice::Idle
    }

    /* collect acceptable candidates for one queue kind: the current
       runner (with its bonus), the local queue, and - migration
       allowed - the other CPUs of the cell, or just the hyperthread
       partner when it isn't */
    fn gather(&self, state: &CellState, pcpu: PcpuID, kind: QueueKind,
              migrate_ok: bool) -> Vec<Cand>
    {
        let mut cands = Vec::new();
        let bonus = self.preempt_bonus_cycles();

        /* the incumbent defends its CPU with the preemption bonus */
        if let Some(entry) = state.pcpu(pcpu).and_then(|s| s.running)
        {
            if let Some(vsmp) = state.vsmp(entry.vsmp)
            {
                if vsmp.vcpus[entry.idx].run_state == RunState::Run
                    && vsmp.vcpus[entry.idx].info.death_pending() == false
                    && vsmp.vcpus[entry.idx].affinity.contains(pcpu)
                    && vsmp.max_limited(state.vtime) == false
                    && self.sharing_ok(state, entry, pcpu)
                {
                    /* the incumbent belongs to the pass its standing matches */
                    if super::runq::queue_for(vsmp, state.vtime) == kind
                    {
                        cands.push(Cand { vref: entry, ctx: vsmp.vtime, bonus });
                    }
                }
            }
        }

        let scan_queue = |queue_pcpu: PcpuID, cands: &mut Vec<Cand>|
        {
            if let Some(shadow) = state.pcpu(queue_pcpu)
            {
                for entry in shadow.queues.iter(kind)
                {
                    if self.acceptable(state, *entry, pcpu)
                    {
                        if let Some(vsmp) = state.vsmp(entry.vsmp)
                        {
                            cands.push(Cand { vref: *entry, ctx: vsmp.vtime, bonus: 0 });
                        }
                    }
                }
            }
        };

        scan_queue(pcpu, &mut cands);

        if migrate_ok
        {
            let others: Vec<PcpuID> = state.pcpus.keys().copied()
                .filter(|id| *id != pcpu).collect();
            for other in others
            {
                scan_queue(other, &mut cands);
            }
        }
        else if let Some(partner) = state.pcpu(pcpu).and_then(|s| s.partner)
        {
            scan_queue(partner, &mut cands);
        }

        cands
    }

    /* per-candidate acceptability on this CPU: affinity, the cap, the
       co-run state, mutual hyperthread sharing with the partner's
       occupant, and co-schedulability of the rest of its VM */
    fn acceptable(&self, state: &CellState, entry: VcpuRef, pcpu: PcpuID) -> bool
    {
        let vsmp = match state.vsmp(entry.vsmp)
        {
            Some(vsmp) => vsmp,
            None => return false
        };
        let vcpu = &vsmp.vcpus[entry.idx];

        if vcpu.run_state != RunState::Ready
        {
            return false;
        }
        if vcpu.info.death_pending()
        {
            return false;
        }
        if vcpu.affinity.contains(pcpu) == false
        {
            return false;
        }

        /* still draining off another CPU's stack: that CPU must switch
           it out before anyone else may run it */
        match state.running_on(entry)
        {
            Some(on) if on != pcpu => return false,
            _ => ()
        }
        if vsmp.corun == CoRunState::CoStop
        {
            return false;
        }
        if vsmp.max_limited(state.vtime)
        {
            return false;
        }

        if self.sharing_ok(state, entry, pcpu) == false
        {
            return false;
        }

        /* an SMP candidate must be placeable as a whole */
        let placeable = self.cell_mask_of(state);
        can_coschedule(vsmp, entry.idx, pcpu, placeable, &self.config)
    }

    /* both sides of a package must consent to sharing it. a VM
       demanding whole packages refuses even its own siblings. applies
       to queued candidates and to whoever already sits on the CPU */
    fn sharing_ok(&self, state: &CellState, entry: VcpuRef, pcpu: PcpuID) -> bool
    {
        let vsmp = match state.vsmp(entry.vsmp)
        {
            Some(vsmp) => vsmp,
            None => return false
        };

        if let Some(partner) = state.pcpu(pcpu).and_then(|s| s.partner)
        {
            if let Some(occupant) = state.pcpu(partner).and_then(|s| s.running)
            {
                let mine = ht::effective_sharing(vsmp,
                    self.affinity_allows_whole(vsmp));
                if ht::sharing_permits(mine, entry.vsmp, Some(occupant.vsmp)) == false
                {
                    return false;
                }
                if occupant.vsmp != entry.vsmp
                {
                    if let Some(other) = state.vsmp(occupant.vsmp)
                    {
                        let theirs = ht::effective_sharing(other,
                            self.affinity_allows_whole(other));
                        if ht::sharing_permits(theirs, occupant.vsmp, Some(entry.vsmp)) == false
                        {
                            return false;
                        }
                    }
                }
            }
        }

        true
    }

    /* can this VM claim a whole package per vCPU out of its affinity? */
    fn affinity_allows_whole(&self, vsmp: &super::vsmp::Vsmp) -> bool
    {
        if self.platform.ht_enabled() == false
        {
            return true;
        }

        let union = vsmp.affinity_union();
        let mut packages = 0;
        let per = self.platform.logical_per_package();
        for package in 0..(self.platform.num_pcpus() + per - 1) / per
        {
            let mut whole = true;
            for offset in 0..per
            {
                if union.contains(package * per + offset) == false
                {
                    whole = false;
                }
            }
            if whole
            {
                packages = packages + 1;
            }
        }
        packages >= vsmp.nvcpus()
    }

    fn cell_mask_of(&self, state: &CellState) -> PcpuMask
    {
        let mut mask = PcpuMask::EMPTY;
        for id in state.pcpus.keys()
        {
            mask.set(*id);
        }
        mask
    }

    /* resolve the group clocks mentioned on candidates' paths through
       the per-CPU cache, filling misses from the tree */
    fn resolve_groups(&self, state: &mut CellState, pcpu: PcpuID,
                      cands: &[Cand]) -> HashMap<GroupID, GroupVtime>
    {
        let mut wanted = Vec::new();
        for cand in cands.iter()
        {
            for slot in 0..GROUP_PATH_LEN
            {
                let id = cand.ctx.path[slot];
                if id == GROUP_ID_INVALID
                {
                    break;
                }
                if wanted.contains(&id) == false
                {
                    wanted.push(id);
                }
            }
        }

        let mut resolved = HashMap::new();
        for id in wanted
        {
            let cached = state.pcpu(pcpu).and_then(|s| s.cache.lookup(id));
            match cached
            {
                Some(clock) =>
                {
                    resolved.insert(id, clock);
                },
                None =>
                {
                    /* miss: fetch the publish handle under the tree lock
                       and remember it for the rest of this generation */
                    if let Some(handle) = self.tree.lock().clock_handle(id)
                    {
                        let clock = handle.read();
                        if let Some(shadow) = state.pcpu_mut(pcpu)
                        {
                            shadow.cache.insert(id, handle);
                        }
                        resolved.insert(id, clock);
                    }
                }
            }
        }
        resolved
    }

    /* try-lock one randomly chosen other cell and report its best
       main-queue candidate compatible with this CPU. a contended cell
       is skipped outright */
    fn scan_remote_cell(&self, state: &mut CellState, pcpu: PcpuID)
        -> Option<(CellID, VsmpID, VtimeContext)>
    {
        let ncells = self.num_cells();
        if ncells < 2
        {
            return None;
        }

        let local = state.id;
        let pick = state.pcpu_mut(pcpu)?.rand.below(ncells as u64) as usize;
        if pick == local
        {
            return None;
        }

        let remote = self.cell(pick)?;
        let guard = match remote.state.try_lock()
        {
            Some(guard) => guard,
            None => return None
        };

        let mut best: Option<(VsmpID, VtimeContext)> = None;
        for (_, shadow) in guard.pcpus.iter()
        {
            for entry in shadow.queues.iter(QueueKind::Main)
            {
                let vsmp = match guard.vsmp(entry.vsmp)
                {
                    Some(vsmp) => vsmp,
                    None => continue
                };
                let vcpu = &vsmp.vcpus[entry.idx];

                /* console worlds never migrate, and the whole VM must
                   fit this CPU's cell by affinity */
                if vcpu.run_state != RunState::Ready || vsmp.console
                {
                    continue;
                }
                if vcpu.affinity.contains(pcpu) == false
                {
                    continue;
                }
                if vsmp.max_limited(guard.vtime)
                {
                    continue;
                }

                best = match best
                {
                    None => Some((entry.vsmp, vsmp.vtime)),
                    Some((_, best_ctx)) =>
                    {
                        if context_compare(&vsmp.vtime, 0, &best_ctx, 0,
                                           false, |_| (0, 0)) < 0
                        {
                            Some((entry.vsmp, vsmp.vtime))
                        }
                        else
                        {
                            best
                        }
                    }
                };
            }
        }

        best.map(|(vsmp, ctx)| (pick, vsmp, ctx))
    }

    fn note_cell_scan(&self, state: &mut CellState, pcpu: PcpuID, now: u64)
    {
        if let Some(shadow) = state.pcpu_mut(pcpu)
        {
            let period = shadow.rand.jitter(self.tun.cell_migrate);
            shadow.next_cell_migrate = now + period;
            let period = shadow.rand.jitter(self.tun.pcpu_migrate);
            shadow.next_pcpu_migrate = now + period;
        }
    }

    /* push the current runner to an idle permissible CPU when this
       CPU has to idle anyway and the runner's package is contested */
    fn try_runner_move(&self, state: &mut CellState, pcpu: PcpuID, now: u64)
    {
        let allowed = state.pcpu(pcpu)
            .map(|s| now >= s.next_runner_move)
            .unwrap_or(false);
        if allowed == false
        {
            return;
        }

        let entry = match state.pcpu(pcpu).and_then(|s| s.running)
        {
            Some(entry) => entry,
            None => return
        };

        /* only bother when the partner thread is squeezed by policy */
        let squeezed = match state.pcpu(pcpu).and_then(|s| s.partner)
        {
            Some(partner) => match state.pcpu(partner).and_then(|s| s.running)
            {
                Some(occupant) if occupant.vsmp != entry.vsmp =>
                {
                    match state.vsmp(entry.vsmp)
                    {
                        Some(vsmp) => ht::effective_sharing(vsmp,
                            self.affinity_allows_whole(vsmp)) != super::vsmp::HtSharing::Any,
                        None => false
                    }
                },
                _ => false
            },
            None => false
        };
        if squeezed == false
        {
            return;
        }

        /* find an idle CPU the runner may use */
        let affinity = match state.vsmp(entry.vsmp)
        {
            Some(vsmp) => vsmp.vcpus[entry.idx].affinity,
            None => return
        };
        let target = state.pcpus.iter()
            .filter(|(id, shadow)| affinity.contains(**id) && **id != pcpu
                    && shadow.running.is_none() && shadow.queues.total() == 0)
            .map(|(id, _)| *id)
            .next();

        if let Some(target) = target
        {
            if let Some(vsmp) = state.vsmp_mut(entry.vsmp)
            {
                vsmp.vcpus[entry.idx].pcpu = target;
            }
            if let Some(shadow) = state.pcpu_mut(pcpu)
            {
                let period = shadow.rand.jitter(self.tun.runner_move);
                shadow.next_runner_move = now + period;
            }
            if let Some(shadow) = state.pcpu_mut(target)
            {
                shadow.mark_reschedule();
            }
            self.platform.send_resched_ipi(target);
        }
    }

    /* ---- cross-cell migration ---- */

    /* an affinity change can orphan a VM from its cell: pull it into
       the cell owning the target CPU.
       <= Busy while a vCPU is still on a CPU in the old cell */
    pub(crate) fn migrate_for_affinity(&self, target_pcpu: PcpuID, from_cell: CellID,
                                       vsmp: VsmpID) -> Result<(), Cause>
    {
        self.migrate_vsmp(target_pcpu, from_cell, vsmp);

        let (cell_now, _) = self.lock_vsmp_cell(vsmp)?;
        let wanted = self.cell_of_pcpu(target_pcpu)?.id;
        if cell_now != wanted
        {
            return Err(Cause::WorldRemoveBusy);
        }
        Ok(())
    }

    /* pull a VSMP from a remote cell into this CPU's cell: both locks
       in ascending id order, move the value, sync the clocks, re-home
       the vCPUs and requeue */
    fn migrate_vsmp(&self, pcpu: PcpuID, remote_id: CellID, vsmp_id: VsmpID)
    {
        let local = match self.cell_of_pcpu(pcpu)
        {
            Ok(cell) => cell,
            Err(_) => return
        };
        if local.id == remote_id
        {
            return;
        }
        let remote = match self.cell(remote_id)
        {
            Some(cell) => cell,
            None => return
        };

        let (mut local_guard, mut remote_guard) = lock_two(local, remote);

        /* the candidate may have moved or run since the scan */
        let movable = remote_guard.vsmp(vsmp_id)
            .map(|vsmp| vsmp.nrun == 0 && vsmp.console == false)
            .unwrap_or(false);
        if movable == false
        {
            return;
        }

        /* pull the vCPUs off the remote queues */
        let entries: Vec<VcpuRef> = match remote_guard.vsmp(vsmp_id)
        {
            Some(vsmp) => (0..vsmp.nvcpus()).map(|idx| VcpuRef { vsmp: vsmp_id, idx }).collect(),
            None => return
        };

        /* a vCPU still draining off a remote CPU's stack pins the VM
           in place until that CPU switches away */
        for entry in entries.iter()
        {
            if remote_guard.running_on(*entry).is_some()
            {
                return;
            }
        }
        for entry in entries.iter()
        {
            remote_guard.queue_remove(*entry);
        }

        let mut vsmp = match remote_guard.vsmps.remove(&vsmp_id)
        {
            Some(vsmp) => vsmp,
            None => return
        };

        /* element-wise max keeps both cells' clocks monotonic */
        sync_time(&mut local_guard, &mut remote_guard);

        /* re-home every vCPU onto a permissible local CPU, spreading
           round-robin across the cell */
        let local_mask = self.cell_mask_of(&local_guard);
        let locals: Vec<PcpuID> = local_mask.iter().collect();
        let mut cursor = locals.iter().position(|id| *id == pcpu).unwrap_or(0);
        for vcpu in vsmp.vcpus.iter_mut()
        {
            let allowed = vcpu.affinity.intersect(local_mask);
            let mut home = allowed.first().unwrap_or(pcpu);
            for step in 0..locals.len()
            {
                let candidate = locals[(cursor + step) % locals.len()];
                if allowed.contains(candidate)
                {
                    home = candidate;
                    cursor = cursor + step + 1;
                    break;
                }
            }
            vcpu.pcpu = home;
        }

        vsmp.cell = local_guard.id;
        local_guard.vsmps.insert(vsmp_id, vsmp);
        self.set_cell_hint(vsmp_id, local_guard.id);

        /* timestamps from the slower cell must not sit in our future */
        local_guard.clamp_vsmp_meters(vsmp_id);

        for entry in entries
        {
            let ready = local_guard.vsmp(entry.vsmp)
                .map(|vsmp| vsmp.vcpus[entry.idx].run_state.is_ready())
                .unwrap_or(false);
            if ready
            {
                local_guard.queue_add(entry);
            }
        }

        hvdebug!("VSMP {} migrated cell {} -> cell {}", vsmp_id, remote_id, local_guard.id);
    }

    /* ---- the switch itself ---- */

    /* charge and deschedule the previous runner. returns its world id */
    fn deschedule_prev(&self, state: &mut CellState, pcpu: PcpuID,
                       next: Option<VcpuRef>) -> WorldID
    {
        let prev = match state.pcpu(pcpu).and_then(|s| s.running)
        {
            Some(prev) => prev,
            None => return WORLD_ID_NONE
        };
        let now = state.now;

        let (prev_world, prev_state) = match state.vsmp(prev.vsmp)
        {
            Some(vsmp) => (vsmp.vcpus[prev.idx].world, vsmp.vcpus[prev.idx].run_state),
            None =>
            {
                /* the VSMP left this cell underneath us */
                if let Some(shadow) = state.pcpu_mut(pcpu)
                {
                    shadow.running = None;
                }
                return WORLD_ID_NONE;
            }
        };

        if prev_state == RunState::Run
        {
            /* being preempted. an SMP VM that needs its siblings and is
               losing the CPU to a stranger regroups via co-stop */
            let (stop, target) = match state.vsmp(prev.vsmp)
            {
                Some(vsmp) =>
                {
                    let needs = vsmp.is_mp() && vsmp.corun == CoRunState::CoRun
                        && must_cosched_set(vsmp, prev.idx, &self.config).is_empty() == false;
                    let stranger = next.map(|n| n.vsmp != prev.vsmp).unwrap_or(true);
                    if needs && stranger && vsmp.descheduleable()
                    {
                        (true, RunState::ReadyCostop)
                    }
                    else
                    {
                        (false, RunState::Ready)
                    }
                },
                None => (false, RunState::Ready)
            };

            if let Some(vsmp) = state.vsmp_mut(prev.vsmp)
            {
                if stop
                {
                    vsmp.corun_stop(now);
                }
                vsmp.set_run_state(prev.idx, target, now);
            }
        }

        self.charge_vcpu(state, pcpu, prev);

        /* queue it again if it's plainly ready */
        let requeue = state.vsmp(prev.vsmp)
            .map(|vsmp| vsmp.vcpus[prev.idx].run_state == RunState::Ready)
            .unwrap_or(false);
        if requeue
        {
            state.queue_add(prev);
        }

        /* a draining co-stop may be complete now */
        let released = state.vsmp_mut(prev.vsmp)
            .map(|vsmp| vsmp.corun_note_deschedule())
            .unwrap_or(false);
        if released
        {
            state.requeue_siblings(prev.vsmp);
        }

        if let Some(shadow) = state.pcpu_mut(pcpu)
        {
            shadow.running = None;
        }
        prev_world
    }

    /* price the cycles a vCPU consumed and advance its VM's clocks,
       with the hyperthread adjustments and the entitled-clock clamp */
    fn charge_vcpu(&self, state: &mut CellState, pcpu: PcpuID, entry: VcpuRef)
    {
        let now = state.now;
        let cell_vtime = state.vtime;

        /* partner halt delta over the interval we're charging */
        let partner = state.pcpu(pcpu).and_then(|s| s.partner);
        let partner_halt = match partner
        {
            Some(partner) => state.pcpu(partner)
                .map(|s| s.halt.halted_until(now))
                .unwrap_or(0),
            None => 0
        };
        let halt_base = state.pcpu(pcpu).map(|s| s.partner_halt_base).unwrap_or(0);
        let halt_delta = partner_halt.saturating_sub(halt_base);
        if let Some(shadow) = state.pcpu_mut(pcpu)
        {
            shadow.partner_halt_base = partner_halt;
        }

        let quantum = self.tun.quantum;
        let mut group_charge: Option<(super::groups::GroupPath, u64)> = None;

        if let Some(vsmp) = state.vsmp_mut(entry.vsmp)
        {
            /* a vCPU charged mid-run banks what it has consumed so far */
            vsmp.accrue_running(entry.idx, now);

            let stride = vsmp.vtime.stride;
            let stride_limit = vsmp.stride_limit;

            let vcpu = &mut vsmp.vcpus[entry.idx];
            let cycles = vcpu.uncharged_cycles;
            if cycles == 0 && vcpu.sys_cycles_pending == 0 && halt_delta == 0
            {
                return;
            }
            vcpu.uncharged_cycles = 0;
            let sys = vcpu.sys_cycles_pending;
            vcpu.sys_cycles_pending = 0;

            let adjusted = ht::adjusted_charge(cycles, halt_delta, sys, 0, quantum);
            vcpu.charged_cycles = vcpu.charged_cycles + adjusted;
            let charged_total = vcpu.charged_cycles;
            let run_total = vcpu.run_cycles;
            vcpu.info.publish_charge(charged_total, run_total);

            vsmp.vtime.main = vsmp.vtime.main + vtime::cycles_to_vtime(stride, adjusted);
            vsmp.vtime.extra = vsmp.vtime.extra + vtime::cycles_to_vtime(stride, adjusted);
            vsmp.vtime_limit = vsmp.vtime_limit + vtime::cycles_to_vtime(stride_limit, adjusted);

            /* the entitled clock never runs past the cell's horizon by
               more than a quantum: the excess becomes bonus cycles */
            let horizon = cell_vtime + vtime::cycles_to_vtime(stride, quantum);
            if vsmp.vtime.main > horizon
            {
                let overshoot = vsmp.vtime.main - horizon;
                vsmp.bonus_cycles = vtime::vtime_to_cycles(stride, overshoot);
                if vsmp.bonus_cycles as u64
                    > OVERSHOOT_PANIC_SECONDS * self.platform.cycles_per_second()
                {
                    panic!("VSMP {} overshot its entitlement by {} cycles",
                           vsmp.leader, vsmp.bonus_cycles);
                }
                vsmp.vtime.main = horizon;
            }

            group_charge = Some((vsmp.vtime.path, adjusted));

            if let Some(shadow) = state.pcpu_mut(pcpu)
            {
                shadow.used_cycles = shadow.used_cycles + cycles;
                shadow.sys_overlap_cycles = shadow.sys_overlap_cycles + sys;
            }
        }

        /* the charge may have flipped the VM ahead of or behind the
           cell: its queued siblings change class with it */
        state.requeue_siblings(entry.vsmp);

        if let Some((path, cycles)) = group_charge
        {
            self.tree.lock().charge(&path, cycles);
        }
    }

    /* dispatch the chosen vCPU on this CPU, placing co-scheduled
       siblings and performing the world switch handshake */
    fn switch_to(&self, mut state: super::lock::MutexGuard<'_, CellState>,
                 pcpu: PcpuID, next: VcpuRef, inherit_quantum: Option<u64>) -> Option<WorldID>
    {
        let now = state.now;
        let prev = state.pcpu(pcpu).and_then(|s| s.running);

        /* keeping the incumbent, if it really is still on the CPU,
           just restarts its quantum. a stale running pointer (the world
           waited and was woken before we got here) goes the long way
           round so it re-enters RUN properly */
        let incumbent_running = state.vsmp(next.vsmp)
            .map(|vsmp| vsmp.vcpus[next.idx].run_state == RunState::Run)
            .unwrap_or(false);
        if prev == Some(next) && incumbent_running
        {
            self.charge_vcpu(&mut state, pcpu, next);
            if let Some(vsmp) = state.vsmp_mut(next.vsmp)
            {
                vsmp.quantum_expire = now + self.tun.quantum;
                let ctx = vsmp.vtime;
                let world = vsmp.vcpus[next.idx].world;
                if let Some(shadow) = state.pcpu_mut(pcpu)
                {
                    shadow.snap = PreemptSnap
                    {
                        valid: true,
                        ctx,
                        bonus_cycles: self.preempt_bonus_cycles()
                    };
                }
                return Some(world);
            }
            return None;
        }

        let prev_world = self.deschedule_prev(&mut state, pcpu, Some(next));

        /* close out an idle stretch, halted time not counted as idle */
        self.end_idle(&mut state, pcpu);

        state.queue_remove(next);

        /* bring the winner onto the CPU */
        let (next_world, next_info) = match state.vsmp_mut(next.vsmp)
        {
            Some(vsmp) =>
            {
                vsmp.corun_dispatched();
                vsmp.vcpus[next.idx].pcpu = pcpu;
                vsmp.set_run_state(next.idx, RunState::Run, now);
                vsmp.quantum_expire = match inherit_quantum
                {
                    Some(expire) if expire > now => expire,
                    _ => now + self.tun.quantum
                };
                (vsmp.vcpus[next.idx].world, vsmp.vcpus[next.idx].info.clone())
            },
            None => return None
        };

        /* lazy per-CPU mappings follow the world to its new CPU */
        let mapped = state.vsmp(next.vsmp)
            .map(|vsmp| vsmp.vcpus[next.idx].mapped_pcpu)
            .unwrap_or(None);
        if mapped != Some(pcpu)
        {
            self.platform.prda_map(pcpu, next_world);
            self.platform.kseg_map(pcpu, next_world);
            if let Some(vsmp) = state.vsmp_mut(next.vsmp)
            {
                vsmp.vcpus[next.idx].mapped_pcpu = Some(pcpu);
            }
        }

        /* publish the new pick and remember the partner's halt level */
        let snap_ctx = state.vsmp(next.vsmp).map(|vsmp| vsmp.vtime);
        let partner_halt = state.pcpu(pcpu).and_then(|s| s.partner)
            .and_then(|partner| state.pcpu(partner).map(|s| s.halt.halted_until(now)))
            .unwrap_or(0);
        if let Some(shadow) = state.pcpu_mut(pcpu)
        {
            shadow.running = Some(next);
            shadow.partner_halt_base = partner_halt;
            if let Some(ctx) = snap_ctx
            {
                shadow.snap = PreemptSnap
                {
                    valid: true,
                    ctx,
                    bonus_cycles: self.preempt_bonus_cycles()
                };
            }
        }

        /* reserve CPUs for the siblings that must run with us */
        self.corun_place(&mut state, pcpu, next);

        /* the handshake: the outgoing world's stack stays valid until
           the flag clears; nobody may switch into the incoming world
           while its own flag is still up from a remote switch. a world
           resuming onto its own CPU needs no switch at all */
        let prev_info = if prev_world != WORLD_ID_NONE && prev_world != next_world
        {
            self.world_entry(prev_world).ok().map(|entry| entry.info)
        }
        else
        {
            None
        };

        if let Some(info) = prev_info.as_ref()
        {
            info.set_switch_in_progress(true);
        }

        drop(state);

        if prev_world == next_world
        {
            return Some(next_world);
        }

        let mut spins = 0u64;
        while next_info.switch_in_progress()
        {
            spins = spins + 1;
            if spins > SWITCH_DRAIN_SPINS_MAX
            {
                panic!("world {} stuck in switch for too long", next_world);
            }
            core::hint::spin_loop();
        }

        self.platform.world_switch(pcpu, prev_world, next_world);

        /* we are conceptually on the incoming world's stack now: release
           the outgoing one and deal with a pending unconditional kill */
        if let Some(info) = prev_info.as_ref()
        {
            info.set_switch_in_progress(false);

            if info.kill_level() == super::world::KillLevel::Unconditional
            {
                self.reap_world(prev_world);
            }
        }

        Some(next_world)
    }

    /* idle this CPU: charge and park the previous runner, open the
       idle accounting window, publish an idle snapshot */
    fn go_idle(&self, mut state: super::lock::MutexGuard<'_, CellState>,
               pcpu: PcpuID) -> Option<WorldID>
    {
        let now = state.now;
        let prev_world = self.deschedule_prev(&mut state, pcpu, None);

        let already_idle = state.pcpu(pcpu).map(|s| s.idle_start.is_some()).unwrap_or(false);
        let halt_total = state.pcpu(pcpu).map(|s| s.halt.halted_until(now)).unwrap_or(0);
        let idle_snap = self.idle_snapshot(&state, pcpu);
        if let Some(shadow) = state.pcpu_mut(pcpu)
        {
            if already_idle == false
            {
                shadow.idle_start = Some(now);
                shadow.idle_halt_base = halt_total;
            }
            shadow.snap = idle_snap;
        }

        let prev_info = if prev_world != WORLD_ID_NONE
        {
            self.world_entry(prev_world).ok().map(|entry| entry.info)
        }
        else
        {
            None
        };

        if let Some(info) = prev_info.as_ref()
        {
            info.set_switch_in_progress(true);
        }

        drop(state);

        if let Some(info) = prev_info.as_ref()
        {
            self.platform.world_switch(pcpu, prev_world, WORLD_ID_NONE);
            info.set_switch_in_progress(false);

            if info.kill_level() == super::world::KillLevel::Unconditional
            {
                self.reap_world(prev_world);
            }
        }

        None
    }

    /* close an idle window, halted cycles excluded from the idle bucket */
    fn end_idle(&self, state: &mut CellState, pcpu: PcpuID)
    {
        let now = state.now;
        let halt_total = state.pcpu(pcpu).map(|s| s.halt.halted_until(now)).unwrap_or(0);

        if let Some(shadow) = state.pcpu_mut(pcpu)
        {
            if let Some(start) = shadow.idle_start.take()
            {
                let idle = now.saturating_sub(start);
                let halted = halt_total.saturating_sub(shadow.idle_halt_base);
                shadow.idle_cycles = shadow.idle_cycles + idle.saturating_sub(halted);
            }
            if shadow.halted
            {
                shadow.halted = false;
                shadow.halt.end(now);
            }
        }
    }

    /* reserve CPUs for the dispatched vCPU's mandatory siblings, then
       any other ready ones: no-migration placements first, then
       migrations, each through a handoff to the destination CPU */
    fn corun_place(&self, state: &mut CellState, pcpu: PcpuID, next: VcpuRef)
    {
        let (mandatory, optional) = match state.vsmp(next.vsmp)
        {
            Some(vsmp) =>
            {
                if vsmp.is_mp() == false
                {
                    return;
                }
                let mandatory = must_cosched_set(vsmp, next.idx, &self.config);
                let optional: Vec<usize> = vsmp.vcpus.iter().enumerate()
                    .filter(|(idx, vcpu)| *idx != next.idx
                            && mandatory.contains(idx) == false
                            && vcpu.run_state == RunState::Ready)
                    .map(|(idx, _)| idx)
                    .collect();
                (mandatory, optional)
            },
            None => return
        };

        if mandatory.is_empty() && optional.is_empty()
        {
            return;
        }

        let mut taken = PcpuMask::single(pcpu);

        /* two passes over the mandatory set: keep CPUs first, move second */
        for migration_pass in [false, true].iter()
        {
            for idx in mandatory.iter()
            {
                self.place_sibling(state, next.vsmp, *idx, &mut taken, *migration_pass);
            }
        }
        for idx in optional.iter()
        {
            self.place_sibling(state, next.vsmp, *idx, &mut taken, false);
        }
    }

    /* a discarded handoff leaves its vCPU reserved but ownerless:
       return it to plain ready and requeue it */
    fn unpark_corun(&self, state: &mut CellState, entry: VcpuRef)
    {
        let now = state.now;
        let parked = state.vsmp(entry.vsmp)
            .map(|vsmp| vsmp.vcpus[entry.idx].run_state == RunState::ReadyCorun)
            .unwrap_or(false);
        if parked
        {
            if let Some(vsmp) = state.vsmp_mut(entry.vsmp)
            {
                vsmp.set_run_state(entry.idx, RunState::Ready, now);
            }
            state.queue_add(entry);
        }
    }

    /* hand one sibling to a destination CPU */
    fn place_sibling(&self, state: &mut CellState, vsmp_id: VsmpID, idx: usize,
                     taken: &mut PcpuMask, allow_migration: bool)
    {
        let (current, affinity, ready) = match state.vsmp(vsmp_id)
        {
            Some(vsmp) =>
            {
                let vcpu = &vsmp.vcpus[idx];
                (vcpu.pcpu, vcpu.affinity, vcpu.run_state == RunState::Ready)
            },
            None => return
        };
        if ready == false
        {
            return;
        }

        let cell_mask = self.cell_mask_of(state);
        let allowed = affinity.intersect(cell_mask);

        let dest = if allowed.contains(current) && taken.contains(current) == false
        {
            Some(current)
        }
        else if allow_migration
        {
            allowed.iter().find(|p| taken.contains(*p) == false)
        }
        else
        {
            None
        };

        let dest = match dest
        {
            Some(dest) => dest,
            None => return
        };
        taken.set(dest);

        let entry = VcpuRef { vsmp: vsmp_id, idx };
        state.queue_remove(entry);

        let now = state.now;
        if let Some(vsmp) = state.vsmp_mut(vsmp_id)
        {
            vsmp.set_run_state(idx, RunState::ReadyCorun, now);
            vsmp.vcpus[idx].pcpu = dest;
        }

        /* an older reservation on this CPU loses its slot */
        let displaced = state.pcpu(dest).and_then(|s| s.handoff)
            .filter(|old| *old != entry);
        if let Some(old) = displaced
        {
            self.unpark_corun(state, old);
        }

        let busy_or_halted = state.pcpu(dest)
            .map(|s| s.running.is_some() || s.halted)
            .unwrap_or(false);

        if let Some(shadow) = state.pcpu_mut(dest)
        {
            shadow.handoff = Some(entry);
            shadow.snap.valid = false;
            shadow.mark_reschedule();
        }

        if busy_or_halted
        {
            self.platform.send_resched_ipi(dest);
        }
    }
}

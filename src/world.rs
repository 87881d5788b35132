/* fairsched world management
 *
 * Every schedulable entity is a world: each virtual CPU of a VM is
 * one world, grouped under the VM's leader world into a VSMP. A
 * small amount of per-world state has to be readable from other
 * physical CPUs while the owning VSMP migrates between cells, so it
 * lives here in a reference-counted side object rather than inside
 * the moved VSMP value: pending action bits, kill flags, the
 * switch-in-progress handshake and the published charge totals.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use alloc::string::String;
use alloc::sync::Arc;
use super::lock::{SeqLock, SpinLock};
use super::platform::WorldID;

/* charge totals published to lock-free readers */
#[derive(Debug, Clone, Copy)]
pub struct ChargeSnap
{
    pub charged_cycles: u64,
    pub run_cycles: u64
}

/* how a world is being killed: a demand surfaces from waits as
   DeathPending; an unconditional kill ends the world at its next
   switch-out */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillLevel
{
    Alive,
    Demand,
    Unconditional
}

pub struct WorldInfo
{
    pub world: WorldID,
    pub name: String,

    /* a VMM world runs guest code and takes part in action wakeups */
    pub vmm: bool,

    /* pending action bits, protected by the action lock against the
       wait/wakeup race */
    pub action_lock: SpinLock,
    action_mask: AtomicU64,

    /* false while a VMM busy-waits: action wakeups are pointless when
       the world is already polling */
    action_notify: AtomicBool,

    /* 0 = alive, 1 = kill demanded, 2 = kill unconditional */
    kill: AtomicU64,

    /* set by the outgoing dispatcher, cleared by this world once it is
       fully off its old stack. a remote CPU must not world-switch into
       this world while the flag is up */
    switch_in_progress: AtomicBool,

    /* lock-free published charge totals */
    pub charged: SeqLock<ChargeSnap>
}

impl WorldInfo
{
    pub fn new(world: WorldID, name: &str, vmm: bool) -> Arc<WorldInfo>
    {
        Arc::new(WorldInfo
        {
            world,
            name: String::from(name),
            vmm,
            action_lock: SpinLock::new(),
            action_mask: AtomicU64::new(0),
            action_notify: AtomicBool::new(true),
            kill: AtomicU64::new(0),
            switch_in_progress: AtomicBool::new(false),
            charged: SeqLock::new(ChargeSnap { charged_cycles: 0, run_cycles: 0 })
        })
    }

    /* ---- action wakeups ---- */

    /* post action bits, returning the previous mask. caller decides
       whether to force a wakeup based on what was already pending */
    pub fn post_action(&self, bits: u64) -> u64
    {
        self.action_lock.lock();
        let previous = self.action_mask.fetch_or(bits, Ordering::SeqCst);
        self.action_lock.unlock();
        previous
    }

    /* consume and clear the pending action bits */
    pub fn take_actions(&self) -> u64
    {
        self.action_lock.lock();
        let taken = self.action_mask.swap(0, Ordering::SeqCst);
        self.action_lock.unlock();
        taken
    }

    pub fn actions_pending(&self) -> bool
    {
        self.action_mask.load(Ordering::SeqCst) != 0
    }

    /* VMMs entering a busy-wait stop action notifications; they restart
       on the way out */
    pub fn set_action_notify(&self, enabled: bool)
    {
        self.action_notify.store(enabled, Ordering::SeqCst);
    }

    pub fn action_notify(&self) -> bool
    {
        self.action_notify.load(Ordering::SeqCst)
    }

    /* ---- death ---- */

    pub fn kill(&self, level: KillLevel)
    {
        let value = match level
        {
            KillLevel::Alive => 0,
            KillLevel::Demand => 1,
            KillLevel::Unconditional => 2
        };
        self.kill.fetch_max(value, Ordering::SeqCst);
    }

    pub fn kill_level(&self) -> KillLevel
    {
        match self.kill.load(Ordering::SeqCst)
        {
            0 => KillLevel::Alive,
            1 => KillLevel::Demand,
            _ => KillLevel::Unconditional
        }
    }

    pub fn death_pending(&self) -> bool
    {
        self.kill_level() != KillLevel::Alive
    }

    /* ---- the switch handshake ---- */

    pub fn set_switch_in_progress(&self, flag: bool)
    {
        self.switch_in_progress.store(flag, Ordering::SeqCst);
    }

    pub fn switch_in_progress(&self) -> bool
    {
        self.switch_in_progress.load(Ordering::SeqCst)
    }

    /* publish updated charge totals. caller holds the owning cell's lock */
    pub fn publish_charge(&self, charged_cycles: u64, run_cycles: u64)
    {
        self.charged.write(ChargeSnap { charged_cycles, run_cycles });
    }
}

/* ---- world lifecycle against the scheduler ---- */

use alloc::vec::Vec;
use super::{CpuSched, WorldEntry};
use super::error::Cause;
use super::groups::{Alloc, GroupID, GROUP_ID_ROOT};
use super::platform::PcpuMask;
use super::runq::VcpuRef;
use super::vcpu::RunState;
use super::vsmp::{HtSharing, Vsmp, VsmpID};

/* everything needed to admit a VM's worlds to the scheduler */
#[derive(Clone)]
pub struct WorldConfig
{
    pub name: String,
    pub vmm: bool,
    pub nvcpus: u32,
    pub alloc: Alloc,
    pub group: GroupID,
    pub affinity: Option<PcpuMask>,
    pub ht_sharing: HtSharing,
    pub strict_cosched: bool,
    pub console: bool
}

impl WorldConfig
{
    pub fn vm(name: &str, nvcpus: u32, alloc: Alloc) -> WorldConfig
    {
        WorldConfig
        {
            name: String::from(name),
            vmm: true,
            nvcpus,
            alloc,
            group: GROUP_ID_ROOT,
            affinity: None,
            ht_sharing: HtSharing::Any,
            strict_cosched: false,
            console: false
        }
    }

    pub fn in_group(mut self, group: GroupID) -> WorldConfig
    {
        self.group = group;
        self
    }

    pub fn pinned(mut self, affinity: PcpuMask) -> WorldConfig
    {
        self.affinity = Some(affinity);
        self
    }
}

impl CpuSched
{
    /* resolve a world to its VSMP leader */
    pub fn vsmp_leader(&self, world: WorldID) -> Result<WorldID, Cause>
    {
        Ok(self.world_entry(world)?.vsmp)
    }

    pub fn is_vsmp_leader(&self, world: WorldID) -> bool
    {
        self.vsmp_leader(world) == Ok(world)
    }

    /* admit a VM to the scheduler: the leader world plus one world per
       additional vCPU, ids leader, leader+1, ... the VM lands in the
       cell its affinity points at with every vCPU ready to run
       => leader = the VM's leader world id
          config = allocation, placement and policy
          already_running = the leader vCPU is already on a CPU (boot
          handover) and must be adopted in RUN rather than queued
       <= Ok, NoResources when admission fails, NotSupported for
          topologies or configs the scheduler won't take */
    pub fn world_add(&self, leader: WorldID, config: WorldConfig,
                     already_running: bool) -> Result<(), Cause>
    {
        if config.nvcpus == 0 || config.nvcpus as usize > self.platform.num_pcpus()
        {
            return Err(Cause::NotSupported);
        }
        if self.worlds_lock().contains_key(&leader)
        {
            return Err(Cause::WorldBadID);
        }

        let npcpus = self.platform.num_pcpus();
        let affinity = config.affinity.unwrap_or(PcpuMask::first_n(npcpus));
        if affinity.intersect(PcpuMask::first_n(npcpus)).is_empty()
        {
            return Err(Cause::VcpuBadAffinity);
        }

        /* console worlds carry a configured floor on their reservation */
        let mut alloc = config.alloc;
        if config.console
        {
            let floor = self.config.cos_min_cpu;
            if alloc.units == super::groups::AllocUnits::Percent && alloc.min < floor
            {
                alloc.min = floor;
            }
        }

        /* admission first: a VM the tree won't take never touches a cell */
        let path =
        {
            let mut tree = self.tree.lock();
            match tree.vm_add(leader, config.group, alloc, config.nvcpus)
            {
                Ok(()) => (),
                Err(Cause::AdmissionDenied) => return Err(Cause::NoResources),
                Err(e) => return Err(e)
            }
            match tree.path_of(leader)
            {
                Ok(path) => path,
                Err(e) =>
                {
                    let _ = tree.vm_remove(leader);
                    return Err(e);
                }
            }
        };

        /* home cell: wherever the affinity's first CPU lives */
        let home_pcpu = match affinity.first()
        {
            Some(pcpu) => pcpu,
            None => return Err(Cause::VcpuBadAffinity)
        };
        let cell = self.cell_of_pcpu(home_pcpu)?;

        let mut infos = Vec::new();
        for idx in 0..config.nvcpus as usize
        {
            infos.push(WorldInfo::new(leader + idx, &config.name, config.vmm));
        }

        let mut state = cell.state.lock();
        let now = state.now;

        let mut vsmp = Vsmp::new(leader, config.nvcpus as usize, affinity, alloc,
                                 config.group, path, cell.id, npcpus, now, infos.clone());
        vsmp.ht_sharing = config.ht_sharing;
        vsmp.strict_cosched = config.strict_cosched;
        vsmp.console = config.console;

        /* a fresh VM starts even with the cell's clock */
        vsmp.vtime.main = state.vtime;
        vsmp.vtime.extra = state.vtime;
        vsmp.vtime_limit = state.vtime;

        state.vsmps.insert(leader, vsmp);
        self.set_cell_hint(leader, cell.id);

        {
            let mut worlds = self.worlds_lock();
            for idx in 0..config.nvcpus as usize
            {
                worlds.insert(leader + idx, WorldEntry
                {
                    vsmp: leader,
                    idx,
                    info: infos[idx].clone()
                });
            }
        }

        /* everyone becomes runnable; a boot-handover leader is adopted
           in RUN on its home CPU instead */
        for idx in 0..config.nvcpus as usize
        {
            let entry = VcpuRef { vsmp: leader, idx };
            if let Some(vsmp) = state.vsmp_mut(leader)
            {
                vsmp.set_run_state(idx, RunState::Ready, now);
                if idx == 0 && already_running
                {
                    vsmp.vcpus[0].pcpu = home_pcpu;
                    vsmp.set_run_state(0, RunState::Run, now);
                    vsmp.corun_dispatched();
                    vsmp.quantum_expire = now + self.tun.quantum;
                }
            }
            if idx == 0 && already_running
            {
                if let Some(shadow) = state.pcpu_mut(home_pcpu)
                {
                    shadow.running = Some(entry);
                }
            }
            else
            {
                state.queue_add(entry);
            }
        }

        if config.console
        {
            self.set_console(Some(leader));
        }

        self.request_reallocate();
        hvlog!("world {} ({}) admitted with {} vcpus", leader, config.name, config.nvcpus);
        Ok(())
    }

    /* take a VM out of the scheduler. a VM with a vCPU still on a CPU
       can't be removed yet: its CPUs are marked for reschedule and the
       caller retries after a dispatch. unmanaged worlds fast-path to Ok */
    pub fn world_remove(&self, world: WorldID) -> Result<(), Cause>
    {
        let entry = match self.worlds_lock().get(&world).cloned()
        {
            Some(entry) => entry,
            None => return Ok(())
        };
        let leader = entry.vsmp;

        {
            let (_, mut state) = self.lock_vsmp_cell(leader)?;

            let running: Vec<usize> = match state.vsmp(leader)
            {
                Some(vsmp) => vsmp.vcpus.iter().enumerate()
                    .filter(|(_, v)| v.run_state == RunState::Run)
                    .map(|(idx, _)| idx)
                    .collect(),
                None => return Ok(())
            };

            if running.is_empty() == false
            {
                /* demand death and kick the CPUs; the next dispatch
                   releases them and the retry succeeds */
                let mut kick = Vec::new();
                if let Some(vsmp) = state.vsmp_mut(leader)
                {
                    for idx in running
                    {
                        vsmp.vcpus[idx].info.kill(KillLevel::Demand);
                        kick.push(vsmp.vcpus[idx].pcpu);
                    }
                }
                for pcpu in kick
                {
                    if let Some(shadow) = state.pcpu_mut(pcpu)
                    {
                        shadow.mark_reschedule();
                    }
                    self.platform.send_resched_ipi(pcpu);
                }
                return Err(Cause::WorldRemoveBusy);
            }

            /* nothing on a CPU: tear the VSMP out of its cell */
            let entries: Vec<VcpuRef> = match state.vsmp(leader)
            {
                Some(vsmp) => (0..vsmp.nvcpus())
                    .map(|idx| VcpuRef { vsmp: leader, idx }).collect(),
                None => Vec::new()
            };
            for vref in entries
            {
                state.queue_remove(vref);
            }
            state.vsmps.remove(&leader);
        }

        self.cleanup_vsmp(leader);
        Ok(())
    }

    /* release everything else a VM held: the world table, event
       queues, timers, the allocation tree and the console slot.
       idempotent, and also the tail of world_remove */
    pub fn world_cleanup(&self, world: WorldID)
    {
        let leader = match self.worlds_lock().get(&world).cloned()
        {
            Some(entry) => entry.vsmp,
            None => return
        };
        self.cleanup_vsmp(leader);
    }

    fn cleanup_vsmp(&self, leader: VsmpID)
    {
        self.drop_cell_hint(leader);

        let members: Vec<WorldID> =
        {
            let worlds = self.worlds_lock();
            worlds.iter()
                .filter(|(_, entry)| entry.vsmp == leader)
                .map(|(world, _)| *world)
                .collect()
        };

        for world in members.iter()
        {
            self.events.purge_world(*world);
        }

        {
            let mut worlds = self.worlds_lock();
            for world in members.iter()
            {
                worlds.remove(world);
            }
        }

        let _ = self.tree.lock().vm_remove(leader);
        if self.console_vsmp() == Some(leader)
        {
            self.set_console(None);
        }

        self.request_reallocate();
        hvdebug!("VSMP {} cleaned up ({} worlds)", leader, members.len());
    }

    /* called from the post-switch path when a world dies under an
       unconditional kill: zombie it, and tear the VM down once every
       sibling is dead */
    pub(crate) fn reap_world(&self, world: WorldID)
    {
        let entry = match self.worlds_lock().get(&world).cloned()
        {
            Some(entry) => entry,
            None => return
        };

        let all_dead = match self.lock_vsmp_cell(entry.vsmp)
        {
            Ok((_, mut state)) =>
            {
                let now = state.now;
                state.queue_remove(VcpuRef { vsmp: entry.vsmp, idx: entry.idx });

                let (all_dead, nvcpus) = match state.vsmp_mut(entry.vsmp)
                {
                    Some(vsmp) =>
                    {
                        vsmp.set_run_state(entry.idx, RunState::Zombie, now);
                        (vsmp.vcpus.iter().all(|v| v.run_state == RunState::Zombie),
                         vsmp.nvcpus())
                    },
                    None => (false, 0)
                };

                if all_dead
                {
                    for idx in 0..nvcpus
                    {
                        state.queue_remove(VcpuRef { vsmp: entry.vsmp, idx });
                    }
                    state.vsmps.remove(&entry.vsmp);
                }
                all_dead
            },
            Err(_) => false
        };

        if all_dead
        {
            self.cleanup_vsmp(entry.vsmp);
        }
    }

    /* ---- control operations ---- */

    /* change a world's hard affinity. the whole VM is re-homed when
       the new mask leaves its current cell entirely */
    pub fn world_set_affinity(&self, world: WorldID, mask: PcpuMask) -> Result<(), Cause>
    {
        let npcpus = self.platform.num_pcpus();
        let mask = mask.intersect(PcpuMask::first_n(npcpus));
        if mask.is_empty()
        {
            return Err(Cause::VcpuBadAffinity);
        }

        let entry = self.world_entry(world)?;
        let (cell_id, mut state) = self.lock_vsmp_cell(entry.vsmp)?;

        let vref = VcpuRef { vsmp: entry.vsmp, idx: entry.idx };
        state.queue_remove(vref);

        let needs_rehome = match state.vsmp_mut(entry.vsmp)
        {
            Some(vsmp) =>
            {
                vsmp.vcpus[entry.idx].affinity = mask;
                vsmp.update_joint_affinity();

                /* keep the vCPU on a permitted CPU within this cell */
                let here = self.cell(cell_id).map(|c| c.pcpu_mask)
                    .unwrap_or(PcpuMask::EMPTY);
                let local = mask.intersect(here);
                match local.first()
                {
                    Some(pcpu) =>
                    {
                        if local.contains(vsmp.vcpus[entry.idx].pcpu) == false
                        {
                            vsmp.vcpus[entry.idx].pcpu = pcpu;
                        }
                        false
                    },
                    None => true
                }
            },
            None => return Err(Cause::WorldBadID)
        };

        let ready = state.vsmp(entry.vsmp)
            .map(|vsmp| vsmp.vcpus[entry.idx].run_state.is_ready())
            .unwrap_or(false);
        if ready && needs_rehome == false
        {
            state.queue_add(vref);
        }
        drop(state);

        if needs_rehome
        {
            /* no legal CPU in this cell: pull the VM to the mask's home */
            let target = mask.first().ok_or(Cause::VcpuBadAffinity)?;
            self.migrate_for_affinity(target, cell_id, entry.vsmp)?;
        }

        Ok(())
    }

    /* change a VM's external allocation */
    pub fn world_set_alloc(&self, world: WorldID, alloc: Alloc) -> Result<(), Cause>
    {
        let leader = self.vsmp_leader(world)?;

        let nvcpus =
        {
            let (_, state) = self.lock_vsmp_cell(leader)?;
            match state.vsmp(leader)
            {
                Some(vsmp) => vsmp.nvcpus() as u32,
                None => return Err(Cause::WorldBadID)
            }
        };

        self.tree.lock().vm_set_alloc(leader, alloc, nvcpus)?;

        {
            let (_, mut state) = self.lock_vsmp_cell(leader)?;
            if let Some(vsmp) = state.vsmp_mut(leader)
            {
                vsmp.alloc = alloc;
            }
        }

        self.request_reallocate();
        Ok(())
    }

    /* change a VM's hyperthread sharing policy */
    pub fn world_set_ht_sharing(&self, world: WorldID, sharing: HtSharing) -> Result<(), Cause>
    {
        let leader = self.vsmp_leader(world)?;
        let (_, mut state) = self.lock_vsmp_cell(leader)?;
        match state.vsmp_mut(leader)
        {
            Some(vsmp) =>
            {
                vsmp.ht_sharing = sharing;
                Ok(())
            },
            None => Err(Cause::WorldBadID)
        }
    }

    /* ---- group control, forwarded to the tree ---- */

    pub fn group_create(&self, parent: GroupID, name: &str) -> Result<GroupID, Cause>
    {
        let id = self.tree.lock().create(parent, name)?;
        Ok(id)
    }

    pub fn group_remove(&self, group: GroupID) -> Result<(), Cause>
    {
        self.tree.lock().remove(group)
    }

    pub fn group_set_alloc(&self, group: GroupID, alloc: Alloc) -> Result<(), Cause>
    {
        self.tree.lock().set_alloc(group, alloc)
    }

    pub fn move_vm_alloc_to_group(&self, world: WorldID, group: GroupID) -> Result<(), Cause>
    {
        let leader = self.vsmp_leader(world)?;
        self.tree.lock().move_vm_alloc_to_group(leader, group)
    }

    pub fn move_group_alloc_to_vm(&self, group: GroupID, world: WorldID,
                                  amount_base: u32) -> Result<(), Cause>
    {
        let leader = self.vsmp_leader(world)?;
        self.tree.lock().move_group_alloc_to_vm(group, leader, amount_base)
    }

    /* kill a world: a demand surfaces from its next wait; an
       unconditional kill also yanks it off the CPU */
    pub fn world_kill(&self, world: WorldID, level: KillLevel) -> Result<(), Cause>
    {
        let entry = self.world_entry(world)?;
        entry.info.kill(level);

        if level == KillLevel::Unconditional
        {
            let (_, mut state) = self.lock_vsmp_cell(entry.vsmp)?;
            let pcpu = state.vsmp(entry.vsmp)
                .map(|vsmp| vsmp.vcpus[entry.idx].pcpu);
            if let Some(pcpu) = pcpu
            {
                if let Some(shadow) = state.pcpu_mut(pcpu)
                {
                    shadow.mark_reschedule();
                }
                self.platform.send_resched_ipi(pcpu);
            }
        }

        self.force_wakeup(world);
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn action_bits_accumulate_and_clear()
    {
        let info = WorldInfo::new(1, "vm0.vcpu0", true);
        assert_eq!(info.post_action(0b01), 0);
        assert_eq!(info.post_action(0b10), 0b01);
        assert!(info.actions_pending());
        assert_eq!(info.take_actions(), 0b11);
        assert!(!info.actions_pending());
    }

    #[test]
    fn kill_only_escalates()
    {
        let info = WorldInfo::new(1, "w", false);
        assert_eq!(info.kill_level(), KillLevel::Alive);
        info.kill(KillLevel::Unconditional);
        info.kill(KillLevel::Demand);
        assert_eq!(info.kill_level(), KillLevel::Unconditional);
    }

    #[test]
    fn charge_snapshot_reads_consistently()
    {
        let info = WorldInfo::new(1, "w", false);
        info.publish_charge(1000, 900);
        let snap = info.charged.read();
        assert_eq!(snap.charged_cycles, 1000);
        assert_eq!(snap.run_cycles, 900);
    }
}

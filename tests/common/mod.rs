/* fairsched test rig
 *
 * Builds a scheduler on the simulated platform and drives it the way
 * a host would: dispatch every CPU, advance the pretend clock, tick
 * every CPU, repeat. Everything is deterministic.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

#![allow(dead_code)]

use std::sync::Arc;
use fairsched::CpuSched;
use fairsched::config::SchedConfig;
use fairsched::groups::Alloc;
use fairsched::platform::{PcpuMask, WorldID};
use fairsched::sim::{SimPlatform, SIM_HZ};
use fairsched::world::WorldConfig;

pub struct Rig
{
    pub sim: Arc<SimPlatform>,
    pub sched: CpuSched,
    pub npcpus: usize
}

impl Rig
{
    pub fn new(npcpus: usize, logical_per_package: usize) -> Rig
    {
        Rig::with_config(npcpus, logical_per_package, SchedConfig::default())
    }

    pub fn with_config(npcpus: usize, logical_per_package: usize, config: SchedConfig) -> Rig
    {
        let sim = Arc::new(SimPlatform::new(npcpus, logical_per_package));
        let sched = CpuSched::new(sim.clone(), config).expect("scheduler refused to start");
        Rig { sim, sched, npcpus }
    }

    /* admit a CPU-bound VM with plain shares and full affinity */
    pub fn add_vm(&self, leader: WorldID, nvcpus: u32, shares: u32)
    {
        self.sched.world_add(leader,
            WorldConfig::vm("testvm", nvcpus, Alloc::shares_only(shares)), false)
            .expect("world_add failed");
    }

    pub fn add_vm_pinned(&self, leader: WorldID, nvcpus: u32, shares: u32, affinity: PcpuMask)
    {
        self.sched.world_add(leader,
            WorldConfig::vm("testvm", nvcpus, Alloc::shares_only(shares)).pinned(affinity), false)
            .expect("world_add failed");
    }

    pub fn add_vm_config(&self, leader: WorldID, config: WorldConfig)
    {
        self.sched.world_add(leader, config, false).expect("world_add failed");
    }

    /* push the pending allocation through */
    pub fn settle(&self)
    {
        self.sched.reallocate().expect("rebalance failed");
    }

    /* one millisecond of simulated machine time */
    pub fn step_ms(&self)
    {
        for pcpu in 0..self.npcpus
        {
            self.sched.dispatch(pcpu);
        }
        self.sim.advance_ms(1);
        for pcpu in 0..self.npcpus
        {
            self.sched.timer_tick(pcpu);
        }
    }

    pub fn run_ms(&self, ms: u64)
    {
        for _ in 0..ms
        {
            self.step_ms();
        }
    }

    /* like step_ms, but CPUs left idle halt the way a host's idle
       loop would, so halt-aware charging applies */
    pub fn step_ms_halting(&self)
    {
        for pcpu in 0..self.npcpus
        {
            self.sched.dispatch(pcpu);
        }
        for pcpu in 0..self.npcpus
        {
            if self.sched.running_world(pcpu).is_none()
            {
                let _ = self.sched.halt(pcpu, 0);
            }
        }
        self.sim.advance_ms(1);
        for pcpu in 0..self.npcpus
        {
            self.sched.timer_tick(pcpu);
        }
    }

    /* a VM's consumed share of the whole machine over `elapsed_ms`,
       in tenths of a percent */
    pub fn machine_share_permille(&self, leader: WorldID, elapsed_ms: u64) -> u64
    {
        let usage = self.sched.vsmp_usage(leader).expect("no usage for VM");
        let capacity = SIM_HZ / 1000 * elapsed_ms * self.npcpus as u64;
        usage.run_cycles * 1000 / capacity
    }

    pub fn run_cycles(&self, leader: WorldID) -> u64
    {
        self.sched.vsmp_usage(leader).expect("no usage for VM").run_cycles
    }
}

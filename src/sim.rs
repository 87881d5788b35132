/* fairsched simulated platform
 *
 * A deterministic stand-in for real hardware: the clock only moves
 * when the test advances it, IPIs and world switches are recorded
 * rather than delivered, and the machine-clear counter reads whatever
 * the test programmed. The whole scheduler core can be exercised on a
 * host machine with this.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use alloc::vec::Vec;
use hashbrown::hash_map::HashMap;
use super::platform::{Platform, PcpuID, WorldID};

/* one gigacycle per simulated second keeps the sums easy to read */
pub const SIM_HZ: u64 = 1_000_000_000;

pub struct SimPlatform
{
    npcpus: usize,
    logical_per_package: usize,
    cycles: AtomicU64,

    /* what the scheduler did to the pretend hardware */
    ipis: Mutex<Vec<PcpuID>>,
    switches: Mutex<Vec<(PcpuID, WorldID, WorldID)>>,

    /* per-world machine-clear counters the test can dial up */
    machine_clears: Mutex<HashMap<WorldID, u64>>
}

impl SimPlatform
{
    /* build a pretend machine
       => npcpus = number of logical CPUs
          logical_per_package = 1 for no hyperthreading, 2 for HT pairs */
    pub fn new(npcpus: usize, logical_per_package: usize) -> SimPlatform
    {
        SimPlatform
        {
            npcpus,
            logical_per_package,
            cycles: AtomicU64::new(0),
            ipis: Mutex::new(Vec::new()),
            switches: Mutex::new(Vec::new()),
            machine_clears: Mutex::new(HashMap::new())
        }
    }

    /* move the clock forward */
    pub fn advance(&self, cycles: u64)
    {
        self.cycles.fetch_add(cycles, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64)
    {
        self.advance(SIM_HZ / 1000 * ms);
    }

    pub fn advance_us(&self, us: u64)
    {
        self.advance(SIM_HZ / 1000000 * us);
    }

    /* take the recorded reschedule IPIs, clearing the log */
    pub fn take_ipis(&self) -> Vec<PcpuID>
    {
        let mut ipis = self.ipis.lock();
        let taken = ipis.clone();
        ipis.clear();
        taken
    }

    /* take the recorded world switches, clearing the log */
    pub fn take_switches(&self) -> Vec<(PcpuID, WorldID, WorldID)>
    {
        let mut switches = self.switches.lock();
        let taken = switches.clone();
        switches.clear();
        taken
    }

    /* program a world's cumulative machine-clear counter */
    pub fn set_machine_clears(&self, world: WorldID, count: u64)
    {
        self.machine_clears.lock().insert(world, count);
    }
}

impl Platform for SimPlatform
{
    fn now_cycles(&self) -> u64
    {
        self.cycles.load(Ordering::SeqCst)
    }

    fn cycles_per_second(&self) -> u64
    {
        SIM_HZ
    }

    fn num_pcpus(&self) -> usize
    {
        self.npcpus
    }

    fn logical_per_package(&self) -> usize
    {
        self.logical_per_package
    }

    fn send_resched_ipi(&self, pcpu: PcpuID)
    {
        self.ipis.lock().push(pcpu);
    }

    fn read_machine_clears(&self, world: WorldID) -> Option<u64>
    {
        self.machine_clears.lock().get(&world).copied()
    }

    fn world_switch(&self, pcpu: PcpuID, prev: WorldID, next: WorldID)
    {
        self.switches.lock().push((pcpu, prev, next));
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::platform::Platform;

    #[test]
    fn clock_only_moves_when_told()
    {
        let sim = SimPlatform::new(4, 2);
        assert_eq!(sim.now_cycles(), 0);
        sim.advance_ms(5);
        assert_eq!(sim.now_cycles(), SIM_HZ / 1000 * 5);
    }

    #[test]
    fn topology_reporting()
    {
        let sim = SimPlatform::new(4, 2);
        assert!(sim.ht_enabled());
        assert_eq!(sim.package_of(3), 1);
        assert_eq!(sim.partner_of(2), Some(3));
        assert_eq!(sim.partner_of(3), Some(2));

        let flat = SimPlatform::new(4, 1);
        assert!(!flat.ht_enabled());
        assert_eq!(flat.partner_of(2), None);
    }

    #[test]
    fn ipis_are_recorded()
    {
        let sim = SimPlatform::new(2, 1);
        sim.send_resched_ipi(1);
        sim.send_resched_ipi(0);
        assert_eq!(sim.take_ipis(), alloc::vec![1, 0]);
        assert!(sim.take_ipis().is_empty());
    }
}

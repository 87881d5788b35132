/* fairsched platform interface
 *
 * The scheduler core is portable and drives real hardware through this
 * trait: a monotonic cycle counter, reschedule IPIs, the CPU package
 * topology, the machine-clear performance counter, and the
 * architectural world switch. The host's timer IRQ handler calls into
 * the scheduler (timer_tick and friends); no callbacks come back out
 * through this interface.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use super::error::Cause;

/* physical CPU, package and NUMA node IDs assigned linearly from zero */
pub type PcpuID = usize;
pub type PackageID = usize;
pub type NodeID = usize;

/* every schedulable entity is a world. a virtual machine is a group of
   worlds, one per virtual CPU, co-ordinated by its leader world */
pub type WorldID = usize;

/* an invalid world ID, used where no world applies */
pub const WORLD_ID_NONE: WorldID = usize::MAX;

/* bitmask of physical CPUs. the core handles up to 64 logical CPUs,
   which covers the cell sizes this scheduler is designed around */
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PcpuMask(pub u64);

impl PcpuMask
{
    pub const EMPTY: PcpuMask = PcpuMask(0);

    /* return a mask covering CPUs 0 to count-1 inclusive */
    pub fn first_n(count: usize) -> PcpuMask
    {
        if count >= 64
        {
            return PcpuMask(!0);
        }
        PcpuMask((1u64 << count) - 1)
    }

    /* return a mask of exactly one CPU */
    pub fn single(pcpu: PcpuID) -> PcpuMask
    {
        PcpuMask(1u64 << pcpu)
    }

    pub fn contains(self, pcpu: PcpuID) -> bool
    {
        pcpu < 64 && (self.0 >> pcpu) & 1 == 1
    }

    pub fn set(&mut self, pcpu: PcpuID)
    {
        self.0 = self.0 | (1u64 << pcpu);
    }

    pub fn clear(&mut self, pcpu: PcpuID)
    {
        self.0 = self.0 & !(1u64 << pcpu);
    }

    pub fn count(self) -> usize
    {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool
    {
        self.0 == 0
    }

    pub fn intersect(self, other: PcpuMask) -> PcpuMask
    {
        PcpuMask(self.0 & other.0)
    }

    pub fn union(self, other: PcpuMask) -> PcpuMask
    {
        PcpuMask(self.0 | other.0)
    }

    /* return the lowest-numbered CPU in the mask, or None if empty */
    pub fn first(self) -> Option<PcpuID>
    {
        if self.0 == 0
        {
            return None;
        }
        Some(self.0.trailing_zeros() as usize)
    }

    /* iterate over the CPUs present in the mask, lowest first */
    pub fn iter(self) -> PcpuMaskIter
    {
        PcpuMaskIter { remaining: self.0 }
    }
}

pub struct PcpuMaskIter
{
    remaining: u64
}

impl Iterator for PcpuMaskIter
{
    type Item = PcpuID;

    fn next(&mut self) -> Option<PcpuID>
    {
        if self.remaining == 0
        {
            return None;
        }
        let bit = self.remaining.trailing_zeros() as usize;
        self.remaining = self.remaining & (self.remaining - 1);
        Some(bit)
    }
}

/* everything the scheduler needs from the machine it runs on */
pub trait Platform: Send + Sync
{
    /* monotonic cycle counter, and its rate. reads are cheap and may
       be taken with interrupts off */
    fn now_cycles(&self) -> u64;
    fn cycles_per_second(&self) -> u64;

    /* number of logical CPUs, and how the packages are arranged.
       logical CPUs of one package are numbered consecutively */
    fn num_pcpus(&self) -> usize;
    fn logical_per_package(&self) -> usize;

    fn ht_enabled(&self) -> bool
    {
        self.logical_per_package() > 1
    }

    fn package_of(&self, pcpu: PcpuID) -> PackageID
    {
        pcpu / self.logical_per_package()
    }

    /* the other logical CPU of this CPU's package, resolved once at
       init and cached in the per-CPU shadow thereafter */
    fn partner_of(&self, pcpu: PcpuID) -> Option<PcpuID>
    {
        if self.logical_per_package() != 2
        {
            return None;
        }
        let base = self.package_of(pcpu) * 2;
        Some(base + ((pcpu - base) ^ 1))
    }

    /* NUMA layout: nodes are not split across scheduler cells */
    fn num_nodes(&self) -> usize { 1 }

    fn node_of(&self, _pcpu: PcpuID) -> NodeID { 0 }

    fn pcpus_of_node(&self, node: NodeID) -> PcpuMask
    {
        if node == 0
        {
            return PcpuMask::first_n(self.num_pcpus());
        }
        PcpuMask::EMPTY
    }

    /* poke a physical CPU so its interrupt-return path consults the
       local reschedule flag. the handler itself does nothing */
    fn send_resched_ipi(&self, pcpu: PcpuID);

    /* cumulative machine-clear event count for a world, from the
       per-world performance counter. returns None if the counter
       could not be opened or activated for this world */
    fn read_machine_clears(&self, world: WorldID) -> Option<u64>;

    /* the architectural switch: save prev's context, load next's.
       the scheduler has already released its locks and set the
       switch-in-progress handshake before calling this */
    fn world_switch(&self, pcpu: PcpuID, prev: WorldID, next: WorldID);

    /* lazily remap the per-CPU private data area and the kernel
       segment when a world lands on a new physical CPU */
    fn prda_map(&self, _pcpu: PcpuID, _world: WorldID) {}
    fn kseg_map(&self, _pcpu: PcpuID, _world: WorldID) {}
}

/* convert a millisecond count to cycles at the platform's timer rate */
pub fn ms_to_cycles(platform: &dyn Platform, ms: u64) -> u64
{
    platform.cycles_per_second() / 1000 * ms
}

/* convert a microsecond count to cycles at the platform's timer rate */
pub fn us_to_cycles(platform: &dyn Platform, us: u64) -> u64
{
    platform.cycles_per_second() / 1000000 * us
}

/* convert cycles to microseconds for reporting */
pub fn cycles_to_us(platform: &dyn Platform, cycles: u64) -> u64
{
    let per_us = platform.cycles_per_second() / 1000000;
    if per_us == 0
    {
        return 0;
    }
    cycles / per_us
}

/* reject topologies the scheduler is not built for.
   <= Ok, or NotSupported for packages wider than two logical CPUs */
pub fn check_topology(platform: &dyn Platform) -> Result<(), Cause>
{
    let count = platform.num_pcpus();
    if count == 0 || count > 64
    {
        return Err(Cause::PcpuCountUnknown);
    }

    match platform.logical_per_package()
    {
        1 | 2 => Ok(()),
        _ => Err(Cause::NotSupported)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn mask_basics()
    {
        let mut mask = PcpuMask::first_n(4);
        assert_eq!(mask.count(), 4);
        assert!(mask.contains(3));
        assert!(!mask.contains(4));

        mask.clear(0);
        assert_eq!(mask.first(), Some(1));
        assert_eq!(mask.iter().collect::<alloc::vec::Vec<_>>(), alloc::vec![1, 2, 3]);
    }

    #[test]
    fn mask_intersect_union()
    {
        let a = PcpuMask::single(0).union(PcpuMask::single(2));
        let b = PcpuMask::first_n(2);
        assert_eq!(a.intersect(b), PcpuMask::single(0));
        assert_eq!(a.union(b).count(), 3);
    }
}

/* fairsched scheduler cells
 *
 * A cell is a disjoint set of physical CPUs dispatched under one
 * lock: the common case of scheduling the local CPU takes exactly
 * one lock and touches no other cell. All logical CPUs of a package
 * stay in one cell, a NUMA node is never split across cells, and a
 * cell holds at most four packages.
 *
 * A VSMP lives in exactly one cell's table at a time. The cell a
 * VSMP belongs to is found by the lock-and-recheck idiom: read the
 * hint without locks, lock the hinted cell, and check the VSMP is
 * still resident, retrying if it moved.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use alloc::vec::Vec;
use hashbrown::hash_map::HashMap;
use super::lock::Mutex;
use super::platform::{Platform, PcpuID, PcpuMask};
use super::groups::BASE_SHARES_PER_PCPU;
use super::vtime::{self, Vtime, Stride, STRIDE1};
use super::vsmp::{CellID, Vsmp, VsmpID};
use super::pcpu::PcpuShadow;
use super::runq::{queue_for, VcpuRef};

/* how many packages one cell spans at most */
pub const CELL_PACKAGES_MAX: usize = 4;

/* everything a cell's lock protects */
pub struct CellState
{
    pub id: CellID,

    /* cell-local clocks: real time in cycles and global virtual time.
       both only move forward; a timer running backwards lands in
       lost_cycles instead */
    pub now: u64,
    pub vtime: Vtime,
    pub lost_cycles: u64,
    last_raw: u64,

    /* rate the global clock advances per real cycle: the stride of one
       physical CPU's worth of base shares. identical in every cell, so
       clocks stay comparable across migrations */
    pub nstride: Stride,

    /* VSMPs resident in this cell, owned by value */
    pub vsmps: HashMap<VsmpID, Vsmp>,

    /* the shadows of this cell's physical CPUs */
    pub pcpus: HashMap<PcpuID, PcpuShadow>,

    /* a global vtime reset has been scheduled and not yet run */
    pub vtime_reset_pending: bool
}

impl CellState
{
    /* advance the cell clocks from the raw cycle counter.
       <= real cycles elapsed since the last update */
    pub fn update_time(&mut self, raw_cycles: u64) -> u64
    {
        if raw_cycles < self.last_raw
        {
            /* the counter went backwards; account it rather than rewind */
            self.lost_cycles = self.lost_cycles + (self.last_raw - raw_cycles);
            return 0;
        }

        let delta = raw_cycles - self.last_raw;
        self.last_raw = raw_cycles;
        self.now = self.now + delta;
        self.vtime = self.vtime + vtime::cycles_to_vtime(self.nstride, delta);
        delta
    }

    pub fn vsmp(&self, id: VsmpID) -> Option<&Vsmp>
    {
        self.vsmps.get(&id)
    }

    pub fn vsmp_mut(&mut self, id: VsmpID) -> Option<&mut Vsmp>
    {
        self.vsmps.get_mut(&id)
    }

    pub fn pcpu(&self, id: PcpuID) -> Option<&PcpuShadow>
    {
        self.pcpus.get(&id)
    }

    pub fn pcpu_mut(&mut self, id: PcpuID) -> Option<&mut PcpuShadow>
    {
        self.pcpus.get_mut(&id)
    }

    /* place a runnable vCPU on its current CPU's queue, choosing
       main, extra or limbo from the VSMP's standing right now */
    pub fn queue_add(&mut self, entry: VcpuRef)
    {
        let (kind, pcpu) = match self.vsmps.get(&entry.vsmp)
        {
            Some(vsmp) => (queue_for(vsmp, self.vtime), vsmp.vcpus[entry.idx].pcpu),
            None => return
        };

        if let Some(shadow) = self.pcpus.get_mut(&pcpu)
        {
            if shadow.queues.contains(entry) == false
            {
                shadow.queues.push_front(kind, entry);
            }
        }
    }

    /* take a vCPU off whichever queue it is on */
    pub fn queue_remove(&mut self, entry: VcpuRef)
    {
        let pcpu = match self.vsmps.get(&entry.vsmp)
        {
            Some(vsmp) => vsmp.vcpus[entry.idx].pcpu,
            None => return
        };

        /* the entry should be on its own CPU's queue, but a recent
           re-assignment can leave it elsewhere: sweep the cell if so */
        if let Some(shadow) = self.pcpus.get_mut(&pcpu)
        {
            if shadow.queues.remove(entry)
            {
                return;
            }
        }
        for (_, shadow) in self.pcpus.iter_mut()
        {
            if shadow.queues.remove(entry)
            {
                return;
            }
        }
    }

    /* re-place every queued vCPU of a VSMP after something changed the
       VSMP's queue class: a charge flipped it ahead/behind, a new base
       allocation, or release from co-stop */
    pub fn requeue_siblings(&mut self, vsmp_id: VsmpID)
    {
        let entries: Vec<VcpuRef> = match self.vsmps.get(&vsmp_id)
        {
            Some(vsmp) => vsmp.vcpus.iter().enumerate()
                .filter(|(_, v)| v.run_state.is_ready())
                .map(|(idx, _)| VcpuRef { vsmp: vsmp_id, idx })
                .collect(),
            None => return
        };

        for entry in entries
        {
            self.queue_remove(entry);
            self.queue_add(entry);
        }
    }

    /* which CPU still physically holds a vCPU: a woken world stays on
       its old CPU's stack until that CPU switches away, and nobody
       else may run it before then */
    pub fn running_on(&self, entry: VcpuRef) -> Option<PcpuID>
    {
        for (id, shadow) in self.pcpus.iter()
        {
            if shadow.running == Some(entry)
            {
                return Some(*id);
            }
        }
        None
    }

    /* every runnable vCPU in this cell, for scans and checks */
    pub fn queued_total(&self) -> usize
    {
        let mut total = 0;
        for (_, shadow) in self.pcpus.iter()
        {
            total = total + shadow.queues.total();
        }
        total
    }

    /* does any clock in this cell approach the reset threshold? */
    pub fn vtime_reset_due(&self, threshold: Vtime) -> bool
    {
        if self.vtime > threshold
        {
            return true;
        }
        for (_, vsmp) in self.vsmps.iter()
        {
            if vsmp.vtime.main > threshold || vsmp.vtime.extra > threshold
                || vsmp.vtime_limit > threshold
            {
                return true;
            }
        }
        false
    }

    /* subtract the reset offset from every virtual clock in the cell.
       preemption snapshots are invalidated: their contexts are stale
       by the offset */
    pub fn apply_vtime_reset(&mut self, offset: Vtime)
    {
        self.vtime = self.vtime - offset;

        for (_, vsmp) in self.vsmps.iter_mut()
        {
            vsmp.vtime.main = vsmp.vtime.main - offset;
            vsmp.vtime.extra = vsmp.vtime.extra - offset;
            vsmp.vtime_limit = vsmp.vtime_limit - offset;
        }

        for (_, shadow) in self.pcpus.iter_mut()
        {
            shadow.snap.valid = false;
        }

        self.vtime_reset_pending = false;
    }

    /* clamp state-meter start stamps so nothing sits in the future of
       this cell's clock: needed when a VSMP arrives from a cell whose
       clock ran ahead */
    pub fn clamp_vsmp_meters(&mut self, vsmp_id: VsmpID)
    {
        let now = self.now;
        if let Some(vsmp) = self.vsmps.get_mut(&vsmp_id)
        {
            for vcpu in vsmp.vcpus.iter_mut()
            {
                vcpu.meters.clamp_start(now);
            }
        }
    }
}

/* one scheduler cell: the lock plus the fixed facts about it */
pub struct Cell
{
    pub id: CellID,
    pub pcpu_mask: PcpuMask,
    pub node: usize,
    pub state: Mutex<CellState>
}

impl Cell
{
    pub fn contains_pcpu(&self, pcpu: PcpuID) -> bool
    {
        self.pcpu_mask.contains(pcpu)
    }
}

/* acquire two cells' locks in ascending id order, which is the only
   legal order. equal ids are a caller bug */
pub fn lock_two<'a>(a: &'a Cell, b: &'a Cell)
    -> (super::lock::MutexGuard<'a, CellState>, super::lock::MutexGuard<'a, CellState>)
{
    debug_assert!(a.id != b.id, "locking one cell twice");
    if a.id < b.id
    {
        let first = a.state.lock();
        let second = b.state.lock();
        (first, second)
    }
    else
    {
        let second = b.state.lock();
        let first = a.state.lock();
        (first, second)
    }
}

/* when a VSMP migrates, pull both cells' clocks up to the pairwise
   max so no clock in either cell moves backwards from the VSMP's
   point of view */
pub fn sync_time(a: &mut CellState, b: &mut CellState)
{
    let now = core::cmp::max(a.now, b.now);
    let vtime = core::cmp::max(a.vtime, b.vtime);
    a.now = now;
    b.now = now;
    a.vtime = vtime;
    b.vtime = vtime;
}

/* carve the machine's packages into cells: whole packages only, at
   most CELL_PACKAGES_MAX per cell, and never across a NUMA node
   boundary
   <= the cells plus a per-pcpu map to its cell */
pub fn build_cells(platform: &dyn Platform) -> (Vec<Cell>, Vec<CellID>)
{
    let npcpus = platform.num_pcpus();
    let per_package = platform.logical_per_package();
    let nstride = STRIDE1 / BASE_SHARES_PER_PCPU as i64;

    let mut cells = Vec::new();
    let mut cell_of_pcpu = alloc::vec![0 as CellID; npcpus];

    for node in 0..platform.num_nodes()
    {
        let node_pcpus = platform.pcpus_of_node(node);

        /* packages of this node, in id order */
        let mut packages = Vec::new();
        for pcpu in node_pcpus.iter()
        {
            let package = platform.package_of(pcpu);
            if packages.last() != Some(&package)
            {
                packages.push(package);
            }
        }

        /* chunk the node's packages into cells */
        for chunk in packages.chunks(CELL_PACKAGES_MAX)
        {
            let id = cells.len();
            let mut mask = PcpuMask::EMPTY;
            let mut shadows = HashMap::new();

            for package in chunk.iter()
            {
                let first = package * per_package;
                for offset in 0..per_package
                {
                    let pcpu = first + offset;
                    if pcpu >= npcpus
                    {
                        continue;
                    }
                    mask.set(pcpu);
                    cell_of_pcpu[pcpu] = id;
                    shadows.insert(pcpu, PcpuShadow::new(pcpu,
                                                         platform.partner_of(pcpu),
                                                         *package, first));
                }
            }

            cells.push(Cell
            {
                id,
                pcpu_mask: mask,
                node,
                state: Mutex::new("scheduler cell", CellState
                {
                    id,
                    now: 0,
                    vtime: 0,
                    lost_cycles: 0,
                    last_raw: platform.now_cycles(),
                    nstride,
                    vsmps: HashMap::new(),
                    pcpus: shadows,
                    vtime_reset_pending: false
                })
            });
        }
    }

    (cells, cell_of_pcpu)
}

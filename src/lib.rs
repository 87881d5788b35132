/* fairsched: proportional-share CPU scheduler core for SMP virtual machines
 *
 * Divides physical CPU time among virtual machines according to a
 * hierarchy of min/max/shares allocations, co-schedules the virtual
 * CPUs of SMP guests so they make progress together, and keeps
 * hyperthreaded packages honest through sharing constraints,
 * quarantine and halt-aware charging.
 *
 * The host embeds this crate by implementing the platform trait
 * (cycle counter, IPIs, topology, the machine-clear counter and the
 * world switch) and calling in from its timer interrupt. Everything
 * else - cells, run queues, the group tree, virtual time - lives in
 * here behind one CpuSched handle created at boot.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]

#[macro_use]
extern crate alloc;

/* needed for fast lookup tables of stuff */
extern crate hashbrown;

/* needed for lazily-allocated static variables */
#[macro_use]
extern crate lazy_static;

/* and now for all our portable scheduler code */
#[macro_use]
pub mod debug;  /* get us some kind of debug output, queued for the host console */
pub mod error;     /* list of error codes */
pub mod lock;      /* spin lock, named mutex, sequence lock */
pub mod config;    /* tunable options */
pub mod platform;  /* what we need from the machine */
pub mod sim;       /* a pretend machine for the test suite */
pub mod vtime;     /* virtual time arithmetic */
pub mod groups;    /* allocation group tree and the rebalance pass */
pub mod metrics;   /* load history and usage snapshots */
pub mod world;     /* world identities and lifecycle */
pub mod vcpu;      /* virtual CPU entities... */
pub mod vsmp;      /* ...grouped and co-scheduled per VM */
pub mod runq;      /* main/extra/limbo run queues */
pub mod pcpu;      /* per-physical-CPU shadow state */
pub mod cell;      /* scheduler cells: the lock domains */
pub mod cosched;   /* skew detection and co-placement */
pub mod ht;        /* hyperthreading sharing, quarantine, charging */
pub mod events;    /* the wait and wakeup family */
pub mod scheduler; /* the dispatcher itself */

use core::sync::atomic::{AtomicU64, Ordering};
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::hash_map::HashMap;

use error::Cause;
use config::SchedConfig;
use platform::{ms_to_cycles, us_to_cycles, Platform, PcpuID, WorldID};
use groups::{GroupTree, MachineCaps};
use lock::{Mutex, MutexGuard};
use cell::{Cell, CellState};
use vsmp::{CellID, VsmpID};
use world::WorldInfo;
use events::EventTable;
use vtime::Vtime;

/* a cell-pointer read that retries this many times has to be a bug */
const CELL_LOCK_RETRY_MAX: usize = 1 << 20;

/* the config's periods converted to cycle counts once at boot */
#[derive(Debug, Clone, Copy)]
pub struct Tunables
{
    pub quantum: u64,
    pub credit_age: u64,
    pub pcpu_migrate: u64,
    pub cell_migrate: u64,
    pub runner_move: u64,
    pub skew_sample: u64,
    pub ht_event: u64,
    pub cos_warp: u64,
    pub halt_penalty: u64,
    pub vtime_reset_threshold: Vtime
}

impl Tunables
{
    fn from_config(platform: &dyn Platform, config: &SchedConfig) -> Tunables
    {
        Tunables
        {
            quantum: ms_to_cycles(platform, config.quantum_ms as u64),
            credit_age: ms_to_cycles(platform, config.credit_age_period_ms as u64),
            pcpu_migrate: ms_to_cycles(platform, config.pcpu_migrate_period_ms as u64),
            cell_migrate: ms_to_cycles(platform, config.cell_migrate_period_ms as u64),
            runner_move: ms_to_cycles(platform, config.runner_move_period_ms as u64),
            skew_sample: us_to_cycles(platform, config.skew_sample_usec as u64),
            ht_event: ms_to_cycles(platform, config.ht_event_period_ms as u64),
            cos_warp: ms_to_cycles(platform, config.cos_warp_period_ms as u64),
            halt_penalty: ms_to_cycles(platform, config.halting_idle_ms_penalty as u64),
            vtime_reset_threshold: (1 as Vtime) << config.vtime_reset_lg
        }
    }
}

/* where to find a world: its VSMP and the slot within it */
#[derive(Clone)]
pub struct WorldEntry
{
    pub vsmp: VsmpID,
    pub idx: usize,
    pub info: Arc<WorldInfo>
}

/* the scheduler: one per machine, created at boot, handed around as
   an explicit handle */
pub struct CpuSched
{
    pub platform: Arc<dyn Platform>,
    pub config: SchedConfig,
    pub tun: Tunables,
    pub caps: MachineCaps,

    /* the cells partition the machine's CPUs */
    cells: Vec<Cell>,
    cell_of_pcpu: Vec<CellID>,

    /* which cell each VSMP lives in right now. this is the hint the
       lock-and-recheck idiom starts from; the truth is residency in
       the cell's own table */
    cell_index: spin::Mutex<HashMap<VsmpID, CellID>>,

    /* the allocation tree. writers of tree *structure* during a
       rebalance commit also hold every cell lock */
    pub tree: Mutex<GroupTree>,

    /* world id to VSMP slot resolution */
    worlds: Mutex<HashMap<WorldID, WorldEntry>>,

    /* event-keyed wait queues and one-shot wakeup timers */
    pub events: EventTable,

    /* the console world's VSMP, if registered */
    console: spin::Mutex<Option<VsmpID>>,

    /* pacing stamps for global periodic work */
    next_credit_age: AtomicU64,
    next_cos_warp: AtomicU64
}

impl CpuSched
{
    /* bring the scheduler up on the given machine
       => platform = the machine's capabilities
          config = validated tunables
       <= the scheduler handle, or an error */
    pub fn new(platform: Arc<dyn Platform>, config: SchedConfig) -> Result<CpuSched, Cause>
    {
        config.validate()?;
        platform::check_topology(&*platform)?;

        let caps = MachineCaps
        {
            npcpus: platform.num_pcpus() as u32,
            logical_per_package: platform.logical_per_package() as u32,
            mhz: (platform.cycles_per_second() / 1000000) as u32
        };

        let tun = Tunables::from_config(&*platform, &config);
        let (cells, cell_of_pcpu) = cell::build_cells(&*platform);

        hvlog!("scheduler up: {} pcpus in {} cells, quantum {} ms",
               caps.npcpus, cells.len(), config.quantum_ms);

        Ok(CpuSched
        {
            platform,
            config,
            tun,
            caps,
            cells,
            cell_of_pcpu,
            cell_index: spin::Mutex::new(HashMap::new()),
            tree: Mutex::new("group tree", GroupTree::new(caps)),
            worlds: Mutex::new("world table", HashMap::new()),
            events: EventTable::new(),
            console: spin::Mutex::new(None),
            next_credit_age: AtomicU64::new(0),
            next_cos_warp: AtomicU64::new(0)
        })
    }

    pub fn num_cells(&self) -> usize
    {
        self.cells.len()
    }

    pub fn cell(&self, id: CellID) -> Option<&Cell>
    {
        self.cells.get(id)
    }

    pub fn cells(&self) -> &[Cell]
    {
        &self.cells
    }

    /* the cell owning a physical CPU */
    pub fn cell_of_pcpu(&self, pcpu: PcpuID) -> Result<&Cell, Cause>
    {
        let id = *self.cell_of_pcpu.get(pcpu).ok_or(Cause::PcpuBadID)?;
        self.cells.get(id).ok_or(Cause::CellBadID)
    }

    /* look up a world's location */
    pub fn world_entry(&self, world: WorldID) -> Result<WorldEntry, Cause>
    {
        self.worlds.lock().get(&world).cloned().ok_or(Cause::WorldBadID)
    }

    pub(crate) fn worlds_lock(&self) -> MutexGuard<'_, HashMap<WorldID, WorldEntry>>
    {
        self.worlds.lock()
    }

    /* record or update which cell a VSMP lives in */
    pub(crate) fn set_cell_hint(&self, vsmp: VsmpID, cell: CellID)
    {
        self.cell_index.lock().insert(vsmp, cell);
    }

    pub(crate) fn drop_cell_hint(&self, vsmp: VsmpID)
    {
        self.cell_index.lock().remove(&vsmp);
    }

    /* the lock-and-recheck idiom: snapshot the VSMP's cell without any
       cell lock, lock that cell, and confirm the VSMP is still there.
       retries are expected to be zero; the bound exists to catch bugs */
    pub fn lock_vsmp_cell(&self, vsmp: VsmpID) -> Result<(CellID, MutexGuard<'_, CellState>), Cause>
    {
        let mut retries = 0;
        loop
        {
            let hint = match self.cell_index.lock().get(&vsmp)
            {
                Some(cell) => *cell,
                None => return Err(Cause::WorldBadID)
            };

            let cell = self.cells.get(hint).ok_or(Cause::CellBadID)?;
            let guard = cell.state.lock();
            if guard.vsmps.contains_key(&vsmp)
            {
                return Ok((hint, guard));
            }
            drop(guard);

            retries = retries + 1;
            if retries > CELL_LOCK_RETRY_MAX
            {
                panic!("cell pointer for VSMP {} won't settle after {} retries", vsmp, retries);
            }
        }
    }

    /* machine capacity in percent units */
    pub fn percent_total(&self) -> u32
    {
        self.caps.percent_total()
    }

    /* register the console world's VSMP: pinned to its cell forever and
       guaranteed a minimum slice by configuration */
    pub(crate) fn set_console(&self, vsmp: Option<VsmpID>)
    {
        *self.console.lock() = vsmp;
    }

    pub fn console_vsmp(&self) -> Option<VsmpID>
    {
        *self.console.lock()
    }

    /* ---- allocation engine entry points ---- */

    /* ask for a rebalance at the next opportunity. idempotent */
    pub fn request_reallocate(&self)
    {
        self.tree.lock().request_reallocate();
    }

    /* run the rebalance if one is pending: snapshot under the tree
       lock plus all cell locks, compute with everything dropped, then
       re-acquire and commit. a commit beaten by a concurrent tree
       change returns ReallocRetry and leaves the dirty flag set */
    pub fn reallocate(&self) -> Result<(), Cause>
    {
        /* snapshot phase */
        let snap =
        {
            let mut _guards = Vec::new();
            for cell in self.cells.iter()
            {
                _guards.push(cell.state.lock());
            }
            let mut tree = self.tree.lock();
            if tree.is_dirty() == false
            {
                return Ok(());
            }
            tree.begin_rebalance()?
        };

        /* compute with no scheduler locks held */
        let plan = groups::rebalance(&snap);

        /* commit phase */
        let mut guards = Vec::new();
        for cell in self.cells.iter()
        {
            guards.push(cell.state.lock());
        }
        let mut tree = self.tree.lock();
        let new_bases = tree.commit_rebalance(&snap, &plan)?;
        drop(tree);

        /* push each VM's new base into its VSMP, requeueing ready vCPUs
           whose queue class changed with the stride */
        for (world, base) in new_bases
        {
            for guard in guards.iter_mut()
            {
                let changed = match guard.vsmp_mut(world)
                {
                    Some(vsmp) => Some(vsmp.set_base_alloc(base)),
                    None => None
                };
                match changed
                {
                    Some(true) => guard.requeue_siblings(world),
                    Some(false) => (),
                    None => continue
                }
                break;
            }
        }

        Ok(())
    }

    /* ---- the global virtual time reset ---- */

    /* check whether any clock is near the threshold; called from the
       dispatch path. flags the cell so the reset runs once, soon */
    pub(crate) fn vtime_reset_check(&self, state: &mut CellState) -> bool
    {
        if state.vtime_reset_pending
        {
            return true;
        }
        if state.vtime_reset_due(self.tun.vtime_reset_threshold)
        {
            state.vtime_reset_pending = true;
            return true;
        }
        false
    }

    /* the reset itself: all cell locks plus the tree lock, subtract a
       fixed offset from every live virtual clock. relative order, and
       therefore every scheduling decision, is preserved */
    pub fn vtime_reset(&self)
    {
        let offset = self.tun.vtime_reset_threshold / 2;

        let mut guards = Vec::new();
        for cell in self.cells.iter()
        {
            guards.push(cell.state.lock());
        }

        for guard in guards.iter_mut()
        {
            guard.apply_vtime_reset(offset);
        }

        self.tree.lock().reset_vtimes(offset);

        hvdebug!("global vtime reset by {}", offset);
    }

    /* ---- periodic bookkeeping ---- */

    /* age virtual-time lag so a long-slept VM doesn't monopolize the
       machine on return: clamp everyone's distance from the cell clock
       to bound_lag_quanta quanta, halving the excess */
    pub fn credit_age(&self)
    {
        let bound = (self.tun.quantum * self.config.bound_lag_quanta as u64) as i64;

        for cell in self.cells.iter()
        {
            let mut state = cell.state.lock();
            let cell_vtime = state.vtime;
            let mut requeue = Vec::new();

            for (id, vsmp) in state.vsmps.iter_mut()
            {
                let lag_bound = vtime::cycles_to_vtime(vsmp.vtime.stride, bound as u64);
                let distance = vsmp.vtime.main - cell_vtime;

                if distance < -lag_bound
                {
                    vsmp.vtime.main = vsmp.vtime.main + (-lag_bound - distance) / 2;
                    requeue.push(*id);
                }
                else if distance > lag_bound
                {
                    vsmp.vtime.main = vsmp.vtime.main - (distance - lag_bound) / 2;
                    requeue.push(*id);
                }

                /* run/ready sampling rides the aging period */
                let run: u64 = vsmp.vcpus.iter().map(|v| v.run_cycles).sum();
                let ready: u64 = vsmp.vcpus.iter()
                    .map(|v| v.meters.time_in(vcpu::RunState::Ready)).sum();
                vsmp.load_history.sample_cumulative(run, ready);
            }

            for id in requeue
            {
                state.requeue_siblings(id);
            }
        }
    }

    /* warp the console world a little ahead of its entitlement so host
       management work is never starved behind guests */
    pub fn console_warp(&self)
    {
        let console = match self.console_vsmp()
        {
            Some(vsmp) => vsmp,
            None => return
        };

        if let Ok((_, mut state)) = self.lock_vsmp_cell(console)
        {
            let warp = vtime::cycles_to_vtime(
                vtime::stride_for_shares(self.config.cos_min_cpu.max(1)),
                self.tun.quantum);
            if let Some(vsmp) = state.vsmp_mut(console)
            {
                vsmp.vtime.main = vsmp.vtime.main - warp;
            }
            state.requeue_siblings(console);
        }
    }

    /* drive time-based housekeeping from any CPU's timer tick: credit
       aging, the console warp, pending sleeps and the vtime reset */
    pub fn poll_timers(&self, pcpu: PcpuID)
    {
        let now = self.platform.now_cycles();

        let due = self.next_credit_age.load(Ordering::SeqCst);
        if now >= due
        {
            let next = now + self.tun.credit_age;
            if self.next_credit_age.compare_exchange(due, next,
                    Ordering::SeqCst, Ordering::SeqCst).is_ok()
            {
                self.credit_age();
                if self.tree.lock().is_dirty()
                {
                    match self.reallocate()
                    {
                        Ok(()) | Err(Cause::ReallocRetry) | Err(Cause::ReallocInProgress) => (),
                        Err(e) => hvalert!("rebalance failed: {:?}", e)
                    }
                }
            }
        }

        let due = self.next_cos_warp.load(Ordering::SeqCst);
        if now >= due
        {
            let next = now + self.tun.cos_warp;
            if self.next_cos_warp.compare_exchange(due, next,
                    Ordering::SeqCst, Ordering::SeqCst).is_ok()
            {
                self.console_warp();
            }
        }

        /* fire due sleep timers */
        self.fire_due_timers(now);

        /* a pending vtime reset runs from whichever CPU notices it */
        let pending = match self.cell_of_pcpu(pcpu)
        {
            Ok(cell) => cell.state.lock().vtime_reset_pending,
            Err(_) => false
        };
        if pending
        {
            self.vtime_reset();
        }
    }

    /* ---- introspection ---- */

    /* per-VM usage snapshot */
    pub fn vsmp_usage(&self, leader: VsmpID) -> Result<metrics::VsmpUsage, Cause>
    {
        let (_, state) = self.lock_vsmp_cell(leader)?;
        let vsmp = state.vsmp(leader).ok_or(Cause::WorldBadID)?;

        let mut charged = 0;
        let mut run = 0;
        for vcpu in vsmp.vcpus.iter()
        {
            charged = charged + vcpu.charged_cycles;
            run = run + vcpu.run_cycles;
        }

        let (fast, _, slow) = vsmp.load_history.averages();
        Ok(metrics::VsmpUsage
        {
            leader,
            used_usec: platform::cycles_to_us(&*self.platform, run),
            charged_cycles: charged,
            run_cycles: run,
            load_fast: fast,
            load_slow: slow
        })
    }

    /* per-physical-CPU usage snapshot */
    pub fn pcpu_usage(&self, pcpu: PcpuID) -> Result<metrics::PcpuUsage, Cause>
    {
        let cell = self.cell_of_pcpu(pcpu)?;
        let state = cell.state.lock();
        let shadow = state.pcpu(pcpu).ok_or(Cause::PcpuBadID)?;

        let halted = shadow.halt.halted_until(state.now);

        Ok(metrics::PcpuUsage
        {
            pcpu,
            idle_cycles: shadow.idle_cycles,
            used_cycles: shadow.used_cycles,
            sys_overlap_cycles: shadow.sys_overlap_cycles,
            halted_cycles: halted,
            lost_cycles: state.lost_cycles
        })
    }

    /* a cell's clocks as seen from one of its CPUs */
    pub fn cell_clock(&self, pcpu: PcpuID) -> Result<(u64, Vtime), Cause>
    {
        let cell = self.cell_of_pcpu(pcpu)?;
        let state = cell.state.lock();
        Ok((state.now, state.vtime))
    }

    /* is a rebalance still owed? */
    pub fn realloc_pending(&self) -> bool
    {
        self.tree.lock().is_dirty()
    }

    /* which world a physical CPU is running right now, if any */
    pub fn running_world(&self, pcpu: PcpuID) -> Option<WorldID>
    {
        let cell = self.cell_of_pcpu(pcpu).ok()?;
        let state = cell.state.lock();
        let entry = state.pcpu(pcpu)?.running?;
        state.vsmp(entry.vsmp).map(|vsmp| vsmp.vcpus[entry.idx].world)
    }

    /* a VM's co-run state */
    pub fn vsmp_corun(&self, leader: VsmpID) -> Result<vsmp::CoRunState, Cause>
    {
        let (_, state) = self.lock_vsmp_cell(leader)?;
        state.vsmp(leader).map(|vsmp| vsmp.corun).ok_or(Cause::WorldBadID)
    }

    /* a VM's aggregate counters: running, waiting non-idle, idle */
    pub fn vsmp_counters(&self, leader: VsmpID) -> Result<(u32, u32, u32), Cause>
    {
        let (_, state) = self.lock_vsmp_cell(leader)?;
        state.vsmp(leader)
            .map(|vsmp| (vsmp.nrun, vsmp.nwait, vsmp.nidle))
            .ok_or(Cause::WorldBadID)
    }

    /* verify a VM's counters against a re-scan of its vCPUs */
    pub fn vsmp_check_counters(&self, leader: VsmpID) -> Result<bool, Cause>
    {
        let (_, state) = self.lock_vsmp_cell(leader)?;
        state.vsmp(leader).map(|vsmp| vsmp.check_counters()).ok_or(Cause::WorldBadID)
    }

    /* proc-style text rendering of the allocation tree */
    pub fn render_groups(&self) -> alloc::string::String
    {
        self.tree.lock().render()
    }

    /* proc-style text rendering of every VM's scheduler state */
    pub fn render_vsmps(&self) -> alloc::string::String
    {
        let mut text = alloc::string::String::new();
        text.push_str("vsmp     cell  corun    run/wait/idle\n");

        for cell in self.cells.iter()
        {
            let state = cell.state.lock();
            let mut ids: Vec<VsmpID> = state.vsmps.keys().copied().collect();
            ids.sort();
            for id in ids
            {
                if let Some(vsmp) = state.vsmp(id)
                {
                    text.push_str(&vsmp.render());
                }
            }
        }
        text
    }

    /* cycles charged against the root group: all of the machine's
       priced consumption, for accounting checks */
    pub fn total_group_charge(&self) -> u64
    {
        self.tree.lock().root_charged_cycles()
    }

    /* attribute interrupt-handler cycles to a world: folded into its
       next charge, clipped there to one quantum */
    pub fn charge_sys_cycles(&self, world: WorldID, cycles: u64) -> Result<(), Cause>
    {
        let entry = self.world_entry(world)?;
        let (_, mut state) = self.lock_vsmp_cell(entry.vsmp)?;
        if let Some(vsmp) = state.vsmp_mut(entry.vsmp)
        {
            let vcpu = &mut vsmp.vcpus[entry.idx];
            vcpu.sys_cycles_pending = vcpu.sys_cycles_pending + cycles;
        }
        Ok(())
    }

    /* count an interrupt against a CPU, feeding the idle-pricing model */
    pub fn note_irq(&self, pcpu: PcpuID)
    {
        if let Ok(cell) = self.cell_of_pcpu(pcpu)
        {
            let mut state = cell.state.lock();
            if let Some(shadow) = state.pcpu_mut(pcpu)
            {
                shadow.irq_count = shadow.irq_count + 1;
            }
        }
    }
}

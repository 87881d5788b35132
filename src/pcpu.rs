/* fairsched physical CPU shadow state
 *
 * Each physical CPU owns a shadow structure inside its cell: run
 * queues, the pending co-schedule handoff, the directed-yield target,
 * a snapshot of what it last picked (so remote CPUs can judge
 * preemption without taking its dispatch path), a small versioned
 * cache of group virtual clocks, and halt accounting. The per-package
 * halt lock lives on the package's first logical CPU; the holder is
 * computed once at init and never searched for.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use alloc::sync::Arc;
use super::lock::{SeqLock, SpinLock};
use super::platform::PcpuID;
use super::groups::{GroupID, GroupVtime, GROUP_ID_INVALID};
use super::runq::{RunQueues, VcpuRef};
use super::vtime::VtimeContext;

/* what this CPU last decided to run, published for remote preemption
   judgement. invalidated whenever the decision goes stale */
#[derive(Debug, Clone, Copy)]
pub struct PreemptSnap
{
    pub valid: bool,
    pub ctx: VtimeContext,
    pub bonus_cycles: i64
}

impl PreemptSnap
{
    pub fn invalid() -> PreemptSnap
    {
        PreemptSnap
        {
            valid: false,
            ctx: VtimeContext::new(0, 0, [GROUP_ID_INVALID; super::groups::GROUP_PATH_LEN]),
            bonus_cycles: 0
        }
    }
}

/* number of slots in the direct-mapped group clock cache */
const GROUP_CACHE_SLOTS: usize = 16;

/* a direct-mapped, versioned cache of group clock handles. the
   dispatcher invalidates it wholesale by bumping the generation;
   when the generation counter wraps, every slot is cleared so stale
   generations can't alias */
pub struct GroupVtimeCache
{
    slots: [Option<CacheSlot>; GROUP_CACHE_SLOTS],
    generation: u32
}

struct CacheSlot
{
    group: GroupID,
    generation: u32,
    handle: Arc<SeqLock<GroupVtime>>
}

impl GroupVtimeCache
{
    pub fn new() -> GroupVtimeCache
    {
        GroupVtimeCache
        {
            slots: Default::default(),
            generation: 0
        }
    }

    fn slot_of(group: GroupID) -> usize
    {
        group % GROUP_CACHE_SLOTS
    }

    /* read a group's published clocks through the cache.
       <= the triple, or None on a miss */
    pub fn lookup(&self, group: GroupID) -> Option<GroupVtime>
    {
        match &self.slots[GroupVtimeCache::slot_of(group)]
        {
            Some(slot) if slot.group == group && slot.generation == self.generation =>
                Some(slot.handle.read()),
            _ => None
        }
    }

    /* fill the group's slot with a fresh handle */
    pub fn insert(&mut self, group: GroupID, handle: Arc<SeqLock<GroupVtime>>)
    {
        self.slots[GroupVtimeCache::slot_of(group)] = Some(CacheSlot
        {
            group,
            generation: self.generation,
            handle
        });
    }

    /* drop everything by moving to a new generation */
    pub fn invalidate(&mut self)
    {
        let (next, wrapped) = self.generation.overflowing_add(1);
        self.generation = next;
        if wrapped
        {
            for slot in self.slots.iter_mut()
            {
                *slot = None;
            }
        }
    }
}

/* halt accounting for one package, held on its first logical CPU.
   total_halt_cycles accumulates completed halts; halt_start marks a
   halt still in progress */
pub struct HaltAccount
{
    pub lock: SpinLock,
    pub total_halt_cycles: u64,
    pub halt_start: Option<u64>
}

impl HaltAccount
{
    pub fn new() -> HaltAccount
    {
        HaltAccount
        {
            lock: SpinLock::new(),
            total_halt_cycles: 0,
            halt_start: None
        }
    }

    /* total halted cycles as of `now`, counting any halt in progress */
    pub fn halted_until(&self, now: u64) -> u64
    {
        self.lock.lock();
        let mut total = self.total_halt_cycles;
        if let Some(start) = self.halt_start
        {
            if now > start
            {
                total = total + (now - start);
            }
        }
        self.lock.unlock();
        total
    }

    pub fn begin(&mut self, now: u64)
    {
        self.lock.lock();
        self.halt_start = Some(now);
        self.lock.unlock();
    }

    /* close out a halt interval.
       <= cycles spent halted this time */
    pub fn end(&mut self, now: u64) -> u64
    {
        self.lock.lock();
        let slept = match self.halt_start.take()
        {
            Some(start) if now > start => now - start,
            _ => 0
        };
        self.total_halt_cycles = self.total_halt_cycles + slept;
        self.lock.unlock();
        slept
    }
}

/* a tiny xorshift generator for migration jitter and the occasional
   random remote scan. per-CPU and deterministic from the CPU id */
pub struct Rand(u64);

impl Rand
{
    pub fn new(seed: u64) -> Rand
    {
        Rand(seed.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(1))
    }

    pub fn next(&mut self) -> u64
    {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /* uniform-ish pick in [0, bound) */
    pub fn below(&mut self, bound: u64) -> u64
    {
        if bound == 0
        {
            return 0;
        }
        self.next() % bound
    }

    /* jitter a period by up to +/- an eighth of itself */
    pub fn jitter(&mut self, period: u64) -> u64
    {
        let spread = period / 8;
        if spread == 0
        {
            return period;
        }
        period - spread + self.below(spread * 2 + 1)
    }
}

/* the per-physical-CPU scheduler state, owned by the CPU's cell */
pub struct PcpuShadow
{
    pub id: PcpuID,

    /* hyperthread partner and the holder of this package's halt lock,
       both resolved once at init */
    pub partner: Option<PcpuID>,
    pub package: usize,
    pub package_first: PcpuID,

    pub queues: RunQueues,

    /* what's on the CPU right now; None means idling */
    pub running: Option<VcpuRef>,

    /* reserved-for-next-dispatch target set by a remote co-scheduling CPU */
    pub handoff: Option<VcpuRef>,

    /* directed-yield target, consumed at most once per quantum, and the
       quantum expiry the target inherits from the donor */
    pub yield_to: Option<VcpuRef>,
    pub yield_quantum: Option<u64>,

    /* the published last-pick snapshot */
    pub snap: PreemptSnap,

    pub cache: GroupVtimeCache,

    /* the local reschedule flag, consulted on interrupt return */
    pub resched: bool,

    /* halt bookkeeping: whether this CPU is halted, its own interval
       accounting, and a baseline of the partner's halted total taken at
       switch-in so the charge path can price the partner's halts */
    pub halted: bool,
    pub halt: HaltAccount,
    pub partner_halt_base: u64,

    /* cycle accounting buckets */
    pub idle_cycles: u64,
    pub used_cycles: u64,
    pub sys_cycles: u64,
    pub sys_overlap_cycles: u64,
    pub idle_start: Option<u64>,
    pub idle_halt_base: u64,

    /* interrupt rate estimate, for pricing idle wakeups */
    pub irq_count: u64,

    /* migration pacing: cell time before which each kind may not fire again */
    pub next_pcpu_migrate: u64,
    pub next_cell_migrate: u64,
    pub next_runner_move: u64,

    /* skew sampler pacing */
    pub last_skew_sample: u64,

    pub rand: Rand
}

impl PcpuShadow
{
    pub fn new(id: PcpuID, partner: Option<PcpuID>, package: usize, package_first: PcpuID) -> PcpuShadow
    {
        PcpuShadow
        {
            id,
            partner,
            package,
            package_first,
            queues: RunQueues::new(),
            running: None,
            handoff: None,
            yield_to: None,
            yield_quantum: None,
            snap: PreemptSnap::invalid(),
            cache: GroupVtimeCache::new(),
            resched: false,
            halted: false,
            halt: HaltAccount::new(),
            partner_halt_base: 0,
            idle_cycles: 0,
            used_cycles: 0,
            sys_cycles: 0,
            sys_overlap_cycles: 0,
            idle_start: None,
            idle_halt_base: 0,
            irq_count: 0,
            next_pcpu_migrate: 0,
            next_cell_migrate: 0,
            next_runner_move: 0,
            last_skew_sample: 0,
            rand: Rand::new(id as u64 + 1)
        }
    }

    /* is this CPU the keeper of its package's halt accounting? */
    pub fn owns_halt_lock(&self) -> bool
    {
        self.package_first == self.id
    }

    pub fn mark_reschedule(&mut self)
    {
        self.resched = true;
    }

    pub fn clear_reschedule(&mut self) -> bool
    {
        let was = self.resched;
        self.resched = false;
        was
    }
}

/* fairsched virtual CPU entities
 *
 * A virtual CPU is the unit of dispatch: one guest processor of one
 * virtual machine, owned by its VSMP and moved with it between
 * scheduler cells. Everything here is plain data plus meters; the
 * state transitions themselves are driven through the VSMP so the
 * invariant counters can never drift from the per-vCPU states.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use alloc::vec::Vec;
use alloc::sync::Arc;
use super::platform::{PcpuID, PcpuMask, WorldID};
use super::world::WorldInfo;

/* run states a virtual CPU moves through */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState
{
    New,         /* created, never yet made runnable */
    Ready,       /* runnable, queued */
    ReadyCorun,  /* runnable, reserved by a remote handoff during co-scheduling */
    ReadyCostop, /* runnable but held back while its VSMP is co-descheduled */
    Run,         /* executing on a physical CPU */
    Wait,        /* blocked on an event */
    BusyWait,    /* blocked on an event but polling on the CPU */
    Zombie       /* dead, awaiting reaping */
}

pub const NUM_RUN_STATES: usize = 8;

impl RunState
{
    pub fn index(self) -> usize
    {
        match self
        {
            RunState::New => 0,
            RunState::Ready => 1,
            RunState::ReadyCorun => 2,
            RunState::ReadyCostop => 3,
            RunState::Run => 4,
            RunState::Wait => 5,
            RunState::BusyWait => 6,
            RunState::Zombie => 7
        }
    }

    /* runnable means sitting on (or about to join) a run queue */
    pub fn is_ready(self) -> bool
    {
        match self
        {
            RunState::Ready | RunState::ReadyCorun | RunState::ReadyCostop => true,
            _ => false
        }
    }

    pub fn is_waiting(self) -> bool
    {
        match self
        {
            RunState::Wait | RunState::BusyWait => true,
            _ => false
        }
    }
}

/* an event a virtual CPU can wait on. event numbers are opaque keys
   chosen by the caller: typically an address or a well-known constant */
pub type EventID = u64;

/* why a virtual CPU is waiting. some kinds mark the vCPU as
   effectively idle; some must not hold up co-descheduling of the
   rest of its VSMP */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind
{
    Idle,    /* guest executed its idle loop */
    Rpc,     /* waiting on a cross-world request */
    Sema,    /* waiting on a semaphore */
    Lock,    /* waiting on a kernel lock */
    Sleep,   /* timed sleep */
    Request, /* miscellaneous kernel request */
    Yield    /* directed yield donor */
}

impl WaitKind
{
    /* RPC, semaphore and lock waits are typically held *by* a running
       sibling, so treating the waiter as idle for co-descheduling
       purposes would deadlock the VM */
    pub fn disables_co_deschedule(self) -> bool
    {
        match self
        {
            WaitKind::Rpc | WaitKind::Sema | WaitKind::Lock => true,
            _ => false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState
{
    None,
    Waiting { event: EventID, kind: WaitKind }
}

impl WaitState
{
    pub fn event(self) -> Option<EventID>
    {
        match self
        {
            WaitState::Waiting { event, .. } => Some(event),
            WaitState::None => None
        }
    }

    pub fn kind(self) -> Option<WaitKind>
    {
        match self
        {
            WaitState::Waiting { kind, .. } => Some(kind),
            WaitState::None => None
        }
    }

    pub fn is_idle(self) -> bool
    {
        self.kind() == Some(WaitKind::Idle)
    }
}

/* power-of-two bucketed latency/occupancy histogram */
#[derive(Debug, Clone)]
pub struct Histogram
{
    buckets: [u64; 32]
}

impl Histogram
{
    pub fn new() -> Histogram
    {
        Histogram { buckets: [0; 32] }
    }

    pub fn add(&mut self, cycles: u64)
    {
        let bucket = (64 - cycles.leading_zeros()) as usize;
        let bucket = if bucket >= 32 { 31 } else { bucket };
        self.buckets[bucket] = self.buckets[bucket] + 1;
    }

    pub fn count(&self) -> u64
    {
        let mut total = 0;
        for b in self.buckets.iter()
        {
            total = total + b;
        }
        total
    }

    pub fn bucket(&self, index: usize) -> u64
    {
        if index < 32 { self.buckets[index] } else { 0 }
    }
}

/* time-in-state metering. each state accumulates elapsed cycles and a
   histogram of visit lengths; the wakeup latency meter runs from
   becoming READY out of a wait until the next dispatch */
#[derive(Debug, Clone)]
pub struct StateMeters
{
    pub state_cycles: [u64; NUM_RUN_STATES],
    state_histo: [Histogram; NUM_RUN_STATES],
    pub state_start: u64,

    wakeup_start: Option<u64>,
    pub wakeup_latency: Histogram,

    /* where RUN time went when it ended: preempted back to ready, or
       voluntarily into a wait */
    pub preempt_histo: Histogram,
    pub run_to_wait_histo: Histogram
}

impl StateMeters
{
    pub fn new(now: u64) -> StateMeters
    {
        StateMeters
        {
            state_cycles: [0; NUM_RUN_STATES],
            state_histo: [
                Histogram::new(), Histogram::new(), Histogram::new(), Histogram::new(),
                Histogram::new(), Histogram::new(), Histogram::new(), Histogram::new()
            ],
            state_start: now,
            wakeup_start: None,
            wakeup_latency: Histogram::new(),
            preempt_histo: Histogram::new(),
            run_to_wait_histo: Histogram::new()
        }
    }

    /* close out the old state and open the new one.
       <= cycles spent in the state being left */
    pub fn transition(&mut self, old: RunState, new: RunState, now: u64) -> u64
    {
        if now < self.state_start
        {
            /* a start stamp in the future means someone's clock ran backwards */
            panic!("state meter start {} is ahead of now {} during {:?} -> {:?}",
                   self.state_start, now, old, new);
        }

        let elapsed = now - self.state_start;
        self.state_cycles[old.index()] = self.state_cycles[old.index()] + elapsed;
        self.state_histo[old.index()].add(elapsed);
        self.state_start = now;

        /* wakeup latency runs from leaving a wait to reaching the CPU */
        if old.is_waiting() && new.is_ready()
        {
            self.wakeup_start = Some(now);
        }
        if new == RunState::Run
        {
            if let Some(started) = self.wakeup_start.take()
            {
                self.wakeup_latency.add(now - started);
            }
        }

        /* where did the RUN time go? */
        if old == RunState::Run
        {
            if new.is_ready()
            {
                self.preempt_histo.add(elapsed);
            }
            else if new.is_waiting()
            {
                self.run_to_wait_histo.add(elapsed);
            }
        }

        elapsed
    }

    /* pull all state-start timestamps back during a global vtime reset
       so nothing ends up in the future of the rewound clocks */
    pub fn clamp_start(&mut self, now: u64)
    {
        if self.state_start > now
        {
            self.state_start = now;
        }
        if let Some(started) = self.wakeup_start
        {
            if started > now
            {
                self.wakeup_start = Some(now);
            }
        }
    }

    pub fn time_in(&self, state: RunState) -> u64
    {
        self.state_cycles[state.index()]
    }
}

/* one virtual CPU */
pub struct Vcpu
{
    /* identity: the world id, the owning VSMP's leader, and this
       vCPU's slot within the VSMP */
    pub world: WorldID,
    pub vsmp: WorldID,
    pub idx: usize,

    /* current and last-mapped physical CPUs. current is advisory
       except while the owning cell's lock is held */
    pub pcpu: PcpuID,
    pub mapped_pcpu: Option<PcpuID>,

    pub run_state: RunState,
    pub wait_state: WaitState,

    /* hard affinity over physical CPUs */
    pub affinity: PcpuMask,

    /* co-scheduling skew accumulated against this vCPU */
    pub intra_skew: u32,

    pub meters: StateMeters,

    /* charge accounting. uncharged_cycles collects run time that has
       left the CPU but not yet been priced into the virtual clocks */
    pub charged_cycles: u64,
    pub run_cycles: u64,
    pub uncharged_cycles: u64,
    pub pcpu_run_time: Vec<u64>,

    /* interrupt-handler cycles attributed to this vCPU, folded into its
       next charge (clipped to a quantum) */
    pub sys_cycles_pending: u64,

    /* machine-clear tracking for the hyperthreading quarantine */
    pub mc_last_count: u64,
    pub mc_used_cycles: u64,
    pub mc_ema_slow: u64,
    pub mc_ema_fast: u64,

    /* shared bits that outlive cell migrations and are read cross-CPU */
    pub info: Arc<WorldInfo>
}

impl Vcpu
{
    pub fn new(world: WorldID, vsmp: WorldID, idx: usize, affinity: PcpuMask,
               npcpus: usize, now: u64, info: Arc<WorldInfo>) -> Vcpu
    {
        Vcpu
        {
            world,
            vsmp,
            idx,
            pcpu: affinity.first().unwrap_or(0),
            mapped_pcpu: None,
            run_state: RunState::New,
            wait_state: WaitState::None,
            affinity,
            intra_skew: 0,
            meters: StateMeters::new(now),
            charged_cycles: 0,
            run_cycles: 0,
            uncharged_cycles: 0,
            pcpu_run_time: alloc::vec![0; npcpus],
            sys_cycles_pending: 0,
            mc_last_count: 0,
            mc_used_cycles: 0,
            mc_ema_slow: 0,
            mc_ema_fast: 0,
            info
        }
    }

    /* true if this vCPU should be running alongside its siblings:
       an SMP vCPU that isn't idle and either runs under strict
       co-scheduling or has built up too much intra-skew */
    pub fn needs_cosched(&self, strict: bool, intraskew_threshold: u32) -> bool
    {
        if self.run_state == RunState::Run || self.run_state == RunState::Zombie
        {
            return false;
        }
        if self.wait_state.is_idle()
        {
            return false;
        }
        strict || self.intra_skew > intraskew_threshold
    }

    /* bump the intra-skew meter, saturating */
    pub fn add_skew(&mut self, points: u32)
    {
        self.intra_skew = self.intra_skew.saturating_add(points);
    }

    pub fn decay_skew(&mut self, points: u32)
    {
        self.intra_skew = self.intra_skew.saturating_sub(points);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn histogram_buckets_by_magnitude()
    {
        let mut h = Histogram::new();
        h.add(0);
        h.add(1);
        h.add(1);
        h.add(1024);
        assert_eq!(h.count(), 4);
        assert_eq!(h.bucket(0), 1);
        assert_eq!(h.bucket(1), 2);
        assert_eq!(h.bucket(11), 1);
    }

    #[test]
    fn meters_account_elapsed_time()
    {
        let mut m = StateMeters::new(100);
        let elapsed = m.transition(RunState::New, RunState::Ready, 150);
        assert_eq!(elapsed, 50);
        assert_eq!(m.time_in(RunState::New), 50);

        m.transition(RunState::Ready, RunState::Run, 250);
        assert_eq!(m.time_in(RunState::Ready), 100);
    }

    #[test]
    fn wakeup_latency_measured_wait_to_run()
    {
        let mut m = StateMeters::new(0);
        m.transition(RunState::New, RunState::Ready, 10);
        m.transition(RunState::Ready, RunState::Run, 20);
        m.transition(RunState::Run, RunState::Wait, 30);

        /* woken at 40, dispatched at 70: latency 30 lands in bucket 5 */
        m.transition(RunState::Wait, RunState::Ready, 40);
        assert_eq!(m.wakeup_latency.count(), 0);
        m.transition(RunState::Ready, RunState::Run, 70);
        assert_eq!(m.wakeup_latency.count(), 1);
        assert_eq!(m.wakeup_latency.bucket(5), 1);
    }

    #[test]
    fn run_exit_classified()
    {
        let mut m = StateMeters::new(0);
        m.transition(RunState::New, RunState::Run, 0);
        m.transition(RunState::Run, RunState::Ready, 100);
        assert_eq!(m.preempt_histo.count(), 1);
        assert_eq!(m.run_to_wait_histo.count(), 0);

        m.transition(RunState::Ready, RunState::Run, 110);
        m.transition(RunState::Run, RunState::Wait, 160);
        assert_eq!(m.run_to_wait_histo.count(), 1);
    }

    #[test]
    #[should_panic]
    fn future_state_start_is_fatal()
    {
        let mut m = StateMeters::new(1000);
        m.transition(RunState::New, RunState::Ready, 10);
    }

    #[test]
    fn wait_kinds_and_co_deschedule()
    {
        assert!(WaitKind::Rpc.disables_co_deschedule());
        assert!(WaitKind::Sema.disables_co_deschedule());
        assert!(WaitKind::Lock.disables_co_deschedule());
        assert!(!WaitKind::Idle.disables_co_deschedule());
        assert!(!WaitKind::Sleep.disables_co_deschedule());
    }
}

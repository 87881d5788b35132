/* fairsched VSMP management
 *
 * A VSMP is the co-scheduled set of one VM's virtual CPUs and the
 * unit of allocation: virtual time, base shares and the co-run state
 * machine all live at this level. The two functions set_run_state()
 * and set_wait_state() are the only mutators of per-vCPU state, so
 * the aggregate counters (how many vCPUs are running, waiting
 * non-idle, or idle) can never drift from the truth.
 *
 * A VSMP is owned by value by exactly one scheduler cell at a time
 * and is moved between cell tables under both cell locks.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use alloc::vec::Vec;
use alloc::sync::Arc;
use alloc::string::String;
use super::platform::{PcpuMask, WorldID};
use super::groups::{Alloc, BaseAlloc, GroupID, GroupPath, MAX_NONE};
use super::vtime::{self, Vtime, VtimeContext};
use super::vcpu::{RunState, Vcpu, WaitState};
use super::world::WorldInfo;
use super::metrics::LoadHistory;

/* VSMPs are identified by their leader world */
pub type VsmpID = WorldID;

pub type CellID = usize;

/* co-run state of an SMP virtual machine. uniprocessor VMs stay in
   CoNone forever */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoRunState
{
    CoNone,  /* uniprocessor: co-scheduling does not apply */
    CoReady, /* runnable, no vCPU dispatched yet */
    CoRun,   /* at least one vCPU running or the VM is idling */
    CoStop   /* co-descheduled after skewing out */
}

/* how willing this VM is to share a hyperthreaded package */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HtSharing
{
    None,       /* demand a whole package per vCPU */
    Internally, /* share only with vCPUs of the same VM */
    Any         /* share with anyone */
}

/* which accounting bucket a vCPU's current state lands in */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket
{
    Running,
    WaitingIdle,
    Waiting { disables_co_deschedule: bool },
    Other
}

fn bucket_of(run_state: RunState, wait_state: WaitState) -> Bucket
{
    if run_state == RunState::Run
    {
        return Bucket::Running;
    }
    if run_state.is_waiting()
    {
        if wait_state.is_idle()
        {
            return Bucket::WaitingIdle;
        }
        let disables = match wait_state.kind()
        {
            Some(kind) => kind.disables_co_deschedule(),
            None => false
        };
        return Bucket::Waiting { disables_co_deschedule: disables };
    }
    Bucket::Other
}

pub struct Vsmp
{
    /* identity and membership */
    pub leader: WorldID,
    pub vcpus: Vec<Vcpu>,

    /* allocation: the external request and the derived base shares */
    pub alloc: Alloc,
    pub base: BaseAlloc,

    /* virtual clocks: entitled and opportunistic progress, plus the
       max-enforcement clock which advances at the stride of the cap */
    pub vtime: VtimeContext,
    pub vtime_limit: Vtime,
    pub stride_limit: i64,

    /* co-scheduling */
    pub corun: CoRunState,
    pub strict_cosched: bool,

    /* aggregate counters maintained by the state mutators:
       nrun   = vCPUs in RUN
       nwait  = vCPUs waiting on a non-idle event
       nidle  = vCPUs waiting in the guest's idle loop
       disable_co_deschedule = waiters whose wait kind pins the VM on CPU */
    pub nrun: u32,
    pub nwait: u32,
    pub nidle: u32,
    pub disable_co_deschedule: u32,

    /* hyperthreading policy */
    pub ht_sharing: HtSharing,
    pub ht_quarantine: bool,

    /* true while every vCPU carries an identical affinity mask */
    pub joint_affinity: bool,

    /* which group this VM sits under, and which cell owns it */
    pub group: GroupID,
    pub cell: CellID,

    /* the running quantum: cell time at which it expires */
    pub quantum_expire: u64,

    /* overshoot recorded when the entitled clock is clamped to the
       cell's horizon */
    pub bonus_cycles: i64,

    /* console-world privilege: never migrated, periodically warped */
    pub console: bool,

    /* run/ready sampling for load reporting */
    pub load_history: LoadHistory
}

impl Vsmp
{
    /* build a VSMP and its virtual CPUs
       => leader = leader world id; vCPU worlds are leader, leader+1, ...
          nvcpus = number of virtual CPUs
          affinity = initial affinity applied to every vCPU
          group = enclosing allocation group
          path = root-to-group path for extra-time comparisons
          cell = owning cell
          npcpus = machine width, for per-vCPU run-time arrays
          now = current cell time
          infos = shared per-world side objects, one per vCPU */
    pub fn new(leader: WorldID, nvcpus: usize, affinity: PcpuMask, alloc: Alloc,
               group: GroupID, path: GroupPath, cell: CellID,
               npcpus: usize, now: u64, infos: Vec<Arc<WorldInfo>>) -> Vsmp
    {
        let base = BaseAlloc::zero();
        let stride = vtime::stride_for_shares(base.shares);

        let mut vcpus = Vec::with_capacity(nvcpus);
        for idx in 0..nvcpus
        {
            vcpus.push(Vcpu::new(leader + idx, leader, idx, affinity, npcpus, now,
                                 infos[idx].clone()));
        }

        Vsmp
        {
            leader,
            vcpus,
            alloc,
            base,
            vtime: VtimeContext::new(stride, stride, path),
            vtime_limit: 0,
            stride_limit: stride,
            corun: if nvcpus > 1 { CoRunState::CoReady } else { CoRunState::CoNone },
            strict_cosched: false,
            nrun: 0,
            nwait: 0,
            nidle: 0,
            disable_co_deschedule: 0,
            ht_sharing: HtSharing::Any,
            ht_quarantine: false,
            joint_affinity: true,
            group,
            cell,
            quantum_expire: 0,
            bonus_cycles: 0,
            console: false,
            load_history: LoadHistory::new()
        }
    }

    pub fn nvcpus(&self) -> usize
    {
        self.vcpus.len()
    }

    pub fn is_mp(&self) -> bool
    {
        self.vcpus.len() > 1
    }

    /* a VSMP may be co-descheduled only while no waiter is stuck on a
       wait kind a running sibling might be needed to satisfy */
    pub fn descheduleable(&self) -> bool
    {
        self.disable_co_deschedule == 0
    }

    /* ---- the state mutators ---- */

    /* move a vCPU to a new run state, maintaining the aggregate
       counters, the meters and the VMM action-notify coupling.
       this and set_wait_state are the only places run/wait state changes
       <= cycles the vCPU spent in the state it left */
    pub fn set_run_state(&mut self, idx: usize, new: RunState, now: u64) -> u64
    {
        let vcpu = &mut self.vcpus[idx];
        let old = vcpu.run_state;
        if old == new
        {
            return 0;
        }

        let old_bucket = bucket_of(old, vcpu.wait_state);
        let new_bucket = bucket_of(new, vcpu.wait_state);

        let elapsed = vcpu.meters.transition(old, new, now);

        if old == RunState::Run
        {
            vcpu.run_cycles = vcpu.run_cycles + elapsed;
            vcpu.uncharged_cycles = vcpu.uncharged_cycles + elapsed;
            let pcpu = vcpu.pcpu;
            if pcpu < vcpu.pcpu_run_time.len()
            {
                vcpu.pcpu_run_time[pcpu] = vcpu.pcpu_run_time[pcpu] + elapsed;
            }
        }

        /* a VMM polling in busy-wait doesn't want action wakeup IPIs;
           anything leaving busy-wait does again */
        if vcpu.info.vmm
        {
            if new == RunState::BusyWait
            {
                vcpu.info.set_action_notify(false);
            }
            else if old == RunState::BusyWait
            {
                vcpu.info.set_action_notify(true);
            }
        }

        vcpu.run_state = new;
        self.apply_bucket_delta(old_bucket, new_bucket);
        elapsed
    }

    /* bank a still-running vCPU's cycles so far, so charges can be
       taken mid-run without a state change
       <= cycles banked */
    pub fn accrue_running(&mut self, idx: usize, now: u64) -> u64
    {
        let vcpu = &mut self.vcpus[idx];
        if vcpu.run_state != RunState::Run
        {
            return 0;
        }

        let elapsed = vcpu.meters.transition(RunState::Run, RunState::Run, now);
        vcpu.run_cycles = vcpu.run_cycles + elapsed;
        vcpu.uncharged_cycles = vcpu.uncharged_cycles + elapsed;
        let pcpu = vcpu.pcpu;
        if pcpu < vcpu.pcpu_run_time.len()
        {
            vcpu.pcpu_run_time[pcpu] = vcpu.pcpu_run_time[pcpu] + elapsed;
        }
        elapsed
    }

    /* change a vCPU's wait descriptor. while the vCPU is in a waiting
       run state this re-buckets it (idle against non-idle, and the
       co-deschedule pin) without touching the run state */
    pub fn set_wait_state(&mut self, idx: usize, new: WaitState)
    {
        let vcpu = &mut self.vcpus[idx];
        let old_bucket = bucket_of(vcpu.run_state, vcpu.wait_state);
        vcpu.wait_state = new;
        let new_bucket = bucket_of(vcpu.run_state, new);
        self.apply_bucket_delta(old_bucket, new_bucket);
    }

    fn apply_bucket_delta(&mut self, old: Bucket, new: Bucket)
    {
        if old == new
        {
            return;
        }

        match old
        {
            Bucket::Running => self.nrun = self.nrun - 1,
            Bucket::WaitingIdle => self.nidle = self.nidle - 1,
            Bucket::Waiting { disables_co_deschedule } =>
            {
                self.nwait = self.nwait - 1;
                if disables_co_deschedule
                {
                    self.disable_co_deschedule = self.disable_co_deschedule - 1;
                }
            },
            Bucket::Other => ()
        }

        match new
        {
            Bucket::Running => self.nrun = self.nrun + 1,
            Bucket::WaitingIdle => self.nidle = self.nidle + 1,
            Bucket::Waiting { disables_co_deschedule } =>
            {
                self.nwait = self.nwait + 1;
                if disables_co_deschedule
                {
                    self.disable_co_deschedule = self.disable_co_deschedule + 1;
                }
            },
            Bucket::Other => ()
        }
    }

    /* ---- the co-run state machine ---- */

    /* release held-back vCPUs to plain ready so they can be queued again */
    fn release_costopped(&mut self)
    {
        for vcpu in self.vcpus.iter_mut()
        {
            if vcpu.run_state == RunState::ReadyCostop
            {
                vcpu.run_state = RunState::Ready;
            }
        }
    }

    /* a co-stopped VSMP is released once no non-idle waiter remains.
       called after a waiter wakes: back to CoRun if something is still
       running or idling, or all the way to CoReady when every vCPU is
       queued again.
       <= true if the VSMP left CoStop and its vCPUs should be requeued */
    pub fn corun_note_wakeup(&mut self) -> bool
    {
        if self.corun != CoRunState::CoStop || self.nwait != 0
        {
            return false;
        }

        if self.nrun + self.nidle > 0
        {
            self.corun = CoRunState::CoRun;
        }
        else
        {
            self.corun = CoRunState::CoReady;
        }
        self.release_costopped();
        true
    }

    /* called when a runner leaves the CPU while the VSMP is co-stopped:
       once the last one drains and no non-idle waiter remains, the VM
       has regrouped and may start over.
       <= true if the VSMP left CoStop and its vCPUs should be requeued */
    pub fn corun_note_deschedule(&mut self) -> bool
    {
        if self.corun != CoRunState::CoStop || self.nwait != 0 || self.nrun != 0
        {
            return false;
        }

        if self.nidle > 0
        {
            self.corun = CoRunState::CoRun;
        }
        else
        {
            self.corun = CoRunState::CoReady;
        }
        self.release_costopped();
        true
    }

    /* the first dispatch of any vCPU moves a ready SMP VM to co-running */
    pub fn corun_dispatched(&mut self)
    {
        if self.corun == CoRunState::CoReady
        {
            self.corun = CoRunState::CoRun;
        }
    }

    /* enter co-stop: the skew detector decided this VM must regroup.
       runnable vCPUs are parked in ReadyCostop until the waiters clear */
    pub fn corun_stop(&mut self, now: u64)
    {
        if self.corun != CoRunState::CoRun
        {
            return;
        }
        self.corun = CoRunState::CoStop;

        for idx in 0..self.vcpus.len()
        {
            if self.vcpus[idx].run_state == RunState::Ready
            {
                self.set_run_state(idx, RunState::ReadyCostop, now);
            }
        }
    }

    /* ---- virtual time ---- */

    /* how far ahead of the cell's global clock this VM's entitled time is */
    pub fn vtime_ahead(&self, cell_vtime: Vtime) -> Vtime
    {
        self.vtime.main - cell_vtime
    }

    /* true while the cap clock says the VM has used up its maximum */
    pub fn max_limited(&self, cell_vtime: Vtime) -> bool
    {
        if self.base.max == MAX_NONE
        {
            return false;
        }
        self.vtime_limit > cell_vtime
    }

    /* apply a freshly computed base allocation: recompute strides, and
       rescale the clocks so the VM's distance from the global clock is
       preserved in real-cycle terms across the stride change.
       <= true if the stride changed, in which case ready vCPUs must be requeued */
    pub fn set_base_alloc(&mut self, base: BaseAlloc) -> bool
    {
        let old_stride = self.vtime.stride;
        self.base = base;

        let new_stride = vtime::stride_for_shares(base.shares);
        let new_stride_limit = if base.max == MAX_NONE
        {
            new_stride
        }
        else
        {
            vtime::stride_for_shares(base.max)
        };

        if new_stride == old_stride
        {
            self.stride_limit = new_stride_limit;
            return false;
        }

        self.vtime.main = vtime::vtime_scale(self.vtime.main, new_stride as u64, old_stride as u64);
        self.vtime.extra = vtime::vtime_scale(self.vtime.extra, new_stride as u64, old_stride as u64);
        self.vtime_limit = vtime::vtime_scale(self.vtime_limit, new_stride_limit as u64, self.stride_limit as u64);
        self.vtime.stride = new_stride;
        self.stride_limit = new_stride_limit;
        true
    }

    /* recompute whether all vCPUs share one affinity mask */
    pub fn update_joint_affinity(&mut self)
    {
        let mut joint = true;
        if let Some(first) = self.vcpus.first()
        {
            let mask = first.affinity;
            for vcpu in self.vcpus.iter()
            {
                if vcpu.affinity != mask
                {
                    joint = false;
                    break;
                }
            }
        }
        self.joint_affinity = joint;
    }

    /* union of every vCPU's affinity: the CPUs this VM can touch at all */
    pub fn affinity_union(&self) -> PcpuMask
    {
        let mut mask = PcpuMask::EMPTY;
        for vcpu in self.vcpus.iter()
        {
            mask = mask.union(vcpu.affinity);
        }
        mask
    }

    /* which physical CPUs currently run this VM's vCPUs */
    pub fn running_pcpus(&self) -> PcpuMask
    {
        let mut mask = PcpuMask::EMPTY;
        for vcpu in self.vcpus.iter()
        {
            if vcpu.run_state == RunState::Run
            {
                mask.set(vcpu.pcpu);
            }
        }
        mask
    }

    /* proc-style one-line snapshot of this VM's scheduling state */
    pub fn render(&self) -> String
    {
        format!("vm{:<6} cell{:<4} {:<8} {}/{}/{}   main={:<16} extra={:<16} stride={:<8} base={:<6} group={}\n",
                self.leader,
                self.cell,
                format!("{:?}", self.corun),
                self.nrun, self.nwait, self.nidle,
                self.vtime.main,
                self.vtime.extra,
                self.vtime.stride,
                self.base.shares,
                self.group)
    }

    /* verify the counters against an explicit re-scan of the vCPU array.
       debug builds panic on drift; release builds report it */
    pub fn check_counters(&self) -> bool
    {
        let mut nrun = 0;
        let mut nwait = 0;
        let mut nidle = 0;
        let mut disable = 0;

        for vcpu in self.vcpus.iter()
        {
            match bucket_of(vcpu.run_state, vcpu.wait_state)
            {
                Bucket::Running => nrun = nrun + 1,
                Bucket::WaitingIdle => nidle = nidle + 1,
                Bucket::Waiting { disables_co_deschedule } =>
                {
                    nwait = nwait + 1;
                    if disables_co_deschedule
                    {
                        disable = disable + 1;
                    }
                },
                Bucket::Other => ()
            }
        }

        let ok = nrun == self.nrun && nwait == self.nwait
              && nidle == self.nidle && disable == self.disable_co_deschedule;
        if ok == false
        {
            hvalert!("VSMP {} counters drifted: have {}/{}/{}/{} expect {}/{}/{}/{}",
                     self.leader, self.nrun, self.nwait, self.nidle, self.disable_co_deschedule,
                     nrun, nwait, nidle, disable);
            debug_assert!(false, "VSMP counter drift");
        }
        ok
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::groups::{group_path_root, Alloc};
    use crate::vcpu::{EventID, WaitKind};

    fn make_vsmp(nvcpus: usize) -> Vsmp
    {
        let mut infos = Vec::new();
        for idx in 0..nvcpus
        {
            infos.push(WorldInfo::new(100 + idx, "test", true));
        }
        Vsmp::new(100, nvcpus, PcpuMask::first_n(4), Alloc::shares_only(1000),
                  0, group_path_root(), 0, 4, 0, infos)
    }

    fn wait_on(vsmp: &mut Vsmp, idx: usize, kind: WaitKind, now: u64)
    {
        vsmp.set_wait_state(idx, WaitState::Waiting { event: 0x100 as EventID, kind });
        vsmp.set_run_state(idx, RunState::Wait, now);
    }

    #[test]
    fn counters_track_transitions()
    {
        let mut vsmp = make_vsmp(2);
        vsmp.set_run_state(0, RunState::Ready, 10);
        vsmp.set_run_state(1, RunState::Ready, 10);
        assert_eq!((vsmp.nrun, vsmp.nwait, vsmp.nidle), (0, 0, 0));

        vsmp.set_run_state(0, RunState::Run, 20);
        assert_eq!(vsmp.nrun, 1);

        wait_on(&mut vsmp, 1, WaitKind::Idle, 20);
        assert_eq!((vsmp.nrun, vsmp.nwait, vsmp.nidle), (1, 0, 1));

        vsmp.set_run_state(0, RunState::Ready, 40);
        wait_on(&mut vsmp, 0, WaitKind::Sema, 50);
        assert_eq!((vsmp.nrun, vsmp.nwait, vsmp.nidle), (0, 1, 1));
        assert_eq!(vsmp.disable_co_deschedule, 1);
        assert!(!vsmp.descheduleable());

        assert!(vsmp.check_counters());
    }

    #[test]
    fn leaving_wait_clears_descriptor_effects()
    {
        let mut vsmp = make_vsmp(1);
        vsmp.set_run_state(0, RunState::Ready, 0);
        vsmp.set_run_state(0, RunState::Run, 1);
        wait_on(&mut vsmp, 0, WaitKind::Lock, 2);
        assert_eq!(vsmp.disable_co_deschedule, 1);

        vsmp.set_run_state(0, RunState::Ready, 3);
        vsmp.set_wait_state(0, WaitState::None);
        assert_eq!(vsmp.disable_co_deschedule, 0);
        assert_eq!(vsmp.nwait, 0);
        assert!(vsmp.check_counters());
    }

    #[test]
    fn wait_to_busy_wait_keeps_event()
    {
        let mut vsmp = make_vsmp(1);
        vsmp.set_run_state(0, RunState::Ready, 0);
        vsmp.set_run_state(0, RunState::Run, 1);
        wait_on(&mut vsmp, 0, WaitKind::Request, 2);

        /* converting to busy-wait keeps the same event and the counters */
        vsmp.set_run_state(0, RunState::BusyWait, 3);
        assert_eq!(vsmp.nwait, 1);
        assert_eq!(vsmp.vcpus[0].wait_state.event(), Some(0x100));

        /* a VMM polling in busy-wait has action notifications off */
        assert!(!vsmp.vcpus[0].info.action_notify());
        vsmp.set_run_state(0, RunState::Ready, 4);
        assert!(vsmp.vcpus[0].info.action_notify());
    }

    #[test]
    fn uniprocessor_never_coscheduled()
    {
        let vsmp = make_vsmp(1);
        assert_eq!(vsmp.corun, CoRunState::CoNone);
    }

    #[test]
    fn corun_lifecycle()
    {
        let mut vsmp = make_vsmp(2);
        assert_eq!(vsmp.corun, CoRunState::CoReady);

        vsmp.set_run_state(0, RunState::Ready, 0);
        vsmp.set_run_state(1, RunState::Ready, 0);
        vsmp.set_run_state(0, RunState::Run, 10);
        vsmp.corun_dispatched();
        assert_eq!(vsmp.corun, CoRunState::CoRun);

        /* sibling 1 blocks on a non-idle event; the skew detector fires */
        wait_on(&mut vsmp, 1, WaitKind::Request, 20);
        vsmp.set_run_state(0, RunState::Ready, 30);
        vsmp.corun_stop(30);
        assert_eq!(vsmp.corun, CoRunState::CoStop);
        assert_eq!(vsmp.vcpus[0].run_state, RunState::ReadyCostop);

        /* the waiter wakes: no non-idle waiters remain and nothing runs,
           so the VM drops back to CoReady with its vCPUs plain ready */
        vsmp.set_run_state(1, RunState::Ready, 40);
        vsmp.set_wait_state(1, WaitState::None);
        assert!(vsmp.corun_note_wakeup());
        assert_eq!(vsmp.corun, CoRunState::CoReady);
        assert_eq!(vsmp.vcpus[0].run_state, RunState::Ready);
        assert!(vsmp.check_counters());
    }

    #[test]
    fn costop_releases_when_runners_drain()
    {
        let mut vsmp = make_vsmp(2);
        vsmp.set_run_state(0, RunState::Ready, 0);
        vsmp.set_run_state(1, RunState::Ready, 0);
        vsmp.set_run_state(0, RunState::Run, 1);
        vsmp.corun_dispatched();

        /* skewed out with no waiters: vCPU 1 is parked, vCPU 0 still on CPU */
        vsmp.corun_stop(5);
        assert_eq!(vsmp.corun, CoRunState::CoStop);
        assert_eq!(vsmp.vcpus[1].run_state, RunState::ReadyCostop);
        assert!(!vsmp.corun_note_deschedule());

        /* the runner drains: the whole VM has regrouped and is ready again */
        vsmp.set_run_state(0, RunState::ReadyCostop, 10);
        assert!(vsmp.corun_note_deschedule());
        assert_eq!(vsmp.corun, CoRunState::CoReady);
        assert_eq!(vsmp.vcpus[0].run_state, RunState::Ready);
        assert_eq!(vsmp.vcpus[1].run_state, RunState::Ready);
    }

    #[test]
    fn costop_with_idle_vcpu_returns_to_corun()
    {
        let mut vsmp = make_vsmp(2);
        vsmp.set_run_state(0, RunState::Ready, 0);
        vsmp.set_run_state(1, RunState::Ready, 0);
        vsmp.set_run_state(0, RunState::Run, 1);
        vsmp.corun_dispatched();

        /* one vCPU idles: idle waiters don't hold a co-stop */
        wait_on(&mut vsmp, 1, WaitKind::Idle, 5);
        vsmp.corun_stop(6);
        assert_eq!(vsmp.corun, CoRunState::CoStop);

        /* the runner drains; the idle vCPU keeps the VM in CoRun */
        vsmp.set_run_state(0, RunState::ReadyCostop, 10);
        assert!(vsmp.corun_note_deschedule());
        assert_eq!(vsmp.corun, CoRunState::CoRun);
    }

    #[test]
    fn ahead_and_limit_clocks()
    {
        let mut vsmp = make_vsmp(1);
        vsmp.vtime.main = 1000;
        assert_eq!(vsmp.vtime_ahead(400), 600);
        assert_eq!(vsmp.vtime_ahead(1500), -500);

        /* no max: never limited */
        assert!(!vsmp.max_limited(0));

        vsmp.base.max = 50;
        vsmp.vtime_limit = 900;
        assert!(vsmp.max_limited(800));
        assert!(!vsmp.max_limited(1000));
    }

    #[test]
    fn base_alloc_rescales_clocks()
    {
        let mut vsmp = make_vsmp(1);
        vsmp.set_base_alloc(BaseAlloc { min: 0, max: MAX_NONE, shares: 100 });
        vsmp.vtime.main = 1 << 20;
        let old_stride = vsmp.vtime.stride;

        /* doubling the shares halves the stride and the clocks */
        let changed = vsmp.set_base_alloc(BaseAlloc { min: 0, max: MAX_NONE, shares: 200 });
        assert!(changed);
        assert_eq!(vsmp.vtime.stride, old_stride / 2);
        assert_eq!(vsmp.vtime.main, 1 << 19);

        /* same shares again: no requeue needed */
        assert!(!vsmp.set_base_alloc(BaseAlloc { min: 0, max: MAX_NONE, shares: 200 }));
    }

    #[test]
    fn render_reports_scheduling_state()
    {
        let mut vsmp = make_vsmp(2);
        vsmp.set_run_state(0, RunState::Ready, 0);
        vsmp.set_run_state(1, RunState::Ready, 0);
        vsmp.set_run_state(0, RunState::Run, 1);
        vsmp.vtime.main = 4242;

        let text = vsmp.render();
        assert!(text.contains("vm100"), "no leader in: {}", text);
        assert!(text.contains("CoReady"), "no co-run state in: {}", text);
        assert!(text.contains("1/0/0"), "no counters in: {}", text);
        assert!(text.contains("main=4242"), "no clock in: {}", text);
    }

    #[test]
    fn affinity_union_and_joint()
    {
        let mut vsmp = make_vsmp(2);
        assert!(vsmp.joint_affinity);

        vsmp.vcpus[0].affinity = PcpuMask::single(0);
        vsmp.vcpus[1].affinity = PcpuMask::single(1);
        vsmp.update_joint_affinity();
        assert!(!vsmp.joint_affinity);
        assert_eq!(vsmp.affinity_union(), PcpuMask::first_n(2));
    }
}

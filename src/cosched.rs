/* fairsched co-scheduling: skew detection and placement
 *
 * The virtual CPUs of an SMP guest must make progress together or
 * its kernel will spin on locks held by descheduled siblings. A
 * periodic per-CPU sampler charges skew points to vCPUs that should
 * be running alongside the current one but aren't; once a VM skews
 * out it is co-descheduled (CoStop) and only restarted when the
 * whole VM can regroup. Before dispatching an SMP vCPU, the
 * dispatcher checks the rest of the VM can actually be placed in
 * the cell.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use alloc::vec::Vec;
use super::config::SchedConfig;
use super::platform::{PcpuID, PcpuMask};
use super::cell::CellState;
use super::vcpu::RunState;
use super::vsmp::{CoRunState, Vsmp};

/* skew points charged and recovered per sample */
const SKEW_GAIN_HT: u32 = 2;
const SKEW_GAIN: u32 = 1;
const SKEW_GAIN_MIXED_PACKAGE: u32 = 1;
const SKEW_DECAY: u32 = 2;

/* what one skew sample concluded */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkewVerdict
{
    pub skewed_out: bool,
    pub deschedule: bool,

    /* CPUs running vCPUs of the skewed VM, to be marked for reschedule */
    pub mark: Vec<PcpuID>
}

impl SkewVerdict
{
    fn none() -> SkewVerdict
    {
        SkewVerdict { skewed_out: false, deschedule: false, mark: Vec::new() }
    }
}

/* true if the VM holds its packages unevenly: some vCPUs paired up on
   whole packages while others sit alone on halves. only meaningful
   with hyperthreading */
fn mixed_packages(vsmp: &Vsmp, state: &CellState) -> bool
{
    let mut whole = false;
    let mut half = false;

    for vcpu in vsmp.vcpus.iter()
    {
        if vcpu.run_state != RunState::Run
        {
            continue;
        }
        let partner_same = match state.pcpu(vcpu.pcpu).and_then(|shadow| shadow.partner)
        {
            Some(partner) => match state.pcpu(partner).and_then(|shadow| shadow.running)
            {
                Some(entry) => entry.vsmp == vsmp.leader,
                None => false
            },
            None => false
        };
        if partner_same
        {
            whole = true;
        }
        else
        {
            half = true;
        }
    }

    whole && half
}

/* run one skew sample against the VM currently on the given CPU.
   charges and decays intra-skew, decides whether the VM has skewed
   out, and if it is descheduleable returns the CPUs to kick. the
   caller transitions the VM to CoStop from its dispatch path
   => prev_running = whether the sampled CPU's vCPU was found in RUN;
      a vCPU sampled mid-switch charges no skew */
pub fn skew_sample(state: &mut CellState, pcpu: PcpuID, config: &SchedConfig,
                   ht: bool, prev_running: bool) -> SkewVerdict
{
    let entry = match state.pcpu(pcpu).and_then(|shadow| shadow.running)
    {
        Some(entry) => entry,
        None => return SkewVerdict::none()
    };

    if prev_running == false
    {
        return SkewVerdict::none();
    }

    let strict = config.relaxed_cosched == false;
    let mixed = ht && match state.vsmp(entry.vsmp)
    {
        Some(vsmp) => vsmp.is_mp() && mixed_packages(vsmp, state),
        None => false
    };

    let vsmp = match state.vsmp_mut(entry.vsmp)
    {
        Some(vsmp) => vsmp,
        None => return SkewVerdict::none()
    };

    if vsmp.is_mp() == false || vsmp.corun != CoRunState::CoRun
    {
        return SkewVerdict::none();
    }

    /* charge skew to lagging vCPUs, pay it back on running/idle ones */
    let gain = if ht { SKEW_GAIN_HT } else { SKEW_GAIN };
    for vcpu in vsmp.vcpus.iter_mut()
    {
        if vcpu.run_state == RunState::Run || vcpu.wait_state.is_idle()
        {
            vcpu.decay_skew(SKEW_DECAY);
            continue;
        }
        if vcpu.needs_cosched(strict, config.intraskew_threshold)
        {
            vcpu.add_skew(gain);
        }
        else if mixed
        {
            vcpu.add_skew(SKEW_GAIN_MIXED_PACKAGE);
        }
    }

    /* has the VM skewed out? */
    let skewed_out = if strict
    {
        let total: u64 = vsmp.vcpus.iter().map(|v| v.intra_skew as u64).sum();
        total > config.skew_sample_threshold as u64
    }
    else
    {
        let lagging = vsmp.vcpus.iter()
            .any(|v| v.needs_cosched(strict, config.intraskew_threshold));
        lagging || mixed
    };

    if skewed_out == false
    {
        return SkewVerdict::none();
    }

    let deschedule = vsmp.descheduleable();
    let mark = if deschedule
    {
        vsmp.running_pcpus().iter().collect()
    }
    else
    {
        Vec::new()
    };

    SkewVerdict { skewed_out, deschedule, mark }
}

/* the siblings that must run alongside a candidate vCPU before it may
   be dispatched: non-idle, not already on a CPU, and either under
   strict co-scheduling or past the intra-skew threshold */
pub fn must_cosched_set(vsmp: &Vsmp, candidate_idx: usize, config: &SchedConfig) -> Vec<usize>
{
    if vsmp.is_mp() == false
    {
        return Vec::new();
    }

    let strict = config.relaxed_cosched == false || vsmp.strict_cosched;
    let mut set = Vec::new();
    for (idx, vcpu) in vsmp.vcpus.iter().enumerate()
    {
        if idx == candidate_idx
        {
            continue;
        }
        if vcpu.needs_cosched(strict, config.intraskew_threshold)
        {
            set.push(idx);
        }
    }
    set
}

/* can every mandatory sibling be placed somewhere in this cell, given
   the candidate occupies target_pcpu? each sibling may stay on its
   current CPU or migrate to any CPU its affinity permits; no CPU slot
   is used twice. identical affinities take a counting fast path,
   disjoint masks are matched greedily
   => placeable = CPUs in this cell a sibling could occupy at all */
pub fn can_coschedule(vsmp: &Vsmp, candidate_idx: usize, target_pcpu: PcpuID,
                      placeable: PcpuMask, config: &SchedConfig) -> bool
{
    let siblings = must_cosched_set(vsmp, candidate_idx, config);
    if siblings.is_empty()
    {
        return true;
    }

    let mut taken = PcpuMask::single(target_pcpu);

    if vsmp.joint_affinity
    {
        /* all masks identical: enough free slots is enough */
        let shared = vsmp.vcpus[candidate_idx].affinity.intersect(placeable);
        let free = shared.count() - shared.intersect(taken).count();
        return free >= siblings.len();
    }

    /* disjoint masks: prefer each sibling's current CPU, then greedily
       take the first permitted free slot */
    for idx in siblings.iter()
    {
        let vcpu = &vsmp.vcpus[*idx];
        let allowed = vcpu.affinity.intersect(placeable);

        let current = vcpu.pcpu;
        if allowed.contains(current) && taken.contains(current) == false
        {
            taken.set(current);
            continue;
        }

        let mut placed = false;
        for pcpu in allowed.iter()
        {
            if taken.contains(pcpu) == false
            {
                taken.set(pcpu);
                placed = true;
                break;
            }
        }
        if placed == false
        {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests
{
    use super::*;
    use alloc::vec::Vec;
    use crate::groups::{group_path_root, Alloc};
    use crate::platform::PcpuMask;
    use crate::vcpu::{WaitKind, WaitState};
    use crate::world::WorldInfo;

    fn make_vsmp(nvcpus: usize, affinity: PcpuMask) -> Vsmp
    {
        let mut infos = Vec::new();
        for idx in 0..nvcpus
        {
            infos.push(WorldInfo::new(100 + idx, "test", true));
        }
        Vsmp::new(100, nvcpus, affinity, Alloc::shares_only(1000),
                  0, group_path_root(), 0, 8, 0, infos)
    }

    #[test]
    fn no_siblings_needed_for_uniprocessor()
    {
        let vsmp = make_vsmp(1, PcpuMask::first_n(4));
        let config = SchedConfig::default();
        assert!(must_cosched_set(&vsmp, 0, &config).is_empty());
    }

    #[test]
    fn strict_mode_demands_all_nonidle_siblings()
    {
        let mut vsmp = make_vsmp(4, PcpuMask::first_n(4));
        let mut config = SchedConfig::default();
        config.relaxed_cosched = false;

        vsmp.set_run_state(0, RunState::Ready, 0);
        vsmp.set_run_state(1, RunState::Ready, 0);
        vsmp.set_run_state(2, RunState::Ready, 0);
        vsmp.set_run_state(3, RunState::Ready, 0);

        /* one sibling idles: it drops out of the mandatory set */
        vsmp.set_wait_state(3, WaitState::Waiting { event: 1, kind: WaitKind::Idle });
        vsmp.set_run_state(3, RunState::Wait, 1);

        assert_eq!(must_cosched_set(&vsmp, 0, &config), alloc::vec![1, 2]);
    }

    #[test]
    fn relaxed_mode_waits_for_skew()
    {
        let mut vsmp = make_vsmp(2, PcpuMask::first_n(4));
        let config = SchedConfig::default();
        vsmp.set_run_state(0, RunState::Ready, 0);
        vsmp.set_run_state(1, RunState::Ready, 0);

        assert!(must_cosched_set(&vsmp, 0, &config).is_empty());

        /* once a sibling's intra-skew passes the threshold it must co-run */
        vsmp.vcpus[1].intra_skew = config.intraskew_threshold + 1;
        assert_eq!(must_cosched_set(&vsmp, 0, &config), alloc::vec![1]);
    }

    #[test]
    fn joint_affinity_counting_path()
    {
        let mut vsmp = make_vsmp(2, PcpuMask::first_n(2));
        let mut config = SchedConfig::default();
        config.relaxed_cosched = false;
        vsmp.set_run_state(0, RunState::Ready, 0);
        vsmp.set_run_state(1, RunState::Ready, 0);

        /* two CPUs for two vCPUs: fits */
        assert!(can_coschedule(&vsmp, 0, 0, PcpuMask::first_n(2), &config));

        /* only one CPU placeable: the sibling has nowhere to go */
        assert!(!can_coschedule(&vsmp, 0, 0, PcpuMask::single(0), &config));
    }

    #[test]
    fn disjoint_affinity_greedy_match()
    {
        let mut vsmp = make_vsmp(3, PcpuMask::first_n(4));
        let mut config = SchedConfig::default();
        config.relaxed_cosched = false;

        for idx in 0..3
        {
            vsmp.set_run_state(idx, RunState::Ready, 0);
        }

        /* vCPU 1 can only use CPU 1, vCPU 2 can use 1 or 2 */
        vsmp.vcpus[1].affinity = PcpuMask::single(1);
        vsmp.vcpus[2].affinity = PcpuMask::single(1).union(PcpuMask::single(2));
        vsmp.update_joint_affinity();
        assert!(!vsmp.joint_affinity);

        /* candidate 0 on CPU 0: 1 -> 1, 2 -> 2 works */
        assert!(can_coschedule(&vsmp, 0, 0, PcpuMask::first_n(3), &config));

        /* candidate 0 stealing CPU 1 starves vCPU 1 */
        assert!(!can_coschedule(&vsmp, 0, 1, PcpuMask::first_n(3), &config));
    }
}

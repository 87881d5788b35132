/* fairsched hyperthreading policy
 *
 * Logical CPUs of one package share execution resources, so a
 * vCPU's charge and its right to a package are policy questions:
 * the sharing constraint says who may occupy the partner thread, the
 * quarantine demotes VMs whose machine-clear storms hurt whatever
 * shares their package, and the charge adjustment prices in the
 * roughly doubled throughput a thread gets while its partner halts.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use super::config::SchedConfig;
use super::vsmp::{HtSharing, Vsmp, VsmpID};

/* resolve the sharing constraint actually enforced for a VM: the most
   restrictive of what's configured and the quarantine override, but
   never stricter than the VM's affinity can honor - a VM that cannot
   claim one whole package per vCPU has no business demanding them
   => affinity_allows_whole = the VM's affinity covers at least one
      whole package per vCPU in every cell it can touch */
pub fn effective_sharing(vsmp: &Vsmp, affinity_allows_whole: bool) -> HtSharing
{
    let mut effective = vsmp.ht_sharing;

    if vsmp.ht_quarantine
    {
        effective = HtSharing::None;
    }

    if effective == HtSharing::None && affinity_allows_whole == false
    {
        effective = HtSharing::Internally;
    }

    effective
}

/* may a vCPU of `candidate` run on a CPU whose hyperthread partner is
   currently occupied as described?
   => partner_running = the VSMP occupying the partner thread, or None
      if the partner idles */
pub fn sharing_permits(effective: HtSharing, candidate: VsmpID,
                       partner_running: Option<VsmpID>) -> bool
{
    match partner_running
    {
        None => true,
        Some(other) => match effective
        {
            HtSharing::None => false,
            HtSharing::Internally => other == candidate,
            HtSharing::Any => true
        }
    }
}

/* quarantine tracking: exponential moving averages of the machine
   clear rate, sampled per vCPU every HT_EVENT_PERIOD of used time.
   rates are events per million used cycles. the slow average factor
   is 19/20, the fast 2/3: the fast one catches a storm inside a few
   periods, the slow one keeps a noisy VM from flapping out again */
pub fn quarantine_sample(vcpu: &mut super::vcpu::Vcpu, mc_count: u64, used_cycles: u64)
{
    let delta = mc_count.saturating_sub(vcpu.mc_last_count);
    vcpu.mc_last_count = mc_count;

    if used_cycles == 0
    {
        return;
    }

    let rate = delta.saturating_mul(1000000) / used_cycles;
    vcpu.mc_ema_slow = (vcpu.mc_ema_slow * 19 + rate) / 20;
    vcpu.mc_ema_fast = (vcpu.mc_ema_fast * 2 + rate) / 3;
}

/* decide a VM's quarantine flag from its vCPUs' averages: any vCPU
   over the threshold on either average quarantines the whole VM; it
   is released only when every vCPU is below on both.
   <= Some(new flag) if the flag changed, None otherwise */
pub fn quarantine_update(vsmp: &mut Vsmp, config: &SchedConfig) -> Option<bool>
{
    if config.machine_clear_thresh == 0
    {
        /* quarantine disabled */
        if vsmp.ht_quarantine
        {
            vsmp.ht_quarantine = false;
            return Some(false);
        }
        return None;
    }

    let threshold = config.machine_clear_thresh as u64;
    let mut any_over = false;
    let mut all_under = true;

    for vcpu in vsmp.vcpus.iter()
    {
        if vcpu.mc_ema_slow > threshold || vcpu.mc_ema_fast > threshold
        {
            any_over = true;
        }
        if vcpu.mc_ema_slow >= threshold || vcpu.mc_ema_fast >= threshold
        {
            all_under = false;
        }
    }

    if vsmp.ht_quarantine == false && any_over
    {
        vsmp.ht_quarantine = true;
        return Some(true);
    }
    if vsmp.ht_quarantine && all_under
    {
        vsmp.ht_quarantine = false;
        return Some(false);
    }
    None
}

/* price a vCPU's run interval for charging:
   - a partner thread halted for part of the interval means this one
     ran at roughly full-core speed, so the halted cycles are charged
     on top
   - system cycles attributed to the vCPU (interrupt handling on its
     behalf) are folded in, clipped to one quantum; overlap with the
     run interval itself is already paid for, so it offsets the charge
   <= cycles to charge the VSMP's clocks with */
pub fn adjusted_charge(run_cycles: u64, partner_halted: u64,
                       sys_cycles: u64, sys_overlap: u64, quantum_cycles: u64) -> u64
{
    let sys = core::cmp::min(sys_cycles, quantum_cycles);
    let sys = sys.saturating_sub(sys_overlap);
    run_cycles + partner_halted + sys
}

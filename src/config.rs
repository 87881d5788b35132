/* fairsched tunable configuration
 *
 * Everything the scheduler can be tuned with lives in one validated
 * structure, filled in by whatever configuration store the host has
 * and handed to the scheduler at boot. Periods are in host time
 * units here and converted to cycle counts once the timer frequency
 * is known.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use super::error::Cause;

/* when does making a remote virtual CPU runnable kick the remote physical CPU? */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReschedOpt
{
    Always,      /* IPI the remote physical CPU every time */
    Preemptible, /* IPI only if the remote runner can be preempted by the waker */
    Defer,       /* no IPI: picked up on the remote CPU's next timer tick */
    None         /* never interfere; rely on quantum expiry alone */
}

#[derive(Debug, Clone)]
pub struct SchedConfig
{
    /* quantum length in milliseconds */
    pub quantum_ms: u32,

    /* how often the credit-aging pass decays virtual-time lag, in milliseconds */
    pub credit_age_period_ms: u32,

    /* clamp an entity's virtual-time lag behind or ahead of the cell to
       this many quanta, halving the excess distance on each aging pass */
    pub bound_lag_quanta: u32,

    /* minimum gaps between migration kinds, in milliseconds. each is
       jittered by a small amount so the machine's CPUs don't thundering-herd
       their migration scans */
    pub pcpu_migrate_period_ms: u32,
    pub cell_migrate_period_ms: u32,
    pub runner_move_period_ms: u32,

    /* 1/N chance that an idle physical CPU scans remote queues even
       outside its migration window. 0 disables the override */
    pub migrate_chance: u32,

    /* co-scheduling skew sampler: sample period and the accumulated-points
       threshold at which a VSMP counts as skewed out */
    pub skew_sample_usec: u32,
    pub skew_sample_threshold: u32,

    /* per-vCPU intra-skew threshold beyond which a vCPU needs co-scheduling
       even in relaxed mode */
    pub intraskew_threshold: u32,

    /* false selects strict co-scheduling for every SMP VM */
    pub relaxed_cosched: bool,

    /* head start granted to whatever is already on the CPU, in
       milliseconds of cycles, so marginal wakeups don't thrash it off */
    pub preempt_bonus_ms: u32,

    /* remote reschedule policy */
    pub resched_opt: ReschedOpt,

    /* halt idle physical CPUs rather than spin, and the per-wakeup
       latency penalty (in milliseconds of vtime) charged when judging
       whether an idle CPU is worth waking */
    pub halting_idle: bool,
    pub halting_idle_ms_penalty: u32,

    /* allow a blocked world to convert its wait into an on-CPU poll
       when preemption is off and it cannot be switched away */
    pub busy_wait_allowed: bool,

    /* machine-clear events per million cycles beyond which a VSMP is
       quarantined away from sharing a package. 0 disables quarantine */
    pub machine_clear_thresh: u32,

    /* period of used time between machine-clear samples, in milliseconds */
    pub ht_event_period_ms: u32,

    /* console world privileges: how often it is warped ahead of global
       virtual time, and its guaranteed minimum in percent of a package */
    pub cos_warp_period_ms: u32,
    pub cos_min_cpu: u32,

    /* log2 of the virtual time value that triggers a global vtime reset */
    pub vtime_reset_lg: u32
}

impl Default for SchedConfig
{
    fn default() -> SchedConfig
    {
        SchedConfig
        {
            quantum_ms: 50,
            credit_age_period_ms: 3000,
            bound_lag_quanta: 8,
            pcpu_migrate_period_ms: 10,
            cell_migrate_period_ms: 100,
            runner_move_period_ms: 20,
            migrate_chance: 128,
            skew_sample_usec: 500,
            skew_sample_threshold: 6,
            intraskew_threshold: 8,
            relaxed_cosched: true,
            preempt_bonus_ms: 2,
            resched_opt: ReschedOpt::Preemptible,
            halting_idle: true,
            halting_idle_ms_penalty: 1,
            busy_wait_allowed: true,
            machine_clear_thresh: 0,
            ht_event_period_ms: 10,
            cos_warp_period_ms: 1000,
            cos_min_cpu: 8,
            vtime_reset_lg: 61
        }
    }
}

impl SchedConfig
{
    /* sanity check the configured values before the scheduler takes them.
       <= Ok, or ConfigBadValue naming nothing: the caller knows what it passed */
    pub fn validate(&self) -> Result<(), Cause>
    {
        if self.quantum_ms < 1 || self.quantum_ms > 1000
        {
            return Err(Cause::ConfigBadValue);
        }
        if self.credit_age_period_ms < 100 || self.credit_age_period_ms > 60000
        {
            return Err(Cause::ConfigBadValue);
        }
        if self.bound_lag_quanta < 1 || self.bound_lag_quanta > 100
        {
            return Err(Cause::ConfigBadValue);
        }
        if self.pcpu_migrate_period_ms == 0 || self.cell_migrate_period_ms == 0
            || self.runner_move_period_ms == 0
        {
            return Err(Cause::ConfigBadValue);
        }
        if self.skew_sample_usec < 100 || self.skew_sample_usec > 100000
        {
            return Err(Cause::ConfigBadValue);
        }
        if self.skew_sample_threshold == 0 || self.intraskew_threshold == 0
        {
            return Err(Cause::ConfigBadValue);
        }
        if self.ht_event_period_ms == 0
        {
            return Err(Cause::ConfigBadValue);
        }
        if self.cos_min_cpu > 100
        {
            return Err(Cause::ConfigBadValue);
        }

        /* the reset threshold must leave room above it before VTIME_MAX
           and must dwarf any plausible accumulated vtime */
        if self.vtime_reset_lg < 32 || self.vtime_reset_lg > 61
        {
            return Err(Cause::ConfigBadValue);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn defaults_validate()
    {
        assert!(SchedConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_values_rejected()
    {
        let mut cfg = SchedConfig::default();
        cfg.quantum_ms = 0;
        assert_eq!(cfg.validate(), Err(Cause::ConfigBadValue));

        let mut cfg = SchedConfig::default();
        cfg.vtime_reset_lg = 63;
        assert_eq!(cfg.validate(), Err(Cause::ConfigBadValue));

        let mut cfg = SchedConfig::default();
        cfg.cos_min_cpu = 101;
        assert_eq!(cfg.validate(), Err(Cause::ConfigBadValue));
    }
}

/* fairsched load metrics
 *
 * Load history tracks how much an entity ran against how long it sat
 * runnable-but-waiting, sampled on the credit-aging period and folded
 * into decayed averages over one, five and fifteen periods. All
 * fixed point, no floating point.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

/* fixed-point one for load fractions */
pub const LOAD_FIXED_1: u64 = 1 << 11;

/* decay factors for the three averages, as num/den fractions */
const DECAY: [(u64, u64); 3] = [(1, 2), (4, 5), (14, 15)];

#[derive(Debug, Clone)]
pub struct LoadHistory
{
    /* cumulative totals last seen by sample_cumulative */
    last_run: u64,
    last_ready: u64,

    /* decayed load averages in LOAD_FIXED_1 units */
    avg: [u64; 3],

    samples: u64
}

impl LoadHistory
{
    pub fn new() -> LoadHistory
    {
        LoadHistory
        {
            last_run: 0,
            last_ready: 0,
            avg: [0; 3],
            samples: 0
        }
    }

    pub fn reset(&mut self)
    {
        self.last_run = 0;
        self.last_ready = 0;
        self.avg = [0; 3];
        self.samples = 0;
    }

    /* feed one sample period's run and ready cycle deltas */
    pub fn sample_delta(&mut self, run: u64, ready: u64)
    {
        let busy = run + ready;
        let util = if busy == 0
        {
            0
        }
        else
        {
            run * LOAD_FIXED_1 / busy
        };

        for (slot, (num, den)) in DECAY.iter().enumerate()
        {
            self.avg[slot] = (self.avg[slot] * num + util * (den - num)) / den;
        }
        self.samples = self.samples + 1;
    }

    /* feed cumulative totals, computing the deltas since last time
       <= (run delta, ready delta) */
    pub fn sample_cumulative(&mut self, total_run: u64, total_ready: u64) -> (u64, u64)
    {
        let delta_run = total_run.saturating_sub(self.last_run);
        let delta_ready = total_ready.saturating_sub(self.last_ready);
        self.last_run = total_run;
        self.last_ready = total_ready;

        self.sample_delta(delta_run, delta_ready);
        (delta_run, delta_ready)
    }

    /* decayed load fractions in LOAD_FIXED_1 units: fast, medium, slow */
    pub fn averages(&self) -> (u64, u64, u64)
    {
        (self.avg[0], self.avg[1], self.avg[2])
    }

    pub fn samples(&self) -> u64
    {
        self.samples
    }
}

/* a point-in-time view of one physical CPU's accounting */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcpuUsage
{
    pub pcpu: usize,
    pub idle_cycles: u64,
    pub used_cycles: u64,
    pub sys_overlap_cycles: u64,
    pub halted_cycles: u64,
    pub lost_cycles: u64
}

/* a point-in-time view of one VM's consumption */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsmpUsage
{
    pub leader: usize,
    pub used_usec: u64,
    pub charged_cycles: u64,
    pub run_cycles: u64,
    pub load_fast: u64,
    pub load_slow: u64
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn fully_busy_converges_to_one()
    {
        let mut history = LoadHistory::new();
        for _ in 0..64
        {
            history.sample_delta(1000, 0);
        }
        let (fast, medium, slow) = history.averages();
        assert!(fast > LOAD_FIXED_1 * 95 / 100);
        assert!(medium > LOAD_FIXED_1 * 90 / 100);
        assert!(slow > LOAD_FIXED_1 * 85 / 100);
    }

    #[test]
    fn idle_decays_toward_zero()
    {
        let mut history = LoadHistory::new();
        for _ in 0..16
        {
            history.sample_delta(1000, 0);
        }
        for _ in 0..64
        {
            history.sample_delta(0, 0);
        }
        let (fast, _, slow) = history.averages();
        assert!(fast < LOAD_FIXED_1 / 20);
        assert!(slow < LOAD_FIXED_1 / 4);
    }

    #[test]
    fn half_loaded_sits_near_half()
    {
        let mut history = LoadHistory::new();
        for _ in 0..64
        {
            history.sample_delta(500, 500);
        }
        let (fast, _, _) = history.averages();
        assert!(fast > LOAD_FIXED_1 * 2 / 5 && fast < LOAD_FIXED_1 * 3 / 5);
    }

    #[test]
    fn cumulative_produces_deltas()
    {
        let mut history = LoadHistory::new();
        assert_eq!(history.sample_cumulative(100, 50), (100, 50));
        assert_eq!(history.sample_cumulative(300, 60), (200, 10));

        /* a reset total (counter rewound) saturates rather than wrapping */
        assert_eq!(history.sample_cumulative(100, 60), (0, 0));
        assert_eq!(history.samples(), 3);
    }
}

/* fairsched virtual time arithmetic
 *
 * Virtual time is the progress meter of proportional sharing: an
 * entity's vtime advances by stride x elapsed_cycles while it runs,
 * where stride is inversely proportional to its share allocation.
 * Entities behind the cell's global vtime are owed CPU; entities
 * ahead are in debt. All of the arithmetic here is integer
 * multiply/shift; there is no floating point anywhere in the
 * scheduler.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use super::groups::{GroupID, GROUP_ID_INVALID, GROUP_PATH_LEN, GroupPath};

/* virtual time and stride are signed so comparisons of entities either
   side of a reset behave, though strides are always positive in practice */
pub type Vtime = i64;
pub type Stride = i64;

/* stride of an entity holding exactly one share */
pub const STRIDE1: i64 = 1 << 24;

/* cycles-to-vtime fixed point: vtime advances stride x cycles >> 16 */
pub const STRIDE_CYCLES_LG: u32 = 16;

/* beyond this the arithmetic is in danger, so a global reset fires well below it */
pub const VTIME_MAX: Vtime = 1 << 62;

/* share bounds accepted from external allocations */
pub const SHARES_MIN: u32 = 1;
pub const SHARES_MAX: u32 = 1 << 18;

/* compute an entity's stride from its share allocation.
   more shares => smaller stride => slower vtime advance per cycle */
pub fn stride_for_shares(shares: u32) -> Stride
{
    let shares = if shares < SHARES_MIN { SHARES_MIN } else { shares };
    STRIDE1 / shares as i64
}

/* convert a cycle count to a vtime delta at the given stride.
   the 32x32 path covers any interval under ~4 billion cycles; longer
   intervals split the count so no intermediate product overflows
   => stride = entity's stride
      cycles = elapsed real cycles, at most 2^48
   <= vtime delta */
pub fn cycles_to_vtime(stride: Stride, cycles: u64) -> Vtime
{
    if cycles <= u32::MAX as u64
    {
        /* fast path: cycles < 2^32 and stride < 2^24 keeps the product well inside i64 */
        return ((cycles as i64) * stride) >> STRIDE_CYCLES_LG;
    }

    /* wide path: split at 32 bits and recombine past the fixed point */
    let hi = (cycles >> 32) as i64;
    let lo = (cycles & 0xffff_ffff) as i64;
    ((hi * stride) << (32 - STRIDE_CYCLES_LG)) + ((lo * stride) >> STRIDE_CYCLES_LG)
}

/* approximate inverse of cycles_to_vtime, used to express a cycle bonus
   in vtime units for comparison. rounds to nearest */
pub fn vtime_to_cycles(stride: Stride, vtime: Vtime) -> i64
{
    if stride <= 0
    {
        return 0;
    }

    let whole = vtime / stride;
    let rem = vtime % stride;
    (whole << STRIDE_CYCLES_LG) + (((rem << STRIDE_CYCLES_LG) + stride / 2) / stride)
}

/* scale a vtime by num/den, preserving sign. multiply first while the
   unsigned magnitude fits 32 bits to keep the precision, otherwise
   divide first to keep the product in range */
pub fn vtime_scale(vtime: Vtime, num: u64, den: u64) -> Vtime
{
    if den == 0 || num == den
    {
        return vtime;
    }

    let negative = vtime < 0;
    let magnitude = vtime.unsigned_abs();

    let scaled = if magnitude <= u32::MAX as u64 && num <= u32::MAX as u64
    {
        magnitude * num / den
    }
    else
    {
        /* precision traded for range on these big values */
        magnitude / den * num
    };

    let scaled = if scaled > VTIME_MAX as u64 { VTIME_MAX as u64 } else { scaled };
    if negative { -(scaled as i64) } else { scaled as i64 }
}

/* an entity's virtual clocks plus what's needed to compare them:
   entitled (main) and opportunistic (extra) vtime, the stride both
   advance at, the per-tick global advance, and the path of group
   tree nodes from the root down to the entity */
#[derive(Clone, Copy, Debug)]
pub struct VtimeContext
{
    pub main: Vtime,
    pub extra: Vtime,
    pub stride: Stride,
    pub nstride: Stride,
    pub path: GroupPath
}

impl VtimeContext
{
    pub fn new(stride: Stride, nstride: Stride, path: GroupPath) -> VtimeContext
    {
        VtimeContext
        {
            main: 0,
            extra: 0,
            stride,
            nstride,
            path
        }
    }
}

/* compare two vtime contexts for selection, returning negative if a
   should run before b, positive if b before a, zero for a tie.
   bonuses are cycle counts, converted at each side's own stride.

   main mode compares entitled vtime directly. extra mode walks both
   group paths from the root: the first level at which they diverge
   supplies the basis for each side - the group's published vtime if
   the side still has a group there, or the entity's own extra vtime
   if its path already ended. the caller supplies group lookups,
   normally backed by the per-PCPU group-vtime cache
   => group_vt = returns (vtime, stride) for a group id */
pub fn context_compare<F>(a: &VtimeContext, a_bonus_cycles: i64,
                          b: &VtimeContext, b_bonus_cycles: i64,
                          use_extra: bool, group_vt: F) -> i64
    where F: Fn(GroupID) -> (Vtime, Stride)
{
    if use_extra == false
    {
        let a_key = a.main - cycles_to_vtime(a.stride, a_bonus_cycles.unsigned_abs()) * a_bonus_cycles.signum();
        let b_key = b.main - cycles_to_vtime(b.stride, b_bonus_cycles.unsigned_abs()) * b_bonus_cycles.signum();
        return a_key - b_key;
    }

    /* find the level at which the two paths part company */
    for level in 0..GROUP_PATH_LEN
    {
        if a.path[level] == b.path[level]
        {
            if a.path[level] == GROUP_ID_INVALID
            {
                /* identical paths all the way down: compare the entities' own extra clocks */
                break;
            }
            continue;
        }

        /* diverged: each side's basis is its group's vtime at this level,
           or its own extra clock if its path has already ended */
        let (a_base, a_stride) = if a.path[level] == GROUP_ID_INVALID
        {
            (a.extra, a.stride)
        }
        else
        {
            group_vt(a.path[level])
        };

        let (b_base, b_stride) = if b.path[level] == GROUP_ID_INVALID
        {
            (b.extra, b.stride)
        }
        else
        {
            group_vt(b.path[level])
        };

        let a_key = a_base - cycles_to_vtime(a_stride, a_bonus_cycles.unsigned_abs()) * a_bonus_cycles.signum();
        let b_key = b_base - cycles_to_vtime(b_stride, b_bonus_cycles.unsigned_abs()) * b_bonus_cycles.signum();
        return a_key - b_key;
    }

    let a_key = a.extra - cycles_to_vtime(a.stride, a_bonus_cycles.unsigned_abs()) * a_bonus_cycles.signum();
    let b_key = b.extra - cycles_to_vtime(b.stride, b_bonus_cycles.unsigned_abs()) * b_bonus_cycles.signum();
    a_key - b_key
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::groups::group_path_root;

    #[test]
    fn stride_inversely_proportional()
    {
        assert_eq!(stride_for_shares(1), STRIDE1);
        assert_eq!(stride_for_shares(2), STRIDE1 / 2);
        assert_eq!(stride_for_shares(1000), STRIDE1 / 1000);

        /* zero shares clamps to the minimum rather than dividing by zero */
        assert_eq!(stride_for_shares(0), STRIDE1);
    }

    #[test]
    fn conversion_fast_and_wide_paths_agree()
    {
        let stride = stride_for_shares(1000);

        /* a boundary-straddling pair: the wide path must continue the fast path exactly */
        let just_under = (u32::MAX as u64) - 1;
        let just_over = (u32::MAX as u64) + 1;
        let under = cycles_to_vtime(stride, just_under);
        let over = cycles_to_vtime(stride, just_over);
        assert!(over > under);

        /* 2^48 cycles at stride for one share: exercises the widest case */
        let wide = cycles_to_vtime(STRIDE1, 1 << 48);
        assert_eq!(wide, (1i64 << 48) * STRIDE1 >> STRIDE_CYCLES_LG);
    }

    #[test]
    fn round_trip_within_one_cycle()
    {
        /* strides of at least 2^16 (shares up to 256) round-trip exactly
           to within a cycle across the whole 2^48 range */
        for &shares in &[1u32, 2, 16, 128, 256]
        {
            let stride = stride_for_shares(shares);
            for &cycles in &[0u64, 1, 1000, 123456789, 1 << 32, (1 << 48) - 1]
            {
                let back = vtime_to_cycles(stride, cycles_to_vtime(stride, cycles));
                let diff = (back - cycles as i64).abs();
                assert!(diff <= 1, "shares {} cycles {} came back {}", shares, cycles, back);
            }
        }
    }

    #[test]
    fn round_trip_bounded_for_small_strides()
    {
        /* below 2^16 the floor in cycles_to_vtime costs up to 2^16/stride cycles */
        for &shares in &[1000u32, 10000, SHARES_MAX]
        {
            let stride = stride_for_shares(shares);
            let bound = (1i64 << STRIDE_CYCLES_LG) / stride + 1;
            for &cycles in &[1000u64, 123456789, 1 << 40]
            {
                let back = vtime_to_cycles(stride, cycles_to_vtime(stride, cycles));
                let diff = (back - cycles as i64).abs();
                assert!(diff <= bound, "shares {} cycles {} err {} bound {}", shares, cycles, diff, bound);
            }
        }
    }

    #[test]
    fn scaling_preserves_sign_and_ratio()
    {
        assert_eq!(vtime_scale(1000, 3, 2), 1500);
        assert_eq!(vtime_scale(-1000, 3, 2), -1500);
        assert_eq!(vtime_scale(1000, 1, 1), 1000);

        /* magnitude past 32 bits goes through the divide-first path */
        let big = 1i64 << 40;
        assert_eq!(vtime_scale(big, 2, 1), big * 2);

        /* zero denominator is refused rather than faulted */
        assert_eq!(vtime_scale(42, 5, 0), 42);
    }

    #[test]
    fn main_compare_orders_by_entitlement()
    {
        let path = group_path_root();
        let mut a = VtimeContext::new(stride_for_shares(100), STRIDE1, path);
        let mut b = VtimeContext::new(stride_for_shares(100), STRIDE1, path);
        a.main = 500;
        b.main = 900;

        /* no bonus: the side further behind wins */
        assert!(context_compare(&a, 0, &b, 0, false, |_| (0, 0)) < 0);

        /* a big enough bonus on b pulls it ahead */
        let bonus = vtime_to_cycles(b.stride, 600);
        assert!(context_compare(&a, 0, &b, bonus, false, |_| (0, 0)) > 0);
    }

    #[test]
    fn extra_compare_uses_diverging_group()
    {
        /* two entities under different top-level groups: the comparison
           is between the groups' clocks, not the entities' own */
        let mut a_path = group_path_root();
        let mut b_path = group_path_root();
        a_path[1] = 10;
        b_path[1] = 20;

        let mut a = VtimeContext::new(stride_for_shares(100), STRIDE1, a_path);
        let mut b = VtimeContext::new(stride_for_shares(100), STRIDE1, b_path);
        a.extra = 1;
        b.extra = 1000000;

        /* group 10 is way ahead of group 20, so b runs first despite its own clock */
        let lookup = |id: GroupID| if id == 10 { (5000, STRIDE1 / 2) } else { (100, STRIDE1 / 2) };
        assert!(context_compare(&a, 0, &b, 0, true, lookup) > 0);
    }

    #[test]
    fn extra_compare_same_group_uses_own_clocks()
    {
        let mut path = group_path_root();
        path[1] = 7;

        let mut a = VtimeContext::new(stride_for_shares(100), STRIDE1, path);
        let mut b = VtimeContext::new(stride_for_shares(100), STRIDE1, path);
        a.extra = 300;
        b.extra = 200;

        /* identical paths: fall through to the entities' extra clocks */
        assert!(context_compare(&a, 0, &b, 0, true, |_| (0, 0)) > 0);
    }
}

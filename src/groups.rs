/* fairsched allocation group tree
 *
 * Administrators organize virtual machines into a tree of named
 * groups, each carrying a {min, max, shares} allocation. The tree
 * turns those external allocations into per-VM base shares: the
 * rebalance pass snapshots the tree, computes base allocations with
 * the scheduling locks dropped, and commits only if the tree hasn't
 * changed shape underneath it.
 *
 * Group virtual clocks are published through sequence locks so the
 * per-PCPU cache can read a consistent {vtime, limit, stride} triple
 * without taking the tree lock.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use alloc::string::String;
use alloc::vec::Vec;
use alloc::sync::Arc;
use hashbrown::hash_map::HashMap;
use super::error::Cause;
use super::lock::SeqLock;
use super::platform::WorldID;
use super::vtime::{self, Vtime, Stride, SHARES_MIN, SHARES_MAX};

pub type GroupID = usize;

pub const GROUP_ID_INVALID: GroupID = usize::MAX;
pub const GROUP_ID_ROOT: GroupID = 0;

/* fixed depth of group paths: root plus up to seven nested groups */
pub const GROUP_PATH_LEN: usize = 8;
pub type GroupPath = [GroupID; GROUP_PATH_LEN];

/* a path containing just the root group */
pub fn group_path_root() -> GroupPath
{
    let mut path = [GROUP_ID_INVALID; GROUP_PATH_LEN];
    path[0] = GROUP_ID_ROOT;
    path
}

/* base shares backing one physical CPU's worth of capacity */
pub const BASE_SHARES_PER_PCPU: u32 = 100;

/* sentinel for "no maximum" */
pub const MAX_NONE: u32 = u32::MAX;

/* units an external allocation can be expressed in */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocUnits
{
    Percent,
    Mhz,
    Bshares
}

/* an externally-specified allocation */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alloc
{
    pub min: u32,
    pub max: u32,
    pub shares: u32,
    pub units: AllocUnits
}

impl Alloc
{
    pub fn new(min: u32, max: u32, shares: u32, units: AllocUnits) -> Alloc
    {
        Alloc { min, max, shares, units }
    }

    /* an allocation with shares only: no reservation, no cap */
    pub fn shares_only(shares: u32) -> Alloc
    {
        Alloc { min: 0, max: MAX_NONE, shares, units: AllocUnits::Bshares }
    }
}

/* the internal allocation every external one is reduced to: all three
   fields in base shares */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseAlloc
{
    pub min: u32,
    pub max: u32,
    pub shares: u32
}

impl BaseAlloc
{
    pub fn zero() -> BaseAlloc
    {
        BaseAlloc { min: 0, max: MAX_NONE, shares: SHARES_MIN }
    }
}

/* what the machine is worth, for unit conversion and admission */
#[derive(Debug, Clone, Copy)]
pub struct MachineCaps
{
    pub npcpus: u32,
    pub logical_per_package: u32,
    pub mhz: u32
}

impl MachineCaps
{
    /* total base shares across the machine */
    pub fn total_base(&self) -> u32
    {
        self.npcpus * BASE_SHARES_PER_PCPU
    }

    /* machine capacity in percent units: one hundred per physical CPU */
    pub fn percent_total(&self) -> u32
    {
        self.npcpus * 100
    }

    /* base shares of one whole package */
    pub fn package_base(&self) -> u32
    {
        BASE_SHARES_PER_PCPU * self.logical_per_package
    }

    /* convert an external value to base shares
       <= base shares, or AllocBadUnits if the units can't be converted */
    pub fn to_base(&self, value: u32, units: AllocUnits) -> Result<u32, Cause>
    {
        if value == MAX_NONE
        {
            return Ok(MAX_NONE);
        }

        match units
        {
            AllocUnits::Bshares => Ok(value),
            AllocUnits::Percent => Ok((value as u64 * BASE_SHARES_PER_PCPU as u64 / 100) as u32),
            AllocUnits::Mhz =>
            {
                if self.mhz == 0
                {
                    return Err(Cause::AllocBadUnits);
                }
                let machine_mhz = self.mhz as u64 * self.npcpus as u64;
                Ok((value as u64 * self.total_base() as u64 / machine_mhz) as u32)
            }
        }
    }
}

/* the group clock triple published to lock-free readers */
#[derive(Debug, Clone, Copy)]
pub struct GroupVtime
{
    pub vtime: Vtime,
    pub vtime_limit: Vtime,
    pub stride: Stride
}

/* a member of a group: either a nested group or a VM, identified by
   the VM's leader world */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMember
{
    Group(GroupID),
    Vm(WorldID)
}

/* an interior node of the allocation tree */
struct GroupNode
{
    id: GroupID,
    name: String,
    parent: GroupID,
    members: Vec<GroupMember>,

    alloc: Alloc,
    min_base: u32,
    max_base: u32,
    base: BaseAlloc,

    vtime: Vtime,
    vtime_limit: Vtime,
    stride: Stride,
    stride_limit: Stride,
    charged_cycles: u64,

    /* the lock-free published copy of this group's clocks */
    published: Arc<SeqLock<GroupVtime>>
}

impl GroupNode
{
    fn new(id: GroupID, name: &str, parent: GroupID, alloc: Alloc, min_base: u32, max_base: u32) -> GroupNode
    {
        let stride = vtime::stride_for_shares(SHARES_MIN);
        GroupNode
        {
            id,
            name: String::from(name),
            parent,
            members: Vec::new(),
            alloc,
            min_base,
            max_base,
            base: BaseAlloc::zero(),
            vtime: 0,
            vtime_limit: 0,
            stride,
            stride_limit: stride,
            charged_cycles: 0,
            published: Arc::new(SeqLock::new(GroupVtime { vtime: 0, vtime_limit: 0, stride }))
        }
    }

    fn publish(&self)
    {
        self.published.write(GroupVtime
        {
            vtime: self.vtime,
            vtime_limit: self.vtime_limit,
            stride: self.stride
        });
    }
}

/* a VM's record in the tree: the external allocation of its VSMP,
   mirrored here so admission and rebalance work entirely under the
   tree lock */
#[derive(Debug, Clone)]
struct VmNode
{
    world: WorldID,
    parent: GroupID,
    alloc: Alloc,
    nvcpus: u32,
    min_base: u32,
    max_base: u32,
    base: BaseAlloc
}

pub struct GroupTree
{
    caps: MachineCaps,
    nodes: HashMap<GroupID, GroupNode>,
    vms: HashMap<WorldID, VmNode>,
    next_id: GroupID,

    /* reallocation is requested by setting the dirty flag; the periodic
       pass picks it up. at most one rebalance may be in flight */
    dirty: bool,
    realloc_in_progress: bool
}

impl GroupTree
{
    /* build a tree containing just the root group, which owns the whole machine */
    pub fn new(caps: MachineCaps) -> GroupTree
    {
        let total = caps.total_base();
        let root_alloc = Alloc::new(total, MAX_NONE, total, AllocUnits::Bshares);
        let mut root = GroupNode::new(GROUP_ID_ROOT, "host", GROUP_ID_INVALID, root_alloc, total, MAX_NONE);
        root.base = BaseAlloc { min: total, max: MAX_NONE, shares: total };
        root.stride = vtime::stride_for_shares(total);
        root.stride_limit = root.stride;
        root.publish();

        let mut nodes = HashMap::new();
        nodes.insert(GROUP_ID_ROOT, root);

        GroupTree
        {
            caps,
            nodes,
            vms: HashMap::new(),
            next_id: GROUP_ID_ROOT + 1,
            dirty: false,
            realloc_in_progress: false
        }
    }

    pub fn caps(&self) -> MachineCaps { self.caps }

    /* machine capacity in percent units, for external interfaces */
    pub fn percent_total(&self) -> u32
    {
        self.caps.percent_total()
    }

    /* sum of base-share mins reserved by a group's members */
    fn reserved_by_members(&self, group: &GroupNode, skip: Option<GroupMember>) -> u64
    {
        let mut total = 0u64;
        for member in group.members.iter()
        {
            if Some(*member) == skip
            {
                continue;
            }
            total = total + match member
            {
                GroupMember::Group(id) => self.nodes.get(id).map(|n| n.min_base as u64).unwrap_or(0),
                GroupMember::Vm(world) => self.vms.get(world).map(|v| v.min_base as u64).unwrap_or(0)
            };
        }
        total
    }

    /* base-share capacity a group can promise to its members: its own
       min reservation, since only reserved capacity can be re-reserved */
    fn group_reservation_pool(&self, group: &GroupNode) -> u64
    {
        group.min_base as u64
    }

    /* validate an external allocation's internal consistency and
       convert its min/max to base shares
       <= (min_base, max_base) or an error */
    fn check_alloc(&self, alloc: &Alloc) -> Result<(u32, u32), Cause>
    {
        if alloc.shares < SHARES_MIN || alloc.shares > SHARES_MAX
        {
            return Err(Cause::AllocBadParam);
        }

        let min_base = self.caps.to_base(alloc.min, alloc.units)?;
        let max_base = self.caps.to_base(alloc.max, alloc.units)?;

        if max_base != MAX_NONE && min_base > max_base
        {
            return Err(Cause::AllocBadParam);
        }

        Ok((min_base, max_base))
    }

    /* admission check for giving a member of the given parent a new min
       => parent = enclosing group
         member = the member being changed, skipped when summing siblings
         new_min_base = requested reservation in base shares
         member_floor = base shares the member's own children already reserve */
    fn admit(&self, parent: &GroupNode, member: GroupMember, new_min_base: u32, member_floor: u64) -> Result<(), Cause>
    {
        let reserved = self.reserved_by_members(parent, Some(member));
        let pool = self.group_reservation_pool(parent);

        if reserved + new_min_base as u64 > pool
        {
            return Err(Cause::AdmissionDenied);
        }

        if (new_min_base as u64) < member_floor
        {
            return Err(Cause::AdmissionDenied);
        }

        Ok(())
    }

    /* create an empty group under the given parent
       <= new group's id, or an error */
    pub fn create(&mut self, parent: GroupID, name: &str) -> Result<GroupID, Cause>
    {
        if self.depth_of(parent)? + 1 >= GROUP_PATH_LEN
        {
            return Err(Cause::GroupTreeTooDeep);
        }

        let id = self.next_id;
        if id == GROUP_ID_INVALID
        {
            return Err(Cause::GroupIDExhaustion);
        }
        self.next_id = self.next_id + 1;

        /* new groups start with no reservation and minimal shares */
        let alloc = Alloc::shares_only(SHARES_MIN);
        let node = GroupNode::new(id, name, parent, alloc, 0, MAX_NONE);
        group_state_init(&node);
        self.nodes.insert(id, node);

        match self.nodes.get_mut(&parent)
        {
            Some(p) => p.members.push(GroupMember::Group(id)),
            None =>
            {
                self.nodes.remove(&id);
                return Err(Cause::GroupBadID);
            }
        }

        self.dirty = true;
        Ok(id)
    }

    /* remove an empty group. the root can't be removed */
    pub fn remove(&mut self, group: GroupID) -> Result<(), Cause>
    {
        if group == GROUP_ID_ROOT
        {
            return Err(Cause::GroupBadID);
        }

        let parent = match self.nodes.get(&group)
        {
            Some(node) =>
            {
                if node.members.is_empty() == false
                {
                    return Err(Cause::GroupNotEmpty);
                }
                node.parent
            },
            None => return Err(Cause::GroupBadID)
        };

        if let Some(node) = self.nodes.remove(&group)
        {
            group_state_cleanup(&node);
        }
        if let Some(p) = self.nodes.get_mut(&parent)
        {
            p.members.retain(|m| *m != GroupMember::Group(group));
        }

        self.dirty = true;
        Ok(())
    }

    /* change a group's external allocation, subject to admission control */
    pub fn set_alloc(&mut self, group: GroupID, alloc: Alloc) -> Result<(), Cause>
    {
        if group == GROUP_ID_ROOT
        {
            return Err(Cause::GroupBadID);
        }

        let (min_base, max_base) = self.check_alloc(&alloc)?;

        let (parent_id, floor) = match self.nodes.get(&group)
        {
            Some(node) => (node.parent, self.reserved_by_members(node, None)),
            None => return Err(Cause::GroupBadID)
        };

        match self.nodes.get(&parent_id)
        {
            Some(parent) => self.admit(parent, GroupMember::Group(group), min_base, floor)?,
            None => return Err(Cause::GroupBadID)
        }

        if let Some(node) = self.nodes.get_mut(&group)
        {
            node.alloc = alloc;
            node.min_base = min_base;
            node.max_base = max_base;
        }

        self.dirty = true;
        Ok(())
    }

    /* register a VM under a group
       => world = the VM's leader world id
          parent = enclosing group
          alloc = external allocation
          nvcpus = how many virtual CPUs the VM has */
    pub fn vm_add(&mut self, world: WorldID, parent: GroupID, alloc: Alloc, nvcpus: u32) -> Result<(), Cause>
    {
        if self.vms.contains_key(&world)
        {
            return Err(Cause::WorldBadID);
        }

        let (min_base, max_base) = self.check_alloc(&alloc)?;
        let max_base = self.canonicalize_max(max_base, nvcpus);

        match self.nodes.get(&parent)
        {
            Some(p) => self.admit(p, GroupMember::Vm(world), min_base, 0)?,
            None => return Err(Cause::GroupBadID)
        }

        self.vms.insert(world, VmNode
        {
            world,
            parent,
            alloc,
            nvcpus,
            min_base,
            max_base,
            base: BaseAlloc::zero()
        });

        if let Some(p) = self.nodes.get_mut(&parent)
        {
            p.members.push(GroupMember::Vm(world));
        }

        self.dirty = true;
        Ok(())
    }

    /* forget a VM, releasing its reservation */
    pub fn vm_remove(&mut self, world: WorldID) -> Result<(), Cause>
    {
        let parent = match self.vms.remove(&world)
        {
            Some(vm) => vm.parent,
            None => return Err(Cause::WorldBadID)
        };

        if let Some(p) = self.nodes.get_mut(&parent)
        {
            p.members.retain(|m| *m != GroupMember::Vm(world));
        }

        self.dirty = true;
        Ok(())
    }

    /* a max of one package of capacity per virtual CPU is no constraint
       at all, so canonicalize it to MAX_NONE */
    fn canonicalize_max(&self, max_base: u32, nvcpus: u32) -> u32
    {
        if max_base == MAX_NONE
        {
            return MAX_NONE;
        }
        if max_base as u64 >= nvcpus as u64 * self.caps.package_base() as u64
        {
            return MAX_NONE;
        }
        max_base
    }

    /* change a VM's external allocation, subject to admission control
       against the enclosing group's reservation pool */
    pub fn vm_set_alloc(&mut self, world: WorldID, alloc: Alloc, nvcpus: u32) -> Result<(), Cause>
    {
        let (min_base, max_base) = self.check_alloc(&alloc)?;
        let max_base = self.canonicalize_max(max_base, nvcpus);

        let parent_id = match self.vms.get(&world)
        {
            Some(vm) => vm.parent,
            None => return Err(Cause::WorldBadID)
        };

        match self.nodes.get(&parent_id)
        {
            Some(parent) => self.admit(parent, GroupMember::Vm(world), min_base, 0)?,
            None => return Err(Cause::GroupBadID)
        }

        if let Some(vm) = self.vms.get_mut(&world)
        {
            vm.alloc = alloc;
            vm.nvcpus = nvcpus;
            vm.min_base = min_base;
            vm.max_base = max_base;
        }

        self.dirty = true;
        Ok(())
    }

    /* atomically return a VM's min reservation to its enclosing group's
       pool. the VM's reservation was carved out of the group's own min,
       so the group keeps its min and the capacity is free to re-reserve;
       admission cannot fail */
    pub fn move_vm_alloc_to_group(&mut self, world: WorldID, group: GroupID) -> Result<(), Cause>
    {
        match self.vms.get(&world)
        {
            Some(vm) =>
            {
                if vm.parent != group
                {
                    return Err(Cause::GroupBadID);
                }
            },
            None => return Err(Cause::WorldBadID)
        };

        if self.nodes.contains_key(&group) == false
        {
            return Err(Cause::GroupBadID);
        }

        if let Some(vm) = self.vms.get_mut(&world)
        {
            vm.min_base = 0;
            vm.alloc.min = 0;
        }

        self.dirty = true;
        Ok(())
    }

    /* atomically move part of a group's min reservation onto a VM it contains
       => amount_base = base shares to transfer */
    pub fn move_group_alloc_to_vm(&mut self, group: GroupID, world: WorldID, amount_base: u32) -> Result<(), Cause>
    {
        match self.vms.get(&world)
        {
            Some(vm) if vm.parent == group => (),
            Some(_) => return Err(Cause::GroupBadID),
            None => return Err(Cause::WorldBadID)
        }

        /* the group must keep enough reservation to cover its other members */
        let (pool, reserved) = match self.nodes.get(&group)
        {
            Some(node) => (self.group_reservation_pool(node), self.reserved_by_members(node, Some(GroupMember::Vm(world)))),
            None => return Err(Cause::GroupBadID)
        };

        let vm_min = self.vms.get(&world).map(|v| v.min_base as u64).unwrap_or(0);
        if reserved + vm_min + amount_base as u64 > pool
        {
            return Err(Cause::AdmissionDenied);
        }

        if let Some(vm) = self.vms.get_mut(&world)
        {
            vm.min_base = vm.min_base.saturating_add(amount_base);
            if vm.max_base != MAX_NONE && vm.min_base > vm.max_base
            {
                vm.max_base = vm.min_base;
            }
        }

        self.dirty = true;
        Ok(())
    }

    /* how deep a group sits: root is depth 0 */
    fn depth_of(&self, group: GroupID) -> Result<usize, Cause>
    {
        let mut depth = 0;
        let mut cursor = group;
        while cursor != GROUP_ID_ROOT
        {
            cursor = match self.nodes.get(&cursor)
            {
                Some(node) => node.parent,
                None => return Err(Cause::GroupBadID)
            };
            depth = depth + 1;
            if depth >= GROUP_PATH_LEN
            {
                return Err(Cause::GroupTreeTooDeep);
            }
        }
        Ok(depth)
    }

    /* the fixed-depth root-to-parent group path of a VM */
    pub fn path_of(&self, world: WorldID) -> Result<GroupPath, Cause>
    {
        let parent = match self.vms.get(&world)
        {
            Some(vm) => vm.parent,
            None => return Err(Cause::WorldBadID)
        };

        let mut reversed = Vec::new();
        let mut cursor = parent;
        loop
        {
            reversed.push(cursor);
            if cursor == GROUP_ID_ROOT
            {
                break;
            }
            cursor = match self.nodes.get(&cursor)
            {
                Some(node) => node.parent,
                None => return Err(Cause::GroupBadID)
            };
        }

        let mut path = [GROUP_ID_INVALID; GROUP_PATH_LEN];
        for (slot, id) in reversed.iter().rev().enumerate()
        {
            path[slot] = *id;
        }
        Ok(path)
    }

    /* a lock-free handle onto a group's published clocks, for the
       per-PCPU cache */
    pub fn clock_handle(&self, group: GroupID) -> Option<Arc<SeqLock<GroupVtime>>>
    {
        self.nodes.get(&group).map(|n| n.published.clone())
    }

    /* charge used cycles to every group along a path, advancing their
       virtual clocks at their own strides */
    pub fn charge(&mut self, path: &GroupPath, cycles: u64)
    {
        for slot in 0..GROUP_PATH_LEN
        {
            let id = path[slot];
            if id == GROUP_ID_INVALID
            {
                break;
            }
            if let Some(node) = self.nodes.get_mut(&id)
            {
                node.vtime = node.vtime + vtime::cycles_to_vtime(node.stride, cycles);
                node.vtime_limit = node.vtime_limit + vtime::cycles_to_vtime(node.stride_limit, cycles);
                node.charged_cycles = node.charged_cycles + cycles;
                node.publish();
            }
        }
    }

    /* the published clock triple for a group, for callers already
       holding the tree lock */
    pub fn group_vtime(&self, group: GroupID) -> Option<GroupVtime>
    {
        self.nodes.get(&group).map(|n| GroupVtime
        {
            vtime: n.vtime,
            vtime_limit: n.vtime_limit,
            stride: n.stride
        })
    }

    /* subtract the global reset offset from every group clock */
    pub fn reset_vtimes(&mut self, offset: Vtime)
    {
        for (_, node) in self.nodes.iter_mut()
        {
            node.vtime = node.vtime - offset;
            node.vtime_limit = node.vtime_limit - offset;
            node.publish();
        }
    }

    /* aggregate charge across the whole tree, for accounting checks */
    pub fn root_charged_cycles(&self) -> u64
    {
        self.nodes.get(&GROUP_ID_ROOT).map(|n| n.charged_cycles).unwrap_or(0)
    }

    pub fn request_reallocate(&mut self)
    {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool
    {
        self.dirty
    }

    pub fn vm_base(&self, world: WorldID) -> Option<BaseAlloc>
    {
        self.vms.get(&world).map(|v| v.base)
    }

    pub fn vm_count(&self) -> usize
    {
        self.vms.len()
    }

    /* start a rebalance: snapshot the tree. at most one rebalance can
       be in flight at a time. caller must hold the tree lock plus all
       cell locks while snapshotting, then drop them to compute */
    pub fn begin_rebalance(&mut self) -> Result<BalanceSnapshot, Cause>
    {
        if self.realloc_in_progress == true
        {
            return Err(Cause::ReallocInProgress);
        }
        self.realloc_in_progress = true;
        Ok(self.snapshot())
    }

    pub fn abort_rebalance(&mut self)
    {
        self.realloc_in_progress = false;
    }

    /* capture the tree's shape and allocations. group base-min/max are
       computed bottom-up: a group must reserve at least what its members
       reserve, clamped by its own max */
    fn snapshot(&self) -> BalanceSnapshot
    {
        let mut groups = HashMap::new();
        for (id, node) in self.nodes.iter()
        {
            groups.insert(*id, SnapGroup
            {
                id: *id,
                parent: node.parent,
                alloc_shares: node.alloc.shares,
                min_base: node.min_base,
                max_base: node.max_base,
                members: node.members.clone(),
                vsmp_count: 0
            });
        }

        let mut vms = HashMap::new();
        for (world, vm) in self.vms.iter()
        {
            vms.insert(*world, SnapVm
            {
                world: *world,
                parent: vm.parent,
                alloc_shares: vm.alloc.shares,
                min_base: vm.min_base,
                max_base: vm.max_base,
                nvcpus: vm.nvcpus
            });
        }

        let mut snap = BalanceSnapshot
        {
            groups,
            vms,
            total_base: self.caps.total_base()
        };
        snap.roll_up_mins();
        snap
    }

    /* commit a computed plan: verify the tree is structurally unchanged
       since the snapshot, then write the new base allocations into the
       groups and the VM mirror, publishing new group strides. caller
       must hold the tree lock plus every cell lock.
       <= per-VM base allocations for the caller to apply to the VSMPs,
          or ReallocRetry if the tree changed and the pass must rerun */
    pub fn commit_rebalance(&mut self, snap: &BalanceSnapshot, plan: &BalancePlan) -> Result<Vec<(WorldID, BaseAlloc)>, Cause>
    {
        if self.realloc_in_progress == false
        {
            return Err(Cause::ReallocRetry);
        }
        self.realloc_in_progress = false;

        if self.snapshot().same_structure(snap) == false
        {
            /* the dirty flag stays set so the periodic pass retries */
            return Err(Cause::ReallocRetry);
        }

        for (id, base) in plan.group_base.iter()
        {
            if let Some(node) = self.nodes.get_mut(id)
            {
                let old_stride = node.stride;
                node.base = *base;
                node.stride = vtime::stride_for_shares(base.shares);
                node.stride_limit = if base.max == MAX_NONE
                {
                    node.stride
                }
                else
                {
                    vtime::stride_for_shares(base.max)
                };

                /* keep the group's progress signal stable in real-cycle terms */
                if node.stride != old_stride
                {
                    node.vtime = vtime::vtime_scale(node.vtime, node.stride as u64, old_stride as u64);
                    node.vtime_limit = vtime::vtime_scale(node.vtime_limit, node.stride_limit as u64, old_stride as u64);
                }
                node.publish();
            }
        }

        let mut out = Vec::new();
        for (world, base) in plan.vm_base.iter()
        {
            if let Some(vm) = self.vms.get_mut(world)
            {
                vm.base = *base;
            }
            out.push((*world, *base));
        }

        self.dirty = false;
        Ok(out)
    }

    /* proc-style snapshot of the group tree for status reporting */
    pub fn render(&self) -> String
    {
        let mut text = String::new();
        text.push_str("id     parent name             min    max    shares base\n");

        let mut ids: Vec<GroupID> = self.nodes.keys().copied().collect();
        ids.sort();
        for id in ids
        {
            if let Some(node) = self.nodes.get(&id)
            {
                let max = if node.max_base == MAX_NONE { String::from("none") } else { format!("{}", node.max_base) };
                text.push_str(&format!("{:<6} {:<6} {:<16} {:<6} {:<6} {:<6} {}\n",
                    node.id,
                    if node.parent == GROUP_ID_INVALID { String::from("-") } else { format!("{}", node.parent) },
                    node.name, node.min_base, max, node.alloc.shares, node.base.shares));
            }
        }

        for (world, vm) in self.vms.iter()
        {
            text.push_str(&format!("vm{:<5} g{:<5} vcpus={} min={} shares={} base={}\n",
                world, vm.parent, vm.nvcpus, vm.min_base, vm.alloc.shares, vm.base.shares));
        }
        text
    }
}

/* per-group scheduling state bring-up and teardown hooks */
fn group_state_init(node: &GroupNode)
{
    hvdebug!("group {} ({}) created", node.id, node.name);
}

fn group_state_cleanup(node: &GroupNode)
{
    hvdebug!("group {} ({}) removed after charging {} cycles", node.id, node.name, node.charged_cycles);
}

/* ---- the balance pass, computed with no scheduler locks held ---- */

#[derive(Clone, PartialEq, Eq)]
pub struct SnapGroup
{
    pub id: GroupID,
    pub parent: GroupID,
    pub alloc_shares: u32,
    pub min_base: u32,
    pub max_base: u32,
    pub members: Vec<GroupMember>,
    pub vsmp_count: u32
}

#[derive(Clone, PartialEq, Eq)]
pub struct SnapVm
{
    pub world: WorldID,
    pub parent: GroupID,
    pub alloc_shares: u32,
    pub min_base: u32,
    pub max_base: u32,
    pub nvcpus: u32
}

#[derive(Clone)]
pub struct BalanceSnapshot
{
    pub groups: HashMap<GroupID, SnapGroup>,
    pub vms: HashMap<WorldID, SnapVm>,
    pub total_base: u32
}

impl BalanceSnapshot
{
    /* bottom-up pass: each group's effective min covers its members'
       mins, clamped by the group's own max. also counts VSMPs per subtree */
    fn roll_up_mins(&mut self)
    {
        fn visit(snap: &mut BalanceSnapshot, id: GroupID) -> (u32, u32)
        {
            let members = match snap.groups.get(&id)
            {
                Some(g) => g.members.clone(),
                None => return (0, 0)
            };

            let mut member_min = 0u64;
            let mut count = 0u32;
            for member in members
            {
                match member
                {
                    GroupMember::Group(gid) =>
                    {
                        let (child_min, child_count) = visit(snap, gid);
                        member_min = member_min + child_min as u64;
                        count = count + child_count;
                    },
                    GroupMember::Vm(world) =>
                    {
                        if let Some(vm) = snap.vms.get(&world)
                        {
                            member_min = member_min + vm.min_base as u64;
                        }
                        count = count + 1;
                    }
                }
            }

            if let Some(g) = snap.groups.get_mut(&id)
            {
                if member_min > g.min_base as u64
                {
                    g.min_base = member_min as u32;
                }
                if g.max_base != MAX_NONE && g.min_base > g.max_base
                {
                    /* infeasible limits clamp the reservation rather than the cap */
                    g.min_base = g.max_base;
                }
                g.vsmp_count = count;
                return (g.min_base, count);
            }
            (0, 0)
        }

        visit(self, GROUP_ID_ROOT);
    }

    /* true if the other snapshot has the same shape: same groups under
       the same parents with the same external allocations, same VMs */
    pub fn same_structure(&self, other: &BalanceSnapshot) -> bool
    {
        if self.groups.len() != other.groups.len() || self.vms.len() != other.vms.len()
        {
            return false;
        }

        for (id, group) in self.groups.iter()
        {
            match other.groups.get(id)
            {
                Some(o) => if group != o { return false; },
                None => return false
            }
        }

        for (world, vm) in self.vms.iter()
        {
            match other.vms.get(world)
            {
                Some(o) => if vm != o { return false; },
                None => return false
            }
        }

        true
    }
}

#[derive(Clone, Default)]
pub struct BalancePlan
{
    pub group_base: HashMap<GroupID, BaseAlloc>,
    pub vm_base: HashMap<WorldID, BaseAlloc>
}

/* a member's claim during the balance, in base shares */
struct BalanceClaim
{
    member: GroupMember,
    alloc_shares: u32,
    min_base: u32,
    max_base: u32,
    base_shares: u32
}

/* compute base allocations for every group and VM in the snapshot.
   phase one hands each member the larger of its min and an
   alloc-proportional slice of the parent's capacity, clipped to its
   max. phase two sweeps any residual back out in decreasing chunks,
   each chunk going to the member with the smallest achieved
   base-to-alloc-shares ratio still below its max. groups then recurse
   with their base shares as capacity */
pub fn rebalance(snap: &BalanceSnapshot) -> BalancePlan
{
    let mut plan = BalancePlan::default();

    /* residual chunk sizes: roughly 1%, 0.5%, 0.25% and 0.05% of machine capacity */
    let total = snap.total_base as u64;
    let chunks = [
        core::cmp::max(total / 100, 1),
        core::cmp::max(total / 200, 1),
        core::cmp::max(total / 400, 1),
        core::cmp::max(total / 2000, 1)
    ];

    descend(snap, &mut plan, GROUP_ID_ROOT, snap.total_base, &chunks);
    plan
}

fn descend(snap: &BalanceSnapshot, plan: &mut BalancePlan, group: GroupID, capacity: u32, chunks: &[u64; 4])
{
    let node = match snap.groups.get(&group)
    {
        Some(n) => n,
        None => return
    };

    plan.group_base.insert(group, BaseAlloc
    {
        min: node.min_base,
        max: node.max_base,
        shares: capacity
    });

    if node.members.is_empty()
    {
        return;
    }

    /* gather this group's members as claims */
    let mut claims = Vec::new();
    let mut total_alloc_shares = 0u64;
    for member in node.members.iter()
    {
        let (alloc_shares, min_base, max_base) = match member
        {
            GroupMember::Group(gid) => match snap.groups.get(gid)
            {
                Some(g) => (g.alloc_shares, g.min_base, g.max_base),
                None => continue
            },
            GroupMember::Vm(world) => match snap.vms.get(world)
            {
                Some(v) => (v.alloc_shares, v.min_base, v.max_base),
                None => continue
            }
        };

        total_alloc_shares = total_alloc_shares + alloc_shares as u64;
        claims.push(BalanceClaim
        {
            member: *member,
            alloc_shares,
            min_base,
            max_base,
            base_shares: 0
        });
    }

    if total_alloc_shares == 0
    {
        return;
    }

    /* phase one: the larger of the member's reservation and a simple
       share-proportional slice of the capacity left after everyone's
       reservations, clipped to its max. max(min, prop) never sums past
       capacity because the proportional pool excludes the mins */
    let reserved: u64 = claims.iter().map(|c| c.min_base as u64).sum();
    let unreserved = (capacity as u64).saturating_sub(reserved);

    let mut handed_out = 0u64;
    for claim in claims.iter_mut()
    {
        let proportional = unreserved * claim.alloc_shares as u64 / total_alloc_shares;
        let mut share = core::cmp::max(claim.min_base as u64, proportional);
        if claim.max_base != MAX_NONE && share > claim.max_base as u64
        {
            share = claim.max_base as u64;
        }
        claim.base_shares = share as u32;
        handed_out = handed_out + share;
    }

    /* phase two: distribute the residual in decreasing chunks to the
       hungriest member still below its max */
    let mut residual = (capacity as u64).saturating_sub(handed_out);
    for chunk in chunks.iter()
    {
        while residual >= *chunk
        {
            let mut best: Option<usize> = None;
            for (idx, claim) in claims.iter().enumerate()
            {
                if claim.max_base != MAX_NONE && claim.base_shares as u64 + chunk > claim.max_base as u64
                {
                    continue;
                }

                /* smallest base/alloc ratio wins: compare by cross multiplication */
                best = match best
                {
                    None => Some(idx),
                    Some(current) =>
                    {
                        let a = &claims[idx];
                        let b = &claims[current];
                        if (a.base_shares as u64 * b.alloc_shares as u64) <
                           (b.base_shares as u64 * a.alloc_shares as u64)
                        {
                            Some(idx)
                        }
                        else
                        {
                            Some(current)
                        }
                    }
                };
            }

            match best
            {
                Some(idx) =>
                {
                    claims[idx].base_shares = claims[idx].base_shares + *chunk as u32;
                    residual = residual - *chunk;
                },
                None => break
            }
        }
    }

    /* record VM results and recurse into groups with their new capacity */
    for claim in claims.iter()
    {
        match claim.member
        {
            GroupMember::Vm(world) =>
            {
                plan.vm_base.insert(world, BaseAlloc
                {
                    min: claim.min_base,
                    max: claim.max_base,
                    shares: core::cmp::max(claim.base_shares, SHARES_MIN)
                });
            },
            GroupMember::Group(gid) =>
            {
                descend(snap, plan, gid, core::cmp::max(claim.base_shares, SHARES_MIN), chunks);
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn caps() -> MachineCaps
    {
        MachineCaps { npcpus: 4, logical_per_package: 1, mhz: 2000 }
    }

    fn run_rebalance(tree: &mut GroupTree) -> Vec<(WorldID, BaseAlloc)>
    {
        let snap = tree.begin_rebalance().unwrap();
        let plan = rebalance(&snap);
        tree.commit_rebalance(&snap, &plan).unwrap()
    }

    #[test]
    fn units_convert_to_base_shares()
    {
        let caps = caps();
        assert_eq!(caps.total_base(), 400);
        assert_eq!(caps.to_base(100, AllocUnits::Percent).unwrap(), 100);
        assert_eq!(caps.to_base(50, AllocUnits::Percent).unwrap(), 50);
        assert_eq!(caps.to_base(2000, AllocUnits::Mhz).unwrap(), 100);
        assert_eq!(caps.to_base(123, AllocUnits::Bshares).unwrap(), 123);
        assert_eq!(caps.to_base(MAX_NONE, AllocUnits::Percent).unwrap(), MAX_NONE);
    }

    #[test]
    fn bad_allocations_rejected()
    {
        let mut tree = GroupTree::new(caps());
        let g = tree.create(GROUP_ID_ROOT, "tenants").unwrap();

        /* min above max */
        let bad = Alloc::new(100, 50, 1000, AllocUnits::Bshares);
        assert_eq!(tree.set_alloc(g, bad), Err(Cause::AllocBadParam));

        /* shares out of range */
        let bad = Alloc::new(0, MAX_NONE, 0, AllocUnits::Bshares);
        assert_eq!(tree.set_alloc(g, bad), Err(Cause::AllocBadParam));
        let bad = Alloc::new(0, MAX_NONE, SHARES_MAX + 1, AllocUnits::Bshares);
        assert_eq!(tree.set_alloc(g, bad), Err(Cause::AllocBadParam));
    }

    #[test]
    fn admission_denied_when_over_reserved()
    {
        let mut tree = GroupTree::new(caps());

        /* the root reserves the whole machine: 400 base shares.
           two groups wanting 300 each can't both be admitted */
        let a = tree.create(GROUP_ID_ROOT, "a").unwrap();
        let b = tree.create(GROUP_ID_ROOT, "b").unwrap();
        assert!(tree.set_alloc(a, Alloc::new(300, MAX_NONE, 1000, AllocUnits::Bshares)).is_ok());
        assert_eq!(tree.set_alloc(b, Alloc::new(300, MAX_NONE, 1000, AllocUnits::Bshares)),
                   Err(Cause::AdmissionDenied));

        /* a group can't set its min below what its members reserve */
        assert!(tree.vm_add(100, a, Alloc::new(200, MAX_NONE, 1000, AllocUnits::Bshares), 1).is_ok());
        assert_eq!(tree.set_alloc(a, Alloc::new(100, MAX_NONE, 1000, AllocUnits::Bshares)),
                   Err(Cause::AdmissionDenied));
    }

    #[test]
    fn max_of_package_per_vcpu_is_no_max()
    {
        let mut tree = GroupTree::new(caps());
        tree.vm_add(1, GROUP_ID_ROOT, Alloc::new(0, 200, 1000, AllocUnits::Percent), 2).unwrap();
        run_rebalance(&mut tree);
        assert_eq!(tree.vm_base(1).unwrap().max, MAX_NONE);
    }

    #[test]
    fn proportional_split_two_vms()
    {
        let mut tree = GroupTree::new(caps());
        tree.vm_add(1, GROUP_ID_ROOT, Alloc::shares_only(1000), 1).unwrap();
        tree.vm_add(2, GROUP_ID_ROOT, Alloc::shares_only(3000), 1).unwrap();

        run_rebalance(&mut tree);

        let one = tree.vm_base(1).unwrap().shares as u64;
        let two = tree.vm_base(2).unwrap().shares as u64;

        /* 1:3 split of 400 base shares, allowing for chunk rounding */
        assert!(one >= 95 && one <= 105, "vm1 got {}", one);
        assert!(two >= 295 && two <= 305, "vm2 got {}", two);
        assert!(one + two <= 400);
    }

    #[test]
    fn min_respected_over_proportionality()
    {
        let mut tree = GroupTree::new(caps());

        /* tiny shares but a large reservation: the min wins */
        tree.vm_add(1, GROUP_ID_ROOT, Alloc::new(200, MAX_NONE, 1, AllocUnits::Bshares), 1).unwrap();
        tree.vm_add(2, GROUP_ID_ROOT, Alloc::shares_only(1000), 1).unwrap();

        run_rebalance(&mut tree);
        assert!(tree.vm_base(1).unwrap().shares >= 200);
    }

    #[test]
    fn group_capacity_flows_down()
    {
        let mut tree = GroupTree::new(caps());
        let g = tree.create(GROUP_ID_ROOT, "g").unwrap();
        tree.set_alloc(g, Alloc::new(160, MAX_NONE, 4000, AllocUnits::Bshares)).unwrap();

        tree.vm_add(1, g, Alloc::shares_only(1000), 1).unwrap();
        tree.vm_add(2, g, Alloc::shares_only(1000), 1).unwrap();
        tree.vm_add(3, GROUP_ID_ROOT, Alloc::shares_only(1000), 1).unwrap();

        run_rebalance(&mut tree);

        let in_a = tree.vm_base(1).unwrap().shares as u64;
        let in_b = tree.vm_base(2).unwrap().shares as u64;

        /* equal shares inside the group split the group's capacity evenly */
        let diff = if in_a > in_b { in_a - in_b } else { in_b - in_a };
        assert!(diff <= chunk_slack(&tree), "group members got {} and {}", in_a, in_b);

        /* and the group's members together got at least its reservation */
        assert!(in_a + in_b >= 160);
    }

    fn chunk_slack(tree: &GroupTree) -> u64
    {
        core::cmp::max(tree.caps().total_base() as u64 / 100, 1)
    }

    #[test]
    fn commit_fails_if_structure_changed()
    {
        let mut tree = GroupTree::new(caps());
        tree.vm_add(1, GROUP_ID_ROOT, Alloc::shares_only(1000), 1).unwrap();

        let snap = tree.begin_rebalance().unwrap();
        let plan = rebalance(&snap);

        /* a VM arrives mid-rebalance */
        tree.vm_add(2, GROUP_ID_ROOT, Alloc::shares_only(1000), 1).unwrap();

        assert_eq!(tree.commit_rebalance(&snap, &plan), Err(Cause::ReallocRetry));
        assert!(tree.is_dirty());

        /* the retry succeeds */
        let snap = tree.begin_rebalance().unwrap();
        let plan = rebalance(&snap);
        assert!(tree.commit_rebalance(&snap, &plan).is_ok());
        assert!(!tree.is_dirty());
    }

    #[test]
    fn only_one_rebalance_in_flight()
    {
        let mut tree = GroupTree::new(caps());
        let _snap = tree.begin_rebalance().unwrap();
        assert_eq!(tree.begin_rebalance().err(), Some(Cause::ReallocInProgress));
        tree.abort_rebalance();
        assert!(tree.begin_rebalance().is_ok());
    }

    #[test]
    fn paths_run_root_to_parent()
    {
        let mut tree = GroupTree::new(caps());
        let g = tree.create(GROUP_ID_ROOT, "outer").unwrap();
        let inner = tree.create(g, "inner").unwrap();
        tree.vm_add(9, inner, Alloc::shares_only(100), 1).unwrap();

        let path = tree.path_of(9).unwrap();
        assert_eq!(path[0], GROUP_ID_ROOT);
        assert_eq!(path[1], g);
        assert_eq!(path[2], inner);
        assert_eq!(path[3], GROUP_ID_INVALID);
    }

    #[test]
    fn charge_advances_clocks_along_path()
    {
        let mut tree = GroupTree::new(caps());
        let g = tree.create(GROUP_ID_ROOT, "g").unwrap();
        tree.vm_add(5, g, Alloc::shares_only(1000), 1).unwrap();
        run_rebalance(&mut tree);

        let path = tree.path_of(5).unwrap();
        let before = tree.group_vtime(g).unwrap().vtime;
        tree.charge(&path, 1000000);
        let after = tree.group_vtime(g).unwrap().vtime;
        assert!(after > before);

        /* and the published copy agrees */
        let handle = tree.clock_handle(g).unwrap();
        assert_eq!(handle.read().vtime, after);
    }

    #[test]
    fn removing_nonempty_group_refused()
    {
        let mut tree = GroupTree::new(caps());
        let g = tree.create(GROUP_ID_ROOT, "g").unwrap();
        tree.vm_add(1, g, Alloc::shares_only(100), 1).unwrap();

        assert_eq!(tree.remove(g), Err(Cause::GroupNotEmpty));
        tree.vm_remove(1).unwrap();
        assert!(tree.remove(g).is_ok());
        assert_eq!(tree.remove(g), Err(Cause::GroupBadID));
    }
}

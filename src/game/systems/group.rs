//! Group coordination
//!
//! Groups bundle AI-controlled entities around a shared target and a named
//! behavior. An entity belongs to at most one group; adding it to another
//! group moves it. A group is deleted as soon as its last member leaves.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::RwLock;
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::game::constants::group::{IDLE_TIMEOUT, UPDATE_INTERVAL};
use crate::game::constants::spatial::POOL_CAPACITY;
use crate::game::entity::{EntityId, NO_TARGET};
use crate::game::spatial::pool::{Pool, PoolStats, Poolable};
use crate::game::systems::ai::AiDriver;

new_key_type! {
    /// Generation-checked group handle; a handle to a deleted group stays invalid
    pub struct GroupId;
}

/// Named group behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GroupBehavior {
    #[default]
    Normal,
    Attack,
    Defend,
    Patrol,
}

impl GroupBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupBehavior::Normal => "normal",
            GroupBehavior::Attack => "attack",
            GroupBehavior::Defend => "defend",
            GroupBehavior::Patrol => "patrol",
        }
    }
}

impl FromStr for GroupBehavior {
    type Err = GroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(GroupBehavior::Normal),
            "attack" => Ok(GroupBehavior::Attack),
            "defend" => Ok(GroupBehavior::Defend),
            "patrol" => Ok(GroupBehavior::Patrol),
            _ => Err(GroupError::UnknownBehavior(s.to_string())),
        }
    }
}

/// Shared state of one group
#[derive(Debug, Clone, Default)]
pub struct GroupAi {
    pub members: SmallVec<[EntityId; 8]>,
    pub leader: EntityId,
    pub target_id: EntityId,
    pub formation: String,
    pub behavior: GroupBehavior,
    pub created: Option<Instant>,
    pub last_action: Option<Instant>,
}

impl GroupAi {
    /// Last time anything happened to this group
    fn last_activity(&self) -> Option<Instant> {
        self.last_action.or(self.created)
    }
}

impl Poolable for GroupAi {
    fn recycle(&mut self) {
        self.members.clear();
        self.formation.clear();
    }
}

#[derive(Default)]
struct GroupTable {
    groups: SlotMap<GroupId, GroupAi>,
    by_member: HashMap<EntityId, GroupId>,
}

impl GroupTable {
    /// Remove `member` from its group; returns the group if that emptied it
    fn detach(&mut self, member: EntityId) -> Option<GroupAi> {
        let id = self.by_member.remove(&member)?;
        let group = self.groups.get_mut(id)?;
        group.members.retain(|m| *m != member);
        if group.members.is_empty() {
            debug!("Group {:?} emptied, deleting", id);
            return self.groups.remove(id);
        }
        if group.leader == member {
            group.leader = group.members[0];
        }
        None
    }
}

/// Group behavior dispatch captured under the table lock
struct Dispatch {
    behavior: GroupBehavior,
    target: EntityId,
    members: SmallVec<[EntityId; 8]>,
}

pub struct GroupCoordinator {
    driver: Arc<AiDriver>,
    table: RwLock<GroupTable>,
    pool: Pool<GroupAi>,
    update_interval: Duration,
    idle_timeout: Duration,
}

impl GroupCoordinator {
    pub fn new(driver: Arc<AiDriver>) -> Self {
        Self::with_timing(driver, UPDATE_INTERVAL, IDLE_TIMEOUT, POOL_CAPACITY)
    }

    pub fn with_timing(
        driver: Arc<AiDriver>,
        update_interval: Duration,
        idle_timeout: Duration,
        pool_capacity: usize,
    ) -> Self {
        Self {
            driver,
            table: RwLock::new(GroupTable::default()),
            pool: Pool::new(pool_capacity),
            update_interval,
            idle_timeout,
        }
    }

    /// Create a group; the first member leads
    pub fn create_group(&self, members: &[EntityId], now: Instant) -> Result<GroupId, GroupError> {
        let mut unique: SmallVec<[EntityId; 8]> = SmallVec::new();
        for &member in members {
            if member != NO_TARGET && !unique.contains(&member) {
                unique.push(member);
            }
        }
        if unique.is_empty() {
            return Err(GroupError::EmptyMembers);
        }

        let mut group = self.pool.get();
        group.leader = unique[0];
        group.target_id = NO_TARGET;
        group.formation.clear();
        group.behavior = GroupBehavior::Normal;
        group.created = Some(now);
        group.last_action = None;
        group.members.clear();
        group.members.extend_from_slice(&unique);

        let mut table = self.table.write();
        let mut emptied = Vec::new();
        for &member in &unique {
            emptied.extend(table.detach(member));
        }
        let id = table.groups.insert(group);
        for &member in &unique {
            table.by_member.insert(member, id);
        }
        drop(table);

        self.release(emptied);
        debug!("Created group {:?} with {} members", id, unique.len());
        Ok(id)
    }

    pub fn add_member(&self, id: GroupId, member: EntityId) -> Result<(), GroupError> {
        let mut table = self.table.write();
        if !table.groups.contains_key(id) {
            return Err(GroupError::StaleHandle);
        }
        if table.by_member.get(&member) == Some(&id) {
            return Ok(());
        }
        let emptied = table.detach(member);
        if let Some(group) = table.groups.get_mut(id) {
            group.members.push(member);
        }
        table.by_member.insert(member, id);
        drop(table);

        self.release(emptied);
        Ok(())
    }

    /// Remove a member; the group is deleted once empty
    pub fn remove_member(&self, id: GroupId, member: EntityId) -> Result<(), GroupError> {
        let mut table = self.table.write();
        if !table.groups.contains_key(id) {
            return Err(GroupError::StaleHandle);
        }
        if table.by_member.get(&member) != Some(&id) {
            return Err(GroupError::NotMember(member));
        }
        let emptied = table.detach(member);
        drop(table);

        self.release(emptied);
        Ok(())
    }

    pub fn set_target(&self, id: GroupId, target: EntityId) -> Result<(), GroupError> {
        self.with_group(id, |group| group.target_id = target)
    }

    pub fn set_behavior(&self, id: GroupId, behavior: GroupBehavior) -> Result<(), GroupError> {
        self.with_group(id, |group| group.behavior = behavior)
    }

    pub fn set_formation(&self, id: GroupId, formation: &str) -> Result<(), GroupError> {
        self.with_group(id, |group| {
            group.formation.clear();
            group.formation.push_str(formation);
        })
    }

    /// Run the group's behavior unless it acted less than the update interval ago
    ///
    /// Returns `Ok(false)` when throttled.
    pub fn update(&self, id: GroupId, now: Instant) -> Result<bool, GroupError> {
        let dispatch = {
            let mut table = self.table.write();
            let group = table.groups.get_mut(id).ok_or(GroupError::StaleHandle)?;
            if let Some(last) = group.last_action {
                if now.saturating_duration_since(last) < self.update_interval {
                    return Ok(false);
                }
            }
            group.last_action = Some(now);
            Dispatch {
                behavior: group.behavior,
                target: group.target_id,
                members: group.members.clone(),
            }
        };

        trace!("Group {:?} dispatching {}", id, dispatch.behavior.as_str());
        match dispatch.behavior {
            GroupBehavior::Attack => self.attack(&dispatch),
            GroupBehavior::Defend | GroupBehavior::Patrol | GroupBehavior::Normal => {}
        }
        Ok(true)
    }

    /// Update every group; returns how many dispatched
    pub fn update_all(&self, now: Instant) -> usize {
        let ids: Vec<GroupId> = self.table.read().groups.keys().collect();
        ids.into_iter()
            .filter(|id| matches!(self.update(*id, now), Ok(true)))
            .count()
    }

    fn attack(&self, dispatch: &Dispatch) {
        if dispatch.target == NO_TARGET {
            return;
        }
        for &member in &dispatch.members {
            self.driver.assign_target(member, dispatch.target);
        }
    }

    /// Delete groups idle for longer than the idle timeout
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let mut table = self.table.write();
        let stale: Vec<GroupId> = table
            .groups
            .iter()
            .filter(|(_, group)| {
                group
                    .last_activity()
                    .is_some_and(|at| now.saturating_duration_since(at) > self.idle_timeout)
            })
            .map(|(id, _)| id)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(group) = table.groups.remove(id) {
                for member in &group.members {
                    table.by_member.remove(member);
                }
                removed.push(group);
            }
        }
        drop(table);

        let count = removed.len();
        if count > 0 {
            debug!("Swept {} idle groups", count);
        }
        self.release(removed);
        count
    }

    pub fn members(&self, id: GroupId) -> Option<Vec<EntityId>> {
        self.table.read().groups.get(id).map(|g| g.members.to_vec())
    }

    pub fn leader(&self, id: GroupId) -> Option<EntityId> {
        self.table.read().groups.get(id).map(|g| g.leader)
    }

    pub fn target(&self, id: GroupId) -> Option<EntityId> {
        self.table.read().groups.get(id).map(|g| g.target_id)
    }

    pub fn behavior(&self, id: GroupId) -> Option<GroupBehavior> {
        self.table.read().groups.get(id).map(|g| g.behavior)
    }

    pub fn formation(&self, id: GroupId) -> Option<String> {
        self.table.read().groups.get(id).map(|g| g.formation.clone())
    }

    pub fn group_of(&self, member: EntityId) -> Option<GroupId> {
        self.table.read().by_member.get(&member).copied()
    }

    pub fn len(&self) -> usize {
        self.table.read().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().groups.is_empty()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn with_group<F>(&self, id: GroupId, f: F) -> Result<(), GroupError>
    where
        F: FnOnce(&mut GroupAi),
    {
        let mut table = self.table.write();
        let group = table.groups.get_mut(id).ok_or(GroupError::StaleHandle)?;
        f(group);
        Ok(())
    }

    fn release(&self, groups: impl IntoIterator<Item = GroupAi>) {
        for group in groups {
            self.pool.put(group);
        }
    }
}

/// Group coordinator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    #[error("group handle is stale or unknown")]
    StaleHandle,
    #[error("a group needs at least one member")]
    EmptyMembers,
    #[error("entity {0} is not a member of this group")]
    NotMember(EntityId),
    #[error("unknown group behavior '{0}'")]
    UnknownBehavior(String),
}

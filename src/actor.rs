//! Actor routing: location-transparent delivery to migrating entities.
//!
//! A game entity (an "actor") lives on exactly one process at a time but may
//! migrate. The pieces here:
//!
//! - [`ActorLocationService`]: the authoritative actor -> process table,
//!   guarded by per-actor migration locks with a ttl so a crashed process
//!   cannot wedge an actor forever.
//! - [`EntityMailbox`]: per-entity FIFO of delivered messages, so an entity
//!   processes its traffic one message at a time in arrival order.
//! - [`ActorRouter`]: decides for each actor-addressed message whether it is
//!   deliverable locally or must be forwarded to the owning process.
//! - [`proto`]: the wire messages a location service host registers, plus the
//!   application error codes their responses carry.
//!
//! Resolution while a migration lock is held returns [`BastionError::LockHeld`];
//! callers retry on their next tick and see the post-migration location once
//! the mover unlocks.

use std::any::Any;
use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::{ActorId, BastionError, ConnectionId, ProcessId, RpcId};

/// One held migration lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    /// The process that took the lock.
    pub holder: ProcessId,
    /// When the lock was granted, ms.
    pub acquired_at_ms: u64,
    /// How long the lock stays valid without release.
    pub ttl_ms: u64,
}

impl LockRecord {
    /// Whether the lock has outlived its ttl.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.acquired_at_ms) >= self.ttl_ms
    }
}

/// Per-actor migration locks with ttl expiry.
#[derive(Debug, Default)]
pub struct DistributedLocks {
    locks: HashMap<ActorId, LockRecord>,
}

impl DistributedLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `actor`. An unexpired lock held by another
    /// process refuses the acquire; an expired one is silently replaced.
    /// Re-acquiring by the current holder refreshes the ttl.
    pub fn acquire(
        &mut self,
        actor: ActorId,
        holder: ProcessId,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<(), BastionError> {
        if let Some(record) = self.locks.get(&actor) {
            if !record.is_expired(now_ms) && record.holder != holder {
                return Err(BastionError::LockHeld {
                    actor,
                    holder: record.holder,
                });
            }
            if record.is_expired(now_ms) {
                debug!(%actor, holder = %record.holder, "replacing expired lock");
            }
        }
        self.locks.insert(
            actor,
            LockRecord {
                holder,
                acquired_at_ms: now_ms,
                ttl_ms,
            },
        );
        Ok(())
    }

    /// Releases the lock for `actor`. Only the holder may release.
    pub fn release(&mut self, actor: ActorId, holder: ProcessId) -> Result<(), BastionError> {
        match self.locks.get(&actor) {
            Some(record) if record.holder == holder => {
                self.locks.remove(&actor);
                Ok(())
            }
            _ => Err(BastionError::LockNotHeld { actor }),
        }
    }

    /// The live lock on `actor`, if any.
    #[must_use]
    pub fn get(&self, actor: ActorId, now_ms: u64) -> Option<&LockRecord> {
        self.locks
            .get(&actor)
            .filter(|record| !record.is_expired(now_ms))
    }
}

/// The authoritative actor -> process location table.
///
/// Hosted by one designated process; other processes talk to it with the
/// [`proto`] messages. Mutations require holding the actor's migration lock
/// when one exists.
#[derive(Debug, Default)]
pub struct ActorLocationService {
    table: HashMap<ActorId, ProcessId>,
    locks: DistributedLocks,
}

impl ActorLocationService {
    /// Creates an empty location service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `actor` as living on `process`.
    pub fn record(&mut self, actor: ActorId, process: ProcessId) {
        trace!(%actor, %process, "location recorded");
        self.table.insert(actor, process);
    }

    /// Forgets `actor` entirely (entity destroyed).
    pub fn remove(&mut self, actor: ActorId) {
        self.table.remove(&actor);
    }

    /// Resolves the owning process. While a migration lock is held the
    /// location is in flux and resolution fails with [`BastionError::LockHeld`].
    pub fn resolve(&self, actor: ActorId, now_ms: u64) -> Result<ProcessId, BastionError> {
        if let Some(record) = self.locks.get(actor, now_ms) {
            return Err(BastionError::LockHeld {
                actor,
                holder: record.holder,
            });
        }
        self.table
            .get(&actor)
            .copied()
            .ok_or(BastionError::ActorLocationNotFound { actor })
    }

    /// Takes the migration lock for `actor` on behalf of `holder`.
    pub fn lock(
        &mut self,
        actor: ActorId,
        holder: ProcessId,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<(), BastionError> {
        self.locks.acquire(actor, holder, ttl_ms, now_ms)
    }

    /// Releases the migration lock and records the post-migration location in
    /// one step, so no resolver can observe the gap between them.
    pub fn unlock(
        &mut self,
        actor: ActorId,
        holder: ProcessId,
        new_process: ProcessId,
    ) -> Result<(), BastionError> {
        self.locks.release(actor, holder)?;
        self.table.insert(actor, new_process);
        debug!(%actor, %new_process, "migration completed");
        Ok(())
    }
}

/// One message delivered to a local entity.
#[derive(Debug)]
pub struct MailboxEntry {
    /// The connection the message arrived on; replies go back here.
    pub origin: ConnectionId,
    /// The rpc id to answer, for actor requests.
    pub rpc_id: Option<RpcId>,
    /// The decoded message.
    pub message: Box<dyn Any + Send>,
}

/// FIFO of messages awaiting processing by one local entity.
#[derive(Debug, Default)]
pub struct EntityMailbox {
    queue: VecDeque<MailboxEntry>,
}

impl EntityMailbox {
    /// Appends a delivered message.
    pub fn push(&mut self, entry: MailboxEntry) {
        self.queue.push_back(entry);
    }

    /// Pops the oldest unprocessed message.
    pub fn pop(&mut self) -> Option<MailboxEntry> {
        self.queue.pop_front()
    }

    /// Messages currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the mailbox is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Where an actor-addressed message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Queued into a local entity's mailbox.
    Delivered,
    /// The actor lives elsewhere; forward the original envelope there.
    Forward(ProcessId),
}

/// Routes actor-addressed messages between local mailboxes and remote
/// processes.
#[derive(Debug)]
pub struct ActorRouter {
    process: ProcessId,
    mailboxes: HashMap<ActorId, EntityMailbox>,
    /// Local replica of the location table, refreshed by the host from the
    /// location service's responses.
    locations: HashMap<ActorId, ProcessId>,
}

impl ActorRouter {
    /// Creates a router for the process we are running as.
    #[must_use]
    pub fn new(process: ProcessId) -> Self {
        ActorRouter {
            process,
            mailboxes: HashMap::new(),
            locations: HashMap::new(),
        }
    }

    /// The local process id.
    #[must_use]
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Registers a locally hosted entity, giving it a mailbox.
    pub fn register_entity(&mut self, actor: ActorId) {
        self.mailboxes.entry(actor).or_default();
        self.locations.insert(actor, self.process);
    }

    /// Unregisters a local entity. Returns any undelivered messages so the
    /// host can fail their rpcs instead of dropping them silently.
    pub fn unregister_entity(&mut self, actor: ActorId) -> Vec<MailboxEntry> {
        self.locations.remove(&actor);
        match self.mailboxes.remove(&actor) {
            Some(mut mailbox) => mailbox.queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Caches a remote actor's location, learned from the location service.
    pub fn cache_location(&mut self, actor: ActorId, process: ProcessId) {
        self.locations.insert(actor, process);
    }

    /// Drops a cached location after a forward bounced, forcing a re-resolve.
    pub fn invalidate_location(&mut self, actor: ActorId) {
        if !self.mailboxes.contains_key(&actor) {
            self.locations.remove(&actor);
        }
    }

    /// Routes one actor-addressed message.
    ///
    /// Local actors get the entry queued; known-remote actors yield a forward
    /// decision. An actor cached as local but with no mailbox is gone, and an
    /// actor with no cached location needs a resolve round-trip first.
    pub fn route(
        &mut self,
        actor: ActorId,
        entry: MailboxEntry,
    ) -> Result<RouteOutcome, BastionError> {
        if let Some(mailbox) = self.mailboxes.get_mut(&actor) {
            mailbox.push(entry);
            return Ok(RouteOutcome::Delivered);
        }
        match self.locations.get(&actor) {
            Some(&process) if process == self.process => {
                // Cached as local but no mailbox: destroyed under us.
                self.locations.remove(&actor);
                Err(BastionError::ActorNotFound { actor })
            }
            Some(&process) => Ok(RouteOutcome::Forward(process)),
            None => Err(BastionError::ActorLocationNotFound { actor }),
        }
    }

    /// Pops the next pending message for a local entity.
    pub fn next_message(&mut self, actor: ActorId) -> Option<MailboxEntry> {
        self.mailboxes.get_mut(&actor).and_then(EntityMailbox::pop)
    }

    /// Queued message count for a local entity, 0 if not local.
    #[must_use]
    pub fn mailbox_len(&self, actor: ActorId) -> usize {
        self.mailboxes.get(&actor).map_or(0, EntityMailbox::len)
    }
}

/// Wire messages and error codes for talking to the location service.
pub mod proto {
    use serde::{Deserialize, Serialize};

    use crate::registry::ResponseBody;
    use crate::{ActorId, ProcessId};

    /// Application error codes carried in location-service responses. `0`
    /// always means success.
    pub mod codes {
        /// No location recorded for the actor.
        pub const LOCATION_NOT_FOUND: u32 = 100_002;
        /// The migration lock is held by another process.
        pub const LOCK_HELD: u32 = 100_003;
        /// Release attempted by a process that does not hold the lock.
        pub const LOCK_NOT_HELD: u32 = 100_004;
        /// The actor does not exist on its owning process.
        pub const ACTOR_NOT_FOUND: u32 = 100_005;
    }

    /// Records an actor's location.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocationAddRequest {
        /// The actor being recorded.
        pub actor: ActorId,
        /// The process that now hosts it.
        pub process: ProcessId,
    }

    /// Response to [`LocationAddRequest`].
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocationAddResponse {
        /// Error code, 0 on success.
        pub error: u32,
    }

    impl ResponseBody for LocationAddResponse {
        fn error_code(&self) -> u32 {
            self.error
        }
    }

    /// Removes an actor's location (entity destroyed).
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocationRemoveRequest {
        /// The actor being forgotten.
        pub actor: ActorId,
    }

    /// Response to [`LocationRemoveRequest`].
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocationRemoveResponse {
        /// Error code, 0 on success.
        pub error: u32,
    }

    impl ResponseBody for LocationRemoveResponse {
        fn error_code(&self) -> u32 {
            self.error
        }
    }

    /// Takes the migration lock for an actor.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocationLockRequest {
        /// The actor to lock.
        pub actor: ActorId,
        /// The process requesting the lock.
        pub holder: ProcessId,
        /// Lock lifetime in milliseconds.
        pub ttl_ms: u64,
    }

    /// Response to [`LocationLockRequest`].
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocationLockResponse {
        /// Error code, 0 on success.
        pub error: u32,
    }

    impl ResponseBody for LocationLockResponse {
        fn error_code(&self) -> u32 {
            self.error
        }
    }

    /// Releases the migration lock and records the new location atomically.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocationUnlockRequest {
        /// The locked actor.
        pub actor: ActorId,
        /// The process releasing (must be the holder).
        pub holder: ProcessId,
        /// Where the actor lives after migration.
        pub new_process: ProcessId,
    }

    /// Response to [`LocationUnlockRequest`].
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocationUnlockResponse {
        /// Error code, 0 on success.
        pub error: u32,
    }

    impl ResponseBody for LocationUnlockResponse {
        fn error_code(&self) -> u32 {
            self.error
        }
    }

    /// Resolves an actor's owning process.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocationGetRequest {
        /// The actor to resolve.
        pub actor: ActorId,
    }

    /// Response to [`LocationGetRequest`].
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LocationGetResponse {
        /// Error code, 0 on success.
        pub error: u32,
        /// The owning process; meaningful only when `error` is 0.
        pub process: Option<ProcessId>,
    }

    impl ResponseBody for LocationGetResponse {
        fn error_code(&self) -> u32 {
            self.error
        }
    }
}

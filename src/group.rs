//! Poll groups.
//!
//! A poll group is a set of sockets serviced together. Each poll cycle
//! flushes every member's queued writes, pumps transport events once, and
//! reports which data sockets have something to read.

use crate::driver::SockDriver;
use crate::error::{AbortReason, Error};
use crate::socket::{Handle, Socket};
use crate::types::{GroupId, SockId, SockKind};
use tracing::{debug, warn};

/// Membership and fairness state of one poll group.
#[derive(Debug, Default)]
pub(crate) struct PollGroup {
    pub(crate) members: Vec<SockId>,
    /// Position the next collection pass starts from.
    pub(crate) cursor: usize,
}

impl SockDriver {
    /// Create an empty poll group.
    pub fn create_group(&mut self) -> GroupId {
        let id = GroupId::new(self.groups.insert(PollGroup::default()));
        debug!(group = id.as_usize(), "create group");
        id
    }

    /// Add a socket to a group. A socket belongs to at most one group.
    pub fn add_to_group(&mut self, gid: GroupId, id: SockId) -> Result<(), Error> {
        if !self.groups.contains(gid.as_usize()) {
            return Err(Error::InvalidGroup);
        }
        let sock = self.socket_mut(id)?;
        if sock.group.is_some() {
            return Err(Error::AlreadyInGroup);
        }
        sock.group = Some(gid);
        self.groups[gid.as_usize()].members.push(id);
        Ok(())
    }

    /// Remove a socket from its group.
    ///
    /// Every queued write on the socket is completed with
    /// [`AbortReason::RemovedFromGroup`].
    pub fn remove_from_group(&mut self, gid: GroupId, id: SockId) -> Result<(), Error> {
        if !self.groups.contains(gid.as_usize()) {
            return Err(Error::InvalidGroup);
        }
        if self.socket(id)?.group != Some(gid) {
            return Err(Error::NotInGroup);
        }
        self.detach(gid, id);
        self.abort_requests(id, AbortReason::RemovedFromGroup)?;
        Ok(())
    }

    /// Destroy an empty group.
    pub fn close_group(&mut self, gid: GroupId) -> Result<(), Error> {
        let group = self
            .groups
            .get(gid.as_usize())
            .ok_or(Error::InvalidGroup)?;
        if !group.members.is_empty() {
            return Err(Error::GroupBusy(group.members.len()));
        }
        self.groups.remove(gid.as_usize());
        debug!(group = gid.as_usize(), "close group");
        Ok(())
    }

    /// Current members of a group, in insertion order.
    pub fn group_members(&self, gid: GroupId) -> Result<&[SockId], Error> {
        self.groups
            .get(gid.as_usize())
            .map(|g| g.members.as_slice())
            .ok_or(Error::InvalidGroup)
    }

    /// Run one poll cycle and return up to `max_events` read-ready data
    /// sockets.
    ///
    /// 1. Every data member is flushed. A member whose flush fails has its
    ///    queued writes aborted; the cycle carries on with the others.
    /// 2. Transport events are pumped once.
    /// 3. Members are scanned from a rotating start position and data
    ///    sockets with pending input are collected. Listening sockets are
    ///    never reported.
    ///
    /// Callbacks fired during step 1 may add, remove or close members; a
    /// socket that left the group before its turn is skipped.
    pub fn poll_group(&mut self, gid: GroupId, max_events: usize) -> Result<Vec<SockId>, Error> {
        let members = self
            .groups
            .get(gid.as_usize())
            .ok_or(Error::InvalidGroup)?
            .members
            .clone();

        for id in members {
            if !self.in_group(gid, id) || !matches!(self.kind(id), Ok(SockKind::Data)) {
                continue;
            }
            if let Err(e) = self.flush(id) {
                warn!(sock = ?id, error = %e, "flush failed, aborting queued writes");
                if let Err(e) = self.abort_requests(id, AbortReason::from(&e)) {
                    debug!(sock = ?id, error = %e, "socket gone before abort");
                }
            }
        }

        self.transport.pump_events().map_err(Error::Transport)?;

        let Self {
            sockets, groups, ..
        } = self;
        let group = groups.get_mut(gid.as_usize()).ok_or(Error::InvalidGroup)?;

        let mut ready = Vec::new();
        let n = group.members.len();
        if n == 0 || max_events == 0 {
            return Ok(ready);
        }

        let start = group.cursor % n;
        let mut examined = 0;
        while examined < n && ready.len() < max_events {
            let id = group.members[(start + examined) % n];
            examined += 1;

            let Some(Socket {
                handle: Handle::Data(stream),
                ..
            }) = sockets
                .get(id.slot())
                .filter(|s| s.generation == id.generation())
            else {
                continue;
            };
            if stream.has_readable_data() {
                ready.push(id);
            }
        }
        group.cursor = (start + examined) % n;

        Ok(ready)
    }

    /// Drop `id` from the member list of `gid` without touching its queue.
    pub(crate) fn detach(&mut self, gid: GroupId, id: SockId) {
        if let Some(group) = self.groups.get_mut(gid.as_usize())
            && let Some(pos) = group.members.iter().position(|m| *m == id)
        {
            group.members.remove(pos);
            if pos < group.cursor {
                group.cursor -= 1;
            }
        }
        if let Ok(sock) = self.socket_mut(id) {
            sock.group = None;
        }
    }

    fn in_group(&self, gid: GroupId, id: SockId) -> bool {
        self.socket(id).is_ok_and(|s| s.group == Some(gid))
    }
}

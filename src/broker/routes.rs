use std::collections::HashMap;

use super::channel::{ChannelHandle, ChannelId};
use crate::protocol::{PageId, Role};

/// Per-role map of page → channel. At most one route per `(page, role)`.
#[derive(Debug, Default)]
pub struct RoutingTable {
    by_role: [HashMap<PageId, ChannelHandle>; 3],
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the route for `(page, role)`, returning the handle it replaced.
    pub fn register(&mut self, page: PageId, role: Role, handle: ChannelHandle) -> Option<ChannelHandle> {
        self.by_role[role.index()].insert(page, handle)
    }

    pub fn get(&self, page: PageId, role: Role) -> Option<&ChannelHandle> {
        self.by_role[role.index()].get(&page)
    }

    pub fn contains(&self, page: PageId, role: Role) -> bool {
        self.by_role[role.index()].contains_key(&page)
    }

    /// Removes the route of `role` bound to exactly this channel.
    ///
    /// Returns the page it served, or `None` when the channel holds no route
    /// (never registered, or already replaced by a newer handshake).
    pub fn remove_by_handle(&mut self, role: Role, id: ChannelId) -> Option<PageId> {
        let table = &mut self.by_role[role.index()];
        let page = table
            .iter()
            .find_map(|(page, handle)| (handle.id() == id).then_some(*page))?;
        table.remove(&page);
        Some(page)
    }

    /// Removes `(page, role)` only if it is still bound to `id`.
    pub fn remove_if_held(&mut self, page: PageId, role: Role, id: ChannelId) -> bool {
        let table = &mut self.by_role[role.index()];
        if table.get(&page).is_some_and(|h| h.id() == id) {
            table.remove(&page);
            true
        } else {
            false
        }
    }

    /// Number of active routes for a role.
    pub fn len(&self, role: Role) -> usize {
        self.by_role[role.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_role.iter().all(HashMap::is_empty)
    }
}

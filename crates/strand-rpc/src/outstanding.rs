use std::collections::HashMap;

/// Two-way requests awaiting a reply, keyed by request id.
///
/// Ids are positive, start at 1 and wrap back to 1 after `i32::MAX`; 0 is reserved for
/// one-way requests. The table is only touched with the connection lock held; callers run the
/// returned handles' callbacks after releasing it.
#[derive(Debug)]
pub struct OutstandingTable<H> {
    next_id: i32,
    entries: HashMap<i32, H>,
}

impl<H> Default for OutstandingTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> OutstandingTable<H> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Allocate the next request id.
    pub fn next_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = if id == i32::MAX { 1 } else { id + 1 };
        id
    }

    /// Track `handle` under `id`. Gives the handle back if `id` is already outstanding.
    pub fn register(&mut self, id: i32, handle: H) -> Result<(), H> {
        debug_assert!(id > 0, "one-way requests have no outstanding entry");
        if self.entries.contains_key(&id) {
            return Err(handle);
        }
        self.entries.insert(id, handle);
        Ok(())
    }

    /// Remove the entry a reply with `id` answers.
    pub fn complete_and_remove(&mut self, id: i32) -> Option<H> {
        self.entries.remove(&id)
    }

    /// Remove the entry for a canceled request.
    pub fn cancel(&mut self, id: i32) -> Option<H> {
        self.entries.remove(&id)
    }

    /// Drain every entry. A second call returns nothing.
    pub fn fail_all(&mut self) -> Vec<(i32, H)> {
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    pub fn contains(&self, id: i32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&mut self, id: i32) {
        self.next_id = id;
    }
}

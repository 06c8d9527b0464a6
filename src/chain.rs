//! Chain: insertion-ordered, doubly-linked list of entries for one bucket.
//!
//! Nodes live in a `SlotMap` arena and link to each other through
//! generational keys rather than raw pointers, so unlinking stays O(1)
//! without aliasing. Each node's storage is a pool `Block`; the chain never
//! allocates or frees pool memory itself. Callers allocate a node before
//! pushing it and free the block returned by `unlink` / `drain`, which keeps
//! pool traffic outside whatever lock guards the chain.
//!
//! The arena's slot vector is the one piece of storage that does come from
//! the process heap. It grows fallibly: a `push_back` that cannot reserve a
//! slot hands its node back instead of aborting.

use crate::pool::Block;
use slotmap::{DefaultKey, SlotMap};

/// One key/value node. `prev`/`next` are only meaningful inside the chain
/// that owns the node.
#[derive(Debug)]
pub(crate) struct Link<V> {
    key: u32,
    value: V,
    prev: Option<DefaultKey>,
    next: Option<DefaultKey>,
}

impl<V> Link<V> {
    pub(crate) fn new(key: u32, value: V) -> Self {
        Self {
            key,
            value,
            prev: None,
            next: None,
        }
    }

    pub(crate) fn key(&self) -> u32 {
        self.key
    }

    pub(crate) fn value(&self) -> &V {
        &self.value
    }

    pub(crate) fn into_value(self) -> V {
        self.value
    }
}

#[derive(Debug)]
pub(crate) struct Chain<V> {
    links: SlotMap<DefaultKey, Block<Link<V>>>,
    head: Option<DefaultKey>,
    tail: Option<DefaultKey>,
    // Simulated exhaustion: reservations fail once this many nodes are held.
    #[cfg(test)]
    slot_limit: Option<usize>,
}

impl<V> Chain<V> {
    pub(crate) fn new() -> Self {
        Self {
            links: SlotMap::with_key(),
            head: None,
            tail: None,
            #[cfg(test)]
            slot_limit: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    /// Append a node after the current tail.
    ///
    /// Returns the node untouched, leaving the chain as it was, when the
    /// arena cannot grow to hold it.
    pub(crate) fn push_back(
        &mut self,
        mut node: Block<Link<V>>,
    ) -> Result<DefaultKey, Block<Link<V>>> {
        if !self.reserve_slot() {
            return Err(node);
        }
        node.prev = self.tail;
        node.next = None;
        let k = self.links.insert(node);
        match self.tail {
            Some(t) => self.links[t].next = Some(k),
            None => self.head = Some(k),
        }
        self.tail = Some(k);
        Ok(k)
    }

    fn reserve_slot(&mut self) -> bool {
        !self.at_slot_limit() && self.links.try_reserve(1).is_ok()
    }

    #[cfg(not(test))]
    fn at_slot_limit(&self) -> bool {
        false
    }

    #[cfg(test)]
    fn at_slot_limit(&self) -> bool {
        self.slot_limit.is_some_and(|limit| self.links.len() >= limit)
    }

    #[cfg(test)]
    pub(crate) fn set_slot_limit(&mut self, limit: Option<usize>) {
        self.slot_limit = limit;
    }

    /// First node in chain order whose key matches.
    pub(crate) fn find(&self, key: u32) -> Option<DefaultKey> {
        let mut cur = self.head;
        while let Some(k) = cur {
            let link = &self.links[k];
            if link.key == key {
                return Some(k);
            }
            cur = link.next;
        }
        None
    }

    pub(crate) fn get_mut(&mut self, k: DefaultKey) -> Option<&mut Link<V>> {
        self.links.get_mut(k).map(|b| &mut **b)
    }

    /// Detach a node, repairing neighbour links and the endpoints.
    pub(crate) fn unlink(&mut self, k: DefaultKey) -> Option<Block<Link<V>>> {
        let node = self.links.remove(k)?;
        match node.prev {
            Some(p) => self.links[p].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.links[n].prev = node.prev,
            None => self.tail = node.prev,
        }
        Some(node)
    }

    /// Detach every node; the chain is empty afterwards.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Block<Link<V>>> + '_ {
        self.head = None;
        self.tail = None;
        self.links.drain().map(|(_, node)| node)
    }

    /// Walk from head to tail.
    pub(crate) fn iter(&self) -> Iter<'_, V> {
        Iter {
            links: &self.links,
            cur: self.head,
        }
    }

    /// Panics if the forward and backward walks disagree.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        assert_eq!(self.head.is_none(), self.tail.is_none());
        assert_eq!(self.head.is_none(), self.links.is_empty());

        let mut forward = Vec::new();
        let mut prev = None;
        let mut cur = self.head;
        while let Some(k) = cur {
            let link = &self.links[k];
            assert_eq!(link.prev, prev, "prev link out of sync");
            forward.push(k);
            prev = Some(k);
            cur = link.next;
        }
        assert_eq!(prev, self.tail);
        assert_eq!(forward.len(), self.links.len());

        let mut backward = Vec::new();
        let mut cur = self.tail;
        while let Some(k) = cur {
            backward.push(k);
            cur = self.links[k].prev;
        }
        backward.reverse();
        assert_eq!(forward, backward);
    }
}

pub(crate) struct Iter<'a, V> {
    links: &'a SlotMap<DefaultKey, Block<Link<V>>>,
    cur: Option<DefaultKey>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (u32, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let k = self.cur?;
        let links = self.links;
        let link: &'a Link<V> = &links[k];
        self.cur = link.next;
        Some((link.key, &link.value))
    }
}

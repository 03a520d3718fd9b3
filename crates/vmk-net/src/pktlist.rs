//! Ownership-transferring packet lists.
//!
//! A [`PacketList`] is a doubly-linked sequence of [`Packet`]s stored in a
//! per-list slab. Elements are addressed by [`PktRef`], which records the
//! owning list, so handing a reference from one list to another is caught
//! instead of corrupting either list.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::pkt::Packet;

const NIL: u32 = u32::MAX;

static NEXT_LIST_ID: AtomicU64 = AtomicU64::new(1);

/// Position of a packet inside one particular list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PktRef {
    list: u64,
    slot: u32,
    gen: u32,
}

struct Node {
    pkt: Option<Packet>,
    prev: u32,
    next: u32,
    gen: u32,
}

/// Ordered list of packets with O(1) insertion and removal.
pub struct PacketList {
    id: u64,
    nodes: Vec<Node>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    count: usize,
    may_modify: bool,
}

impl Default for PacketList {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketList {
    pub fn new() -> Self {
        Self {
            id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            count: 0,
            may_modify: true,
        }
    }

    /// Resets the list to empty. Packets still queued are released.
    pub fn init(&mut self) {
        if self.count != 0 {
            warn!(list = self.id, count = self.count, "init on non-empty packet list");
            self.release_all();
        }
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether chains may consume or reorder this list in place. A list
    /// shared by several destinations is marked read-only and chains that
    /// modify lists work on a clone.
    pub fn may_modify(&self) -> bool {
        self.may_modify
    }

    pub fn set_may_modify(&mut self, may_modify: bool) {
        self.may_modify = may_modify;
    }

    /// Total frame bytes queued.
    pub fn byte_count(&self) -> usize {
        self.iter().map(Packet::len).sum()
    }

    fn alloc(&mut self, pkt: Packet) -> u32 {
        match self.free.pop() {
            Some(slot) => {
                let node = &mut self.nodes[slot as usize];
                node.pkt = Some(pkt);
                node.prev = NIL;
                node.next = NIL;
                slot
            }
            None => {
                self.nodes.push(Node {
                    pkt: Some(pkt),
                    prev: NIL,
                    next: NIL,
                    gen: 0,
                });
                (self.nodes.len() - 1) as u32
            }
        }
    }

    fn make_ref(&self, slot: u32) -> PktRef {
        PktRef {
            list: self.id,
            slot,
            gen: self.nodes[slot as usize].gen,
        }
    }

    fn resolve(&self, r: PktRef) -> Option<u32> {
        if r.list != self.id {
            return None;
        }
        let node = self.nodes.get(r.slot as usize)?;
        (node.gen == r.gen && node.pkt.is_some()).then_some(r.slot)
    }

    fn violation(&self, op: &str, r: PktRef) {
        debug_assert!(
            false,
            "{op}: packet ref {r:?} is not an element of list {}",
            self.id
        );
        warn!(list = self.id, other = r.list, "{op}: packet is not an element of this list");
    }

    fn link_between(&mut self, slot: u32, prev: u32, next: u32) {
        self.nodes[slot as usize].prev = prev;
        self.nodes[slot as usize].next = next;
        if prev == NIL {
            self.head = slot;
        } else {
            self.nodes[prev as usize].next = slot;
        }
        if next == NIL {
            self.tail = slot;
        } else {
            self.nodes[next as usize].prev = slot;
        }
        self.count += 1;
    }

    fn unlink(&mut self, slot: u32) -> Packet {
        let (prev, next) = {
            let node = &self.nodes[slot as usize];
            (node.prev, node.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next as usize].prev = prev;
        }
        self.count -= 1;

        let node = &mut self.nodes[slot as usize];
        node.gen = node.gen.wrapping_add(1);
        node.prev = NIL;
        node.next = NIL;
        let pkt = node.pkt.take();
        self.free.push(slot);
        // resolve() guarantees the slot was occupied
        pkt.unwrap_or_else(|| Packet::new(Vec::new()))
    }

    pub fn add_to_tail(&mut self, pkt: Packet) -> PktRef {
        let slot = self.alloc(pkt);
        let tail = self.tail;
        self.link_between(slot, tail, NIL);
        self.make_ref(slot)
    }

    pub fn add_to_head(&mut self, pkt: Packet) -> PktRef {
        let slot = self.alloc(pkt);
        let head = self.head;
        self.link_between(slot, NIL, head);
        self.make_ref(slot)
    }

    /// Inserts `pkt` right after `at`. A foreign `at` is a contract
    /// violation; release builds fall back to appending at the tail.
    pub fn insert_after(&mut self, at: PktRef, pkt: Packet) -> PktRef {
        match self.resolve(at) {
            Some(prev) => {
                let next = self.nodes[prev as usize].next;
                let slot = self.alloc(pkt);
                self.link_between(slot, prev, next);
                self.make_ref(slot)
            }
            None => {
                self.violation("insert_after", at);
                self.add_to_tail(pkt)
            }
        }
    }

    /// Inserts `pkt` right before `at`.
    pub fn insert_before(&mut self, at: PktRef, pkt: Packet) -> PktRef {
        match self.resolve(at) {
            Some(next) => {
                let prev = self.nodes[next as usize].prev;
                let slot = self.alloc(pkt);
                self.link_between(slot, prev, next);
                self.make_ref(slot)
            }
            None => {
                self.violation("insert_before", at);
                self.add_to_head(pkt)
            }
        }
    }

    pub fn head(&self) -> Option<PktRef> {
        (self.head != NIL).then(|| self.make_ref(self.head))
    }

    pub fn tail(&self) -> Option<PktRef> {
        (self.tail != NIL).then(|| self.make_ref(self.tail))
    }

    pub fn next(&self, r: PktRef) -> Option<PktRef> {
        let slot = self.resolve(r)?;
        let next = self.nodes[slot as usize].next;
        (next != NIL).then(|| self.make_ref(next))
    }

    pub fn prev(&self, r: PktRef) -> Option<PktRef> {
        let slot = self.resolve(r)?;
        let prev = self.nodes[slot as usize].prev;
        (prev != NIL).then(|| self.make_ref(prev))
    }

    pub fn get(&self, r: PktRef) -> Option<&Packet> {
        let slot = self.resolve(r)?;
        self.nodes[slot as usize].pkt.as_ref()
    }

    /// Unlinks and returns the packet at `r`. Removing something that is not
    /// an element of this list is a contract violation.
    pub fn remove(&mut self, r: PktRef) -> Option<Packet> {
        match self.resolve(r) {
            Some(slot) => Some(self.unlink(slot)),
            None => {
                self.violation("remove", r);
                None
            }
        }
    }

    pub fn pop_head(&mut self) -> Option<Packet> {
        (self.head != NIL).then(|| self.unlink(self.head))
    }

    /// Moves every element of `src` to the tail of `self`, in order.
    pub fn join(&mut self, src: &mut PacketList) {
        while let Some(pkt) = src.pop_head() {
            self.add_to_tail(pkt);
        }
    }

    /// Moves at most `n` head elements of `src` to the tail of `self`.
    /// Returns the number moved.
    pub fn append_n(&mut self, src: &mut PacketList, n: usize) -> usize {
        let mut moved = 0;
        while moved < n {
            match src.pop_head() {
                Some(pkt) => {
                    self.add_to_tail(pkt);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Detaches `at` and everything after it into a new list.
    pub fn split_off(&mut self, at: PktRef) -> PacketList {
        let mut rest = PacketList::new();
        rest.may_modify = self.may_modify;
        let Some(mut slot) = self.resolve(at) else {
            self.violation("split_off", at);
            return rest;
        };
        loop {
            let next = self.nodes[slot as usize].next;
            rest.add_to_tail(self.unlink(slot));
            if next == NIL {
                break;
            }
            slot = next;
        }
        rest
    }

    /// Removes every packet matching `pred` into a new list, preserving the
    /// relative order of both the extracted and the remaining packets.
    pub fn take_matching(&mut self, mut pred: impl FnMut(&Packet) -> bool) -> PacketList {
        let mut taken = PacketList::new();
        let mut cur = self.head;
        while cur != NIL {
            let next = self.nodes[cur as usize].next;
            if self.nodes[cur as usize].pkt.as_ref().is_some_and(&mut pred) {
                taken.add_to_tail(self.unlink(cur));
            }
            cur = next;
        }
        taken
    }

    /// Drains the list, completing each packet exactly once.
    pub fn complete_all(&mut self) {
        while let Some(pkt) = self.pop_head() {
            pkt.complete();
        }
    }

    /// Drains the list, releasing each packet exactly once.
    pub fn release_all(&mut self) {
        while let Some(pkt) = self.pop_head() {
            pkt.release();
        }
    }

    /// Returns a list of shared-frame handles for the first `n` packets.
    pub fn clone_n(&self, n: usize) -> PacketList {
        self.iter().take(n).map(Packet::clone_handle).collect()
    }

    /// Returns a list of shared-frame handles for every packet.
    pub fn clone_list(&self) -> PacketList {
        self.clone_n(self.count)
    }

    /// Returns a list with private copies of every frame.
    pub fn copy_list(&self) -> PacketList {
        self.iter().map(Packet::deep_copy).collect()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.head,
        }
    }

    /// Iterates the list by popping from the head.
    pub fn drain(&mut self) -> Drain<'_> {
        Drain { list: self }
    }

    /// Number of elements reachable walking forward from the head.
    pub fn forward_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while cur != NIL && n <= self.nodes.len() {
            n += 1;
            cur = self.nodes[cur as usize].next;
        }
        n
    }

    /// Number of elements reachable walking backward from the tail.
    pub fn backward_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.tail;
        while cur != NIL && n <= self.nodes.len() {
            n += 1;
            cur = self.nodes[cur as usize].prev;
        }
        n
    }
}

impl FromIterator<Packet> for PacketList {
    fn from_iter<I: IntoIterator<Item = Packet>>(iter: I) -> Self {
        let mut list = PacketList::new();
        for pkt in iter {
            list.add_to_tail(pkt);
        }
        list
    }
}

impl fmt::Debug for PacketList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketList")
            .field("id", &self.id)
            .field("count", &self.count)
            .field("may_modify", &self.may_modify)
            .finish()
    }
}

/// Borrowing iterator over a [`PacketList`].
pub struct Iter<'a> {
    list: &'a PacketList,
    cur: u32,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Packet;

    fn next(&mut self) -> Option<&'a Packet> {
        while self.cur != NIL {
            let node = &self.list.nodes[self.cur as usize];
            self.cur = node.next;
            if let Some(pkt) = node.pkt.as_ref() {
                return Some(pkt);
            }
        }
        None
    }
}

/// Draining iterator over a [`PacketList`].
pub struct Drain<'a> {
    list: &'a mut PacketList,
}

impl Iterator for Drain<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        self.list.pop_head()
    }
}

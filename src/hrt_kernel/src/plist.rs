//! Descending-priority-sorted list
//!
//! [`PList`] keeps its entries sorted by priority (lower value = more urgent)
//! and, among entries of equal priority, by arrival order. Entries live in an
//! arena and are linked on two tiers:
//!
//!  - The *distinct-priority* tier holds one anchor per priority value present,
//!    in ascending order of priority value.
//!  - The *serialized* tier holds every entry (anchors included) in the final
//!    order.
//!
//! ```text
//!  tier 1:   [10] ------------> [20] -------> [35]
//!             |                  |             |
//!  tier 2:   [10] -> 10 -> 10 -> [20] -> 20 -> [35]
//! ```
//!
//! Insertion walks tier 1 only, so it costs O(K) where K is the number of
//! distinct priorities, however many entries there are. Removal and lookup of
//! the most urgent entry are O(1).
use core::fmt;
use slab::Slab;

/// A priority value. Lower values are more urgent.
pub type Priority = i32;

/// Identifies an entry of a [`PList`]. Stays valid until the entry is
/// removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    #[inline]
    pub(crate) const fn into_raw(self) -> usize {
        self.0
    }

    #[inline]
    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
}

struct Node<T> {
    prio: Priority,
    value: T,
    /// Serialized tier
    sp: Link,
    /// Distinct-priority tier. `Some(_)` iff this node is the anchor of its
    /// priority.
    dp: Option<Link>,
}

/// A priority-sorted list with FIFO ordering among equal priorities.
pub struct PList<T> {
    nodes: Slab<Node<T>>,
    dp_head: Option<usize>,
    dp_tail: Option<usize>,
    sp_head: Option<usize>,
    sp_tail: Option<usize>,
}

impl<T> PList<T> {
    pub const fn new() -> Self {
        Self {
            nodes: Slab::new(),
            dp_head: None,
            dp_tail: None,
            sp_head: None,
            sp_tail: None,
        }
    }

    /// Get the number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sp_head.is_none()
    }

    /// Get the priority of the most urgent entry.
    #[inline]
    pub fn first_prio(&self) -> Option<Priority> {
        self.dp_head.map(|i| self.nodes[i].prio)
    }

    /// Get the most urgent entry. Among entries of equal priority, the one
    /// inserted first is returned.
    #[inline]
    pub fn peek_highest(&self) -> Option<(NodeId, &T)> {
        self.sp_head.map(|i| (NodeId(i), &self.nodes[i].value))
    }

    /// Remove and return the most urgent entry.
    pub fn pop_highest(&mut self) -> Option<T> {
        let i = self.sp_head?;
        Some(self.remove(NodeId(i)).0)
    }

    /// Get the entry identified by `id`.
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(id.0).map(|n| &n.value)
    }

    /// Get the entry identified by `id`.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(id.0).map(|n| &mut n.value)
    }

    /// Get the priority of the entry identified by `id`.
    pub fn prio(&self, id: NodeId) -> Option<Priority> {
        self.nodes.get(id.0).map(|n| n.prio)
    }

    /// Iterate over the entries from the most urgent to the least urgent.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, Priority, &T)> + '_ {
        let mut cur = self.sp_head;
        core::iter::from_fn(move || {
            let i = cur?;
            let node = &self.nodes[i];
            cur = node.sp.next;
            Some((NodeId(i), node.prio, &node.value))
        })
    }

    /// Insert `value` with priority `prio` behind all entries of the same or
    /// more urgent priority.
    ///
    /// Returns the new entry's ID and whether the most urgent priority of the
    /// list changed.
    pub fn insert(&mut self, value: T, prio: Priority) -> (NodeId, bool) {
        let old_first = self.first_prio();
        let i = self.nodes.insert(Node {
            prio,
            value,
            sp: Link::default(),
            dp: None,
        });
        self.link(i);
        (NodeId(i), self.first_prio() != old_first)
    }

    /// Remove the entry identified by `id`.
    ///
    /// Returns the entry's value and whether the most urgent priority of the
    /// list changed.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not identify an entry of this list.
    pub fn remove(&mut self, id: NodeId) -> (T, bool) {
        assert!(self.nodes.contains(id.0), "plist: no such entry");
        let old_first = self.first_prio();
        self.unlink(id.0);
        let node = self.nodes.remove(id.0);
        (node.value, self.first_prio() != old_first)
    }

    /// Change the priority of the entry identified by `id`. The entry moves
    /// behind all entries of the new priority, even if the priority did not
    /// change. `id` stays valid.
    ///
    /// Returns whether the most urgent priority of the list changed.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not identify an entry of this list.
    pub fn change_priority(&mut self, id: NodeId, prio: Priority) -> bool {
        assert!(self.nodes.contains(id.0), "plist: no such entry");
        let old_first = self.first_prio();
        self.unlink(id.0);
        self.nodes[id.0].prio = prio;
        self.link(id.0);
        self.first_prio() != old_first
    }

    fn dp(&self, i: usize) -> Link {
        match self.nodes[i].dp {
            Some(link) => link,
            None => panic!("plist: entry {i} is not an anchor"),
        }
    }

    fn dp_mut(&mut self, i: usize) -> &mut Link {
        match &mut self.nodes[i].dp {
            Some(link) => link,
            None => panic!("plist: entry {i} is not an anchor"),
        }
    }

    /// Link an unlinked node `i` into both tiers.
    fn link(&mut self, i: usize) {
        let prio = self.nodes[i].prio;

        // Find the first anchor not more urgent than `prio`
        let mut cur = self.dp_head;
        let mut last_prio = None;
        while let Some(a) = cur {
            let a_prio = self.nodes[a].prio;
            if last_prio.map_or(false, |p| p >= a_prio) {
                panic!("plist: duplicate or misordered anchor for priority {a_prio}");
            }
            if a_prio >= prio {
                break;
            }
            last_prio = Some(a_prio);
            cur = self.dp(a).next;
        }

        match cur {
            Some(a) if self.nodes[a].prio == prio => {
                // Join the tail of the existing group, which ends right
                // before the next group's anchor
                let next_anchor = self.dp(a).next;
                self.nodes[i].dp = None;
                self.sp_insert_before(i, next_anchor);
            }
            _ => {
                // Become a new anchor in front of `cur`'s group
                self.dp_insert_before(i, cur);
                self.sp_insert_before(i, cur);
            }
        }
    }

    /// Unlink node `i` from both tiers, promoting the next node of the same
    /// priority to anchor if needed.
    fn unlink(&mut self, i: usize) {
        if self.nodes[i].dp.is_some() {
            let prio = self.nodes[i].prio;
            match self.nodes[i].sp.next {
                Some(n) if self.nodes[n].prio == prio => {
                    if self.nodes[n].dp.is_some() {
                        panic!("plist: duplicate anchor for priority {prio}");
                    }
                    self.dp_replace(i, n);
                }
                _ => self.dp_unlink(i),
            }
        }
        self.sp_unlink(i);
    }

    /// Insert `i` into the serialized tier before `before` (or at the tail).
    fn sp_insert_before(&mut self, i: usize, before: Option<usize>) {
        let prev = match before {
            Some(b) => self.nodes[b].sp.prev,
            None => self.sp_tail,
        };
        self.nodes[i].sp = Link { prev, next: before };
        match prev {
            Some(p) => self.nodes[p].sp.next = Some(i),
            None => self.sp_head = Some(i),
        }
        match before {
            Some(b) => self.nodes[b].sp.prev = Some(i),
            None => self.sp_tail = Some(i),
        }
    }

    fn sp_unlink(&mut self, i: usize) {
        let Link { prev, next } = self.nodes[i].sp;
        match prev {
            Some(p) => self.nodes[p].sp.next = next,
            None => self.sp_head = next,
        }
        match next {
            Some(n) => self.nodes[n].sp.prev = prev,
            None => self.sp_tail = prev,
        }
        self.nodes[i].sp = Link::default();
    }

    /// Insert `i` into the distinct-priority tier before `before` (or at the
    /// tail).
    fn dp_insert_before(&mut self, i: usize, before: Option<usize>) {
        let prev = match before {
            Some(b) => self.dp(b).prev,
            None => self.dp_tail,
        };
        self.nodes[i].dp = Some(Link { prev, next: before });
        match prev {
            Some(p) => self.dp_mut(p).next = Some(i),
            None => self.dp_head = Some(i),
        }
        match before {
            Some(b) => self.dp_mut(b).prev = Some(i),
            None => self.dp_tail = Some(i),
        }
    }

    fn dp_unlink(&mut self, i: usize) {
        let Link { prev, next } = self.dp(i);
        match prev {
            Some(p) => self.dp_mut(p).next = next,
            None => self.dp_head = next,
        }
        match next {
            Some(n) => self.dp_mut(n).prev = prev,
            None => self.dp_tail = prev,
        }
        self.nodes[i].dp = None;
    }

    /// Put `new` in `old`'s place on the distinct-priority tier.
    fn dp_replace(&mut self, old: usize, new: usize) {
        let link = self.dp(old);
        self.nodes[old].dp = None;
        self.nodes[new].dp = Some(link);
        match link.prev {
            Some(p) => self.dp_mut(p).next = Some(new),
            None => self.dp_head = Some(new),
        }
        match link.next {
            Some(n) => self.dp_mut(n).prev = Some(new),
            None => self.dp_tail = Some(new),
        }
    }
}

impl<T> Default for PList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for PList<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|(_, prio, value)| (prio, value)))
            .finish()
    }
}

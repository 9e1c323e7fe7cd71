//! Recall ids and recycling contexts.
//!
//! A [`RecyclingContext`] names one concurrent playback instance: the slice
//! of recyclings it covers plus its place in the tree of nested contexts (a
//! note inside a pattern inside a master context). A [`RecallId`] ties a
//! context to the sound scope it is played in.

use std::sync::{Arc, Mutex, Weak};

use vesper_types::{ContextId, SoundScope};

use crate::recycling::Recycling;
use crate::{flag_set, lock, next_id};

#[derive(Default)]
struct ContextInner {
    parent: Weak<RecyclingContext>,
    children: Vec<Arc<RecyclingContext>>,
    recycling: Vec<Weak<Recycling>>,
    recall_id: Weak<RecallId>,
}

pub struct RecyclingContext {
    id: ContextId,
    inner: Mutex<ContextInner>,
}

impl std::fmt::Debug for RecyclingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecyclingContext").field("id", &self.id).finish()
    }
}

impl RecyclingContext {
    /// A context with `length` empty recycling slots.
    pub fn new(length: usize) -> Arc<Self> {
        Self::from_slots(vec![Weak::new(); length], Weak::new())
    }

    /// A context covering `recycling` in order.
    pub fn with_recycling(recycling: &[Arc<Recycling>]) -> Arc<Self> {
        Self::from_slots(recycling.iter().map(Arc::downgrade).collect(), Weak::new())
    }

    fn from_slots(recycling: Vec<Weak<Recycling>>, parent: Weak<RecyclingContext>) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId::new(next_id()),
            inner: Mutex::new(ContextInner {
                parent,
                recycling,
                ..ContextInner::default()
            }),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).recycling.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live recyclings in slot order; empty or dropped slots are skipped.
    pub fn recycling(&self) -> Vec<Arc<Recycling>> {
        lock(&self.inner)
            .recycling
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn get(&self, position: usize) -> Option<Arc<Recycling>> {
        lock(&self.inner).recycling.get(position).and_then(Weak::upgrade)
    }

    pub fn parent(&self) -> Option<Arc<RecyclingContext>> {
        lock(&self.inner).parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<RecyclingContext>> {
        lock(&self.inner).children.clone()
    }

    pub fn has_children(&self) -> bool {
        !lock(&self.inner).children.is_empty()
    }

    pub fn recall_id(&self) -> Option<Arc<RecallId>> {
        lock(&self.inner).recall_id.upgrade()
    }

    /// Number of ancestors above this context.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(ctx) = current {
            depth += 1;
            current = ctx.parent();
        }
        depth
    }

    /// The root of this context's tree.
    pub fn toplevel(self: &Arc<Self>) -> Arc<RecyclingContext> {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Put `recycling` into slot `position`. Out of range positions are rejected.
    pub fn replace(&self, recycling: &Arc<Recycling>, position: usize) -> bool {
        let mut inner = lock(&self.inner);
        match inner.recycling.get_mut(position) {
            Some(slot) => {
                *slot = Arc::downgrade(recycling);
                true
            }
            None => false,
        }
    }

    fn derive(&self, edit: impl FnOnce(&mut Vec<Weak<Recycling>>)) -> Arc<RecyclingContext> {
        let (mut slots, parent) = {
            let inner = lock(&self.inner);
            (inner.recycling.clone(), inner.parent.clone())
        };
        edit(&mut slots);
        Self::from_slots(slots, parent)
    }

    /// A new context with `recycling` appended. `self` is unchanged.
    pub fn add(&self, recycling: &Arc<Recycling>) -> Arc<RecyclingContext> {
        self.derive(|slots| slots.push(Arc::downgrade(recycling)))
    }

    /// A new context without `recycling`. `self` is unchanged.
    pub fn remove(&self, recycling: &Recycling) -> Arc<RecyclingContext> {
        self.derive(|slots| slots.retain(|w| !std::ptr::eq(w.as_ptr(), recycling)))
    }

    /// A new context with `recycling` inserted at `position` (clamped).
    pub fn insert(&self, recycling: &Arc<Recycling>, position: usize) -> Arc<RecyclingContext> {
        self.derive(|slots| {
            let at = position.min(slots.len());
            slots.insert(at, Arc::downgrade(recycling));
        })
    }

    /// Slot index of `recycling`.
    pub fn find(&self, recycling: &Recycling) -> Option<usize> {
        lock(&self.inner)
            .recycling
            .iter()
            .position(|w| std::ptr::eq(w.as_ptr(), recycling))
    }

    /// Index of the first child context that covers `recycling`.
    pub fn find_child(&self, recycling: &Recycling) -> Option<usize> {
        self.children()
            .iter()
            .position(|child| child.find(recycling).is_some())
    }

    /// Slot index of `recycling` in the parent context.
    pub fn find_parent(&self, recycling: &Recycling) -> Option<usize> {
        self.parent().and_then(|parent| parent.find(recycling))
    }

    pub fn add_child(self: &Arc<Self>, child: &Arc<RecyclingContext>) {
        lock(&child.inner).parent = Arc::downgrade(self);
        let mut inner = lock(&self.inner);
        if !inner.children.iter().any(|c| Arc::ptr_eq(c, child)) {
            inner.children.push(child.clone());
        }
    }

    pub fn remove_child(&self, child: &RecyclingContext) -> bool {
        let removed = {
            let mut inner = lock(&self.inner);
            let before = inner.children.len();
            inner.children.retain(|c| !std::ptr::eq(c.as_ref(), child));
            before != inner.children.len()
        };
        if removed {
            lock(&child.inner).parent = Weak::new();
        }
        removed
    }

    /// Recall ids of the direct child contexts.
    pub fn child_recall_ids(&self) -> Vec<Arc<RecallId>> {
        self.children()
            .iter()
            .filter_map(|child| child.recall_id())
            .collect()
    }

    /// Replace the slot range `old_first..=old_last` with the sibling chain
    /// `new_first..=new_last`. Returns the new context, or `None` when the
    /// old range is not part of this context.
    pub fn reset_recycling(
        &self,
        old_first: &Recycling,
        old_last: &Recycling,
        new_first: Option<&Arc<Recycling>>,
        new_last: Option<&Arc<Recycling>>,
    ) -> Option<Arc<RecyclingContext>> {
        let first = self.find(old_first)?;
        let last = self.find(old_last)?;
        if last < first {
            return None;
        }
        let replacement: Vec<Weak<Recycling>> = match new_first {
            Some(start) => Recycling::chain(start, new_last)
                .iter()
                .map(Arc::downgrade)
                .collect(),
            None => Vec::new(),
        };
        Some(self.derive(|slots| {
            slots.splice(first..=last, replacement).for_each(drop);
        }))
    }
}

flag_set!(
    /// Sync state of a recall id within one tick.
    RecallIdFlags {
        PRE_SYNC_ASYNC_DONE = 0;
        INTER_SYNC_ASYNC_DONE = 1;
        POST_SYNC_ASYNC_DONE = 2;
        PLAYBACK = 3;
        SEQUENCER = 4;
        NOTATION = 5;
        DONE = 6;
    }
);

/// Groups the recalls of one concurrent playback instance.
pub struct RecallId {
    scope: SoundScope,
    context: Arc<RecyclingContext>,
    flags: Mutex<RecallIdFlags>,
}

impl std::fmt::Debug for RecallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecallId")
            .field("scope", &self.scope)
            .field("context", &self.context.id())
            .finish()
    }
}

impl RecallId {
    /// Bind `context` to `scope`. The context keeps a weak link back.
    pub fn new(scope: SoundScope, context: Arc<RecyclingContext>) -> Arc<Self> {
        let flags = match scope {
            SoundScope::Playback => RecallIdFlags::PLAYBACK,
            SoundScope::Sequencer => RecallIdFlags::SEQUENCER,
            SoundScope::Notation => RecallIdFlags::NOTATION,
            SoundScope::Wave | SoundScope::Midi => RecallIdFlags::NONE,
        };
        let id = Arc::new(Self {
            scope,
            context,
            flags: Mutex::new(flags),
        });
        lock(&id.context.inner).recall_id = Arc::downgrade(&id);
        id
    }

    pub fn scope(&self) -> SoundScope {
        self.scope
    }

    pub fn context(&self) -> &Arc<RecyclingContext> {
        &self.context
    }

    pub fn flags(&self) -> RecallIdFlags {
        *lock(&self.flags)
    }

    pub fn set_flags(&self, flags: RecallIdFlags) {
        lock(&self.flags).insert(flags);
    }

    pub fn unset_flags(&self, flags: RecallIdFlags) {
        lock(&self.flags).remove(flags);
    }

    pub fn is_done(&self) -> bool {
        self.flags().contains(RecallIdFlags::DONE)
    }

    pub fn matches_context(&self, context: &RecyclingContext) -> bool {
        std::ptr::eq(self.context.as_ref(), context)
    }

    pub fn find_by_context(
        ids: &[Arc<RecallId>],
        context: &RecyclingContext,
    ) -> Option<Arc<RecallId>> {
        ids.iter().find(|id| id.matches_context(context)).cloned()
    }

    /// The id in `ids` whose context is the parent of `context`.
    pub fn find_parent_context(
        ids: &[Arc<RecallId>],
        context: &RecyclingContext,
    ) -> Option<Arc<RecallId>> {
        let parent = context.parent()?;
        Self::find_by_context(ids, &parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> Vec<Arc<Recycling>> {
        let nodes: Vec<_> = (0..n).map(|_| Recycling::new()).collect();
        Recycling::link_chain(&nodes);
        nodes
    }

    #[test]
    fn add_remove_insert_leave_original_untouched() {
        let nodes = chain(3);
        let ctx = RecyclingContext::with_recycling(&nodes[..1]);

        let added = ctx.add(&nodes[1]);
        assert_eq!(ctx.len(), 1);
        assert_eq!(added.len(), 2);
        assert_eq!(added.find(&nodes[1]), Some(1));

        let inserted = added.insert(&nodes[2], 0);
        assert_eq!(inserted.find(&nodes[2]), Some(0));
        assert_eq!(inserted.find(&nodes[0]), Some(1));

        let removed = inserted.remove(&nodes[0]);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed.find(&nodes[0]), None);
        assert_eq!(inserted.len(), 3);
    }

    #[test]
    fn replace_in_range_only() {
        let nodes = chain(2);
        let ctx = RecyclingContext::new(1);
        assert!(ctx.replace(&nodes[0], 0));
        assert!(!ctx.replace(&nodes[1], 1));
        assert!(Arc::ptr_eq(&ctx.get(0).unwrap(), &nodes[0]));
    }

    #[test]
    fn tree_queries() {
        let nodes = chain(2);
        let root = RecyclingContext::with_recycling(&nodes);
        let child = RecyclingContext::with_recycling(&nodes[1..]);
        let grandchild = RecyclingContext::new(0);
        root.add_child(&child);
        child.add_child(&grandchild);

        assert_eq!(grandchild.depth(), 2);
        assert!(Arc::ptr_eq(&grandchild.toplevel(), &root));
        assert_eq!(root.find_child(&nodes[1]), Some(0));
        assert_eq!(root.find_child(&nodes[0]), None);
        assert_eq!(child.find_parent(&nodes[1]), Some(1));

        assert!(root.remove_child(&child));
        assert!(child.parent().is_none());
        assert_eq!(child.depth(), 0);
    }

    #[test]
    fn child_recall_ids_follow_weak_links() {
        let root = RecyclingContext::new(0);
        let child = RecyclingContext::new(0);
        root.add_child(&child);
        assert!(root.child_recall_ids().is_empty());

        let id = RecallId::new(SoundScope::Notation, child.clone());
        assert!(id.flags().contains(RecallIdFlags::NOTATION));
        let ids = root.child_recall_ids();
        assert_eq!(ids.len(), 1);
        assert!(Arc::ptr_eq(&ids[0], &id));
        drop(ids);
        drop(id);
        assert!(root.child_recall_ids().is_empty());
    }

    #[test]
    fn reset_recycling_swaps_a_range() {
        let old = chain(4);
        let new = chain(3);
        let ctx = RecyclingContext::with_recycling(&old);
        let reset = ctx
            .reset_recycling(&old[1], &old[2], Some(&new[0]), Some(&new[2]))
            .unwrap();
        let live = reset.recycling();
        assert_eq!(live.len(), 5);
        assert!(Arc::ptr_eq(&live[0], &old[0]));
        assert!(Arc::ptr_eq(&live[1], &new[0]));
        assert!(Arc::ptr_eq(&live[3], &new[2]));
        assert!(Arc::ptr_eq(&live[4], &old[3]));

        assert!(ctx.reset_recycling(&new[0], &new[1], None, None).is_none());
    }

    #[test]
    fn find_recall_ids_by_context() {
        let root = RecyclingContext::new(0);
        let child = RecyclingContext::new(0);
        root.add_child(&child);
        let ids = vec![
            RecallId::new(SoundScope::Playback, root.clone()),
            RecallId::new(SoundScope::Playback, child.clone()),
        ];
        let found = RecallId::find_by_context(&ids, &child).unwrap();
        assert!(Arc::ptr_eq(&found, &ids[1]));
        let parent = RecallId::find_parent_context(&ids, &child).unwrap();
        assert!(Arc::ptr_eq(&parent, &ids[0]));
        assert!(RecallId::find_parent_context(&ids, &root).is_none());
    }
}

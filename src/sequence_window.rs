use crate::message_id::MessageId;
use anyhow::bail;
use std::collections::VecDeque;

/// Fixed-span sliding window mapping monotonically increasing message ids to
///  slots. Valid key range is `head_id ..< head_id + span` (with wrap-around
///  semantics); referencing an id outside that range is a contract violation.
///
/// Slots are stored by offset from `head_id` and grown lazily, so memory is
///  bounded by the ids actually in flight rather than the full span. A slot
///  is 'defined' while it holds a value; erasing the value at the head (and
///  any contiguous erased run behind it) advances the window.
pub struct SequenceWindow<M> {
    head_id: MessageId,
    span: u32,
    slots: VecDeque<Option<M>>,
}

impl<M> SequenceWindow<M> {
    pub fn new(start_id: MessageId, span: u32) -> SequenceWindow<M> {
        assert!(span > 0 && span < (1 << 31), "window span must be in (0, 2^31)");
        SequenceWindow {
            head_id: start_id,
            span,
            slots: VecDeque::new(),
        }
    }

    /// Resets the window to a new start id, clearing all slots.
    pub fn reinit(&mut self, start_id: MessageId) {
        self.head_id = start_id;
        self.slots.clear();
    }

    pub fn head_id(&self) -> MessageId {
        self.head_id
    }

    pub fn span(&self) -> u32 {
        self.span
    }

    pub fn in_window(&self, id: MessageId) -> bool {
        id.offset_from(self.head_id) < self.span
    }

    /// True iff `id` is behind the window, i.e. stale / duplicate.
    pub fn pre_window(&self, id: MessageId) -> bool {
        id.is_before(self.head_id)
    }

    /// Grows the slot storage as needed so `id` is addressable and returns
    ///  its slot. Fails if `id` is outside the window.
    pub fn slot_mut(&mut self, id: MessageId) -> anyhow::Result<&mut Option<M>> {
        if !self.in_window(id) {
            bail!("message id {} outside window [{}, {})", id, self.head_id, self.head_id.plus(self.span));
        }
        let offset = id.offset_from(self.head_id) as usize;
        while self.slots.len() <= offset {
            self.slots.push_back(None);
        }
        Ok(&mut self.slots[offset])
    }

    pub fn get(&self, id: MessageId) -> Option<&M> {
        if !self.in_window(id) {
            return None;
        }
        self.slots
            .get(id.offset_from(self.head_id) as usize)
            .and_then(|slot| slot.as_ref())
    }

    /// Erases the slot at `id` and purges the window head. Pre-window ids
    ///  are ignored (regular stale data); ids beyond the window are a
    ///  contract violation.
    pub fn remove(&mut self, id: MessageId) -> anyhow::Result<Option<M>> {
        if self.pre_window(id) {
            return Ok(None);
        }
        let removed = self.slot_mut(id)?.take();
        self.purge();
        Ok(removed)
    }

    /// Advances `head_id` past the contiguous run of erased leading slots.
    pub fn purge(&mut self) {
        while matches!(self.slots.front(), Some(None)) {
            self.slots.pop_front();
            self.head_id = self.head_id.next();
        }
    }

    /// True iff the slot at `head_id` holds a defined message.
    pub fn head_defined(&self) -> bool {
        matches!(self.slots.front(), Some(Some(_)))
    }

    pub fn n_defined(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Ids of all defined slots, in ascending order.
    pub fn defined_ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        let head = self.head_id;
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(move |(offset, _)| head.plus(offset as u32))
    }

    pub fn iter_defined_mut(&mut self) -> impl Iterator<Item = (MessageId, &mut M)> + '_ {
        let head = self.head_id;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(move |(offset, slot)| slot.as_mut().map(|m| (head.plus(offset as u32), m)))
    }
}

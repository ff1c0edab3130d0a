use std::collections::BTreeSet;

/// Which physical slot holds which piece.
///
/// The mapping is injective: a slot holds at most one piece. Slots that
/// hold nothing are *holes*; `allocated` records whether a slot's bytes
/// exist on disk, so the background allocator knows what to fill.
#[derive(Debug, Clone)]
pub struct PlacementMap {
    piece_to_slot: Vec<Option<usize>>,
    slot_to_piece: Vec<Option<usize>>,
    holes: BTreeSet<usize>,
    allocated: Vec<bool>,
    out_of_place: usize,
}

impl PlacementMap {
    /// Every slot starts as an unallocated hole.
    pub fn new(count: usize) -> Self {
        Self {
            piece_to_slot: vec![None; count],
            slot_to_piece: vec![None; count],
            holes: (0..count).collect(),
            allocated: vec![false; count],
            out_of_place: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slot_to_piece.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot_to_piece.is_empty()
    }

    pub fn slot_of(&self, piece: usize) -> Option<usize> {
        self.piece_to_slot.get(piece).copied().flatten()
    }

    pub fn piece_at(&self, slot: usize) -> Option<usize> {
        self.slot_to_piece.get(slot).copied().flatten()
    }

    pub fn is_hole(&self, slot: usize) -> bool {
        self.holes.contains(&slot)
    }

    /// Number of pieces stored away from their natural slot.
    pub fn out_of_place(&self) -> usize {
        self.out_of_place
    }

    /// Puts `piece` into the free `slot`. Returns false, changing nothing,
    /// if either is already placed.
    pub fn place(&mut self, piece: usize, slot: usize) -> bool {
        if piece >= self.len() || slot >= self.len() {
            return false;
        }
        if self.piece_to_slot[piece].is_some() || self.slot_to_piece[slot].is_some() {
            return false;
        }
        self.piece_to_slot[piece] = Some(slot);
        self.slot_to_piece[slot] = Some(piece);
        self.holes.remove(&slot);
        self.allocated[slot] = true;
        if piece != slot {
            self.out_of_place += 1;
        }
        true
    }

    /// Frees the slot holding `piece`, turning it back into a hole.
    pub fn unplace(&mut self, piece: usize) -> Option<usize> {
        let slot = self.piece_to_slot.get_mut(piece)?.take()?;
        self.slot_to_piece[slot] = None;
        self.holes.insert(slot);
        if piece != slot {
            self.out_of_place -= 1;
        }
        Some(slot)
    }

    /// Lowest hole that may take `piece`.
    ///
    /// The final slot is reserved for the final piece, which may be
    /// shorter than the others.
    pub fn lowest_hole_for(&self, piece: usize) -> Option<usize> {
        let last = self.len().checked_sub(1)?;
        if piece == last {
            return self.is_hole(last).then_some(last);
        }
        self.holes.iter().copied().find(|&slot| slot != last)
    }

    pub fn is_allocated(&self, slot: usize) -> bool {
        self.allocated.get(slot).copied().unwrap_or(false)
    }

    pub fn mark_allocated(&mut self, slot: usize) {
        if let Some(flag) = self.allocated.get_mut(slot) {
            *flag = true;
        }
    }

    /// Lowest hole whose bytes have never been written.
    pub fn next_unallocated_hole(&self) -> Option<usize> {
        self.holes
            .iter()
            .copied()
            .find(|&slot| !self.allocated[slot])
    }

    /// `(piece, slot)` for every piece stored away from its natural slot,
    /// ordered by piece.
    pub fn nontrivial(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.piece_to_slot
            .iter()
            .enumerate()
            .filter_map(|(piece, slot)| match slot {
                Some(slot) if *slot != piece => Some((piece, *slot)),
                _ => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_is_injective() {
        let mut map = PlacementMap::new(4);
        assert!(map.place(2, 0));
        assert!(!map.place(3, 0));
        assert!(!map.place(2, 1));
        assert_eq!(map.slot_of(2), Some(0));
        assert_eq!(map.piece_at(0), Some(2));
        assert_eq!(map.out_of_place(), 1);
        assert_eq!(map.nontrivial().collect::<Vec<_>>(), vec![(2, 0)]);
    }

    #[test]
    fn test_unplace_restores_hole() {
        let mut map = PlacementMap::new(3);
        map.place(1, 0);
        assert!(!map.is_hole(0));
        assert_eq!(map.unplace(1), Some(0));
        assert!(map.is_hole(0));
        assert!(map.is_allocated(0));
        assert_eq!(map.out_of_place(), 0);
        assert_eq!(map.unplace(1), None);
    }

    #[test]
    fn test_last_slot_reserved() {
        let mut map = PlacementMap::new(3);
        map.place(0, 0);
        map.place(1, 1);
        assert_eq!(map.lowest_hole_for(1), None);
        assert_eq!(map.lowest_hole_for(2), Some(2));
    }

    #[test]
    fn test_next_unallocated_hole() {
        let mut map = PlacementMap::new(3);
        map.mark_allocated(0);
        assert_eq!(map.next_unallocated_hole(), Some(1));
        map.place(1, 1);
        assert_eq!(map.next_unallocated_hole(), Some(2));
    }
}

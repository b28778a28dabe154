//! cursor walks the cells of a table btree in key order.
//!
//! Nodes on disk have no parent pointers, so the cursor materializes the
//! path from the root to its current leaf cell as a trail of
//! (node, cell index) pairs. Each trail entry owns its node, which keeps the
//! pager's page alive for exactly as long as the entry is on the trail.

use streaming_iterator::StreamingIterator;

use super::cell::Cell;
use super::node::Node;
use super::{BTree, Error};
use crate::pager::PageNum;

/// What the cursor was opened for. The storage core treats both kinds the
/// same; the distinction is recorded for the execution layer above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorMode {
    #[default]
    Unspecified,
    Read,
    Write,
}

// One step of the root-to-leaf path. For an interior node, `cell_index` in
// 0..n_cells names the child pointer last descended; n_cells names the right
// page. For the leaf at the top of the trail it names the current cell.
#[derive(Debug)]
struct TrailEntry {
    node: Node,
    cell_index: u16,
}

/// A stateful iterator over one table btree.
///
/// After [`Cursor::rewind`] the cursor sits on the first (or, rewinding
/// backward, the last) leaf cell, available via [`Cursor::cell`]. Each
/// successful [`Cursor::table_move`] shifts it one cell over. A failed move
/// reports [`Error::CursorCantMove`] and leaves the trail where it was, so a
/// move in the opposite direction remains well-defined.
#[derive(Debug)]
pub struct Cursor {
    pub mode: CursorMode,
    root_page: PageNum,
    trail: Vec<TrailEntry>,
    current: Option<Cell<'static>>,
}

impl Cursor {
    /// Creates a cursor over the tree rooted at `root_page`, positioned on
    /// the root. Call [`Cursor::rewind`] before reading or moving.
    pub fn new(tree: &mut BTree, root_page: PageNum) -> Result<Cursor, Error> {
        let root = tree.node(root_page)?;
        Ok(Cursor {
            mode: CursorMode::default(),
            root_page,
            trail: vec![TrailEntry {
                node: root,
                cell_index: 0,
            }],
            current: None,
        })
    }

    pub fn root_page(&self) -> PageNum {
        self.root_page
    }

    /// The leaf cell the cursor sits on, or None on an empty tree.
    pub fn cell(&self) -> Option<&Cell<'static>> {
        self.current.as_ref()
    }

    /// Drops the trail and descends from the root again: to the first leaf
    /// cell when `forward`, to the last one otherwise.
    pub fn rewind(&mut self, tree: &mut BTree, forward: bool) -> Result<(), Error> {
        self.trail.clear();
        let root = tree.node(self.root_page)?;
        let cell_index = if forward { 0 } else { root.n_cells };
        self.trail.push(TrailEntry {
            node: root,
            cell_index,
        });
        self.table_down(tree, forward)
    }

    /// Steps one leaf cell forward or backward.
    pub fn table_move(&mut self, tree: &mut BTree, forward: bool) -> Result<(), Error> {
        if !self.can_move(forward) {
            return Err(Error::CursorCantMove);
        }
        let advanced = match self.trail.last_mut() {
            None => return Err(Error::CursorCantMove),
            Some(top) => {
                debug_assert!(top.node.page_type.is_leaf(), "trail must end at a leaf");
                if forward && top.cell_index + 1 < top.node.n_cells {
                    top.cell_index += 1;
                    true
                } else if !forward && top.cell_index > 0 {
                    top.cell_index -= 1;
                    true
                } else {
                    false
                }
            }
        };
        if advanced {
            return self.refresh_current();
        }
        self.trail.pop();
        self.table_up(tree, forward)
    }

    // Resumes the walk in the parent after a child was exhausted. Advances
    // the top entry's child position and descends, or pops again when the
    // parent is exhausted too.
    fn table_up(&mut self, tree: &mut BTree, forward: bool) -> Result<(), Error> {
        loop {
            let advanced = match self.trail.last_mut() {
                None => return Err(Error::CursorCantMove),
                Some(top) => {
                    if forward {
                        top.cell_index += 1;
                        top.cell_index <= top.node.n_cells
                    } else if top.cell_index > 0 {
                        top.cell_index -= 1;
                        true
                    } else {
                        false
                    }
                }
            };
            if advanced {
                return self.table_down(tree, forward);
            }
            self.trail.pop();
        }
    }

    // Descends from the top trail entry to a leaf, following the entry's
    // current child position, then first children (forward) or last children
    // (backward), and caches the leaf cell arrived at.
    fn table_down(&mut self, tree: &mut BTree, forward: bool) -> Result<(), Error> {
        loop {
            {
                let top = self
                    .trail
                    .last_mut()
                    .expect("trail is never empty during descent");
                if top.node.page_type.is_leaf() {
                    if !forward {
                        top.cell_index = top.node.n_cells.saturating_sub(1);
                    }
                    break;
                }
            }
            let top = self.trail.last().expect("trail checked non-empty above");
            let next_page = if top.cell_index < top.node.n_cells {
                top.node
                    .get_cell(top.cell_index)?
                    .child()
                    .expect("interior cells carry a child page")
            } else {
                top.node
                    .right_page
                    .expect("interior nodes carry a right page")
            };
            let node = tree.node(next_page)?;
            let cell_index = if forward { 0 } else { node.n_cells };
            self.trail.push(TrailEntry { node, cell_index });
        }
        self.refresh_current()
    }

    // True if some trail entry still has a cell (leaf) or child pointer
    // (interior) left in the given direction. Checked before any entry is
    // popped so a failing move does not disturb the trail.
    fn can_move(&self, forward: bool) -> bool {
        self.trail.iter().any(|e| {
            if e.node.page_type.is_leaf() {
                if forward {
                    e.cell_index + 1 < e.node.n_cells
                } else {
                    e.cell_index > 0
                }
            } else if forward {
                e.cell_index < e.node.n_cells
            } else {
                e.cell_index > 0
            }
        })
    }

    fn refresh_current(&mut self) -> Result<(), Error> {
        let top = self.trail.last().expect("trail holds the current leaf");
        self.current = if top.node.n_cells == 0 {
            None
        } else {
            Some(top.node.get_cell(top.cell_index)?)
        };
        Ok(())
    }
}

/// Iterates over the cells of one table btree, in ascending key order.
///
/// Wraps a [`Cursor`] as a `StreamingIterator`: `advance` rewinds on first
/// use and steps forward after that, `get` exposes the cursor's cached cell.
pub struct CursorCells<'t> {
    tree: &'t mut BTree,
    cursor: Cursor,
    started: bool,
    done: bool,
}

impl<'t> CursorCells<'t> {
    pub fn new(tree: &'t mut BTree, root_page: PageNum) -> Result<CursorCells<'t>, Error> {
        let cursor = Cursor::new(tree, root_page)?;
        Ok(CursorCells {
            tree,
            cursor,
            started: false,
            done: false,
        })
    }
}

impl StreamingIterator for CursorCells<'_> {
    type Item = Cell<'static>;

    #[inline]
    fn advance(&mut self) {
        // TODO: pass through errors instead of treating them as exhaustion?
        if self.done {
            return;
        }
        if !self.started {
            self.started = true;
            self.cursor
                .rewind(self.tree, true)
                .expect("Should have rewound cursor.");
            if self.cursor.cell().is_none() {
                self.done = true;
            }
        } else if self.cursor.table_move(self.tree, true).is_err() {
            self.done = true;
        }
    }

    #[inline]
    fn get(&self) -> Option<&Self::Item> {
        if self.done {
            None
        } else {
            self.cursor.cell()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_tree(page_size: u32) -> (tempfile::TempDir, BTree) {
        let dir = tempfile::TempDir::new().expect("Should have created temp dir.");
        let path = dir.path().join("cursor_test.cdb");
        let tree =
            BTree::open_with_page_size(path.to_str().expect("Should have path str."), page_size)
                .expect("Should have opened btree.");
        (dir, tree)
    }

    fn collect_keys(tree: &mut BTree, forward: bool) -> Vec<u32> {
        let mut cursor = Cursor::new(tree, 1).expect("Should have made cursor.");
        cursor
            .rewind(tree, forward)
            .expect("Should have rewound cursor.");
        let mut keys = vec![];
        if let Some(cell) = cursor.cell() {
            keys.push(cell.key());
        }
        while cursor.table_move(tree, forward).is_ok() {
            keys.push(cursor.cell().expect("Should have a cell after a move.").key());
        }
        keys
    }

    #[test]
    fn test_empty_tree_has_no_cell_and_cannot_move() {
        let (_dir, mut tree) = scratch_tree(512);
        let mut cursor = Cursor::new(&mut tree, 1).expect("Should have made cursor.");
        cursor
            .rewind(&mut tree, true)
            .expect("Should have rewound cursor.");
        assert!(cursor.cell().is_none());
        assert!(matches!(
            cursor.table_move(&mut tree, true),
            Err(Error::CursorCantMove)
        ));
        assert!(matches!(
            cursor.table_move(&mut tree, false),
            Err(Error::CursorCantMove)
        ));
    }

    #[test]
    fn test_single_leaf_forward_and_backward() {
        let (_dir, mut tree) = scratch_tree(512);
        for key in [20_u32, 10, 30] {
            tree.insert_in_table(1, key, b"x").expect("insert");
        }
        assert_eq!(collect_keys(&mut tree, true), vec![10, 20, 30]);
        assert_eq!(collect_keys(&mut tree, false), vec![30, 20, 10]);
    }

    #[test]
    fn test_failed_move_keeps_position() {
        let (_dir, mut tree) = scratch_tree(512);
        for key in [1_u32, 2] {
            tree.insert_in_table(1, key, b"x").expect("insert");
        }
        let mut cursor = Cursor::new(&mut tree, 1).expect("Should have made cursor.");
        cursor
            .rewind(&mut tree, true)
            .expect("Should have rewound cursor.");
        cursor
            .table_move(&mut tree, true)
            .expect("Should have moved to key 2.");
        assert!(matches!(
            cursor.table_move(&mut tree, true),
            Err(Error::CursorCantMove)
        ));
        // Still on the last cell; stepping back works.
        assert_eq!(cursor.cell().expect("Should have a cell.").key(), 2);
        cursor
            .table_move(&mut tree, false)
            .expect("Should have moved back to key 1.");
        assert_eq!(cursor.cell().expect("Should have a cell.").key(), 1);
    }

    #[test]
    fn test_multi_level_traversal_covers_every_key_in_order() {
        let (_dir, mut tree) = scratch_tree(512);
        for key in 1..=150_u32 {
            tree.insert_in_table(1, key, b"0123456789").expect("insert");
        }
        let forward = collect_keys(&mut tree, true);
        assert_eq!(forward, (1..=150).collect::<Vec<u32>>());
        let backward = collect_keys(&mut tree, false);
        assert_eq!(backward, (1..=150).rev().collect::<Vec<u32>>());
    }

    #[test]
    fn test_streaming_iterator_over_cells() {
        let (_dir, mut tree) = scratch_tree(512);
        for key in [3_u32, 1, 2] {
            tree.insert_in_table(1, key, b"pay").expect("insert");
        }
        let mut it = tree.scan(1).expect("Should have made scan.");
        let mut keys = vec![];
        while let Some(cell) = it.next() {
            keys.push(cell.key());
        }
        assert_eq!(keys, vec![1, 2, 3]);
    }
}

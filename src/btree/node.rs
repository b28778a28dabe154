//! node gives an in-memory view of one page as a btree node.
//!
//! A btree page is divided into regions in the following order:
//! 1. The 100-byte database file header (found on page 1 only)
//! 2. The 8 or 12 byte btree node header
//! 3. The cell offset array
//! 4. Unallocated space
//! 5. The cell area, growing downward from the end of the page
//!
//! Node header, at the node base (byte 100 on page 1, byte 0 elsewhere):
//!
//! Offset	Size	Description
//! 0	1	The page type code.
//! 1	2	First free byte after the cell offset array, big-endian.
//! 3	2	The number of cells on the page.
//! 5	2	Start of the cell area.
//! 7	1	Always zero.
//! 8	4	The right-page pointer. Interior nodes only.

use byteorder::{BigEndian, ByteOrder};

use super::cell::Cell;
use super::{Error, PageType};
use crate::dbheader;
use crate::pager::{Page, PageNum, Pager};

// The first page has a header which is not btree content.
fn btree_start_offset(page_no: PageNum) -> usize {
    match page_no {
        1 => 100,
        _ => 0,
    }
}

// Byte cost of one cell offset array entry.
const OFFSET_ENTRY_SIZE: usize = 2;

/// One page viewed as a btree node.
///
/// The header fields live in the struct while the node is in memory; the
/// offset array and the cells are read and written directly in the page
/// buffer. [`Node::write`] puts the header back and hands the page to the
/// pager. Dropping the node releases its hold on the page.
#[derive(Debug)]
pub struct Node {
    page: Page,
    pub page_type: PageType,
    pub free_offset: u16,
    pub n_cells: u16,
    pub cells_offset: u16,
    pub right_page: Option<PageNum>,
}

impl Node {
    /// Materializes the node stored on page `page_no`.
    pub fn load(pager: &mut Pager, page_no: PageNum) -> Result<Node, Error> {
        let page = pager.read_page(page_no)?;
        let base = btree_start_offset(page_no);
        let (page_type, free_offset, n_cells, cells_offset, right_page) = {
            let data = page.data();
            let type_code = data[base];
            let page_type = PageType::from_code(type_code)
                .ok_or(Error::InvalidPageType(page_no, type_code))?;
            let free_offset = BigEndian::read_u16(&data[base + 1..]);
            let n_cells = BigEndian::read_u16(&data[base + 3..]);
            let cells_offset = BigEndian::read_u16(&data[base + 5..]);
            let right_page = if page_type.is_leaf() {
                None
            } else {
                Some(BigEndian::read_u32(&data[base + 8..]) as PageNum)
            };
            (page_type, free_offset, n_cells, cells_offset, right_page)
        };
        Ok(Node {
            page,
            page_type,
            free_offset,
            n_cells,
            cells_offset,
            right_page,
        })
    }

    /// Initializes a freshly allocated page as an empty node of `page_type`.
    ///
    /// Page 1 additionally gets the full file header written ahead of the
    /// node. The caller writes the node when it is ready.
    pub fn init(pager: &mut Pager, page_no: PageNum, page_type: PageType) -> Result<Node, Error> {
        let page_size = pager.page_size();
        let page = pager.read_page(page_no)?;
        if page_no == 1 {
            let header = dbheader::build_header(page_size);
            page.data_mut()[..dbheader::HEADER_SIZE].copy_from_slice(&header);
        }
        let mut node = Node {
            page,
            page_type,
            free_offset: 0,
            n_cells: 0,
            cells_offset: 0,
            right_page: None,
        };
        node.reset(page_type);
        Ok(node)
    }

    /// Reinitializes the node region in place as an empty node of `page_type`.
    ///
    /// The region from the node base to the end of the page is zero-filled,
    /// so stale cell bytes never survive a reshape. Bytes ahead of the base
    /// (the file header on page 1) are untouched. Clears `right_page`.
    pub fn reset(&mut self, page_type: PageType) {
        let base = self.base();
        let page_size = {
            let mut data = self.page.data_mut();
            data[base..].fill(0);
            data.len()
        };
        self.page_type = page_type;
        self.free_offset = (base + page_type.header_size()) as u16;
        self.n_cells = 0;
        self.cells_offset = page_size as u16;
        self.right_page = None;
    }

    /// Serializes the header fields back into the page and hands the page to
    /// the pager for writing.
    pub fn write(&self, pager: &mut Pager) -> Result<(), Error> {
        {
            let base = self.base();
            let mut data = self.page.data_mut();
            data[base] = self.page_type.code();
            BigEndian::write_u16(&mut data[base + 1..], self.free_offset);
            BigEndian::write_u16(&mut data[base + 3..], self.n_cells);
            BigEndian::write_u16(&mut data[base + 5..], self.cells_offset);
            data[base + 7] = 0;
            if let Some(right_page) = self.right_page {
                BigEndian::write_u32(&mut data[base + 8..], right_page as u32);
            }
        }
        pager.write_page(&self.page)?;
        Ok(())
    }

    pub fn page_no(&self) -> PageNum {
        self.page.page_no()
    }

    fn base(&self) -> usize {
        btree_start_offset(self.page.page_no())
    }

    fn offset_array_base(&self) -> usize {
        self.base() + self.page_type.header_size()
    }

    fn cell_offset(&self, data: &[u8], i: u16) -> usize {
        BigEndian::read_u16(&data[self.offset_array_base() + OFFSET_ENTRY_SIZE * i as usize..])
            as usize
    }

    /// Bytes left between the offset array and the cell area.
    pub fn free_space(&self) -> usize {
        (self.cells_offset - self.free_offset) as usize
    }

    /// True if inserting `cell` (plus its offset array entry) would not fit.
    pub fn would_overflow(&self, cell: &Cell) -> bool {
        cell.size() + OFFSET_ENTRY_SIZE > self.free_space()
    }

    /// Returns the i-th cell, in key order.
    pub fn get_cell(&self, i: u16) -> Result<Cell<'static>, Error> {
        if i >= self.n_cells {
            return Err(Error::CellNumberBeyondLimits(i, self.n_cells));
        }
        let data = self.page.data();
        let offset = self.cell_offset(&data, i);
        Ok(Cell::read_from(&data[offset..], self.page_type).into_owned())
    }

    /// Returns the key of the i-th cell without decoding the rest of it.
    pub fn cell_key(&self, i: u16) -> Result<u32, Error> {
        if i >= self.n_cells {
            return Err(Error::CellNumberBeyondLimits(i, self.n_cells));
        }
        let data = self.page.data();
        let offset = self.cell_offset(&data, i);
        Ok(match self.page_type {
            PageType::TableInterior => crate::varint::get_varint32(&data[offset + 4..]).0,
            PageType::TableLeaf => {
                let (_, n) = crate::varint::get_varint32(&data[offset..]);
                crate::varint::get_varint32(&data[offset + n..]).0
            }
            PageType::IndexInterior => BigEndian::read_u32(&data[offset + 8..]),
            PageType::IndexLeaf => BigEndian::read_u32(&data[offset + 4..]),
        })
    }

    /// Inserts `cell` at position `i` of the offset array.
    ///
    /// The caller has checked [`Node::would_overflow`] and picked `i` so that
    /// key order is preserved. The cell bytes go to the bottom of the free
    /// gap; entries `i..n_cells` of the offset array shift right.
    pub fn insert_cell(&mut self, i: u16, cell: &Cell) -> Result<(), Error> {
        if i > self.n_cells {
            return Err(Error::CellNumberBeyondLimits(i, self.n_cells));
        }
        debug_assert!(!self.would_overflow(cell), "insert_cell on a full node");
        let len = cell.size();
        let new_offset = self.cells_offset as usize - len;
        {
            let mut data = self.page.data_mut();
            cell.write_to(&mut data[new_offset..new_offset + len]);
            let slot = self.offset_array_base() + OFFSET_ENTRY_SIZE * i as usize;
            let end = self.offset_array_base() + OFFSET_ENTRY_SIZE * self.n_cells as usize;
            data.copy_within(slot..end, slot + OFFSET_ENTRY_SIZE);
            BigEndian::write_u16(&mut data[slot..], new_offset as u16);
        }
        self.cells_offset = new_offset as u16;
        self.free_offset += OFFSET_ENTRY_SIZE as u16;
        self.n_cells += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    fn scratch_pager(page_size: u32) -> (tempfile::TempDir, Pager) {
        let dir = tempfile::TempDir::new().expect("Should have created temp dir.");
        let path = dir.path().join("node_test.cdb");
        let mut pager = Pager::open(path.to_str().expect("Should have path str."))
            .expect("Should have opened pager.");
        pager.set_page_size(page_size);
        (dir, pager)
    }

    fn leaf_cell(key: u32, payload: &'static [u8]) -> Cell<'static> {
        Cell::TableLeaf {
            key,
            payload: Cow::Borrowed(payload),
        }
    }

    #[test]
    fn test_init_page_one_gets_file_header() {
        let (_dir, mut pager) = scratch_pager(512);
        let pn = pager.allocate_page();
        assert_eq!(pn, 1);
        let node =
            Node::init(&mut pager, pn, PageType::TableLeaf).expect("Should have initialized node.");
        assert_eq!(node.free_offset, 108);
        assert_eq!(node.cells_offset, 512);
        assert_eq!(node.n_cells, 0);
        node.write(&mut pager).expect("Should have written node.");
        let page = pager.read_page(1).expect("Should have read page 1.");
        assert_eq!(&page.data()[0..16], b"SQLite format 3\0");
        assert_eq!(page.data()[100], 0x0d);
    }

    #[test]
    fn test_init_other_pages_start_at_zero() {
        let (_dir, mut pager) = scratch_pager(512);
        pager.allocate_page();
        let pn = pager.allocate_page();
        let node = Node::init(&mut pager, pn, PageType::TableInterior)
            .expect("Should have initialized node.");
        assert_eq!(node.free_offset, 12);
        assert_eq!(node.cells_offset, 512);
    }

    #[test]
    fn test_insert_and_get_cells_in_order() {
        let (_dir, mut pager) = scratch_pager(512);
        pager.allocate_page();
        let pn = pager.allocate_page();
        let mut node =
            Node::init(&mut pager, pn, PageType::TableLeaf).expect("Should have initialized node.");
        // Arrival order 10, 30, 20; offset array order must be 10, 20, 30.
        node.insert_cell(0, &leaf_cell(10, b"aa")).expect("insert");
        node.insert_cell(1, &leaf_cell(30, b"cc")).expect("insert");
        node.insert_cell(1, &leaf_cell(20, b"bb")).expect("insert");
        assert_eq!(node.n_cells, 3);
        let keys: Vec<u32> = (0..3)
            .map(|i| node.cell_key(i).expect("Should have read key."))
            .collect();
        assert_eq!(keys, vec![10, 20, 30]);
        assert_eq!(
            node.get_cell(1).expect("Should have read cell."),
            leaf_cell(20, b"bb")
        );
        // Three leaf cells of 10 bytes each, packed from the page end.
        assert_eq!(node.cells_offset, 512 - 30);
        // Leaf header plus three offset-array entries.
        assert_eq!(node.free_offset, 8 + 6);
    }

    #[test]
    fn test_get_cell_beyond_count() {
        let (_dir, mut pager) = scratch_pager(512);
        pager.allocate_page();
        let pn = pager.allocate_page();
        let node =
            Node::init(&mut pager, pn, PageType::TableLeaf).expect("Should have initialized node.");
        assert!(matches!(
            node.get_cell(0),
            Err(Error::CellNumberBeyondLimits(0, 0))
        ));
    }

    #[test]
    fn test_would_overflow_boundary() {
        let (_dir, mut pager) = scratch_pager(512);
        pager.allocate_page();
        let pn = pager.allocate_page();
        let mut node =
            Node::init(&mut pager, pn, PageType::TableLeaf).expect("Should have initialized node.");
        // 504 free bytes; each insert costs 18 + 2. After 25 inserts 4 bytes
        // remain, which is not enough for any further cell.
        let payload: &'static [u8] = b"0123456789";
        for i in 0..25 {
            let cell = leaf_cell(i, payload);
            assert!(!node.would_overflow(&cell), "cell {} should fit", i);
            node.insert_cell(i as u16, &cell).expect("insert");
        }
        assert_eq!(node.free_space(), 4);
        assert!(node.would_overflow(&leaf_cell(99, payload)));
        assert!(node.would_overflow(&leaf_cell(99, b"")));
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let (_dir, mut pager) = scratch_pager(512);
        pager.allocate_page();
        let pn = pager.allocate_page();
        let mut node = Node::init(&mut pager, pn, PageType::IndexInterior)
            .expect("Should have initialized node.");
        node.right_page = Some(7);
        node.insert_cell(
            0,
            &Cell::IndexInterior {
                child: 3,
                key_idx: 5,
                key_pk: 1,
            },
        )
        .expect("insert");
        node.write(&mut pager).expect("Should have written node.");
        drop(node);
        let reloaded = Node::load(&mut pager, pn).expect("Should have loaded node.");
        assert_eq!(reloaded.page_type, PageType::IndexInterior);
        assert_eq!(reloaded.n_cells, 1);
        assert_eq!(reloaded.right_page, Some(7));
        assert_eq!(
            reloaded.get_cell(0).expect("Should have read cell."),
            Cell::IndexInterior {
                child: 3,
                key_idx: 5,
                key_pk: 1,
            }
        );
    }

    #[test]
    fn test_reset_zeroes_node_region() {
        let (_dir, mut pager) = scratch_pager(512);
        pager.allocate_page();
        let pn = pager.allocate_page();
        let mut node =
            Node::init(&mut pager, pn, PageType::TableLeaf).expect("Should have initialized node.");
        node.insert_cell(0, &leaf_cell(1, b"xyz")).expect("insert");
        node.reset(PageType::TableInterior);
        assert_eq!(node.n_cells, 0);
        assert_eq!(node.free_offset, 12);
        assert_eq!(node.cells_offset, 512);
        assert!(node.page.data().iter().all(|b| *b == 0));
    }
}

//! Btree stores and retrieves keyed cells in a paged database file.
//!
//! A file holds one or more btrees sharing a single page space. Btrees come
//! in two families: Tables (integer key, byte payload) and Indexes (indexed
//! key, primary key). Btree pages are either leaves or interior pages, and
//! each of these 4 combinations has a different cell format.
//!
//! The [`BTree`] engine opens the file, materializes pages as [`Node`]s,
//! finds keys, and inserts cells, splitting nodes ahead of descent so the
//! tree stays balanced. Range traversal is the [`cursor`] module's job.

use log::debug;
use std::borrow::Cow;

use crate::dbheader;
use crate::pager::{self, PageNum, Pager};

/// module `cell` encodes and decodes the four cell variants.
pub mod cell;
/// module `node` views one page as a btree node.
pub mod node;
/// module `cursor` walks a table btree in key order.
pub mod cursor;

pub use cell::Cell;
pub use cursor::{Cursor, CursorCells, CursorMode};
pub use node::Node;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Btree: file header is corrupt: {0}")]
    CorruptHeader(#[from] dbheader::Error),
    #[error("Btree: {0}")]
    Pager(#[from] pager::Error),
    #[error("Btree: page {0} is not a btree node: bad type byte {1:#04x}.")]
    InvalidPageType(PageNum, u8),
    #[error("Btree: cell number {0} is beyond the node's {1} cells.")]
    CellNumberBeyondLimits(u16, u16),
    #[error("Btree: key {0} not found.")]
    KeyNotFound(u32),
    #[error("Btree: key {0} is already in the tree.")]
    DuplicateKey(u32),
    #[error("Cursor: no further cell in that direction.")]
    CursorCantMove,
}

/// The four btree page types and their on-disk type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    IndexInterior,
    TableInterior,
    IndexLeaf,
    TableLeaf,
}

impl PageType {
    pub fn from_code(code: u8) -> Option<PageType> {
        match code {
            0x02 => Some(PageType::IndexInterior),
            0x05 => Some(PageType::TableInterior),
            0x0a => Some(PageType::IndexLeaf),
            0x0d => Some(PageType::TableLeaf),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            PageType::IndexInterior => 0x02,
            PageType::TableInterior => 0x05,
            PageType::IndexLeaf => 0x0a,
            PageType::TableLeaf => 0x0d,
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, PageType::IndexLeaf | PageType::TableLeaf)
    }

    /// Node-header bytes ahead of the offset array: 8 for leaves, 12 for
    /// interior nodes.
    pub fn header_size(self) -> usize {
        if self.is_leaf() {
            8
        } else {
            12
        }
    }

    /// The interior type of the same family. Used when a root is reshaped.
    pub fn interior_variant(self) -> PageType {
        match self {
            PageType::TableInterior | PageType::TableLeaf => PageType::TableInterior,
            PageType::IndexInterior | PageType::IndexLeaf => PageType::IndexInterior,
        }
    }
}

/// One open btree file.
///
/// Owns the pager for the file. The root page number of a tree never changes
/// over its lifetime: splitting a full root reshapes it in place and moves
/// its cells to a freshly allocated sibling.
pub struct BTree {
    pager: Pager,
    header: dbheader::DbfileHeader,
}

impl BTree {
    /// Opens a btree file, creating it when absent or empty.
    ///
    /// An existing file has its header validated byte-for-byte; a new file
    /// gets a header with the default page size and an empty table-leaf node
    /// on page 1.
    pub fn open(path: &str) -> Result<BTree, Error> {
        Self::open_with_page_size(path, pager::DEFAULT_PAGE_SIZE)
    }

    /// As [`BTree::open`], with a chosen page size for file creation.
    ///
    /// An existing file keeps the page size recorded in its header.
    pub fn open_with_page_size(path: &str, page_size: u32) -> Result<BTree, Error> {
        if !dbheader::supported_page_size(page_size) {
            return Err(Error::CorruptHeader(dbheader::Error::UnsupportedPagesize));
        }
        let mut pager = Pager::open(path)?;
        if pager.is_new() {
            debug!("Creating btree file {} with page size {}", path, page_size);
            pager.set_page_size(page_size);
            let mut tree = BTree {
                pager,
                header: dbheader::DbfileHeader::new(page_size),
            };
            let page_no = tree.pager.allocate_page();
            let root = Node::init(&mut tree.pager, page_no, PageType::TableLeaf)?;
            root.write(&mut tree.pager)?;
            Ok(tree)
        } else {
            let mut buf = [0_u8; dbheader::HEADER_SIZE];
            pager.read_header(&mut buf).map_err(|e| match e {
                pager::Error::Io(ref io_err)
                    if io_err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    Error::CorruptHeader(dbheader::Error::ReadFailed)
                }
                e => Error::Pager(e),
            })?;
            let header = dbheader::get_header(&buf)?;
            pager.set_page_size(header.pagesize);
            Ok(BTree { pager, header })
        }
    }

    /// Flushes and closes the underlying file.
    pub fn close(self) -> Result<(), Error> {
        self.pager.close()?;
        Ok(())
    }

    pub fn pager(&mut self) -> &mut Pager {
        &mut self.pager
    }

    pub fn page_size(&self) -> u32 {
        self.header.pagesize
    }

    pub fn change_counter(&self) -> u32 {
        self.header.changecnt
    }

    pub fn schema_version(&self) -> u32 {
        self.header.schema_version
    }

    pub fn user_cookie(&self) -> u32 {
        self.header.user_cookie
    }

    /// Allocates and initializes an empty node, e.g. the root of a new tree
    /// within this file. Returns its page number.
    pub fn new_node(&mut self, page_type: PageType) -> Result<PageNum, Error> {
        let page_no = self.pager.allocate_page();
        self.init_empty_node(page_no, page_type)?;
        Ok(page_no)
    }

    /// Initializes page `page_no` as an empty node of `page_type` and writes it.
    pub fn init_empty_node(
        &mut self,
        page_no: PageNum,
        page_type: PageType,
    ) -> Result<Node, Error> {
        let node = Node::init(&mut self.pager, page_no, page_type)?;
        node.write(&mut self.pager)?;
        Ok(node)
    }

    /// Materializes the node stored on page `page_no`. Dropping the node
    /// releases it.
    pub fn node(&mut self, page_no: PageNum) -> Result<Node, Error> {
        Node::load(&mut self.pager, page_no)
    }

    /// Writes a node's page back to the file.
    pub fn write_node(&mut self, node: &Node) -> Result<(), Error> {
        node.write(&mut self.pager)
    }

    /// Looks up `key` in the tree rooted at `root_page` and returns a copy
    /// of the payload stored with it.
    ///
    /// Descends by the first cell whose key is greater than or equal to
    /// `key`; each visited node is released before the next one loads.
    pub fn find(&mut self, root_page: PageNum, key: u32) -> Result<Vec<u8>, Error> {
        let mut page_no = root_page;
        loop {
            let node = Node::load(&mut self.pager, page_no)?;
            let mut descend: Option<PageNum> = None;
            for i in 0..node.n_cells {
                let k = node.cell_key(i)?;
                if k < key {
                    continue;
                }
                if node.page_type.is_leaf() {
                    if k == key {
                        if let Cell::TableLeaf { payload, .. } = node.get_cell(i)? {
                            return Ok(payload.into_owned());
                        }
                    }
                    return Err(Error::KeyNotFound(key));
                }
                descend = Some(
                    node.get_cell(i)?
                        .child()
                        .expect("interior cells carry a child page"),
                );
                break;
            }
            page_no = match descend {
                Some(p) => p,
                None => {
                    if node.page_type.is_leaf() {
                        return Err(Error::KeyNotFound(key));
                    }
                    node.right_page.expect("interior nodes carry a right page")
                }
            };
        }
    }

    // True if `key` is anywhere in the tree. Separator keys count: a table
    // separator is a real row key and an index interior cell is a real entry.
    fn key_exists(&mut self, root_page: PageNum, key: u32) -> Result<bool, Error> {
        let mut page_no = root_page;
        loop {
            let node = Node::load(&mut self.pager, page_no)?;
            let mut descend: Option<PageNum> = None;
            for i in 0..node.n_cells {
                let k = node.cell_key(i)?;
                if k < key {
                    continue;
                }
                if k == key {
                    return Ok(true);
                }
                if node.page_type.is_leaf() {
                    return Ok(false);
                }
                descend = Some(
                    node.get_cell(i)?
                        .child()
                        .expect("interior cells carry a child page"),
                );
                break;
            }
            page_no = match descend {
                Some(p) => p,
                None => {
                    if node.page_type.is_leaf() {
                        return Ok(false);
                    }
                    node.right_page.expect("interior nodes carry a right page")
                }
            };
        }
    }

    /// Inserts a row into the table btree rooted at `root_page`.
    pub fn insert_in_table(
        &mut self,
        root_page: PageNum,
        key: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let cell = Cell::TableLeaf {
            key,
            payload: Cow::Borrowed(data),
        };
        self.insert(root_page, &cell)
    }

    /// Inserts an entry into the index btree rooted at `root_page`.
    pub fn insert_in_index(
        &mut self,
        root_page: PageNum,
        key_idx: u32,
        key_pk: u32,
    ) -> Result<(), Error> {
        let cell = Cell::IndexLeaf { key_idx, key_pk };
        self.insert(root_page, &cell)
    }

    /// Inserts `cell` into the tree rooted at `root_page`.
    ///
    /// Fails with [`Error::DuplicateKey`] before anything is modified, so a
    /// rejected insert leaves the file untouched. A full root is split first
    /// (reshaped in place, never moved); descent then only ever enters
    /// children with room for the cell.
    pub fn insert(&mut self, root_page: PageNum, cell: &Cell) -> Result<(), Error> {
        if self.key_exists(root_page, cell.key())? {
            return Err(Error::DuplicateKey(cell.key()));
        }
        {
            let root = Node::load(&mut self.pager, root_page)?;
            if root.would_overflow(cell) {
                self.split_root(root)?;
            }
        }
        self.insert_nonfull(root_page, cell)
    }

    // Moves the full root's cells to a new sibling and reshapes the root in
    // place as an interior node over it, then splits the sibling. The root
    // page number survives.
    fn split_root(&mut self, mut root: Node) -> Result<(), Error> {
        let root_page = root.page_no();
        let right_page = self.pager.allocate_page();
        debug!(
            "Splitting root page {}; cells move to new page {}",
            root_page, right_page
        );
        let mut right = Node::init(&mut self.pager, right_page, root.page_type)?;
        for i in 0..root.n_cells {
            right.insert_cell(i, &root.get_cell(i)?)?;
        }
        right.right_page = root.right_page;
        root.reset(root.page_type.interior_variant());
        root.right_page = Some(right_page);
        root.write(&mut self.pager)?;
        right.write(&mut self.pager)?;
        drop(root);
        drop(right);
        self.split(root_page, right_page, 0)?;
        Ok(())
    }

    // Inserts into the subtree at `page_no`, which is known to have room for
    // the cell. A child that would overflow is split before descent, and the
    // descent restarts at this node because the new separator may reroute
    // the key.
    fn insert_nonfull(&mut self, page_no: PageNum, cell: &Cell) -> Result<(), Error> {
        let mut node = Node::load(&mut self.pager, page_no)?;
        // Position of the first cell strictly greater than the new key.
        let mut idx = node.n_cells;
        for i in 0..node.n_cells {
            let k = node.cell_key(i)?;
            if k == cell.key() {
                return Err(Error::DuplicateKey(k));
            }
            if k > cell.key() {
                idx = i;
                break;
            }
        }
        if node.page_type.is_leaf() {
            node.insert_cell(idx, cell)?;
            return node.write(&mut self.pager);
        }
        let child_page = if idx < node.n_cells {
            node.get_cell(idx)?
                .child()
                .expect("interior cells carry a child page")
        } else {
            node.right_page.expect("interior nodes carry a right page")
        };
        let child = Node::load(&mut self.pager, child_page)?;
        if child.would_overflow(cell) {
            drop(child);
            drop(node);
            self.split(page_no, child_page, idx)?;
            debug!("Restarting descent at page {} after split", page_no);
            self.insert_nonfull(page_no, cell)
        } else {
            drop(child);
            drop(node);
            self.insert_nonfull(child_page, cell)
        }
    }

    /// Splits the child at `child_page` of the interior node at
    /// `parent_page`, promoting the median key as a separator at position
    /// `parent_ncell` of the parent. Returns the page number of the new left
    /// sibling.
    ///
    /// Cells below the median move to the sibling; cells above it stay in
    /// the child, which is rebuilt in place. A table leaf keeps its median
    /// row in the sibling, so the promoted separator carries the key only;
    /// for every other type the median cell leaves the child level entirely.
    pub fn split(
        &mut self,
        parent_page: PageNum,
        child_page: PageNum,
        parent_ncell: u16,
    ) -> Result<PageNum, Error> {
        let mut parent = Node::load(&mut self.pager, parent_page)?;
        let mut child = Node::load(&mut self.pager, child_page)?;
        let median = child.n_cells / 2;
        let median_cell = child.get_cell(median)?;
        let sibling_page = self.pager.allocate_page();
        debug!(
            "Splitting page {} at key {}; lower cells move to new page {}",
            child_page,
            median_cell.key(),
            sibling_page
        );
        let mut sibling = Node::init(&mut self.pager, sibling_page, child.page_type)?;
        for i in 0..median {
            sibling.insert_cell(i, &child.get_cell(i)?)?;
        }
        if child.page_type == PageType::TableLeaf {
            sibling.insert_cell(median, &median_cell)?;
        }
        if !child.page_type.is_leaf() {
            sibling.right_page = median_cell.child();
        }
        // Rebuild the child in place: copy out the post-median cells, clear
        // the node region, and put them back. No transient page touches the
        // file.
        let tail: Vec<Cell<'static>> = ((median + 1)..child.n_cells)
            .map(|i| child.get_cell(i))
            .collect::<Result<_, _>>()?;
        let child_right_page = child.right_page;
        let child_type = child.page_type;
        child.reset(child_type);
        child.right_page = child_right_page;
        for (i, c) in tail.iter().enumerate() {
            child.insert_cell(i as u16, c)?;
        }
        let separator = match parent.page_type {
            PageType::TableInterior => Cell::TableInterior {
                child: sibling_page,
                key: median_cell.key(),
            },
            PageType::IndexInterior => Cell::IndexInterior {
                child: sibling_page,
                key_idx: median_cell.key(),
                key_pk: median_cell
                    .key_pk()
                    .expect("index cells carry a primary key"),
            },
            PageType::TableLeaf | PageType::IndexLeaf => {
                unreachable!("split parent is always an interior node")
            }
        };
        parent.insert_cell(parent_ncell, &separator)?;
        parent.write(&mut self.pager)?;
        child.write(&mut self.pager)?;
        sibling.write(&mut self.pager)?;
        Ok(sibling_page)
    }

    /// Returns a streaming iterator over the cells of the table btree rooted
    /// at `root_page`, in ascending key order.
    pub fn scan(&mut self, root_page: PageNum) -> Result<CursorCells<'_>, Error> {
        CursorCells::new(self, root_page)
    }
}

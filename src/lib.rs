//! cdb is the storage core of a didactic relational database: a paged
//! B-Tree file plus the cursor used to traverse it.
//!
//! The file format keeps one or more btrees in a single page space. Page 1
//! carries a 100-byte file header ahead of its node. Table btrees map an
//! integer key to a byte payload; index btrees map an indexed key to a
//! primary key. There is no deletion and no transaction layer; an execution
//! engine above this crate is expected to provide record encoding, SQL, and
//! the rest.
//!
//! Organization of the crate:
//! * `pager` owns the file and its fixed-size pages.
//! * `dbheader` builds and validates the file header.
//! * `varint` is the fixed-width integer encoding cells use.
//! * `btree` is the engine: nodes, cells, find/insert/split, and cursors.

pub mod btree;
pub mod dbheader;
pub mod pager;
pub mod varint;

pub use btree::{BTree, Cell, Cursor, CursorCells, CursorMode, Error, Node, PageType};
pub use pager::{Page, PageNum, Pager, DEFAULT_PAGE_SIZE};

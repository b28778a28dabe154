//! pager manages the fixed-size pages of one open database file.
//!
//! The file is a sequence of equally sized pages, numbered from 1. The pager
//! owns the data of each page and hands out reference-counted handles, so
//! several nodes or a cursor trail can hold distinct pages at the same time.
//! Pages are loaded on demand and cached; writes go straight to the file.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Pager: Page number is zero, past the end of the file, or greater than the maximum supported page number.")]
    PageNumberBeyondLimits,
    #[error("Pager: Error accessing database file: {0}")]
    Io(#[from] std::io::Error),
}

// Page numbers are 1-based, to match how the file format numbers pages. PageNum ensures people
// pass something that is meant to be a page number to a function that expects a page number.
pub type PageNum = usize;

/// Page size used when creating a new file.
pub const DEFAULT_PAGE_SIZE: u32 = 1024;

// TODO: support databases with more on-disk pages, limiting memory usage by paging out unused pages.
const MAX_PAGE_NUM: PageNum = 10_000;

/// A handle on one cached page.
///
/// Cloning the handle clones the hold, not the data; everyone holding a
/// handle for a page sees the same bytes. Dropping the handle gives the hold
/// back to the pager.
#[derive(Debug, Clone)]
pub struct Page {
    page_no: PageNum,
    data: Rc<RefCell<Vec<u8>>>,
}

impl Page {
    pub fn page_no(&self) -> PageNum {
        self.page_no
    }

    pub fn data(&self) -> Ref<'_, Vec<u8>> {
        self.data.borrow()
    }

    pub fn data_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.data.borrow_mut()
    }
}

/// A `Pager` manages the file access and the memory use for one open database file.
///
/// Single-threaded. Callers get `Page` handles for reading and in-place
/// modification; a modified page reaches the disk only through
/// [`Pager::write_page`].
pub struct Pager {
    f: std::fs::File,
    /// Map from page number to the page data, or key not found if page not in memory.
    pages: HashMap<PageNum, Rc<RefCell<Vec<u8>>>>,
    page_size: u32,
    n_pages: usize,
    file_len: u64,
    was_empty: bool,
}

impl Pager {
    /// Opens a database file, creating it when it does not exist.
    ///
    /// The caller decides what an empty file means (see [`Pager::is_new`])
    /// and must set the page size before reading pages.
    pub fn open(path: &str) -> Result<Pager, Error> {
        // TODO: Lock file when opening so that other processes do not also
        // open and modify it.
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_len = f.metadata()?.len();
        Ok(Pager {
            f,
            pages: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            n_pages: (file_len / DEFAULT_PAGE_SIZE as u64) as usize,
            file_len,
            was_empty: file_len == 0,
        })
    }

    /// True if the file was absent or zero-length at open time.
    pub fn is_new(&self) -> bool {
        self.was_empty
    }

    /// Reads the first 100 bytes of page 1 into `buf`.
    ///
    /// Raw file access: the page size need not be known yet.
    pub fn read_header(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.f.seek(SeekFrom::Start(0))?;
        self.f.read_exact(buf)?;
        Ok(())
    }

    /// Sets the page size. To be called once, right after open, before any
    /// page is read or allocated.
    pub fn set_page_size(&mut self, page_size: u32) {
        self.page_size = page_size;
        self.n_pages = (self.file_len / page_size as u64) as usize;
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of pages the file holds, counting allocated-but-unwritten ones.
    pub fn n_pages(&self) -> usize {
        self.n_pages
    }

    /// Returns a fresh unused page number. The new page is zero-filled and
    /// reaches the disk when it is first written.
    pub fn allocate_page(&mut self) -> PageNum {
        self.n_pages += 1;
        let page_no = self.n_pages;
        self.pages.insert(
            page_no,
            Rc::new(RefCell::new(vec![0_u8; self.page_size as usize])),
        );
        page_no
    }

    fn read_page_from_file(&mut self, page_no: PageNum) -> Result<Vec<u8>, Error> {
        let mut v = vec![0_u8; self.page_size as usize];
        self.f
            .seek(SeekFrom::Start((page_no - 1) as u64 * self.page_size as u64))?;
        self.f.read_exact(&mut v[..])?;
        Ok(v)
    }

    /// Returns a handle on page `page_no`, reading it in on demand.
    pub fn read_page(&mut self, page_no: PageNum) -> Result<Page, Error> {
        if page_no == 0 || page_no > self.n_pages || page_no > MAX_PAGE_NUM {
            return Err(Error::PageNumberBeyondLimits);
        }
        if !self.pages.contains_key(&page_no) {
            let v = self.read_page_from_file(page_no)?;
            self.pages.insert(page_no, Rc::new(RefCell::new(v)));
        }
        Ok(Page {
            page_no,
            data: Rc::clone(&self.pages[&page_no]),
        })
    }

    /// Flushes the handle's buffer to its slot in the file.
    pub fn write_page(&mut self, page: &Page) -> Result<(), Error> {
        let data = page.data();
        self.f
            .seek(SeekFrom::Start((page.page_no - 1) as u64 * self.page_size as u64))?;
        self.f.write_all(&data)?;
        let end = page.page_no as u64 * self.page_size as u64;
        if end > self.file_len {
            self.file_len = end;
        }
        Ok(())
    }

    /// Gives up the caller's hold on a page.
    ///
    /// Dropping the handle has the same effect; this exists for callers that
    /// want the release to be visible in the code.
    pub fn release_page(&mut self, page: Page) {
        // The cache entry stays; once every outstanding handle is gone the
        // entry is the sole owner of the buffer.
        // TODO: evict unreferenced clean pages when memory is low.
        drop(page);
    }

    /// Flushes OS buffers and closes the file.
    pub fn close(self) -> Result<(), Error> {
        self.f.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_pager() -> (tempfile::TempDir, Pager) {
        let dir = tempfile::TempDir::new().expect("Should have created temp dir.");
        let path = dir.path().join("pager_test.cdb");
        let pager = Pager::open(path.to_str().expect("Should have path str."))
            .expect("Should have opened pager.");
        (dir, pager)
    }

    #[test]
    fn test_new_file_is_new() {
        let (_dir, pager) = scratch_pager();
        assert!(pager.is_new());
        assert_eq!(pager.n_pages(), 0);
    }

    #[test]
    fn test_allocate_write_read_back() {
        let (_dir, mut pager) = scratch_pager();
        pager.set_page_size(512);
        let pn = pager.allocate_page();
        assert_eq!(pn, 1);
        {
            let page = pager.read_page(pn).expect("Should have read allocated page.");
            page.data_mut()[0] = 0xab;
            pager.write_page(&page).expect("Should have written page.");
        }
        let pn2 = pager.allocate_page();
        assert_eq!(pn2, 2);
        let page = pager.read_page(1).expect("Should have read page 1.");
        assert_eq!(page.data()[0], 0xab);
    }

    #[test]
    fn test_handles_share_data() {
        let (_dir, mut pager) = scratch_pager();
        pager.set_page_size(512);
        let pn = pager.allocate_page();
        let a = pager.read_page(pn).expect("Should have read page.");
        let b = pager.read_page(pn).expect("Should have read page.");
        a.data_mut()[7] = 9;
        assert_eq!(b.data()[7], 9);
        pager.release_page(a);
        pager.release_page(b);
    }

    #[test]
    fn test_page_number_limits() {
        let (_dir, mut pager) = scratch_pager();
        pager.set_page_size(512);
        assert!(matches!(
            pager.read_page(0),
            Err(Error::PageNumberBeyondLimits)
        ));
        assert!(matches!(
            pager.read_page(1),
            Err(Error::PageNumberBeyondLimits)
        ));
    }
}

//! Fixed-size display windows over an ordered collection.

use std::{num::NonZeroUsize, ops::Range};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageWindow<T> {
    pub items: Vec<T>,
    /// 1-based page actually shown after clamping.
    pub page: usize,
    pub total_pages: usize,
    pub total_items: usize,
    pub page_size: usize,
}

impl<T> PageWindow<T> {
    pub fn has_previous(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMove {
    First,
    Previous,
    Next,
    Last,
    To(usize),
}

/// Number of pages needed for `len` items. An empty collection is one empty page.
pub fn total_pages(len: usize, page_size: NonZeroUsize) -> usize {
    len.div_ceil(page_size.get()).max(1)
}

/// Clamps `page` into `1..=total_pages`.
pub fn clamp_page(page: usize, total_pages: usize) -> usize {
    page.clamp(1, total_pages.max(1))
}

pub fn bounds(len: usize, page_size: NonZeroUsize, page: usize) -> Range<usize> {
    let page = clamp_page(page, total_pages(len, page_size));
    let start = ((page - 1) * page_size.get()).min(len);
    let end = (page * page_size.get()).min(len);
    start..end
}

pub fn project<T: Clone>(items: &[T], page_size: NonZeroUsize, page: usize) -> PageWindow<T> {
    let total_pages = total_pages(items.len(), page_size);
    let page = clamp_page(page, total_pages);
    PageWindow {
        items: items[bounds(items.len(), page_size, page)].to_vec(),
        page,
        total_pages,
        total_items: items.len(),
        page_size: page_size.get(),
    }
}

/// Page position over a collection that may be replaced underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    page: usize,
    page_size: NonZeroUsize,
}

impl PageCursor {
    pub fn new(page_size: NonZeroUsize) -> Self {
        Self { page: 1, page_size }
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn reset(&mut self) {
        self.page = 1;
    }

    pub fn set_page_size(&mut self, page_size: NonZeroUsize, len: usize) {
        self.page_size = page_size;
        self.page = clamp_page(self.page, total_pages(len, page_size));
    }

    /// Applies `movement` against a collection of `len` items and stores the clamped page.
    pub fn apply(&mut self, movement: PageMove, len: usize) -> usize {
        let last = total_pages(len, self.page_size);
        let requested = match movement {
            PageMove::First => 1,
            PageMove::Previous => self.page.saturating_sub(1),
            PageMove::Next => self.page.saturating_add(1),
            PageMove::Last => last,
            PageMove::To(page) => page,
        };
        self.page = clamp_page(requested, last);
        self.page
    }

    pub fn window<T: Clone>(&self, items: &[T]) -> PageWindow<T> {
        project(items, self.page_size, self.page)
    }
}

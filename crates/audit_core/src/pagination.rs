//! Collects every page of a page-based listing endpoint into one ordered set.

use std::{future::Future, num::NonZeroU32};

use shared::protocol::{WorkUnit, WorkUnitPage};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl From<WorkUnitPage> for Page<WorkUnit> {
    fn from(page: WorkUnitPage) -> Self {
        Self {
            items: page.items,
            total: page.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected<T> {
    pub items: Vec<T>,
    /// Total reported by the first page.
    pub total: u64,
    pub requests: u32,
}

/// Number of requests needed to cover `total` items. The first page is always
/// requested since it is what reports the total.
pub fn request_count(total: u64, limit: NonZeroU32) -> u32 {
    let pages = total.div_ceil(u64::from(limit.get())).max(1);
    u32::try_from(pages).unwrap_or(u32::MAX)
}

/// Fetches page 1, then pages `2..=ceil(total / limit)` sequentially.
///
/// Any failing page aborts the whole collection with that page's error; the
/// caller never sees a partial result.
pub async fn collect_pages<T, E, F, Fut>(
    page_size: NonZeroU32,
    mut fetch: F,
) -> Result<Collected<T>, E>
where
    F: FnMut(PageQuery) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    let limit = page_size.get();
    let first = fetch(PageQuery { page: 1, limit }).await?;
    let total = first.total;
    let requests = request_count(total, page_size);
    debug!(total, limit, requests, "collecting paged listing");

    let mut items = first.items;
    for page in 2..=requests {
        let next = fetch(PageQuery { page, limit }).await?;
        items.extend(next.items);
    }

    if items.len() as u64 != total {
        warn!(
            total,
            collected = items.len(),
            "paged listing size does not match the reported total"
        );
    }

    Ok(Collected {
        items,
        total,
        requests,
    })
}

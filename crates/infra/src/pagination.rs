//! Keyset pagination over the distinct-subscriber scan.

use campaigner_core::{Subscriber, SubscriberCursor};

use crate::store::{CampaignStore, StoreError, SubscriberQuery};

/// Default page size for subscriber scans.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Iterator over pages of subscribers, resuming after the last row of the
/// previous page.
///
/// Iteration stops after an empty or short page, or after the first error.
/// Empty pages are never yielded.
pub struct SubscriberPages<'a, S: CampaignStore + ?Sized> {
    store: &'a S,
    query: SubscriberQuery,
    page_size: usize,
    cursor: Option<SubscriberCursor>,
    done: bool,
}

impl<'a, S: CampaignStore + ?Sized> SubscriberPages<'a, S> {
    pub fn new(store: &'a S, query: SubscriberQuery, page_size: usize) -> Self {
        Self {
            store,
            query,
            page_size: page_size.max(1),
            cursor: None,
            done: false,
        }
    }

    /// Start after `cursor` instead of at the beginning.
    pub fn resume_from(mut self, cursor: SubscriberCursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Key of the last subscriber yielded so far.
    pub fn cursor(&self) -> Option<SubscriberCursor> {
        self.cursor
    }
}

impl<S: CampaignStore + ?Sized> Iterator for SubscriberPages<'_, S> {
    type Item = Result<Vec<Subscriber>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let page = match self.store.get_distinct_subscribers_by_segment_ids(
            &self.query,
            self.cursor,
            self.page_size,
        ) {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        if page.len() < self.page_size {
            self.done = true;
        }
        let last = page.last()?;
        self.cursor = Some(last.cursor());
        Some(Ok(page))
    }
}

//! Worklist query results.

use crate::backend::{OpenMode, WorklistPage};
use crate::item::WorklistItem;
use crate::models::SerialNumber;
use crate::session::SessionRef;

/// A snapshot of worklist items matching one query.
///
/// The snapshot never refreshes itself: an item completed elsewhere keeps
/// its handle here, and completing it again fails on the backend.
#[derive(Debug, Clone)]
pub struct Worklist {
    items: Vec<WorklistItem>,
    total_count: u64,
}

impl Worklist {
    pub(crate) fn new(session: SessionRef, mode: OpenMode, page: WorklistPage) -> Self {
        let items = page
            .items
            .into_iter()
            .map(|record| WorklistItem::new(session.clone(), mode.clone(), record))
            .collect();
        Self {
            items,
            total_count: page.total_count,
        }
    }

    /// Number of items matching the criteria, ignoring paging.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Number of items in this snapshot.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[WorklistItem] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&WorklistItem> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut WorklistItem> {
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, WorklistItem> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, WorklistItem> {
        self.items.iter_mut()
    }

    pub fn find_by_serial(&self, serial: &SerialNumber) -> Option<&WorklistItem> {
        self.items.iter().find(|item| item.serial_number() == serial)
    }

    pub fn find_by_serial_mut(&mut self, serial: &SerialNumber) -> Option<&mut WorklistItem> {
        self.items
            .iter_mut()
            .find(|item| item.serial_number() == serial)
    }

    /// Items whose process folio is exactly `folio`.
    pub fn find_by_folio<'a>(&'a self, folio: &'a str) -> impl Iterator<Item = &'a WorklistItem> {
        self.items.iter().filter(move |item| item.folio() == folio)
    }

    pub fn into_items(self) -> Vec<WorklistItem> {
        self.items
    }
}

impl IntoIterator for Worklist {
    type Item = WorklistItem;
    type IntoIter = std::vec::IntoIter<WorklistItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a Worklist {
    type Item = &'a WorklistItem;
    type IntoIter = std::slice::Iter<'a, WorklistItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<'a> IntoIterator for &'a mut Worklist {
    type Item = &'a mut WorklistItem;
    type IntoIter = std::slice::IterMut<'a, WorklistItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter_mut()
    }
}

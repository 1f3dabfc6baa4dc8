use super::page_id::{PageId, EMPTY_PAGE_ID};
use crate::cursor::CursorId;

/// State shared by every typed page view: identity, the in-memory parent
/// pointer (refreshed on every descent), the dirty bit, and the list of
/// cursors coupled to this page.
///
/// The cursor list is an index, not ownership: cursors live in the
/// database's cursor arena, and every cursor state transition keeps the
/// list in sync.
#[derive(Debug)]
pub struct BasePage {
    pid: PageId,
    parent_pid: PageId,
    dirty: bool,
    cursor_list: Vec<CursorId>,
}

impl BasePage {
    pub fn new(pid: PageId) -> Self {
        Self {
            pid,
            parent_pid: EMPTY_PAGE_ID,
            dirty: false,
            cursor_list: Vec::new(),
        }
    }

    pub fn get_pid(&self) -> PageId {
        self.pid
    }

    pub fn get_parent_pid(&self) -> PageId {
        self.parent_pid
    }

    pub fn set_parent_pid(&mut self, pid: PageId) {
        self.parent_pid = pid;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn cursor_list(&self) -> &[CursorId] {
        &self.cursor_list
    }

    pub fn add_cursor(&mut self, cid: CursorId) {
        debug_assert!(!self.cursor_list.contains(&cid));
        self.cursor_list.push(cid);
    }

    pub fn remove_cursor(&mut self, cid: CursorId) {
        if let Some(pos) = self.cursor_list.iter().position(|&c| c == cid) {
            self.cursor_list.swap_remove(pos);
        }
    }

    pub fn take_cursor_list(&mut self) -> Vec<CursorId> {
        std::mem::take(&mut self.cursor_list)
    }
}

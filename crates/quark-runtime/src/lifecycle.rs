//! Application and page lifecycle state.
//!
//! `AppState` gates which messages may reach the engine; `PageState` gates
//! page-addressed operations on the hosting side.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

pub type AppId = i32;
pub type PageId = i32;

static NEXT_APP_ID: AtomicI32 = AtomicI32::new(1);

/// Allocate a process-unique application id.
pub fn next_app_id() -> AppId {
    NEXT_APP_ID.fetch_add(1, Ordering::Relaxed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Application state
// ─────────────────────────────────────────────────────────────────────────────

/// Engine runtime state for one application.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AppState {
    None = 0,
    RuntimeInited = 1,
    Destroying = 2,
    Destroyed = 3,
}

impl AppState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AppState::RuntimeInited,
            2 => AppState::Destroying,
            3 => AppState::Destroyed,
            _ => AppState::None,
        }
    }

    /// Application-scoped messages are dropped at dispatch in these states.
    pub fn drops_at_dispatch(self) -> bool {
        matches!(self, AppState::None | AppState::Destroyed)
    }

    /// New application-scoped messages are refused in these states.
    pub fn refuses_admission(self) -> bool {
        matches!(self, AppState::Destroying | AppState::Destroyed)
    }
}

/// Shared, lock-free holder of an [`AppState`].
#[derive(Debug, Clone)]
pub struct AppStateCell(Arc<AtomicU8>);

impl Default for AppStateCell {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(AppState::None as u8)))
    }
}

impl AppStateCell {
    pub fn get(&self) -> AppState {
        AppState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: AppState) {
        let previous = AppState::from_u8(self.0.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            tracing::debug!("[app_state] {:?} -> {:?}", previous, state);
        }
    }

    /// Atomically move from `from` to `to`. Returns false if the current
    /// state was not `from`.
    pub fn transition(&self, from: AppState, to: AppState) -> bool {
        let moved = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved {
            tracing::debug!("[app_state] {:?} -> {:?}", from, to);
        }
        moved
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Page state
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PageState {
    None,
    Created,
    Initialized,
    Visible,
}

/// Page table for one application.
#[derive(Debug)]
pub struct PageRegistry {
    pages: DashMap<PageId, PageState>,
    current: AtomicI32,
    settled: Mutex<()>,
    settled_signal: Condvar,
}

const NO_PAGE: PageId = -1;

impl Default for PageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PageRegistry {
    pub fn new() -> Self {
        Self {
            pages: DashMap::new(),
            current: AtomicI32::new(NO_PAGE),
            settled: Mutex::new(()),
            settled_signal: Condvar::new(),
        }
    }

    pub fn state(&self, page_id: PageId) -> PageState {
        self.pages
            .get(&page_id)
            .map(|entry| *entry)
            .unwrap_or(PageState::None)
    }

    /// Register a freshly built page.
    pub fn mark_created(&self, page_id: PageId) {
        self.pages.insert(page_id, PageState::Created);
    }

    /// The first render completed. Returns false if the page is unknown or
    /// already past this point.
    pub fn mark_initialized(&self, page_id: PageId) -> bool {
        let moved = match self.pages.get_mut(&page_id) {
            Some(mut state) if *state == PageState::Created => {
                *state = PageState::Initialized;
                true
            }
            _ => false,
        };
        if moved {
            tracing::debug!("[PageRegistry] page {} initialized", page_id);
            self.notify_settled();
        }
        moved
    }

    /// Wait up to `timeout` for `page_id` to leave `Created`. Returns true
    /// once it is initialized; false if it is removed, unknown, or still
    /// building when the time runs out.
    pub fn wait_initialized(&self, page_id: PageId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.settled.lock();
        loop {
            match self.state(page_id) {
                PageState::None => return false,
                PageState::Created => {}
                PageState::Initialized | PageState::Visible => return true,
            }
            if self
                .settled_signal
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.state(page_id) >= PageState::Initialized;
            }
        }
    }

    fn notify_settled(&self) {
        let _guard = self.settled.lock();
        self.settled_signal.notify_all();
    }

    /// Apply a visibility change. Showing requires `Initialized`; hiding
    /// requires `Visible`. Returns whether a transition happened.
    pub fn set_visible(&self, page_id: PageId, visible: bool) -> bool {
        let Some(mut state) = self.pages.get_mut(&page_id) else {
            return false;
        };
        match (visible, *state) {
            (true, PageState::Initialized) => {
                *state = PageState::Visible;
                self.current.store(page_id, Ordering::SeqCst);
                true
            }
            (false, PageState::Visible) => {
                *state = PageState::Initialized;
                true
            }
            _ => false,
        }
    }

    /// Forget a page. Returns the state it had.
    pub fn remove(&self, page_id: PageId) -> PageState {
        let _ = self.current.compare_exchange(
            page_id,
            NO_PAGE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let state = self
            .pages
            .remove(&page_id)
            .map(|(_, state)| state)
            .unwrap_or(PageState::None);
        self.notify_settled();
        state
    }

    /// Whether page-addressed input may reach the engine.
    pub fn accepts_input(&self, page_id: PageId) -> bool {
        self.state(page_id) >= PageState::Created
    }

    /// Most recently shown page that still exists.
    pub fn current(&self) -> Option<PageId> {
        let id = self.current.load(Ordering::SeqCst);
        (id != NO_PAGE && self.pages.contains_key(&id)).then_some(id)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

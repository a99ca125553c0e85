//! Page stack driven by the app's router requests.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use quark_runtime::config::AppConfig;
use quark_runtime::{AppRuntime, PageId, PageLaunch, RuntimeError};

use crate::console::Navigation;
use crate::package::{AppPackage, PageSource};

pub struct Navigator<'a> {
    app: &'a AppRuntime,
    package: &'a AppPackage,
    stack: Vec<PageId>,
    next_page_id: PageId,
    ready_timeout: Duration,
}

impl<'a> Navigator<'a> {
    pub fn new(app: &'a AppRuntime, package: &'a AppPackage) -> Self {
        Self {
            app,
            package,
            stack: Vec::new(),
            next_page_id: 1,
            ready_timeout: AppConfig::default().page_ready_timeout(),
        }
    }

    /// How long a new page may take to build before it is abandoned.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn current(&self) -> Option<PageId> {
        self.stack.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Build `page`, hide the current one, and show the new one. A page
    /// that fails to build is destroyed and the previous one shown again.
    pub fn open(&mut self, page: &PageSource, params: Value) -> Result<PageId, RuntimeError> {
        let page_id = self.next_page_id;
        self.next_page_id += 1;

        if let Some(top) = self.current() {
            self.app.change_visible_page(top, false);
        }
        self.app.create_page(PageLaunch {
            app_id: self.app.id(),
            page_id,
            script: page.script.clone(),
            style: page.style.clone(),
            params,
            intent: json!({ "uri": page.path }),
            meta: json!({ "name": page.name, "path": page.path }),
        });
        self.app.flush()?;
        if !self.app.wait_page_initialized(page_id, self.ready_timeout) {
            warn!("Page {} ({}) failed to build", page.name, page_id);
            self.app.destroy_page(page_id);
            if let Some(top) = self.current() {
                self.app.change_visible_page(top, true);
            }
            return Err(RuntimeError::PageNotReady(page_id));
        }
        self.app.change_visible_page(page_id, true);
        self.stack.push(page_id);

        info!("Opened page {} ({})", page.name, page_id);
        Ok(page_id)
    }

    /// Apply a router request. Returns false once the last page is gone.
    pub fn handle(&mut self, request: Navigation) -> Result<bool, RuntimeError> {
        debug!("[Navigator] {:?}", request);
        match request {
            Navigation::Push { uri, params } => {
                self.open_uri(&uri, params)?;
            }
            Navigation::Replace { uri, params } => {
                if self.package.resolve(&uri).is_some() {
                    if let Some(top) = self.stack.pop() {
                        self.app.destroy_page(top);
                    }
                }
                self.open_uri(&uri, params)?;
            }
            Navigation::Back => {
                if let Some(top) = self.stack.pop() {
                    self.app.destroy_page(top);
                }
                match self.current() {
                    Some(top) => self.app.change_visible_page(top, true),
                    None => return Ok(false),
                }
            }
            Navigation::Clear => {
                let keep = self.stack.pop();
                for page_id in self.stack.drain(..) {
                    self.app.destroy_page(page_id);
                }
                self.stack.extend(keep);
            }
        }
        Ok(true)
    }

    fn open_uri(&mut self, uri: &str, params: Value) -> Result<(), RuntimeError> {
        match self.package.resolve(uri) {
            Some(page) => {
                self.open(page, params)?;
            }
            None => {
                info!("No page for {}", uri);
                self.app.notify_page_not_found(uri);
            }
        }
        Ok(())
    }
}

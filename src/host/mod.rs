//! Live host state.
//!
//! `HostContext` is the single value through which the executor and the
//! sandbox reach the host application. It is `!Send`: the
//! handles share the document through `Rc<RefCell<_>>`, so the whole
//! context stays on the host thread that created it.

pub mod document;

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use tracing::info;

pub use document::{
    Axis, Body, BooleanOp, Document, DocumentError, DocumentResult, EdgeFilter, Plane, Point3D,
    Selection, Shape, Vector3D,
};

/// Application handle (`app` in scripts).
#[derive(Debug, Clone)]
pub struct Application {
    name: Rc<str>,
    version: Rc<str>,
    log: Rc<RefCell<Vec<String>>>,
}

impl Application {
    pub fn name(&self) -> String {
        self.name.to_string()
    }

    pub fn version(&self) -> String {
        self.version.to_string()
    }

    /// Write to the host's text-command log.
    pub fn log(&self, message: &str) {
        info!(target: "host", "{message}");
        self.log.borrow_mut().push(message.to_string());
    }
}

/// Root component of the active design (`root` in scripts).
#[derive(Debug, Clone)]
pub struct RootComponent {
    document: Rc<RefCell<Document>>,
}

impl RootComponent {
    pub fn add_body(
        &self,
        name: &str,
        shape: Shape,
        plane: &str,
        center: Point3D,
    ) -> DocumentResult<String> {
        let plane: Plane = plane.parse()?;
        self.document.borrow_mut().add_body(name, shape, plane, center)
    }

    pub fn body(&self, name: &str) -> DocumentResult<Body> {
        self.document.borrow().body(name).cloned()
    }

    pub fn body_names(&self) -> Vec<String> {
        self.document
            .borrow()
            .bodies()
            .iter()
            .map(|b| b.name.clone())
            .collect()
    }

    pub fn combine(&self, target: &str, tool: &str, operation: &str) -> DocumentResult<()> {
        let operation: BooleanOp = operation.parse()?;
        self.document.borrow_mut().combine(target, tool, operation)
    }

    pub fn combine_selection(&self, operation: &str) -> DocumentResult<String> {
        let operation: BooleanOp = operation.parse()?;
        self.document.borrow_mut().combine_selection(operation)
    }

    pub fn move_selection(&self, offset: Vector3D) -> DocumentResult<()> {
        self.document.borrow_mut().move_selection(offset)
    }

    pub fn rotate_selection(&self, axis: &str, degrees: f64, pivot: Point3D) -> DocumentResult<()> {
        let axis: Axis = axis.parse()?;
        self.document
            .borrow_mut()
            .rotate_selection(axis, degrees, pivot)
    }

    pub fn fillet_selection(&self, radius: f64) -> DocumentResult<()> {
        self.document.borrow_mut().fillet_selection(radius)
    }

    pub fn undo(&self) -> DocumentResult<()> {
        self.document.borrow_mut().undo()
    }

    pub fn redo(&self) -> DocumentResult<()> {
        self.document.borrow_mut().redo()
    }
}

/// User-interface handle (`ui` in scripts). Owns the active selection.
#[derive(Debug, Clone)]
pub struct UserInterface {
    document: Rc<RefCell<Document>>,
    messages: Rc<RefCell<Vec<String>>>,
}

impl UserInterface {
    pub fn message_box(&self, text: &str) {
        info!(target: "host", message = %text, "message box");
        self.messages.borrow_mut().push(text.to_string());
    }

    pub fn select_body(&self, name: &str) -> DocumentResult<()> {
        self.document.borrow_mut().select_body(name)
    }

    pub fn select_bodies(&self, first: &str, second: &str) -> DocumentResult<()> {
        self.document.borrow_mut().select_bodies(first, second)
    }

    pub fn select_edges(&self, body: &str, filter: &str) -> DocumentResult<usize> {
        let filter: EdgeFilter = filter.parse()?;
        self.document.borrow_mut().select_edges(body, filter)
    }

    pub fn clear_selection(&self) {
        self.document.borrow_mut().clear_selection();
    }

    pub fn selection_count(&self) -> usize {
        self.document
            .borrow()
            .selection()
            .map_or(0, Selection::len)
    }
}

/// Everything the bridge may touch inside the host.
#[derive(Debug)]
pub struct HostContext {
    app: Application,
    document: Rc<RefCell<Document>>,
    ui_messages: Rc<RefCell<Vec<String>>>,
}

impl HostContext {
    /// A host with one empty active document.
    pub fn new(app_name: &str, document_name: &str) -> Self {
        Self {
            app: Application {
                name: Rc::from(app_name),
                version: Rc::from(env!("CARGO_PKG_VERSION")),
                log: Rc::default(),
            },
            document: Rc::new(RefCell::new(Document::new(document_name))),
            ui_messages: Rc::default(),
        }
    }

    pub fn application(&self) -> Application {
        self.app.clone()
    }

    pub fn root(&self) -> RootComponent {
        RootComponent {
            document: Rc::clone(&self.document),
        }
    }

    pub fn ui(&self) -> UserInterface {
        UserInterface {
            document: Rc::clone(&self.document),
            messages: Rc::clone(&self.ui_messages),
        }
    }

    /// Read-only view of the active document.
    pub fn document(&self) -> Ref<'_, Document> {
        self.document.borrow()
    }

    pub fn ui_messages(&self) -> Vec<String> {
        self.ui_messages.borrow().clone()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.app.log.borrow().clone()
    }

    pub fn app_name(&self) -> &str {
        &self.app.name
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new("cad-host", "Untitled")
    }
}

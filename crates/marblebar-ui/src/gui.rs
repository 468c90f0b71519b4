//! The application GUI model.
//!
//! [`MarbleGui`] attaches to a [`ConnectionManager`] as an action listener
//! and as lifecycle hooks. It asks for the initial UI when a connection
//! opens, keeps its views in step with `view/*` actions, and wipes them when
//! the connection is lost.

use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use anyhow::Context as _;
use marblebar_client::{ConnectionHooks, ConnectionManager, ReplyTimeout, ResponseSpec};
use marblebar_core::{RequestId, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::view::{View, ViewSpec};
use crate::widgets::{WidgetHandle, WidgetRegistry};

/// Event sent when a connection opens.
pub const INIT_EVENT: &str = "ui/init";
/// Event sent when a widget fires.
pub const PROPERTY_EVENT: &str = "property/event";
/// Shown after the connection is lost.
pub const DISCONNECTED_NOTICE: &str = "Disconnected from application";

/// `view/propchange` payload.
#[derive(Debug, Deserialize)]
struct PropChange {
    id: String,
    prop: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Default)]
struct GuiState {
    views: Vec<View>,
    notice: Option<String>,
}

impl GuiState {
    fn position(&self, id: &str) -> Option<usize> {
        self.views.iter().position(|v| v.id() == id)
    }

    /// Insert or replace in place.
    fn upsert(&mut self, view: View) {
        match self.position(view.id()) {
            Some(i) => self.views[i] = view,
            None => self.views.push(view),
        }
    }
}

struct GuiInner {
    manager: ConnectionManager,
    widgets: WidgetRegistry,
    state: Mutex<GuiState>,
    changes: watch::Sender<u64>,
}

impl GuiInner {
    fn changed(&self) {
        self.changes.send_modify(|n| *n += 1);
    }

    fn handle_action(&self, name: &str, data: &Value) -> anyhow::Result<()> {
        match name {
            "view/add" | "view/update" => {
                let spec = ViewSpec::from_value(data)
                    .with_context(|| format!("invalid {name} payload"))?;
                let view = View::build(&spec, &self.widgets);
                debug!(action = name, view = %spec.id, properties = view.properties().len(), "view received");
                self.state.lock().upsert(view);
            }
            "view/remove" => {
                let id = data
                    .get("id")
                    .and_then(Value::as_str)
                    .context("view/remove payload has no id")?;
                let mut state = self.state.lock();
                match state.position(id) {
                    Some(i) => drop(state.views.remove(i)),
                    None => {
                        debug!(view = id, "remove for unknown view");
                        return Ok(());
                    }
                }
            }
            "view/propchange" => {
                let change = PropChange::deserialize(data).context("invalid view/propchange payload")?;
                let mut state = self.state.lock();
                let Some(i) = state.position(&change.id) else {
                    debug!(view = %change.id, "propchange for unknown view");
                    return Ok(());
                };
                if !state.views[i].update_property(&change.prop, &change.value) {
                    debug!(view = %change.id, prop = %change.prop, "propchange for unknown property");
                    return Ok(());
                }
            }
            other => {
                debug!(action = other, "ignoring action");
                return Ok(());
            }
        }
        self.changed();
        Ok(())
    }
}

struct GuiHooks {
    gui: Weak<GuiInner>,
}

impl ConnectionHooks for GuiHooks {
    fn on_connected(&self, manager: &ConnectionManager) {
        if let Some(gui) = self.gui.upgrade() {
            gui.state.lock().notice = None;
            gui.changed();
        }
        match manager.send(INIT_EVENT, json!({}), ResponseSpec::None, ReplyTimeout::Default) {
            Ok(id) => debug!(%id, "requested initial ui"),
            Err(e) => warn!(error = %e, "failed to request initial ui"),
        }
    }

    fn on_disconnected(&self) {
        let Some(gui) = self.gui.upgrade() else { return };
        {
            let mut state = gui.state.lock();
            state.views.clear();
            state.notice = Some(DISCONNECTED_NOTICE.to_owned());
        }
        info!("{DISCONNECTED_NOTICE}");
        gui.changed();
    }
}

/// GUI model bound to one connection. Clones share state.
#[derive(Clone)]
pub struct MarbleGui {
    inner: Arc<GuiInner>,
}

impl MarbleGui {
    /// Attach to `manager` with the built-in widgets.
    pub fn attach(manager: &ConnectionManager) -> Self {
        Self::attach_with_widgets(manager, WidgetRegistry::with_builtins())
    }

    /// Attach to `manager` with a custom widget registry.
    pub fn attach_with_widgets(manager: &ConnectionManager, widgets: WidgetRegistry) -> Self {
        let (changes, _) = watch::channel(0);
        let inner = Arc::new(GuiInner {
            manager: manager.clone(),
            widgets,
            state: Mutex::new(GuiState::default()),
            changes,
        });

        let listener = Arc::downgrade(&inner);
        manager.register_action_listener(move |name, data| match listener.upgrade() {
            Some(gui) => gui.handle_action(name, data),
            None => Ok(()),
        });
        manager.add_hooks(Arc::new(GuiHooks {
            gui: Arc::downgrade(&inner),
        }));

        Self { inner }
    }

    /// Apply an action directly, as if it had arrived on the connection.
    pub fn apply_action(&self, name: &str, data: &Value) -> anyhow::Result<()> {
        self.inner.handle_action(name, data)
    }

    /// Forward a widget event to the application.
    pub fn trigger(&self, view: &str, prop: &str, event: &str, data: Value) -> Result<RequestId> {
        self.inner.manager.send(
            PROPERTY_EVENT,
            json!({ "view": view, "prop": prop, "name": event, "data": data }),
            ResponseSpec::None,
            ReplyTimeout::Default,
        )
    }

    /// Ids of the current views in tab order.
    pub fn view_ids(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .views
            .iter()
            .map(|v| v.id().to_owned())
            .collect()
    }

    /// Rendered state of one property.
    pub fn property(&self, view: &str, prop: &str) -> Option<WidgetHandle> {
        let state = self.inner.state.lock();
        let i = state.position(view)?;
        state.views[i].property(prop).map(|p| p.handle().clone())
    }

    /// The inactive-state notice, if the connection was lost.
    pub fn notice(&self) -> Option<String> {
        self.inner.state.lock().notice.clone()
    }

    /// Change counter that ticks on every update.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// Text rendering: a tab bar followed by each view's properties.
    pub fn render(&self) -> String {
        let state = self.inner.state.lock();
        let mut out = String::new();
        if let Some(notice) = &state.notice {
            let _ = writeln!(out, "! {notice}");
        }
        if state.views.is_empty() {
            if state.notice.is_none() {
                out.push_str("(no views)\n");
            }
            return out;
        }
        let tabs: Vec<&str> = state.views.iter().map(View::title).collect();
        let _ = writeln!(out, "| {} |", tabs.join(" | "));
        for view in &state.views {
            view.render_into(&mut out);
        }
        out
    }
}

impl std::fmt::Debug for MarbleGui {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarbleGui")
            .field("views", &self.view_ids())
            .field("notice", &self.notice())
            .finish()
    }
}

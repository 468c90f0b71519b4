//! Views: one tab of properties each.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::widgets::{PropertySpec, Widget, WidgetHandle, WidgetRegistry};

/// A view as described by the application in `view/add` and `view/update`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ViewSpec {
    /// View id.
    pub id: String,
    /// Presentation hints; `title` names the tab.
    pub meta: Map<String, Value>,
    /// Properties in display order.
    pub properties: Vec<PropertySpec>,
}

impl ViewSpec {
    /// Parse an action payload.
    pub fn from_value(data: &Value) -> serde_json::Result<Self> {
        Self::deserialize(data)
    }
}

/// A rendered property bound to its widget.
pub struct Property {
    id: String,
    widget: Arc<dyn Widget>,
    handle: WidgetHandle,
}

impl Property {
    /// Property id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current rendered state.
    pub fn handle(&self) -> &WidgetHandle {
        &self.handle
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// One view and its properties.
#[derive(Debug)]
pub struct View {
    id: String,
    title: String,
    properties: Vec<Property>,
    index: HashMap<String, usize>,
}

impl View {
    /// Build a view, rendering every property whose widget tag is known.
    pub fn build(spec: &ViewSpec, widgets: &WidgetRegistry) -> Self {
        let title = spec
            .meta
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(spec.id.as_str())
            .to_owned();

        let mut view = Self {
            id: spec.id.clone(),
            title,
            properties: Vec::with_capacity(spec.properties.len()),
            index: HashMap::new(),
        };

        for prop in &spec.properties {
            let Some(widget) = widgets.get(prop.widget_tag()) else {
                warn!(view = %spec.id, prop = %prop.id, widget = prop.widget_tag(), "unknown widget, skipping property");
                continue;
            };
            let handle = widget.render(prop);
            let _ = view.index.insert(prop.id.clone(), view.properties.len());
            view.properties.push(Property {
                id: prop.id.clone(),
                widget,
                handle,
            });
        }
        view
    }

    /// View id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tab title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Properties in display order.
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Look up a property by id.
    pub fn property(&self, id: &str) -> Option<&Property> {
        self.index.get(id).map(|&i| &self.properties[i])
    }

    /// Apply a new value to a property. Unknown ids are ignored.
    pub fn update_property(&mut self, id: &str, value: &Value) -> bool {
        let Some(&i) = self.index.get(id) else {
            return false;
        };
        let prop = &mut self.properties[i];
        prop.widget.update(&mut prop.handle, value);
        true
    }

    /// Append a text rendering of the view.
    pub fn render_into(&self, out: &mut String) {
        let _ = writeln!(out, "[{}]", self.title);
        for prop in &self.properties {
            let _ = writeln!(out, "  {}: {}", prop.handle.title, prop.handle.display);
        }
    }
}

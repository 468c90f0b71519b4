//! Widget registry.
//!
//! A property names its control kind with a tag (`text`, `toggle`, ...).
//! The registry maps tags to [`Widget`] implementations; a widget turns a
//! property spec into a [`WidgetHandle`] and applies later value changes to
//! it. Tags nobody registered are skipped by the view builder.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Tag used when a property does not name one.
pub const DEFAULT_WIDGET: &str = "text";

/// One property as described by the application.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PropertySpec {
    /// Property id, unique within its view.
    pub id: String,
    /// Control kind tag; `None` means [`DEFAULT_WIDGET`].
    pub widget: Option<String>,
    /// Initial value.
    pub value: Value,
    /// Free-form presentation hints (`title`, `min`, `max`, ...).
    pub meta: Map<String, Value>,
}

impl PropertySpec {
    /// The control kind tag.
    pub fn widget_tag(&self) -> &str {
        self.widget.as_deref().unwrap_or(DEFAULT_WIDGET)
    }

    /// Display title: `meta.title`, falling back to the id.
    pub fn title(&self) -> &str {
        self.meta
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(self.id.as_str())
    }
}

/// Rendered state of one property.
#[derive(Clone, Debug, PartialEq)]
pub struct WidgetHandle {
    /// Tag of the widget that produced it.
    pub tag: String,
    /// Label shown next to the control.
    pub title: String,
    /// Presentation hints copied from the spec.
    pub meta: Map<String, Value>,
    /// Current value.
    pub value: Value,
    /// Current text rendering.
    pub display: String,
}

/// A control kind.
pub trait Widget: Send + Sync {
    /// Tag this widget is registered under.
    fn tag(&self) -> &'static str;

    /// Build the handle for a property and apply its initial value.
    fn render(&self, spec: &PropertySpec) -> WidgetHandle {
        let mut handle = WidgetHandle {
            tag: self.tag().to_owned(),
            title: spec.title().to_owned(),
            meta: spec.meta.clone(),
            value: Value::Null,
            display: String::new(),
        };
        self.update(&mut handle, &spec.value);
        handle
    }

    /// Apply a new value.
    fn update(&self, handle: &mut WidgetHandle, value: &Value);
}

/// Widgets by tag.
#[derive(Clone, Default)]
pub struct WidgetRegistry {
    widgets: HashMap<&'static str, Arc<dyn Widget>>,
}

impl WidgetRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in control kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TextWidget));
        registry.register(Arc::new(LabelWidget));
        registry.register(Arc::new(ButtonWidget));
        registry.register(Arc::new(ToggleWidget));
        registry.register(Arc::new(SliderWidget));
        registry.register(Arc::new(NumberWidget));
        registry.register(Arc::new(ImageWidget));
        registry
    }

    /// Add or replace a widget under its tag.
    pub fn register(&mut self, widget: Arc<dyn Widget>) {
        let _ = self.widgets.insert(widget.tag(), widget);
    }

    /// Look up a widget by tag.
    pub fn get(&self, tag: &str) -> Option<Arc<dyn Widget>> {
        self.widgets.get(tag).cloned()
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.widgets.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

impl fmt::Debug for WidgetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WidgetRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

// ── Built-ins ───────────────────────────────────────────────────────────────

/// Free text input.
#[derive(Clone, Copy, Debug)]
pub struct TextWidget;

impl Widget for TextWidget {
    fn tag(&self) -> &'static str {
        "text"
    }

    fn update(&self, handle: &mut WidgetHandle, value: &Value) {
        handle.value = value.clone();
        handle.display = plain_text(value);
    }
}

/// Read-only text.
#[derive(Clone, Copy, Debug)]
pub struct LabelWidget;

impl Widget for LabelWidget {
    fn tag(&self) -> &'static str {
        "label"
    }

    fn update(&self, handle: &mut WidgetHandle, value: &Value) {
        handle.value = value.clone();
        handle.display = plain_text(value);
    }
}

/// Clickable button; the value is its caption.
#[derive(Clone, Copy, Debug)]
pub struct ButtonWidget;

impl Widget for ButtonWidget {
    fn tag(&self) -> &'static str {
        "button"
    }

    fn update(&self, handle: &mut WidgetHandle, value: &Value) {
        handle.value = value.clone();
        let caption = plain_text(value);
        handle.display = if caption.is_empty() {
            "[Button]".to_owned()
        } else {
            format!("[{caption}]")
        };
    }
}

/// On/off switch.
#[derive(Clone, Copy, Debug)]
pub struct ToggleWidget;

impl Widget for ToggleWidget {
    fn tag(&self) -> &'static str {
        "toggle"
    }

    fn update(&self, handle: &mut WidgetHandle, value: &Value) {
        let on = truthy(value);
        handle.value = Value::Bool(on);
        handle.display = if on { "On" } else { "Off" }.to_owned();
    }
}

/// Bounded numeric slider. `meta.min`/`max`/`step` default to 0/100/1.
#[derive(Clone, Copy, Debug)]
pub struct SliderWidget;

impl Widget for SliderWidget {
    fn tag(&self) -> &'static str {
        "slider"
    }

    fn update(&self, handle: &mut WidgetHandle, value: &Value) {
        let min = meta_f64(&handle.meta, "min").unwrap_or(0.0);
        let max = meta_f64(&handle.meta, "max").unwrap_or(100.0).max(min);
        let step = meta_f64(&handle.meta, "step").filter(|s| *s > 0.0).unwrap_or(1.0);

        let raw = as_f64(value).unwrap_or(min).clamp(min, max);
        let snapped = (min + ((raw - min) / step).round() * step).min(max);

        handle.value = number(snapped);
        handle.display = format!("{} [{}..{}]", fmt_num(snapped), fmt_num(min), fmt_num(max));
    }
}

/// Numeric input. Non-numeric values are shown as-is.
#[derive(Clone, Copy, Debug)]
pub struct NumberWidget;

impl Widget for NumberWidget {
    fn tag(&self) -> &'static str {
        "number"
    }

    fn update(&self, handle: &mut WidgetHandle, value: &Value) {
        match as_f64(value) {
            Some(n) => {
                handle.value = number(n);
                handle.display = fmt_num(n);
            }
            None => {
                handle.value = value.clone();
                handle.display = plain_text(value);
            }
        }
    }
}

/// Image by URL. `meta.width`/`height` are shown when non-negative.
#[derive(Clone, Copy, Debug)]
pub struct ImageWidget;

impl Widget for ImageWidget {
    fn tag(&self) -> &'static str {
        "image"
    }

    fn update(&self, handle: &mut WidgetHandle, value: &Value) {
        handle.value = value.clone();
        let src = plain_text(value);
        let size = match (
            meta_f64(&handle.meta, "width").filter(|w| *w >= 0.0),
            meta_f64(&handle.meta, "height").filter(|h| *h >= 0.0),
        ) {
            (Some(w), Some(h)) => format!(" {}x{}", fmt_num(w), fmt_num(h)),
            (Some(w), None) => format!(" w={}", fmt_num(w)),
            (None, Some(h)) => format!(" h={}", fmt_num(h)),
            (None, None) => String::new(),
        };
        handle.display = format!("<image {src}{size}>");
    }
}

// ── Value helpers ───────────────────────────────────────────────────────────

fn plain_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn meta_f64(meta: &Map<String, Value>, key: &str) -> Option<f64> {
    meta.get(key).and_then(as_f64)
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

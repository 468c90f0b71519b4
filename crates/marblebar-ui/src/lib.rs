//! # marblebar-ui
//!
//! Headless model of a MarbleBar application UI: views made of widget-backed
//! properties, kept in sync with the application over a
//! [`marblebar_client::ConnectionManager`].
//!
//! - [`widgets`]: control kinds keyed by tag
//! - [`view`]: one tab of properties
//! - [`gui`]: [`MarbleGui`], the action listener and lifecycle hooks

#![deny(unsafe_code)]

pub mod gui;
pub mod view;
pub mod widgets;

pub use gui::{DISCONNECTED_NOTICE, MarbleGui};
pub use view::{View, ViewSpec};
pub use widgets::{PropertySpec, Widget, WidgetHandle, WidgetRegistry};

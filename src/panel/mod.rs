//! Panel core
//!
//! [`dispatcher::Dispatcher`] is the single owner of the fleet state and both
//! broker channels. Callers talk to it through a [`panel_handle::PanelHandle`]
//! and listen to [`events::PanelEvent`]s.

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod panel_handle;

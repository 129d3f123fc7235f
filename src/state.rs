//! Application state shared across handlers

use std::sync::Arc;

use crate::control::ControlSurface;
use crate::routes::settings::SettingsSnapshot;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Review operations over store and upstream
    pub control: Arc<ControlSurface>,
    /// Redacted configuration served by the settings endpoint
    pub settings: Arc<SettingsSnapshot>,
}

impl AppState {
    pub fn new(control: Arc<ControlSurface>, settings: SettingsSnapshot) -> Self {
        Self {
            control,
            settings: Arc::new(settings),
        }
    }
}

//! Host lifecycle hooks.
//!
//! The host platform notifies the background context about install/update,
//! activation of the extension's UI surface, and active-tab changes. The
//! panel surface itself is an external collaborator reached through the
//! [`PanelHost`] trait; the only message this module originates is the
//! `TAB_ACTIVATED` broadcast.

// ============================================================================
// Imports
// ============================================================================

use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::protocol::{MessageType, TabInfo};

// ============================================================================
// LifecycleEvent
// ============================================================================

/// A notification delivered by the host platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The extension was installed or updated.
    Installed,
    /// The user activated the extension's UI surface.
    ActionClicked,
    /// The active browser tab changed.
    TabActivated(TabInfo),
}

// ============================================================================
// PanelHost
// ============================================================================

/// The host's panel surface, at its API boundary.
///
/// Rendering is out of scope here; implementors register and open the
/// panel however the host requires.
pub trait PanelHost {
    /// Makes the panel available on the host's UI surface.
    fn register_panel(&self);

    /// Opens the panel.
    fn open_panel(&self);
}

// ============================================================================
// Dispatch
// ============================================================================

/// Handles one host lifecycle notification.
///
/// Called on the background (hub) context's coordinator.
pub fn handle_lifecycle_event(
    coordinator: &Coordinator,
    host: &dyn PanelHost,
    event: LifecycleEvent,
) {
    match event {
        LifecycleEvent::Installed => {
            info!("extension installed; registering panel");
            host.register_panel();
        }
        LifecycleEvent::ActionClicked => {
            debug!("action clicked; opening panel");
            host.open_panel();
        }
        LifecycleEvent::TabActivated(tab) => {
            debug!(tab_id = tab.tab_id, url = %tab.url, "tab activated");
            coordinator.send(MessageType::TabActivated, tab.into(), None);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

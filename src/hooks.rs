//! Observer chains for system events
//!
//! Plugins that want to see spindle selection, option reports or settings
//! changes install a handler on the matching [`HookChain`]. Dispatch calls
//! every handler exactly once, in installation order; a handler cannot remove
//! or skip another.
//!
//! ```
//! use vfd_spindle::hooks::{HookChain, OptionsReport};
//!
//! let mut chain = HookChain::new();
//! chain.install("banner", |report: &mut OptionsReport| {
//!     if !report.newopt {
//!         report.lines.push("[PLUGIN:Example v1.0]".into());
//!     }
//! });
//!
//! let mut report = OptionsReport::new(false);
//! assert_eq!(chain.dispatch(&mut report), 1);
//! assert_eq!(report.lines, vec!["[PLUGIN:Example v1.0]"]);
//! ```

use crate::settings::{SpindleSettings, VfdSettings};
use crate::spindle::{SpindleCaps, SpindleId, SpindleType};

type Handler<E> = Box<dyn FnMut(&mut E)>;

/// Ordered handlers for one event type
pub struct HookChain<E> {
    handlers: Vec<(&'static str, Handler<E>)>,
}

impl<E> HookChain<E> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Append a handler, returns its position in the chain
    pub fn install<F>(&mut self, name: &'static str, handler: F) -> usize
    where
        F: FnMut(&mut E) + 'static,
    {
        self.handlers.push((name, Box::new(handler)));
        self.handlers.len() - 1
    }

    /// Run every handler in order, returns how many ran
    pub fn dispatch(&mut self, event: &mut E) -> usize {
        for (_, handler) in self.handlers.iter_mut() {
            handler(event);
        }
        self.handlers.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.iter().any(|(n, _)| *n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.iter().map(|(name, _)| *name)
    }
}

impl<E> Default for HookChain<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for HookChain<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ============================================================================
// Events
// ============================================================================

/// A spindle became active
#[derive(Debug, Clone, PartialEq)]
pub struct SpindleSelected {
    pub id: SpindleId,
    pub name: String,
    pub kind: SpindleType,
    pub caps: SpindleCaps,
}

/// Option report in progress; handlers append lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionsReport {
    /// Report of newly enabled options only
    pub newopt: bool,
    pub lines: Vec<String>,
}

impl OptionsReport {
    pub fn new(newopt: bool) -> Self {
        Self {
            newopt,
            lines: Vec::new(),
        }
    }
}

/// Settings were changed and applied
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsChanged {
    pub spindle: SpindleSettings,
    pub vfd: VfdSettings,
    /// VFD settings differ from the previous ones
    pub vfd_changed: bool,
}

/// Periodic real-time status report in progress
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealtimeReport {
    /// Load of the active spindle in percent, when it reports one
    pub load: Option<f32>,
    pub line: String,
}

/// One chain per event type
#[derive(Debug, Default)]
pub struct Hooks {
    pub on_spindle_selected: HookChain<SpindleSelected>,
    pub on_report_options: HookChain<OptionsReport>,
    pub on_settings_changed: HookChain<SettingsChanged>,
    pub on_realtime_report: HookChain<RealtimeReport>,
}

// crates/drudge-rpc/src/lifecycle.rs
//
// Lifecycle state machines for the three serving components.
//
// Valid transitions:
//   (new) -> Starting -> Serving -> ShuttingDown -> Stopped
//   Starting -> Stopped            (startup failed)
//
// Every accepted transition is logged and published to the optional
// observer.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// A component coordinated by `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    RpcListener,
    Loopback,
    HttpListener,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::RpcListener => write!(f, "rpc_listener"),
            Component::Loopback => write!(f, "loopback"),
            Component::HttpListener => write!(f, "http_listener"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Starting,
    Serving,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Starting => write!(f, "Starting"),
            LifecycleState::Serving => write!(f, "Serving"),
            LifecycleState::ShuttingDown => write!(f, "ShuttingDown"),
            LifecycleState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Receives every component state change, in order.
///
/// `detail` carries the bound or dialled endpoint for `Starting`/`Serving`
/// and the failure for a startup `Stopped`.
pub trait LifecycleObserver: Send + Sync {
    fn on_transition(&self, component: Component, state: LifecycleState, detail: Option<&str>);
}

/// State machine for one component.
pub struct ComponentLifecycle {
    component: Component,
    current: Option<LifecycleState>,
    observer: Option<Arc<dyn LifecycleObserver>>,
}

impl ComponentLifecycle {
    pub fn new(component: Component, observer: Option<Arc<dyn LifecycleObserver>>) -> Self {
        Self {
            component,
            current: None,
            observer,
        }
    }

    pub fn current(&self) -> Option<LifecycleState> {
        self.current
    }

    /// Attempt to move to `next`. Returns an error if the transition is not
    /// valid.
    pub fn transition(&mut self, next: LifecycleState, detail: Option<&str>) -> Result<(), String> {
        use LifecycleState::*;

        let valid = matches!(
            (self.current, next),
            (None, Starting)
                | (Some(Starting), Serving)
                | (Some(Starting), Stopped)
                | (Some(Serving), ShuttingDown)
                | (Some(ShuttingDown), Stopped)
        );
        if !valid {
            return Err(format!(
                "Invalid state transition for {}: {} -> {}",
                self.component,
                self.current.map_or_else(|| "(new)".to_string(), |s| s.to_string()),
                next
            ));
        }

        tracing::info!(
            component = %self.component,
            detail = detail.unwrap_or(""),
            "State transition: {} -> {}",
            self.current.map_or_else(|| "(new)".to_string(), |s| s.to_string()),
            next
        );
        self.current = Some(next);
        if let Some(observer) = &self.observer {
            observer.on_transition(self.component, next, detail);
        }
        Ok(())
    }

    /// Walk whatever state the component is in to `Stopped`.
    pub fn stop(&mut self, detail: Option<&str>) {
        let steps: &[LifecycleState] = match self.current {
            Some(LifecycleState::Starting) => &[LifecycleState::Stopped],
            Some(LifecycleState::Serving) => &[LifecycleState::ShuttingDown, LifecycleState::Stopped],
            Some(LifecycleState::ShuttingDown) => &[LifecycleState::Stopped],
            None | Some(LifecycleState::Stopped) => &[],
        };
        for step in steps {
            if let Err(e) = self.transition(*step, detail) {
                tracing::warn!(component = %self.component, error = %e, "Lifecycle stop skipped");
            }
        }
    }
}

impl fmt::Debug for ComponentLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentLifecycle")
            .field("component", &self.component)
            .field("current", &self.current)
            .finish()
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub component: Component,
    pub state: LifecycleState,
    pub detail: Option<String>,
}

/// Observer that keeps every transition in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    transitions: Mutex<Vec<Transition>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.transitions.lock().clone()
    }

    /// Index of the first transition of `component` into `state`.
    pub fn position(&self, component: Component, state: LifecycleState) -> Option<usize> {
        self.transitions
            .lock()
            .iter()
            .position(|t| t.component == component && t.state == state)
    }

    /// Detail recorded with the first matching transition.
    pub fn detail(&self, component: Component, state: LifecycleState) -> Option<String> {
        self.transitions
            .lock()
            .iter()
            .find(|t| t.component == component && t.state == state)
            .and_then(|t| t.detail.clone())
    }
}

impl LifecycleObserver for RecordingObserver {
    fn on_transition(&self, component: Component, state: LifecycleState, detail: Option<&str>) {
        self.transitions.lock().push(Transition {
            component,
            state,
            detail: detail.map(str::to_string),
        });
    }
}

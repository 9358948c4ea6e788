//! The plugin lifecycle state machine's state enumeration and transition
//! events. The transition table itself lives in `plugin-runtime-manager`,
//! which is the sole owner of `PluginRecord` state.

use serde::{Deserialize, Serialize};

/// Closed enumeration of lifecycle states a `PluginRecord` can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
    Reloading,
}

/// Events that drive transitions between `PluginState`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Initialize,
    Start,
    Resume,
    Stop,
    Pause,
    Shutdown,
    Reload,
    Error,
}

impl PluginState {
    /// The next state reached by applying `event`, or `None` if the event is
    /// invalid from this state.
    pub fn apply(self, event: LifecycleEvent) -> Option<PluginState> {
        use LifecycleEvent as E;
        use PluginState as S;
        match (self, event) {
            (S::Loaded, E::Initialize) => Some(S::Initializing),
            (S::Loaded, E::Shutdown) => Some(S::Unloaded),
            (S::Loaded, E::Reload) => Some(S::Reloading),
            (S::Loaded, E::Error) => Some(S::Error),

            (S::Initializing, E::Shutdown) => Some(S::Stopping),
            (S::Initializing, E::Error) => Some(S::Error),

            (S::Running, E::Stop) => Some(S::Stopping),
            (S::Running, E::Pause) => Some(S::Paused),
            (S::Running, E::Shutdown) => Some(S::Stopping),
            (S::Running, E::Reload) => Some(S::Reloading),
            (S::Running, E::Error) => Some(S::Error),

            (S::Paused, E::Start) | (S::Paused, E::Resume) => Some(S::Running),
            (S::Paused, E::Stop) => Some(S::Stopping),
            (S::Paused, E::Shutdown) => Some(S::Stopping),
            (S::Paused, E::Error) => Some(S::Error),

            (S::Stopping, E::Error) => Some(S::Error),

            (S::Stopped, E::Shutdown) => Some(S::Unloaded),
            (S::Stopped, E::Reload) => Some(S::Reloading),
            (S::Stopped, E::Error) => Some(S::Error),

            (S::Error, E::Shutdown) => Some(S::Unloaded),
            (S::Error, E::Reload) => Some(S::Reloading),

            (S::Reloading, E::Initialize) => Some(S::Initializing),
            (S::Reloading, E::Shutdown) => Some(S::Stopping),
            (S::Reloading, E::Error) => Some(S::Error),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use PluginState as S;

    #[test]
    fn unloaded_accepts_no_events() {
        for event in [
            E::Initialize,
            E::Start,
            E::Resume,
            E::Stop,
            E::Pause,
            E::Shutdown,
            E::Reload,
            E::Error,
        ] {
            assert_eq!(S::Unloaded.apply(event), None);
        }
    }

    #[test]
    fn happy_path_to_running() {
        let s = S::Loaded.apply(E::Initialize).unwrap();
        assert_eq!(s, S::Initializing);
        // Initializing -> Running is driven by the manager directly calling
        // the plugin's initialize() and committing success, not a table
        // event; pause/resume and stop/shutdown are table-driven from there.
        assert_eq!(S::Running.apply(E::Pause), Some(S::Paused));
        assert_eq!(S::Paused.apply(E::Resume), Some(S::Running));
        assert_eq!(S::Running.apply(E::Stop), Some(S::Stopping));
    }

    #[test]
    fn error_is_reachable_from_every_non_terminal_state() {
        for s in [
            S::Loaded,
            S::Initializing,
            S::Running,
            S::Paused,
            S::Stopping,
            S::Stopped,
            S::Reloading,
        ] {
            if s == S::Stopping {
                assert_eq!(s.apply(E::Error), Some(S::Error));
            } else {
                assert_eq!(s.apply(E::Error), Some(S::Error));
            }
        }
    }
}

//! Lifecycle state machines for Modules and Interfaces, and device power states

/// Lifecycle of a single Module instance
///
/// ```text
/// Created -> Opening -> Opened -> Closing -> Closed -> Destroyed
///                ^                             |
///                +-----------------------------+ (reopened next power cycle)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Destroyed,
}

impl ModuleState {
    pub fn can_transition_to(self, next: ModuleState) -> bool {
        use ModuleState::*;

        matches!(
            (self, next),
            (Created, Opening)
                | (Created, Destroyed)
                // Failed opens land in `Closed`
                | (Opening, Opened)
                | (Opening, Closed)
                | (Opened, Closing)
                | (Closing, Closed)
                | (Closed, Opening)
                | (Closed, Destroyed)
        )
    }

    /// If the Module can be opened from this state
    pub fn is_openable(self) -> bool {
        self.can_transition_to(ModuleState::Opening)
    }
}

/// Lifecycle of a single Protocol-Transport binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Invalid,
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Destroyed,
}

impl InterfaceState {
    pub fn can_transition_to(self, next: InterfaceState) -> bool {
        use InterfaceState::*;

        matches!(
            (self, next),
            (Invalid, Created)
                | (Created, Opening)
                | (Created, Destroyed)
                // Transport refused the bind
                | (Opening, Destroyed)
                | (Opening, Opened)
                | (Opened, Closing)
                | (Closing, Closed)
                | (Closed, Destroyed)
        )
    }
}

/// Device power states, as reported to `EvtDeviceD0Entry` and `EvtDeviceD0Exit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Unspecified,
    D0,
    D1,
    D2,
    D3,
    /// The device is being started for the first time, or removed
    D3Final,
    PrepareForHibernation,
}

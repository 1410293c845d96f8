//! User input seen by the playback controller

/// Input events that can end playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    /// Window closed or terminal interrupt. Always stops.
    Quit,
    /// Enter, Escape or Space
    ConfirmKey,
    MouseDown,
}

impl PlayerEvent {
    /// Whether this event ends playback under the given skip policy
    pub fn stops_playback(&self, skippable: bool) -> bool {
        match self {
            Self::Quit => true,
            Self::ConfirmKey | Self::MouseDown => skippable,
        }
    }
}

/// Non-blocking event queue
pub trait EventSource {
    fn poll_event(&mut self) -> Option<PlayerEvent>;
}

/// Drains a channel fed by a UI or signal thread
impl EventSource for std::sync::mpsc::Receiver<PlayerEvent> {
    fn poll_event(&mut self) -> Option<PlayerEvent> {
        self.try_recv().ok()
    }
}

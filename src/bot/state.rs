use serde::{Deserialize, Serialize};

/// Represents the current state of the user dialogue
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum State {
    /// Idle; photos sent now go to the upload album
    #[default]
    Start,
    /// `/get_album` is waiting for an album link
    WaitingForLink,
    /// `/add_life` is waiting for photos
    WaitingForPhotos,
    /// `/wall_post` is waiting for text, photos or a video
    WaitingForContent,
}

impl State {
    /// Whether a command is in progress and can be cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        *self != Self::Start
    }
}

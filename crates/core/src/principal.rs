//! Caller-supplied identity for privilege-gated operations.

use serde::{Deserialize, Serialize};

use crate::id::ActorId;

/// The identity on whose behalf an operation runs.
///
/// Authentication and role resolution happen outside the engine; callers
/// pass the decision in as a boolean. Privilege gates (`confirm`, `inbound`,
/// forced `cancel`) trust this flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: ActorId,
    pub privileged: bool,
}

impl Principal {
    pub fn user(id: ActorId) -> Self {
        Self {
            id,
            privileged: false,
        }
    }

    pub fn privileged(id: ActorId) -> Self {
        Self {
            id,
            privileged: true,
        }
    }
}

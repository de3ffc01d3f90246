//! Per-role transcript buffering.
//!
//! Transcript fragments for the user's speech and the model's speech arrive
//! interleaved across many frames. They are concatenated per role and
//! released as whole messages when the turn completes.

use std::time::SystemTime;
use tracing::debug;

/// Who spoke a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

/// A completed message. Immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: SystemTime,
}

/// Two string registers, one per role, cleared on every turn boundary.
#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    pending_user: String,
    pending_model: String,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concatenate a fragment onto the register for `role`.
    pub fn append(&mut self, role: Role, text: &str) {
        match role {
            Role::User => self.pending_user.push_str(text),
            Role::Model => self.pending_model.push_str(text),
        }
    }

    /// Emit one message per non-empty register, user first, and clear both.
    ///
    /// The fixed order keeps "user said X, model replied Y" causal no matter
    /// how the fragments interleaved on the wire.
    pub fn flush(&mut self) -> Vec<Message> {
        let timestamp = SystemTime::now();
        let mut messages = Vec::with_capacity(2);

        for (role, register) in [
            (Role::User, &mut self.pending_user),
            (Role::Model, &mut self.pending_model),
        ] {
            if register.is_empty() {
                continue;
            }
            messages.push(Message {
                role,
                content: std::mem::take(register),
                timestamp,
            });
        }

        debug!("Transcript flush emitted {} message(s)", messages.len());
        messages
    }

    /// Drop both registers without emitting anything.
    pub fn reset(&mut self) {
        self.pending_user.clear();
        self.pending_model.clear();
    }

    pub fn pending(&self, role: Role) -> &str {
        match role {
            Role::User => &self.pending_user,
            Role::Model => &self.pending_model,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending_user.is_empty() && self.pending_model.is_empty()
    }
}

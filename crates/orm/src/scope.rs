// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::session::Session;

/// Caller-owned stack of sessions in use
///
/// The innermost session that is still open is the current one; closed
/// sessions are skipped, not removed.
#[derive(Debug, Default, Clone)]
pub struct SessionStack {
    sessions: Vec<Session>,
}

impl SessionStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, session: Session) {
        self.sessions.push(session);
    }

    pub fn pop(&mut self) -> Option<Session> {
        self.sessions.pop()
    }

    #[must_use]
    pub fn current(&self) -> Option<&Session> {
        self.sessions.iter().rev().find(|session| !session.is_closed())
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.sessions.len()
    }
}

use std::sync::Arc;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver};

use crate::admin::AdminList;
use crate::backend::{AuthEvent, AuthService, Credential, Identity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiMode {
    Visitor,
    Member,
    Admin,
}

/// Watches the auth service and derives the UI mode. The feed must be torn
/// down and rebuilt whenever the identity changes; callers observe that
/// through the return value of `pump`.
pub struct SessionController {
    auth: Arc<dyn AuthService>,
    admins: Arc<AdminList>,
    events: Receiver<AuthEvent>,
    identity: Option<Identity>,
    mode: UiMode,
}

impl SessionController {
    pub fn new(auth: Arc<dyn AuthService>, admins: Arc<AdminList>) -> Result<Self> {
        let (tx, rx) = unbounded();
        auth.watch(tx)?;
        let mut controller = Self {
            auth,
            admins,
            events: rx,
            identity: None,
            mode: UiMode::Visitor,
        };
        // The watcher delivers the current state immediately.
        controller.pump();
        Ok(controller)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    pub fn is_admin(&self) -> bool {
        self.mode == UiMode::Admin
    }

    /// Drains pending auth events. Returns true when the identity changed,
    /// which obliges the caller to rebuild the feed session.
    pub fn pump(&mut self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.events.try_recv() {
            let next = match event {
                AuthEvent::SignedIn(identity) => Some(identity),
                AuthEvent::SignedOut => None,
            };
            if next != self.identity {
                self.identity = next;
                self.mode = match &self.identity {
                    Some(identity) if self.admins.contains(&identity.email) => UiMode::Admin,
                    Some(_) => UiMode::Member,
                    None => UiMode::Visitor,
                };
                changed = true;
            }
        }
        changed
    }

    /// Interactive sign-in. A non-admin identity still signs in; it gets a
    /// member session without the composer.
    pub fn sign_in(&self, credential: Credential) -> Result<Identity> {
        self.auth.sign_in(credential)
    }

    pub fn register(&self, email: &str, password: &str) -> Result<Identity> {
        self.auth.register(email, password)
    }

    pub fn sign_out(&self) -> Result<()> {
        self.auth.sign_out()
    }
}

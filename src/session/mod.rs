//! Per-uid sessions and their backing system accounts.
//!
//! A session ties a uid to a provisioned system account (gid = uid) and a
//! home directory with `mnt` and `tmp` subdirectories. The registry holds
//! one record per uid for the daemon lifetime; creation is idempotent and
//! destruction is best effort.
//!
//! # Example
//!
//! ```no_run
//! use vmsandbox::session::{SessionRegistry, ShellAccounts};
//!
//! let sessions = SessionRegistry::new(Box::new(ShellAccounts));
//! let created = sessions.create(2001, None).unwrap();
//! assert_eq!(created.username, "session2001");
//!
//! // A second create returns the same record.
//! let again = sessions.create(2001, None).unwrap();
//! assert_eq!(created, again);
//! ```

mod provisioner;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::error::SessionError;
use crate::protocol::message::SessionReply;

pub use provisioner::{AccountProvisioner, ShellAccounts};

/// Login shell given to session accounts.
const SESSION_SHELL: &str = "/bin/bash";

/// One provisioned session.
#[derive(Debug, Clone)]
pub struct Session {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub home_dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn reply(&self) -> SessionReply {
        SessionReply {
            uid: self.uid,
            gid: self.gid,
            username: self.username.clone(),
            home_dir: self.home_dir.display().to_string(),
        }
    }
}

/// Registry of live sessions, keyed by uid.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u32, Session>>,
    provisioner: Box<dyn AccountProvisioner>,
    home_base: PathBuf,
}

impl SessionRegistry {
    /// Creates a registry with homes under `/home`.
    #[must_use]
    pub fn new(provisioner: Box<dyn AccountProvisioner>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            provisioner,
            home_base: PathBuf::from("/home"),
        }
    }

    /// Overrides the home base directory.
    #[must_use]
    pub fn with_home_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.home_base = base.into();
        self
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Session>> {
        #[allow(clippy::expect_used)]
        self.sessions.lock().expect("session registry poisoned")
    }

    /// Number of live sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.registry().len()
    }

    /// Looks up an existing session.
    #[must_use]
    pub fn get(&self, uid: u32) -> Option<SessionReply> {
        self.registry().get(&uid).map(Session::reply)
    }

    /// Creates the session for `uid`, or returns the existing one.
    ///
    /// The backing account is provisioned idempotently (gid = uid), and
    /// `${home}`, `${home}/mnt`, `${home}/tmp` are created and chowned to
    /// the session identity.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if provisioning or directory setup fails;
    /// nothing is registered in that case.
    #[instrument(skip(self))]
    pub fn create(&self, uid: u32, username: Option<&str>) -> Result<SessionReply, SessionError> {
        if let Some(existing) = self.get(uid) {
            debug!(uid, "Session already exists");
            return Ok(existing);
        }

        let username = username
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("session{uid}"));
        let home_dir = self.home_base.join(uid.to_string());

        self.provisioner.ensure_group(uid, &username)?;
        self.provisioner
            .ensure_user(uid, uid, &username, &home_dir, SESSION_SHELL)?;

        for dir in [home_dir.clone(), home_dir.join("mnt"), home_dir.join("tmp")] {
            fs::create_dir_all(&dir).map_err(|source| SessionError::IoError {
                context: format!("creating {}", dir.display()),
                source,
            })?;
        }
        self.provisioner.recursive_chown(&home_dir, uid, uid)?;

        let session = Session {
            uid,
            gid: uid,
            username,
            home_dir,
            created_at: Utc::now(),
        };
        let reply = session.reply();
        self.registry().insert(uid, session);
        debug!(uid, username = %reply.username, "Session created");
        Ok(reply)
    }

    /// Destroys the session for `uid`.
    ///
    /// The registry entry is removed first; deleting the home tree (when
    /// requested) and the system account are best effort and only logged on
    /// failure. Unknown uids are a no-op.
    #[instrument(skip(self))]
    pub fn destroy(&self, uid: u32, delete_home: bool) -> Result<(), SessionError> {
        let Some(session) = self.registry().remove(&uid) else {
            debug!(uid, "destroy for unknown session ignored");
            return Ok(());
        };

        if delete_home {
            if let Err(err) = fs::remove_dir_all(&session.home_dir) {
                warn!(uid, home = %session.home_dir.display(), %err, "failed to delete home");
            }
        }
        if let Err(err) = self.provisioner.delete_user(&session.username) {
            warn!(uid, %err, "failed to delete account");
        }
        debug!(uid, "Session destroyed");
        Ok(())
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("count", &self.count())
            .field("home_base", &self.home_base)
            .finish()
    }
}

//! Integration tests for session management.
//!
//! These verify:
//! - Idempotent creation (one record per uid, identical replies)
//! - Username derivation and home directory layout
//! - Destruction, with and without home deletion
//! - Provisioner failure handling
//!
//! All tests use in-memory provisioner fakes so no system accounts are
//! touched.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use vmsandbox::error::SessionError;
use vmsandbox::session::{AccountProvisioner, SessionRegistry};

/// Recording fake: every operation succeeds and is remembered.
#[derive(Debug, Default)]
struct RecordingAccounts {
    groups: Mutex<Vec<(u32, String)>>,
    users: Mutex<Vec<(u32, u32, String, PathBuf)>>,
    deleted: Mutex<Vec<String>>,
    chowns: Mutex<Vec<(PathBuf, u32, u32)>>,
}

impl AccountProvisioner for RecordingAccounts {
    fn ensure_group(&self, gid: u32, name: &str) -> Result<(), SessionError> {
        self.groups
            .lock()
            .expect("lock")
            .push((gid, name.to_string()));
        Ok(())
    }

    fn ensure_user(
        &self,
        uid: u32,
        gid: u32,
        name: &str,
        home: &Path,
        _shell: &str,
    ) -> Result<(), SessionError> {
        self.users
            .lock()
            .expect("lock")
            .push((uid, gid, name.to_string(), home.to_path_buf()));
        Ok(())
    }

    fn delete_user(&self, name: &str) -> Result<(), SessionError> {
        self.deleted.lock().expect("lock").push(name.to_string());
        Ok(())
    }

    fn recursive_chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), SessionError> {
        self.chowns
            .lock()
            .expect("lock")
            .push((path.to_path_buf(), uid, gid));
        Ok(())
    }
}

/// Shares a [`RecordingAccounts`] with the registry so tests can inspect
/// what was provisioned.
#[derive(Debug, Clone)]
struct SharedAccounts(std::sync::Arc<RecordingAccounts>);

impl AccountProvisioner for SharedAccounts {
    fn ensure_group(&self, gid: u32, name: &str) -> Result<(), SessionError> {
        self.0.ensure_group(gid, name)
    }

    fn ensure_user(
        &self,
        uid: u32,
        gid: u32,
        name: &str,
        home: &Path,
        shell: &str,
    ) -> Result<(), SessionError> {
        self.0.ensure_user(uid, gid, name, home, shell)
    }

    fn delete_user(&self, name: &str) -> Result<(), SessionError> {
        self.0.delete_user(name)
    }

    fn recursive_chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), SessionError> {
        self.0.recursive_chown(path, uid, gid)
    }
}

/// Failing fake: user creation always errors.
#[derive(Debug, Default)]
struct BrokenAccounts;

impl AccountProvisioner for BrokenAccounts {
    fn ensure_group(&self, _gid: u32, _name: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn ensure_user(
        &self,
        uid: u32,
        _gid: u32,
        _name: &str,
        _home: &Path,
        _shell: &str,
    ) -> Result<(), SessionError> {
        Err(SessionError::Provision {
            uid,
            reason: String::from("useradd exploded"),
        })
    }

    fn delete_user(&self, _name: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn recursive_chown(&self, _path: &Path, _uid: u32, _gid: u32) -> Result<(), SessionError> {
        Ok(())
    }
}

fn registry_in(dir: &tempfile::TempDir) -> SessionRegistry {
    SessionRegistry::new(Box::new(RecordingAccounts::default()))
        .with_home_base(dir.path().join("home"))
}

// =============================================================================
// Creation
// =============================================================================

#[test]
fn test_create_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_in(&dir);

    let first = registry.create(2001, None).expect("first create");
    let second = registry.create(2001, None).expect("second create");

    assert_eq!(first, second);
    assert_eq!(registry.count(), 1);
}

#[test]
fn test_create_derives_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_in(&dir);

    let reply = registry.create(2001, None).expect("create");
    assert_eq!(reply.uid, 2001);
    assert_eq!(reply.gid, 2001);
    assert_eq!(reply.username, "session2001");
    assert!(reply.home_dir.ends_with("/2001"));
}

#[test]
fn test_create_honors_explicit_username() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_in(&dir);

    let reply = registry.create(2002, Some("builder")).expect("create");
    assert_eq!(reply.username, "builder");
}

#[test]
fn test_create_builds_home_layout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_in(&dir);

    let reply = registry.create(2003, None).expect("create");
    let home = PathBuf::from(&reply.home_dir);
    assert!(home.is_dir(), "home should exist");
    assert!(home.join("mnt").is_dir(), "home/mnt should exist");
    assert!(home.join("tmp").is_dir(), "home/tmp should exist");
}

#[test]
fn test_create_provisions_group_user_and_chown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let accounts = std::sync::Arc::new(RecordingAccounts::default());
    let registry = SessionRegistry::new(Box::new(SharedAccounts(accounts.clone())))
        .with_home_base(dir.path().join("home"));

    registry.create(2004, None).expect("create");

    assert_eq!(
        accounts.groups.lock().expect("lock").as_slice(),
        &[(2004, String::from("session2004"))]
    );
    let users = accounts.users.lock().expect("lock");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].0, 2004);
    assert_eq!(users[0].1, 2004);
    assert_eq!(users[0].2, "session2004");
    assert_eq!(accounts.chowns.lock().expect("lock").len(), 1);
}

#[test]
fn test_distinct_uids_get_distinct_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_in(&dir);

    let a = registry.create(2001, None).expect("create a");
    let b = registry.create(2002, None).expect("create b");

    assert_ne!(a.username, b.username);
    assert_ne!(a.home_dir, b.home_dir);
    assert_eq!(registry.count(), 2);
}

// =============================================================================
// Destruction
// =============================================================================

#[test]
fn test_destroy_removes_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_in(&dir);

    registry.create(2001, None).expect("create");
    registry.destroy(2001, false).expect("destroy");
    assert_eq!(registry.count(), 0);
    assert!(registry.get(2001).is_none());
}

#[test]
fn test_destroy_keeps_home_unless_asked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_in(&dir);

    let reply = registry.create(2001, None).expect("create");
    registry.destroy(2001, false).expect("destroy");
    assert!(PathBuf::from(&reply.home_dir).is_dir());
}

#[test]
fn test_destroy_deletes_home_when_asked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_in(&dir);

    let reply = registry.create(2001, None).expect("create");
    registry.destroy(2001, true).expect("destroy");
    assert!(!PathBuf::from(&reply.home_dir).exists());
}

#[test]
fn test_destroy_unknown_uid_is_a_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_in(&dir);
    registry.destroy(4242, true).expect("destroy of unknown uid");
}

#[test]
fn test_recreate_after_destroy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_in(&dir);

    registry.create(2001, None).expect("create");
    registry.destroy(2001, true).expect("destroy");
    let again = registry.create(2001, None).expect("recreate");
    assert_eq!(again.username, "session2001");
    assert_eq!(registry.count(), 1);
}

// =============================================================================
// Failure handling
// =============================================================================

#[test]
fn test_provisioner_failure_registers_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = SessionRegistry::new(Box::new(BrokenAccounts))
        .with_home_base(dir.path().join("home"));

    let result = registry.create(2001, None);
    assert!(matches!(result, Err(SessionError::Provision { uid: 2001, .. })));
    assert_eq!(registry.count(), 0);
}

//! Self-watch on the daemon's own binary.
//!
//! A daemon running old code must not outlive an update of the binary it was
//! loaded from. The watch fires on any matching event; the daemon turns that
//! into a stop request.

use crate::error::Result;
use crate::platform::paths::is_shared_dir;
use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Which path is watched, chosen from where the binary is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// The binary itself. Used when it sits in a directory shared with other
    /// programs, where directory events would be unrelated installs.
    File(PathBuf),
    /// The binary's own install directory, to catch replace-by-rename updates.
    Directory(PathBuf),
}

impl WatchTarget {
    pub fn for_binary(code_path: &Path, shared_dirs: &[PathBuf]) -> Self {
        match code_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !is_shared_dir(parent, shared_dirs) => {
                WatchTarget::Directory(parent.to_path_buf())
            }
            _ => WatchTarget::File(code_path.to_path_buf()),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            WatchTarget::File(path) | WatchTarget::Directory(path) => path,
        }
    }

    pub fn mask(&self) -> EventMask {
        match self {
            WatchTarget::File(_) => EventMask::FILE,
            WatchTarget::Directory(_) => EventMask::DIRECTORY,
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::File(path) => write!(f, "file {}", path.display()),
            WatchTarget::Directory(path) => write!(f, "directory {}", path.display()),
        }
    }
}

/// Event kinds that count as a change of the watched artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask {
    pub create: bool,
    pub remove: bool,
    pub modify_data: bool,
    pub rename: bool,
}

impl EventMask {
    /// Self-delete and content modification.
    pub const FILE: EventMask = EventMask {
        create: false,
        remove: true,
        modify_data: true,
        rename: false,
    };

    /// Entry creation, deletion (including the directory itself) and moves
    /// in either direction.
    pub const DIRECTORY: EventMask = EventMask {
        create: true,
        remove: true,
        modify_data: false,
        rename: true,
    };

    pub fn matches(&self, kind: &EventKind) -> bool {
        match kind {
            EventKind::Create(_) => self.create,
            EventKind::Remove(_) => self.remove,
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                self.modify_data
            }
            EventKind::Modify(ModifyKind::Name(_)) => self.rename,
            _ => false,
        }
    }
}

/// A live watch. Dropping it stops watching.
pub struct SelfWatch {
    target: WatchTarget,
    _watcher: RecommendedWatcher,
}

impl fmt::Debug for SelfWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfWatch")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl SelfWatch {
    /// Start watching `target`, calling `on_change` from the watcher thread
    /// for every matching event.
    pub fn arm<F>(target: WatchTarget, on_change: F) -> Result<Self>
    where
        F: Fn(&Event) + Send + 'static,
    {
        let mask = target.mask();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if mask.matches(&event.kind) => {
                debug!("Self-watch event {:?} on {:?}", event.kind, event.paths);
                on_change(&event);
            }
            Ok(event) => trace!("Ignoring self-watch event {:?}", event.kind),
            Err(e) => warn!("Self-watch error: {}", e),
        })?;

        watcher.watch(target.path(), RecursiveMode::NonRecursive)?;
        info!("Start monitoring {}", target);

        Ok(Self {
            target,
            _watcher: watcher,
        })
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_binary_in_shared_dir_is_watched_directly() {
        let shared = TempDir::new().unwrap();
        let binary = shared.path().join("tool");

        let target = WatchTarget::for_binary(&binary, &[shared.path().to_path_buf()]);
        assert_eq!(target, WatchTarget::File(binary));
        assert_eq!(target.mask(), EventMask::FILE);
    }

    #[test]
    fn test_binary_in_own_dir_watches_the_dir() {
        let install = TempDir::new().unwrap();
        let binary = install.path().join("tool");

        let target = WatchTarget::for_binary(&binary, &[PathBuf::from("/usr/bin")]);
        assert_eq!(target, WatchTarget::Directory(install.path().to_path_buf()));
        assert_eq!(target.mask(), EventMask::DIRECTORY);
    }

    #[test]
    fn test_file_mask() {
        let mask = EventMask::FILE;
        assert!(mask.matches(&EventKind::Remove(RemoveKind::File)));
        assert!(mask.matches(&EventKind::Modify(ModifyKind::Data(DataChange::Content))));
        assert!(mask.matches(&EventKind::Modify(ModifyKind::Any)));
        assert!(!mask.matches(&EventKind::Create(CreateKind::File)));
        assert!(!mask.matches(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions))));
    }

    #[test]
    fn test_directory_mask() {
        let mask = EventMask::DIRECTORY;
        assert!(mask.matches(&EventKind::Create(CreateKind::File)));
        assert!(mask.matches(&EventKind::Remove(RemoveKind::Folder)));
        assert!(mask.matches(&EventKind::Modify(ModifyKind::Name(RenameMode::To))));
        assert!(mask.matches(&EventKind::Modify(ModifyKind::Name(RenameMode::From))));
        assert!(!mask.matches(&EventKind::Modify(ModifyKind::Data(DataChange::Any))));
        assert!(!mask.matches(&EventKind::Access(notify::event::AccessKind::Any)));
    }

    #[test]
    fn test_directory_watch_fires_on_new_entry() {
        let install = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let _watch = SelfWatch::arm(WatchTarget::Directory(install.path().to_path_buf()), move |e| {
            let _ = tx.send(e.kind);
        })
        .unwrap();

        std::fs::write(install.path().join("tool.new"), b"v2").unwrap();

        let kind = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(EventMask::DIRECTORY.matches(&kind));
    }

    #[test]
    fn test_file_watch_fires_on_modification() {
        let shared = TempDir::new().unwrap();
        let binary = shared.path().join("tool");
        std::fs::write(&binary, b"v1").unwrap();
        let (tx, rx) = mpsc::channel();

        let _watch = SelfWatch::arm(WatchTarget::File(binary.clone()), move |e| {
            let _ = tx.send(e.kind);
        })
        .unwrap();

        std::fs::write(shared.path().join("neighbour"), b"other").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        std::fs::write(&binary, b"v2").unwrap();
        let kind = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(EventMask::FILE.matches(&kind));
    }

    #[test]
    fn test_arm_missing_path_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        assert!(SelfWatch::arm(WatchTarget::File(missing), |_| {}).is_err());
    }
}

//! Discovery announcements.
//!
//! A daemon announces itself at startup and again whenever a losing launch
//! asks it to. Listeners use the announcement to find the endpoint and to
//! check that it came from a privileged sender.

use super::intent::ComponentName;
use crate::error::{Result, SoloError};
use crate::platform::{announce_dir, current_uid, is_privileged};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// The discovery message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub service: String,
    pub component: ComponentName,
    pub pid: u32,
    pub port: u16,
    pub sender_uid: u32,
    /// Set when the sender runs with root privileges.
    pub privileged: bool,
    pub sent_at: String,
}

impl Announcement {
    /// Announcement for the current process serving `component` on `port`.
    pub fn new(component: &ComponentName, port: u16) -> Self {
        Self {
            service: component.service_name(),
            component: component.clone(),
            pid: process::id(),
            port,
            sender_uid: current_uid(),
            privileged: is_privileged(),
            sent_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Delivers announcements to whoever listens for them.
pub trait Announcer: Send + Sync {
    fn send(&self, announcement: &Announcement) -> Result<()>;
}

/// Writes each announcement atomically to `<dir>/<service>.json`.
///
/// The newest announcement for a service replaces the previous one.
#[derive(Debug, Clone)]
pub struct AnnouncementDir {
    dir: PathBuf,
}

impl AnnouncementDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The announcement directory under the soloipc config dir.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(announce_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, service: &str) -> PathBuf {
        let file_name: String = service
            .chars()
            .map(|c| match c {
                ':' | '/' | '\\' => '_',
                c => c,
            })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }

    /// Latest announcement for `service`, if any.
    pub fn read(&self, service: &str) -> Result<Option<Announcement>> {
        let path = self.path_for(service);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SoloError::io_with_path(e, path)),
        };
        let announcement = serde_json::from_str(&contents).map_err(|e| SoloError::Json {
            message: format!("Failed to parse {}: {}", path.display(), e),
            source: Some(e),
        })?;
        Ok(Some(announcement))
    }

    /// Every readable announcement in the directory, sorted by service.
    pub fn list(&self) -> Result<Vec<Announcement>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SoloError::io_with_path(e, &self.dir)),
        };

        let mut announcements = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(SoloError::from)
                .and_then(|s| serde_json::from_str::<Announcement>(&s).map_err(SoloError::from))
            {
                Ok(announcement) => announcements.push(announcement),
                Err(e) => warn!("Skipping unreadable announcement {}: {}", path.display(), e),
            }
        }
        announcements.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(announcements)
    }
}

impl Announcer for AnnouncementDir {
    fn send(&self, announcement: &Announcement) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| SoloError::io_with_path(e, &self.dir))?;

        let path = self.path_for(&announcement.service);
        let temp_path = path.with_extension(format!("json.{}.tmp", process::id()));
        let serialized = serde_json::to_string_pretty(announcement)?;

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| SoloError::io_with_path(e, &temp_path))?;
            file.write_all(serialized.as_bytes())
                .map_err(|e| SoloError::io_with_path(e, &temp_path))?;
            file.sync_all()
                .map_err(|e| SoloError::io_with_path(e, &temp_path))?;
        }

        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            SoloError::io_with_path(e, &path)
        })?;

        debug!("Announced {} at {}", announcement.service, path.display());
        Ok(())
    }
}

/// In-process announcement channel.
#[derive(Debug, Clone)]
pub struct LocalAnnouncer {
    tx: broadcast::Sender<Announcement>,
}

impl LocalAnnouncer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Announcement> {
        self.tx.subscribe()
    }
}

impl Default for LocalAnnouncer {
    fn default() -> Self {
        Self::new(16)
    }
}

impl Announcer for LocalAnnouncer {
    fn send(&self, announcement: &Announcement) -> Result<()> {
        match self.tx.send(announcement.clone()) {
            Ok(listeners) => debug!("Announced {} to {} listeners", announcement.service, listeners),
            Err(_) => debug!("Announced {} with no listeners", announcement.service),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn announcement(port: u16) -> Announcement {
        Announcement::new(&ComponentName::new("app", "app.Svc"), port)
    }

    #[test]
    fn test_announcement_describes_this_process() {
        let a = announcement(4242);
        assert_eq!(a.service, "soloipc:app/app.Svc");
        assert_eq!(a.pid, process::id());
        assert_eq!(a.sender_uid, current_uid());
        assert_eq!(a.privileged, current_uid() == 0);
    }

    #[test]
    fn test_dir_announcer_replaces_previous_announcement() {
        let temp = TempDir::new().unwrap();
        let announcer = AnnouncementDir::new(temp.path().join("announce"));

        announcer.send(&announcement(1000)).unwrap();
        announcer.send(&announcement(2000)).unwrap();

        let latest = announcer.read("soloipc:app/app.Svc").unwrap().unwrap();
        assert_eq!(latest.port, 2000);
        assert_eq!(announcer.list().unwrap().len(), 1);

        let leftovers: Vec<_> = fs::read_dir(announcer.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_dir_announcer_missing_dir_reads_empty() {
        let temp = TempDir::new().unwrap();
        let announcer = AnnouncementDir::new(temp.path().join("nothing"));

        assert!(announcer.read("soloipc:app/app.Svc").unwrap().is_none());
        assert!(announcer.list().unwrap().is_empty());
    }

    #[test]
    fn test_path_for_flattens_service_name() {
        let announcer = AnnouncementDir::new("/tmp/announce");
        assert_eq!(
            announcer.path_for("soloipc:app/app.Svc"),
            PathBuf::from("/tmp/announce/soloipc_app_app.Svc.json")
        );
    }

    #[tokio::test]
    async fn test_local_announcer_reaches_subscribers() {
        let announcer = LocalAnnouncer::default();
        let mut rx = announcer.subscribe();

        announcer.send(&announcement(3000)).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.port, 3000);
    }

    #[test]
    fn test_local_announcer_without_listeners_is_ok() {
        let announcer = LocalAnnouncer::default();
        assert!(announcer.send(&announcement(1)).is_ok());
    }
}

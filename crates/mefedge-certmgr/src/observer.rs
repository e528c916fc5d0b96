//! Filesystem observer for the certificate tree.
//!
//! Consumers (local services holding TLS material) register a handler;
//! whenever a certificate, CRL or key file changes on disk the event
//! fans out to every registered handler so each consumer can reload.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
}

type UpdateHandler = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
pub struct CertObserver {
    handlers: RwLock<Vec<(String, UpdateHandler)>>,
}

impl CertObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer's update handler under a label used only
    /// for logging.
    pub fn register<F>(&self, consumer: &str, handler: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut handlers = write_lock(&self.handlers);
        handlers.push((consumer.to_string(), Box::new(handler)));
    }

    /// Fan one change out to every registered consumer.
    pub fn dispatch(&self, event: &ChangeEvent) {
        let handlers = read_lock(&self.handlers);
        for (consumer, handler) in handlers.iter() {
            tracing::debug!(consumer = %consumer, path = %event.path.display(), "certificate change");
            handler(event);
        }
    }

    /// Start watching `root` recursively. The returned watcher must be
    /// kept alive for events to keep flowing.
    pub fn watch(self: &Arc<Self>, root: &Path) -> notify::Result<RecommendedWatcher> {
        let observer = Arc::clone(self);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "certificate watcher error");
                    return;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }
            for path in event.paths {
                if is_relevant(&path) {
                    observer.dispatch(&ChangeEvent { path });
                }
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), "certificate tree watch started");
        Ok(watcher)
    }
}

/// Final artifacts plus the staged `.crt.new` root, whose appearance
/// announces a rotation in flight. Backup and tmp companions are
/// written as part of the same operation and would double-fire.
fn is_relevant(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.ends_with(".backup") || name.ends_with(".tmp") {
        return false;
    }
    name.ends_with(".crt") || name.ends_with(".crl") || name.ends_with(".key")
        || name.ends_with(".crt.new")
}

fn read_lock<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatch_reaches_every_consumer() {
        let observer = CertObserver::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let a2 = a.clone();
        observer.register("edge_om", move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        let b2 = b.clone();
        observer.register("nginx", move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        });

        observer.dispatch(&ChangeEvent {
            path: PathBuf::from("/tmp/certs/inner/ca.crt"),
        });
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_sees_the_changed_path() {
        let observer = CertObserver::new();
        let seen = Arc::new(RwLock::new(None));
        let seen2 = seen.clone();
        observer.register("edge_om", move |e| {
            *seen2.write().unwrap() = Some(e.path.clone());
        });
        observer.dispatch(&ChangeEvent {
            path: PathBuf::from("/certs/image/ca.crl"),
        });
        assert_eq!(
            seen.read().unwrap().as_deref(),
            Some(Path::new("/certs/image/ca.crl"))
        );
    }

    #[test]
    fn staging_and_backup_files_are_ignored() {
        assert!(is_relevant(Path::new("/c/inner/ca.crt")));
        assert!(is_relevant(Path::new("/c/inner/service.key")));
        assert!(!is_relevant(Path::new("/c/inner/ca.crt.backup")));
        assert!(!is_relevant(Path::new("/c/inner/ca.crt.tmp")));
        assert!(!is_relevant(Path::new("/c/inner/notes.txt")));
    }

    #[test]
    fn staged_rotation_root_is_relevant() {
        assert!(is_relevant(Path::new("/c/ws_client/ca.crt.new")));
        assert!(!is_relevant(Path::new("/c/ws_client/ca.crt.new.tmp")));
    }
}

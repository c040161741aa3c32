use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use engine::ReloadController;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use pool::WorkerPool;
use stdio as stdio_log;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Keeps file watching alive; dropping it stops event delivery.
pub struct WatchGuard {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch `paths` and reload every environment after a burst of changes.
///
/// Host-local environments reload in place; workers get an untagged
/// `full-reload`.
pub fn start_watch(
    paths: &[PathBuf],
    debounce: Duration,
    reload: ReloadController,
    pool: Option<Arc<WorkerPool>>,
) -> Result<WatchGuard, String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })
    .map_err(|err| err.to_string())?;

    for path in paths {
        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|err| format!("Failed to watch {}: {}", path.display(), err))?;
        stdio_log::log("watch", &path.display().to_string());
    }

    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut changed = BTreeSet::new();
            collect(event, &mut changed);
            tokio::time::sleep(debounce).await;
            while let Ok(event) = rx.try_recv() {
                collect(event, &mut changed);
            }
            if changed.is_empty() {
                continue;
            }

            let changed: Vec<String> = changed.into_iter().collect();
            stdio_log::log("watch", &format!("changed {}", changed.join(", ")));
            if let Some(pool) = &pool {
                let signalled = pool.full_reload(None);
                tracing::debug!("reload signalled to {} worker(s)", signalled);
            }
            let summary = reload.reload_all().await;
            for failed in summary.failed() {
                let message = failed.error.as_deref().unwrap_or("unknown error");
                stdio_log::error("reload", &format!("{}: {}", failed.name, message));
            }
        }
    });

    Ok(WatchGuard {
        _watcher: watcher,
        task,
    })
}

fn collect(event: notify::Result<Event>, changed: &mut BTreeSet<String>) {
    match event {
        Ok(event) => changed.extend(relevant_paths(&event)),
        Err(err) => tracing::warn!("watch error: {}", err),
    }
}

/// Paths in `event` that should trigger a reload.
///
/// Reads and listener sockets are ignored.
fn relevant_paths(event: &Event) -> Vec<String> {
    if matches!(event.kind, EventKind::Access(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|path| path.extension().is_none_or(|ext| ext != "sock"))
        .map(|path| path.to_string_lossy().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{EnvironmentRegistry, ErrorRenderer, HandlerError, MapLoader, Module, handler_fn};
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn access_events_are_ignored() {
        let event = Event::new(EventKind::Access(AccessKind::Any)).add_path("/srv/app.js".into());
        assert!(relevant_paths(&event).is_empty());
    }

    #[test]
    fn socket_files_are_ignored() {
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path("/tmp/envmux-1-api-abc.sock".into())
            .add_path("/srv/api.js".into());
        assert_eq!(relevant_paths(&event), vec!["/srv/api.js".to_string()]);
    }

    #[test]
    fn modifications_are_relevant() {
        let event = Event::new(EventKind::Modify(ModifyKind::Any)).add_path("/srv/public".into());
        assert_eq!(relevant_paths(&event), vec!["/srv/public".to_string()]);
    }

    #[tokio::test]
    async fn file_change_reloads_local_environments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let loader = MapLoader::new().entry("./api.js", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(Module::new().with_default(handler_fn(|_req| async {
                    Err::<engine::HttpResponse, _>(HandlerError::new("unused"))
                })))
            }
        });
        let registry = Arc::new(EnvironmentRegistry::new(
            Arc::new(loader),
            Default::default(),
            ErrorRenderer::production(),
        ));
        registry.register("api", "./api.js");
        let reload = ReloadController::new(Arc::clone(&registry));
        let _ = reload.reload_one("api").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = loads.load(Ordering::SeqCst);

        let _guard = start_watch(
            &[dir.path().to_path_buf()],
            Duration::from_millis(20),
            reload,
            None,
        )
        .expect("watch");
        std::fs::write(dir.path().join("api.js"), "changed").expect("write");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while loads.load(Ordering::SeqCst) == before {
            assert!(tokio::time::Instant::now() < deadline, "no reload after change");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

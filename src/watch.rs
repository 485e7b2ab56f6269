//! Live reloading of the translation rule file.
//!
//! A background thread watches the directory containing the rule file (editors
//! often replace files instead of writing in place) and, after changes settle,
//! recompiles the rules and swaps them into the shared translator.

use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::events::Event;
use crate::rules::RuleFile;
use crate::translate::Translator;

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Spawns the watcher thread for `rules`.
pub fn spawn_rules_watcher(rules: RuleFile, translator: Arc<Translator>, tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || {
        if let Err(err) = watch_rules(&rules, &translator, tx) {
            tracing::warn!(path = %rules.path().display(), error = %err, "rule file watcher stopped");
        }
    });
}

fn watch_rules(rules: &RuleFile, translator: &Translator, tx: mpsc::Sender<Event>) -> Result<()> {
    let target = absolute(rules.path())?;
    let dir = target
        .parent()
        .map(Path::to_path_buf)
        .context("rule file has no parent directory")?;

    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;

    loop {
        let event = match raw_rx.recv() {
            Ok(res) => res,
            Err(_) => break,
        };
        if !is_relevant(&event, &target) {
            continue;
        }

        let mut last = Instant::now();
        loop {
            let elapsed = last.elapsed();
            if elapsed >= DEBOUNCE {
                break;
            }
            match raw_rx.recv_timeout(DEBOUNCE - elapsed) {
                Ok(res) => {
                    if is_relevant(&res, &target) {
                        last = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }

        match translator.reload(rules) {
            Ok(count) => {
                let _ = tx.blocking_send(Event::RulesReloaded { rules: count });
            }
            // Mid-save states (file briefly missing) keep the previous table.
            Err(err) => tracing::warn!(error = %err, "rule reload failed, keeping previous rules"),
        }
    }

    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("failed to resolve current dir")?
        .join(path))
}

fn is_relevant(event: &notify::Result<NotifyEvent>, target: &Path) -> bool {
    let Ok(event) = event else {
        return false;
    };
    if event.kind.is_access() {
        return false;
    }
    event
        .paths
        .iter()
        .any(|path| path.file_name().is_some() && path.file_name() == target.file_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, EventKind, ModifyKind};

    fn event(kind: EventKind, path: &str) -> notify::Result<NotifyEvent> {
        Ok(NotifyEvent::new(kind).add_path(PathBuf::from(path)))
    }

    #[test]
    fn only_changes_to_the_rule_file_count() {
        let target = Path::new("/srv/craftrack/logs.dict");
        assert!(is_relevant(
            &event(EventKind::Modify(ModifyKind::Any), "/srv/craftrack/logs.dict"),
            target
        ));
        assert!(is_relevant(
            &event(EventKind::Create(CreateKind::File), "/srv/craftrack/logs.dict"),
            target
        ));
        assert!(!is_relevant(
            &event(EventKind::Modify(ModifyKind::Any), "/srv/craftrack/servers.json"),
            target
        ));
        assert!(!is_relevant(
            &event(EventKind::Access(AccessKind::Any), "/srv/craftrack/logs.dict"),
            target
        ));
        assert!(!is_relevant(&Err(notify::Error::generic("boom")), target));
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let resolved = absolute(Path::new("data/logs.dict")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("data/logs.dict"));
    }
}

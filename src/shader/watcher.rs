use fg::{SourceWatcher, WatchQueue};
use hotwatch::{Event, Hotwatch};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Recursive directory watcher feeding the pass manager's touched-file
/// queue. The watcher thread is the only writer; the main thread drains the
/// queue at `begin_frame`.
pub struct HotwatchWatcher {
    hotwatch: Hotwatch,
    queue: WatchQueue,
    watched: HashSet<PathBuf>,
}

impl HotwatchWatcher {
    pub fn new(queue: WatchQueue) -> anyhow::Result<Self> {
        Ok(Self {
            hotwatch: Hotwatch::new().map_err(|err| anyhow::anyhow!("{}", err))?,
            queue,
            watched: HashSet::new(),
        })
    }
}

impl SourceWatcher for HotwatchWatcher {
    fn watch(&mut self, path: &Path) {
        if !self.watched.insert(path.to_owned()) {
            return;
        }

        let queue = self.queue.clone();

        let result = self.hotwatch.watch(path, move |event: Event| {
            let touched = match event {
                Event::Create(path) | Event::Write(path) | Event::NoticeWrite(path) => Some(path),
                Event::Rename(_, path) => Some(path),
                _ => None,
            };

            if let Some(path) = touched {
                queue.lock().unwrap().insert(path);
            }
        });

        if let Err(err) = result {
            log::warn!("failed to watch {}: {}", path.display(), err);
        }
    }
}

//! # SD Card Watcher
//!
//! The SD state starts `Unsure`: nothing is known until the printer is
//! asked for its files. A non-empty listing proves a card is present;
//! an empty one proves nothing and the printer is asked to re-init the
//! card (`M21`), which does report presence. Ejection has its own serial
//! message, so card removal is observed, not guessed.
//!
//! The directory tree is built lazily from the long-name listing
//! (`M20 -L`) and carries a bidirectional translation table between long
//! and short (8.3) paths. Insertion and ejection invalidate the tree; the
//! periodic tick rebuilds it on the next pass unless a print is running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use printer_protocol::{
    BEGIN_FILES_REGEX, END_FILES_REGEX, LFN_CAPTURE, SD_EJECTED_REGEX, SD_FILESCAN_INTERVAL,
    SD_INTERVAL, SD_MOUNT_NAME, SD_PRESENT_REGEX,
};

use crate::serial::instruction::CapturePattern;
use crate::serial::matcher::{LineMatcher, MatchToken};
use crate::serial::queue::SerialQueue;
use crate::serial::wait_for_instruction;
use crate::signal::Signal;
use crate::state::StateManager;

/// What is known about the card slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SdState {
    Unsure,
    Initialising,
    Present,
    Absent,
}

/// One node of the SD directory tree.
#[derive(Debug, Clone, Serialize)]
pub struct SdFile {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub children: Vec<SdFile>,
}

impl SdFile {
    pub fn new_root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            size: None,
            children: Vec::new(),
        }
    }

    /// Inserts a file under a `/`-separated long path, creating the
    /// intermediate directories.
    pub fn add_by_path(&mut self, path: &str, size: u64) {
        let components: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let Some((file_name, directories)) = components.split_last() else {
            return;
        };

        let mut node = self;
        for directory in directories {
            let position = node
                .children
                .iter()
                .position(|child| child.is_dir && child.name == *directory);
            let index = match position {
                Some(index) => index,
                None => {
                    node.children.push(SdFile {
                        name: (*directory).to_string(),
                        is_dir: true,
                        size: None,
                        children: Vec::new(),
                    });
                    node.children.len() - 1
                }
            };
            node = &mut node.children[index];
        }

        node.children.push(SdFile {
            name: (*file_name).to_string(),
            is_dir: false,
            size: Some(size),
            children: Vec::new(),
        });
    }

    /// Looks a node up by its `/`-separated long path.
    pub fn get(&self, path: &str) -> Option<&SdFile> {
        let mut node = self;
        for component in path.split('/').filter(|part| !part.is_empty()) {
            node = node.children.iter().find(|child| child.name == component)?;
        }
        Some(node)
    }

    pub fn file_count(&self) -> usize {
        self.children
            .iter()
            .map(|child| {
                if child.is_dir {
                    child.file_count()
                } else {
                    1
                }
            })
            .sum()
    }
}

/// Result of parsing one `M20 -L` listing.
pub struct ParsedListing {
    pub tree: SdFile,
    pub lfn_to_sfn: HashMap<String, String>,
    pub sfn_to_lfn: HashMap<String, String>,
}

/// Parses the captured lines of a long-name listing.
///
/// The listing interleaves directory entries, file entries and directory
/// exits; the current directory context does not repeat on file lines,
/// so it is carried along.
pub fn parse_long_listing(mount_name: &str, lines: &[String]) -> ParsedListing {
    let mut tree = SdFile::new_root(mount_name);
    let mut lfn_to_sfn = HashMap::new();
    let mut sfn_to_lfn = HashMap::new();
    let mut current_dir = PathBuf::from("/");

    for line in lines {
        let Some(captures) = LFN_CAPTURE.captures(line) else {
            continue;
        };
        if captures.name("dir_enter").is_some() {
            current_dir.push(&captures["dir_lfn"]);
        } else if captures.name("file").is_some() {
            let short_path = captures["sfn"].to_string();
            let long_name = &captures["lfn"];
            let long_path = current_dir.join(long_name).to_string_lossy().into_owned();
            let size: u64 = captures["size"].parse().unwrap_or(0);

            debug!(long_path, short_path, "adding a path translation");
            lfn_to_sfn.insert(long_path.clone(), short_path.clone());
            sfn_to_lfn.insert(short_path, long_path.clone());
            tree.add_by_path(&long_path, size);
        } else if captures.name("dir_exit").is_some() {
            current_dir.pop();
        }
    }

    ParsedListing {
        tree,
        lfn_to_sfn,
        sfn_to_lfn,
    }
}

struct SdData {
    sd_state: SdState,
    files: Option<SdFile>,
    lfn_to_sfn: HashMap<String, String>,
    sfn_to_lfn: HashMap<String, String>,
    invalidated: bool,
    last_updated: Option<tokio::time::Instant>,
    expecting_insertion: bool,
}

/// Signals published by the watcher.
pub struct SdSignals {
    pub sd_mounted: Signal<Option<SdFile>>,
    pub sd_unmounted: Signal<()>,
    pub tree_updated: Signal<Option<SdFile>>,
    pub state_changed: Signal<SdState>,
}

/// Watches the printer's SD card slot and mirrors its directory tree.
pub struct SdCardWatch {
    inner: Mutex<SdData>,
    pub signals: SdSignals,
    queue: Arc<SerialQueue>,
    state: Arc<StateManager>,
    mount_name: String,
    running: watch::Receiver<bool>,
    handler_tokens: Mutex<Vec<MatchToken>>,
}

impl SdCardWatch {
    pub fn new(
        queue: Arc<SerialQueue>,
        state: Arc<StateManager>,
        mount_name: Option<String>,
        running: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SdData {
                sd_state: SdState::Unsure,
                files: None,
                lfn_to_sfn: HashMap::new(),
                sfn_to_lfn: HashMap::new(),
                invalidated: true,
                last_updated: None,
                expecting_insertion: false,
            }),
            signals: SdSignals {
                sd_mounted: Signal::new(),
                sd_unmounted: Signal::new(),
                tree_updated: Signal::new(),
                state_changed: Signal::new(),
            },
            queue,
            state,
            mount_name: mount_name.unwrap_or_else(|| SD_MOUNT_NAME.to_string()),
            running,
            handler_tokens: Mutex::new(Vec::new()),
        })
    }

    /// Subscribes to the insertion and ejection reports.
    pub fn register_handlers(self: &Arc<Self>, matcher: &LineMatcher) {
        let mut tokens = self.handler_tokens.lock().expect("sd handler tokens poisoned");

        let weak = Arc::downgrade(self);
        tokens.push(matcher.add_handler(&SD_PRESENT_REGEX, move |captures| {
            if let Some(watch) = weak.upgrade() {
                if captures.name("ok").is_some() {
                    watch.sd_inserted();
                }
            }
        }));

        let weak = Arc::downgrade(self);
        tokens.push(matcher.add_handler(&SD_EJECTED_REGEX, move |_| {
            if let Some(watch) = weak.upgrade() {
                watch.sd_ejected();
            }
        }));
    }

    pub fn detach(&self, matcher: &LineMatcher) {
        let tokens: Vec<MatchToken> = self
            .handler_tokens
            .lock()
            .expect("sd handler tokens poisoned")
            .drain(..)
            .collect();
        for token in tokens {
            if let Err(err) = matcher.remove_handler(&token) {
                warn!(%err, "sd handler already removed");
            }
        }
    }

    pub fn sd_state(&self) -> SdState {
        self.lock().sd_state
    }

    pub fn files(&self) -> Option<SdFile> {
        self.lock().files.clone()
    }

    /// Long path to 8.3 path, from the last parsed listing.
    pub fn short_path_for(&self, long_path: &str) -> Option<String> {
        self.lock().lfn_to_sfn.get(long_path).cloned()
    }

    /// 8.3 path back to the long path.
    pub fn long_path_for(&self, short_path: &str) -> Option<String> {
        self.lock().sfn_to_lfn.get(short_path).cloned()
    }

    /// The periodic tick loop. Cycles fast, but re-scans only on events
    /// or in big intervals.
    pub async fn run(self: Arc<Self>) {
        let mut running = self.running.clone();
        let mut ticker = tokio::time::interval(SD_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.update().await;
                }
                _ = running.changed() => {
                    if !*running.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One watcher pass: skip while printing, rebuild when invalidated or
    /// overdue, then settle the presence question.
    pub async fn update(&self) {
        if self.state.get_state().is_printing_layer() {
            return;
        }

        {
            let data = self.lock();
            let overdue = data
                .last_updated
                .map_or(true, |at| at.elapsed() >= SD_FILESCAN_INTERVAL);
            if !data.invalidated && !overdue {
                return;
            }
        }
        {
            let mut data = self.lock();
            data.last_updated = Some(tokio::time::Instant::now());
            data.invalidated = false;
        }

        let listing = self.construct_file_tree().await;
        let (had_files, state_snapshot) = {
            let mut data = self.lock();
            match listing {
                Some(parsed) => {
                    let had_files = parsed.tree.file_count() > 0;
                    data.lfn_to_sfn = parsed.lfn_to_sfn;
                    data.sfn_to_lfn = parsed.sfn_to_lfn;
                    data.files = Some(parsed.tree);
                    (had_files, data.sd_state)
                }
                None => {
                    data.files = None;
                    (false, data.sd_state)
                }
            }
        };

        if state_snapshot == SdState::Unsure {
            if had_files {
                self.sd_state_changed(SdState::Present);
            } else {
                self.decide_presence().await;
            }
        }
        if self.lock().sd_state == SdState::Initialising {
            self.sd_state_changed(SdState::Present);
        }

        let files = self.files();
        self.signals.tree_updated.send(&files);
    }

    /// Builds the tree from an `M20 -L` listing; None while the card is
    /// known absent.
    async fn construct_file_tree(&self) -> Option<ParsedListing> {
        if self.lock().sd_state == SdState::Absent {
            return None;
        }

        let instruction = self.queue.enqueue_collecting(
            "M20 -L",
            CapturePattern {
                begin: &BEGIN_FILES_REGEX,
                item: &LFN_CAPTURE,
                end: &END_FILES_REGEX,
            },
        );
        if !wait_for_instruction(&instruction, &self.running).await {
            debug!("file listing did not confirm");
            return None;
        }
        Some(parse_long_listing(&self.mount_name, &instruction.captured()))
    }

    /// Asks the printer to re-init the card. Disruptive while a card is
    /// in use, fine when the tree is empty anyway.
    async fn decide_presence(&self) {
        self.lock().expecting_insertion = true;
        let instruction = self
            .queue
            .enqueue_matchable("M21", &SD_PRESENT_REGEX, false);
        let confirmed = wait_for_instruction(&instruction, &self.running).await;
        self.lock().expecting_insertion = false;

        if !confirmed {
            debug!("failed determining the SD presence");
            return;
        }
        if instruction.match_group("ok").is_some() {
            if self.lock().sd_state != SdState::Present {
                self.sd_state_changed(SdState::Present);
            }
        } else {
            self.sd_state_changed(SdState::Absent);
        }
    }

    /// An insertion report: expected after our own `M21`, otherwise the
    /// user pushed a card in.
    fn sd_inserted(&self) {
        let mut data = self.lock();
        if data.expecting_insertion {
            data.expecting_insertion = false;
            return;
        }
        data.invalidated = true;
        drop(data);
        self.sd_state_changed(SdState::Initialising);
    }

    fn sd_ejected(&self) {
        self.lock().invalidated = true;
        self.sd_state_changed(SdState::Absent);
    }

    fn sd_state_changed(&self, new_state: SdState) {
        let (mounted, unmounted, files) = {
            let mut data = self.lock();
            debug!(from = ?data.sd_state, to = ?new_state, "sd state changed");

            let mounted = matches!(data.sd_state, SdState::Initialising | SdState::Unsure)
                && new_state == SdState::Present;
            let unmounted = data.sd_state == SdState::Present
                && matches!(new_state, SdState::Absent | SdState::Initialising);

            data.sd_state = new_state;
            (mounted, unmounted, data.files.clone())
        };

        if mounted {
            self.signals.sd_mounted.send(&files);
        } else if unmounted {
            self.signals.sd_unmounted.send(&());
        }
        self.signals.state_changed.send(&new_state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SdData> {
        self.inner.lock().expect("sd watcher data poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> Vec<String> {
        vec![
            r#"DIR_ENTER: /OLD/ "old models""#.to_string(),
            r#"BENCHY~1.GCO 154208 "benchy boat.gcode""#.to_string(),
            "DIR_EXIT".to_string(),
            r#"CUBE~1.GCO 1024 "calibration cube.gcode""#.to_string(),
        ]
    }

    #[test]
    fn test_parse_long_listing_builds_tree_and_tables() {
        let parsed = parse_long_listing(SD_MOUNT_NAME, &listing());

        assert_eq!(parsed.tree.file_count(), 2);
        let nested = parsed.tree.get("/old models/benchy boat.gcode").unwrap();
        assert_eq!(nested.size, Some(154208));
        assert!(parsed.tree.get("/calibration cube.gcode").is_some());

        assert_eq!(
            parsed.lfn_to_sfn.get("/old models/benchy boat.gcode"),
            Some(&"BENCHY~1.GCO".to_string())
        );
        assert_eq!(
            parsed.sfn_to_lfn.get("CUBE~1.GCO"),
            Some(&"/calibration cube.gcode".to_string())
        );
    }

    #[test]
    fn test_translation_is_bijective_on_one_listing() {
        let parsed = parse_long_listing(SD_MOUNT_NAME, &listing());
        assert_eq!(parsed.lfn_to_sfn.len(), parsed.sfn_to_lfn.len());
        for (long, short) in &parsed.lfn_to_sfn {
            assert_eq!(parsed.sfn_to_lfn.get(short), Some(long));
        }
        for (short, long) in &parsed.sfn_to_lfn {
            assert_eq!(parsed.lfn_to_sfn.get(long), Some(short));
        }
    }

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SdRig {
        watch: Arc<SdCardWatch>,
        _running_tx: watch::Sender<bool>,
        _port_rx: tokio::sync::mpsc::Receiver<crate::serial::link::PortCommand>,
    }

    fn rigged_watch() -> SdRig {
        let (port_tx, port_rx) = tokio::sync::mpsc::channel(8);
        let (running_tx, running_rx) = watch::channel(true);
        let queue = SerialQueue::new(port_tx, running_rx.clone());
        let state = StateManager::new(crate::state::StateOptions::default());
        SdRig {
            watch: SdCardWatch::new(queue, state, None, running_rx),
            _running_tx: running_tx,
            _port_rx: port_rx,
        }
    }

    #[test]
    fn test_mount_and_unmount_edges() {
        let rig = rigged_watch();
        let mounted = Arc::new(AtomicUsize::new(0));
        let unmounted = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&mounted);
        rig.watch.signals.sd_mounted.connect(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let counted = Arc::clone(&unmounted);
        rig.watch.signals.sd_unmounted.connect(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        rig.watch.sd_state_changed(SdState::Present);
        assert_eq!(mounted.load(Ordering::SeqCst), 1);

        rig.watch.sd_state_changed(SdState::Absent);
        assert_eq!(unmounted.load(Ordering::SeqCst), 1);

        // Absent -> Present is a plain state change, not a mount edge.
        rig.watch.sd_state_changed(SdState::Present);
        assert_eq!(mounted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expected_insertion_is_swallowed() {
        let rig = rigged_watch();
        rig.watch.lock().expecting_insertion = true;

        rig.watch.sd_inserted();
        assert_eq!(rig.watch.sd_state(), SdState::Unsure, "self-inflicted report ignored");
        assert!(!rig.watch.lock().expecting_insertion);

        rig.watch.sd_inserted();
        assert_eq!(rig.watch.sd_state(), SdState::Initialising, "a real insertion counts");
        assert!(rig.watch.lock().invalidated);
    }
}

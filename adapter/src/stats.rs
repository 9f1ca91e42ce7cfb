//! Print progress and time estimation.
//!
//! For files without inbuilt progress reporting the adapter estimates
//! both from how many commands have executed so far: the file is scanned
//! once when the print starts, then each progress query extrapolates the
//! time per command over the commands that remain. Sliced files end with
//! a tail of park / cooldown moves, so progress clamps to 100 % once the
//! counter gets within that tail.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::info;

use printer_protocol::TAIL_COMMANDS;

/// Strips the comment and whitespace off one G-code file line.
pub fn gcode_of(line: &str) -> Option<&str> {
    let code = line.split(';').next().unwrap_or("").trim();
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

struct StatsData {
    print_time: Duration,
    segment_start: Instant,
    has_inbuilt_stats: bool,
    total_gcode_count: u64,
}

/// Per-job command counting and remaining-time estimation.
pub struct PrintStats {
    inner: Mutex<StatsData>,
}

impl PrintStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsData {
                print_time: Duration::ZERO,
                segment_start: Instant::now(),
                has_inbuilt_stats: false,
                total_gcode_count: 0,
            }),
        }
    }

    /// Scans a new file: counts its commands and checks whether it
    /// reports its own progress through `M73`.
    pub async fn track_new_print(&self, file_path: impl AsRef<Path>) -> anyhow::Result<()> {
        let file = tokio::fs::File::open(file_path.as_ref()).await?;
        let mut lines = BufReader::new(file).lines();

        let mut total = 0u64;
        let mut has_inbuilt_stats = false;
        while let Some(line) = lines.next_line().await? {
            if let Some(code) = gcode_of(&line) {
                total += 1;
                if code.contains("M73") {
                    has_inbuilt_stats = true;
                }
            }
        }

        {
            let mut data = self.lock();
            data.total_gcode_count = total;
            data.print_time = Duration::ZERO;
            data.segment_start = Instant::now();
            data.has_inbuilt_stats = has_inbuilt_stats;
        }
        info!(
            commands = total,
            inbuilt_reporting = has_inbuilt_stats,
            "new file analyzed"
        );
        Ok(())
    }

    pub fn has_inbuilt_stats(&self) -> bool {
        self.lock().has_inbuilt_stats
    }

    pub fn total_gcode_count(&self) -> u64 {
        self.lock().total_gcode_count
    }

    /// Closes the running time segment, accumulating it; called on pause.
    pub fn end_time_segment(&self) {
        let mut data = self.lock();
        let elapsed = data.segment_start.elapsed();
        data.print_time += elapsed;
    }

    /// Opens a new time segment; called on start and resume.
    pub fn start_time_segment(&self) {
        self.lock().segment_start = Instant::now();
    }

    /// Progress and remaining minutes after `gcode_number` commands.
    ///
    /// Returns `None` until a file has been tracked.
    pub fn get_stats(&self, gcode_number: u64) -> Option<(u8, u64)> {
        self.end_time_segment();
        self.start_time_segment();

        let data = self.lock();
        if data.total_gcode_count == 0 || gcode_number == 0 {
            return None;
        }

        let time_per_command = data.print_time.as_secs_f64() / gcode_number as f64;
        let total_time = time_per_command * data.total_gcode_count as f64;
        let seconds_remaining = total_time - data.print_time.as_secs_f64();
        let minutes_remaining = (seconds_remaining / 60.0).round() as u64;

        let percent_done = if gcode_number >= data.total_gcode_count.saturating_sub(TAIL_COMMANDS) {
            100
        } else {
            ((gcode_number as f64 / data.total_gcode_count as f64) * 100.0).round() as u8
        };
        Some((percent_done, minutes_remaining))
    }

    /// Total time spent printing including the open segment.
    pub fn time_printing(&self) -> Duration {
        let data = self.lock();
        data.print_time + data.segment_start.elapsed()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsData> {
        self.inner.lock().expect("print stats poisoned")
    }
}

impl Default for PrintStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_gcode_of_strips_comments_and_blanks() {
        assert_eq!(gcode_of("G1 X10 ; move"), Some("G1 X10"));
        assert_eq!(gcode_of("; pure comment"), None);
        assert_eq!(gcode_of("   "), None);
        assert_eq!(gcode_of("M73 P10"), Some("M73 P10"));
    }

    #[tokio::test]
    async fn test_track_new_print_counts_commands() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "; generated test file").unwrap();
        writeln!(file, "G28").unwrap();
        writeln!(file, "G1 X5 Y5 ; corner").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "M73 P0 R12").unwrap();

        let stats = PrintStats::new();
        stats.track_new_print(file.path()).await.unwrap();

        assert_eq!(stats.total_gcode_count(), 3);
        assert!(stats.has_inbuilt_stats());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_stats_extrapolates_remaining_time() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for _ in 0..100 {
            writeln!(file, "G1 X1").unwrap();
        }

        let stats = PrintStats::new();
        stats.track_new_print(file.path()).await.unwrap();

        // 25 commands in one virtual minute: 75 left means three more.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let (percent, minutes) = stats.get_stats(25).unwrap();
        assert_eq!(percent, 25);
        assert_eq!(minutes, 3);

        // Inside the trailing command window the print counts as done.
        let (percent, _) = stats.get_stats(95).unwrap();
        assert_eq!(percent, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_segments_pause_the_clock() {
        let stats = PrintStats::new();
        stats.start_time_segment();
        tokio::time::sleep(Duration::from_secs(10)).await;
        stats.end_time_segment();

        // Paused: this gap must not count.
        tokio::time::sleep(Duration::from_secs(100)).await;
        stats.start_time_segment();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let total = stats.time_printing();
        assert!(total >= Duration::from_secs(15) && total < Duration::from_secs(16));
    }
}

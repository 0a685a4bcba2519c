// Resource/Stats Collector
// Runtime is the wall clock of every phase (compile + run). Peak memory comes
// from an optional GNU time wrapper and is 0 when nothing measured it.

use std::path::Path;

/// Prefix of the line the time wrapper appends to stderr.
pub const STATS_MARKER: &str = "__ARENA_STATS__";

/// Lines GNU time prints ahead of its format output for abnormal exits.
const TIME_NOTICES: [&str; 2] = ["Command exited with non-zero status", "Command terminated by signal"];

/// Prefix `argv` with the time wrapper, when one is configured.
pub fn wrap_command(time_bin: Option<&Path>, argv: Vec<String>) -> Vec<String> {
    match time_bin {
        Some(bin) => {
            let mut wrapped = vec![
                bin.to_string_lossy().into_owned(),
                "-f".to_string(),
                format!("{} %M %e", STATS_MARKER),
            ];
            wrapped.extend(argv);
            wrapped
        }
        None => argv,
    }
}

/// Split the wrapper's report off `stderr`.
///
/// Returns the program's own stderr and the peak RSS in KiB, if reported.
/// Only the last marker line counts, so a program printing the marker
/// itself cannot spoof the measurement.
pub fn extract_stats(stderr: &str) -> (String, Option<u64>) {
    let lines: Vec<&str> = stderr.lines().collect();
    let Some(pos) = lines.iter().rposition(|l| l.starts_with(STATS_MARKER)) else {
        return (stderr.to_string(), None);
    };

    let peak_kb = lines[pos]
        .trim_start_matches(STATS_MARKER)
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok());

    let mut keep = pos;
    if keep > 0 && TIME_NOTICES.iter().any(|n| lines[keep - 1].starts_with(n)) {
        keep -= 1;
    }

    let mut cleaned = lines[..keep].join("\n");
    if !cleaned.is_empty() && stderr.ends_with('\n') {
        cleaned.push('\n');
    }
    (cleaned, peak_kb)
}

/// Accumulates phase measurements for one job.
#[derive(Debug, Clone)]
pub struct StatsCollector {
    ceiling_kb: u64,
    runtime_ms: u64,
    peak_kb: Option<u64>,
}

impl StatsCollector {
    pub fn new(memory_ceiling_mb: u32) -> Self {
        Self {
            ceiling_kb: memory_ceiling_mb as u64 * 1024,
            runtime_ms: 0,
            peak_kb: None,
        }
    }

    pub fn record(&mut self, wall_ms: u64, peak_kb: Option<u64>) {
        self.runtime_ms += wall_ms;
        if let Some(kb) = peak_kb {
            self.peak_kb = Some(self.peak_kb.map_or(kb, |current| current.max(kb)));
        }
    }

    pub fn runtime_ms(&self) -> u64 {
        self.runtime_ms
    }

    /// Peak memory, never above the configured ceiling.
    pub fn memory_kb(&self) -> u64 {
        self.peak_kb.unwrap_or(0).min(self.ceiling_kb)
    }
}

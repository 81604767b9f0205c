//! Log-line classification.
//!
//! Engine log parsing is brittle and version-coupled, so every pattern the
//! scheduler depends on lives in this one module: the fixed tables below
//! plus the operator's configured rate-limit substrings. New signals are
//! added here without touching the driver or the session state machine.

use std::collections::HashMap;
use std::time::Instant;

use tracing::warn;

use crate::config::RateLimitRule;

/// Substrings marking a completed transfer. The path precedes the marker.
const COMPLETE_MARKERS: [&str; 2] = [": Copied (", ": Moved ("];

/// Substring the engine emits when `--max-transfer` is hit.
const MAX_TRANSFER_MARKER: &str = "max transfer limit reached";

/// Known-unrecoverable engine messages. Anything here aborts the stage.
const FATAL_MARKERS: [&str; 3] = [
    "Failed to create file system",
    "didn't find section in config file",
    "couldn't find root directory",
];

/// One classified log line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// A file finished transferring. Size is present only when the line
    /// carried one; the driver resolves the rest.
    FileComplete { path: String, size: Option<u64> },
    /// A configured rate-limit rule fired (its threshold was reached).
    RateLimit { pattern: String, delay_hours: u64 },
    /// The stage byte cap was reached; early-termination candidacy begins.
    MaxTransferReached,
    /// Unrecoverable engine failure.
    Fatal { message: String },
    /// Everything else.
    Ignore,
}

struct Track {
    count: u32,
    window_expires: Instant,
}

/// Stateful classifier for one stage.
///
/// Rate-limit rules may require several occurrences within a sliding
/// window before they fire; the per-pattern counters live here and reset
/// with the window.
pub struct LineClassifier {
    rules: Vec<(String, RateLimitRule)>,
    tracks: HashMap<String, Track>,
}

impl LineClassifier {
    /// Build a classifier from the effective rate-limit rules.
    pub fn new(rules: impl IntoIterator<Item = (String, RateLimitRule)>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
            tracks: HashMap::new(),
        }
    }

    /// Classify one line into exactly one event.
    pub fn classify(&mut self, line: &str) -> LineEvent {
        self.classify_at(line, Instant::now())
    }

    pub(crate) fn classify_at(&mut self, line: &str, now: Instant) -> LineEvent {
        for marker in COMPLETE_MARKERS {
            if let Some(idx) = line.find(marker)
                && let Some(path) = extract_path(line, idx)
            {
                return LineEvent::FileComplete {
                    path,
                    size: extract_size(&line[idx..]),
                };
            }
        }

        if line.contains(MAX_TRANSFER_MARKER) {
            return LineEvent::MaxTransferReached;
        }

        for marker in FATAL_MARKERS {
            if line.contains(marker) {
                return LineEvent::Fatal {
                    message: line.trim().to_string(),
                };
            }
        }

        for (pattern, rule) in &self.rules {
            if !line.to_lowercase().contains(&pattern.to_lowercase()) {
                continue;
            }

            let track = self.tracks.entry(pattern.clone()).or_insert(Track {
                count: 0,
                window_expires: now + rule.window(),
            });
            if now >= track.window_expires {
                // Window lapsed; this occurrence starts a fresh one.
                track.count = 0;
                track.window_expires = now + rule.window();
            }
            track.count += 1;
            warn!(
                pattern = %pattern,
                occurrences = track.count,
                threshold = rule.count(),
                "Rate-limit pattern observed"
            );

            if track.count >= rule.count() {
                return LineEvent::RateLimit {
                    pattern: pattern.clone(),
                    delay_hours: rule.delay_hours(),
                };
            }
            return LineEvent::Ignore;
        }

        LineEvent::Ignore
    }
}

/// Path between the log prefix and the completion marker.
///
/// Lines look like `2024/01/15 10:30:45 INFO  : media/a.mkv: Copied (new)`;
/// the path spans from the first ` : ` separator to the marker.
fn extract_path(line: &str, marker_idx: usize) -> Option<String> {
    let head = &line[..marker_idx];
    let start = head.find(" : ").map_or(0, |i| i + 3);
    let path = head[start..].trim();
    (!path.is_empty()).then(|| path.to_string())
}

/// Best-effort size parse from the tail of a completion line.
///
/// Recognizes a `size <value>` token with an optional binary-unit suffix.
/// Most engine versions omit it; the driver then falls back to the control
/// plane and finally the local filesystem.
fn extract_size(tail: &str) -> Option<u64> {
    let mut tokens = tail.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "size" {
            return tokens.next().and_then(parse_size_value);
        }
    }
    None
}

/// Parse `123`, `1.5G`, `500Mi`, `2T` into bytes.
fn parse_size_value(token: &str) -> Option<u64> {
    let token = token.trim_end_matches(|c: char| c == ',' || c == ')');
    let split = token
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(token.len());
    let (digits, unit) = token.split_at(split);
    let value: f64 = digits.parse().ok()?;
    let multiplier: u64 = match unit.trim_end_matches('B').trim_end_matches('i') {
        "" | "b" => 1,
        "k" | "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => return None,
    };
    Some((value * multiplier as f64) as u64)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_rate_limits;
    use std::time::Duration;

    fn classifier() -> LineClassifier {
        LineClassifier::new(default_rate_limits())
    }

    #[test]
    fn copied_line_yields_file_complete() {
        let event = classifier()
            .classify("2024/01/15 10:30:45 INFO  : media/show/a.mkv: Copied (new)");
        assert_eq!(
            event,
            LineEvent::FileComplete {
                path: "media/show/a.mkv".to_string(),
                size: None,
            }
        );
    }

    #[test]
    fn moved_line_yields_file_complete() {
        let event = classifier().classify("2024/01/15 10:30:45 INFO  : b.mkv: Moved (server-side)");
        assert!(matches!(event, LineEvent::FileComplete { path, .. } if path == "b.mkv"));
    }

    #[test]
    fn size_token_is_parsed_when_present() {
        let event =
            classifier().classify("2024/01/15 10:30:45 INFO  : a.bin: Copied (new) size 1.5G");
        assert_eq!(
            event,
            LineEvent::FileComplete {
                path: "a.bin".to_string(),
                size: Some((1.5 * (1u64 << 30) as f64) as u64),
            }
        );
    }

    #[test]
    fn size_value_units() {
        assert_eq!(parse_size_value("123"), Some(123));
        assert_eq!(parse_size_value("2k"), Some(2048));
        assert_eq!(parse_size_value("500M"), Some(500 << 20));
        assert_eq!(parse_size_value("1.5Gi"), Some(3 << 29));
        assert_eq!(parse_size_value("2T),"), Some(2 << 40));
        assert_eq!(parse_size_value("weird"), None);
    }

    #[test]
    fn max_transfer_marker() {
        let event = classifier().classify(
            "ERROR : Fatal error received - not attempting retries: max transfer limit reached",
        );
        assert_eq!(event, LineEvent::MaxTransferReached);
    }

    #[test]
    fn fatal_markers() {
        let event = classifier().classify("Failed to create file system for \"gd:\"");
        assert!(matches!(event, LineEvent::Fatal { .. }));
    }

    #[test]
    fn default_rate_limits_fire_on_first_occurrence() {
        let event = classifier()
            .classify("ERROR : googleapi: Error 403: userRateLimitExceeded");
        assert_eq!(
            event,
            LineEvent::RateLimit {
                pattern: "userRateLimitExceeded".to_string(),
                delay_hours: 24,
            }
        );
    }

    #[test]
    fn rate_limit_match_is_case_insensitive() {
        let event = classifier().classify("error 403: USERRATELIMITEXCEEDED");
        assert!(matches!(event, LineEvent::RateLimit { .. }));
    }

    #[test]
    fn thresholded_rule_needs_repeated_hits_within_window() {
        let rule = RateLimitRule::Full {
            delay_hours: 2,
            count: 3,
            window_secs: 60,
        };
        let mut classifier = LineClassifier::new([("slow down".to_string(), rule)]);
        let start = Instant::now();

        assert_eq!(
            classifier.classify_at("server said slow down", start),
            LineEvent::Ignore
        );
        assert_eq!(
            classifier.classify_at("server said slow down", start + Duration::from_secs(10)),
            LineEvent::Ignore
        );
        assert_eq!(
            classifier.classify_at("server said slow down", start + Duration::from_secs(20)),
            LineEvent::RateLimit {
                pattern: "slow down".to_string(),
                delay_hours: 2,
            }
        );
    }

    #[test]
    fn threshold_window_resets_occurrences() {
        let rule = RateLimitRule::Full {
            delay_hours: 2,
            count: 2,
            window_secs: 60,
        };
        let mut classifier = LineClassifier::new([("slow down".to_string(), rule)]);
        let start = Instant::now();

        assert_eq!(
            classifier.classify_at("slow down", start),
            LineEvent::Ignore
        );
        // Second hit lands after the window lapsed: starts a fresh count.
        assert_eq!(
            classifier.classify_at("slow down", start + Duration::from_secs(61)),
            LineEvent::Ignore
        );
        assert!(matches!(
            classifier.classify_at("slow down", start + Duration::from_secs(62)),
            LineEvent::RateLimit { .. }
        ));
    }

    #[test]
    fn unrecognized_lines_are_ignored() {
        assert_eq!(
            classifier().classify("2024/01/15 10:30:45 DEBUG : 16 go routines active"),
            LineEvent::Ignore
        );
        assert_eq!(classifier().classify(""), LineEvent::Ignore);
    }
}

//! Resolution strategies and the per-path policy engine
//!
//! The strategy decides which side wins; glob-pattern rules from the
//! configuration can override the default strategy per path,
//! first-match-wins.

use glob::Pattern;
use std::fmt;
use tracing::{trace, warn};

use onemount_core::config::ConflictRuleConfig;

use crate::detector::{Conflict, ConflictKind};

/// How a conflict should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Compare mtimes with a 1-second tolerance; the older side loses
    LastWriterWins,
    /// Keep both: local copy renamed with a conflict suffix, remote under
    /// the original name
    KeepBoth,
    /// The local version always wins
    PreferLocal,
    /// The remote version always wins
    PreferRemote,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::LastWriterWins => "last_writer_wins",
            Strategy::KeepBoth => "keep_both",
            Strategy::PreferLocal => "prefer_local",
            Strategy::PreferRemote => "prefer_remote",
        };
        write!(f, "{s}")
    }
}

/// Parses a strategy name from configuration.
#[must_use]
pub fn parse_strategy(s: &str) -> Option<Strategy> {
    match s {
        "last_writer_wins" => Some(Strategy::LastWriterWins),
        "keep_both" => Some(Strategy::KeepBoth),
        "prefer_local" => Some(Strategy::PreferLocal),
        "prefer_remote" => Some(Strategy::PreferRemote),
        _ => None,
    }
}

/// What the resolver should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Discard local edits; the entry takes the remote version (or deletion)
    TakeRemote,
    /// Keep the local body and requeue it for upload over the remote version
    KeepLocal,
    /// Keep both: fork the local body under a conflict-copy name, original
    /// takes the remote version
    Fork,
}

/// Mtime comparison tolerance for `LastWriterWins`, in seconds.
const MTIME_TOLERANCE_SECS: i64 = 1;

/// Maps a conflict and strategy onto an outcome.
#[must_use]
pub fn decide(conflict: &Conflict, strategy: Strategy) -> Outcome {
    match conflict.kind {
        // A remotely deleted item with local edits: only an explicit
        // prefer-remote discards the local work.
        ConflictKind::Delete => match strategy {
            Strategy::PreferRemote => Outcome::TakeRemote,
            _ => Outcome::KeepLocal,
        },
        // A restricted remote name cannot be taken as-is; keep both sides.
        ConflictKind::NameRestriction => Outcome::Fork,
        ConflictKind::Content => match strategy {
            Strategy::PreferLocal => Outcome::KeepLocal,
            Strategy::PreferRemote => Outcome::TakeRemote,
            Strategy::KeepBoth => Outcome::Fork,
            Strategy::LastWriterWins => {
                let remote_mtime = conflict.remote.as_ref().and_then(|r| r.mtime);
                match remote_mtime {
                    Some(remote_mtime) => {
                        let lead = (conflict.local.mtime - remote_mtime).num_seconds();
                        if lead > MTIME_TOLERANCE_SECS {
                            Outcome::KeepLocal
                        } else {
                            // ties go to the server
                            Outcome::TakeRemote
                        }
                    }
                    // no remote clock to compare against; keep local work
                    None => Outcome::KeepLocal,
                }
            }
        },
    }
}

/// Per-path strategy rules, first match wins.
pub struct PolicyRules {
    rules: Vec<(Pattern, Strategy)>,
    default_strategy: Strategy,
}

impl PolicyRules {
    /// Compiles the configured rules, logging and skipping invalid ones.
    #[must_use]
    pub fn from_config(default_strategy: &str, rules: &[ConflictRuleConfig]) -> Self {
        let default = parse_strategy(default_strategy).unwrap_or_else(|| {
            warn!(
                strategy = default_strategy,
                "Unknown default conflict strategy, using last_writer_wins"
            );
            Strategy::LastWriterWins
        });

        let compiled = rules
            .iter()
            .filter_map(|rule| {
                let pattern = match Pattern::new(&rule.pattern) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(pattern = %rule.pattern, error = %e, "Skipping invalid conflict rule pattern");
                        return None;
                    }
                };
                let strategy = match parse_strategy(&rule.strategy) {
                    Some(s) => s,
                    None => {
                        warn!(strategy = %rule.strategy, "Skipping invalid conflict rule strategy");
                        return None;
                    }
                };
                Some((pattern, strategy))
            })
            .collect();

        Self {
            rules: compiled,
            default_strategy: default,
        }
    }

    /// The strategy for a drive-relative path.
    #[must_use]
    pub fn evaluate(&self, relative_path: &str) -> Strategy {
        for (pattern, strategy) in &self.rules {
            if pattern.matches(relative_path) {
                trace!(path = relative_path, strategy = %strategy, "Conflict rule matched");
                return *strategy;
            }
        }
        self.default_strategy
    }

    /// Number of compiled rules.
    #[must_use]
    pub fn rules_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_strategy: Strategy::LastWriterWins,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use onemount_core::domain::Entry;
    use onemount_core::ports::RemoteItem;
    use onemount_core::ItemId;

    fn content_conflict(local_mtime_offset_secs: i64, remote_mtime_offset_secs: i64) -> Conflict {
        let now = Utc::now();
        let mut local = Entry::new_local_file(ItemId::new("root").unwrap(), "f.txt").unwrap();
        local.mtime = now + chrono::Duration::seconds(local_mtime_offset_secs);
        let remote = RemoteItem {
            id: local.id.clone(),
            name: "f.txt".to_string(),
            parent_id: local.parent_id.clone(),
            size: 1,
            etag: None,
            hash: None,
            mtime: Some(now + chrono::Duration::seconds(remote_mtime_offset_secs)),
            is_directory: false,
            is_deleted: false,
        };
        Conflict {
            kind: crate::ConflictKind::Content,
            local,
            remote: Some(remote),
            last_change: None,
            detected_at: now,
        }
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(parse_strategy("keep_both"), Some(Strategy::KeepBoth));
        assert_eq!(parse_strategy("prefer_local"), Some(Strategy::PreferLocal));
        assert_eq!(parse_strategy("nope"), None);
    }

    #[test]
    fn test_last_writer_wins_local_newer() {
        let conflict = content_conflict(10, 0);
        assert_eq!(decide(&conflict, Strategy::LastWriterWins), Outcome::KeepLocal);
    }

    #[test]
    fn test_last_writer_wins_remote_newer() {
        let conflict = content_conflict(0, 10);
        assert_eq!(decide(&conflict, Strategy::LastWriterWins), Outcome::TakeRemote);
    }

    #[test]
    fn test_last_writer_wins_tie_goes_to_server() {
        // within the 1-second tolerance
        let conflict = content_conflict(1, 0);
        assert_eq!(decide(&conflict, Strategy::LastWriterWins), Outcome::TakeRemote);
    }

    #[test]
    fn test_fixed_strategies() {
        let conflict = content_conflict(0, 10);
        assert_eq!(decide(&conflict, Strategy::PreferLocal), Outcome::KeepLocal);
        assert_eq!(decide(&conflict, Strategy::PreferRemote), Outcome::TakeRemote);
        assert_eq!(decide(&conflict, Strategy::KeepBoth), Outcome::Fork);
    }

    #[test]
    fn test_delete_conflict_keeps_local_unless_prefer_remote() {
        let mut conflict = content_conflict(0, 0);
        conflict.kind = crate::ConflictKind::Delete;
        conflict.remote = None;
        assert_eq!(decide(&conflict, Strategy::LastWriterWins), Outcome::KeepLocal);
        assert_eq!(decide(&conflict, Strategy::PreferRemote), Outcome::TakeRemote);
    }

    #[test]
    fn test_name_restriction_forks() {
        let mut conflict = content_conflict(0, 0);
        conflict.kind = crate::ConflictKind::NameRestriction;
        assert_eq!(decide(&conflict, Strategy::PreferRemote), Outcome::Fork);
    }

    #[test]
    fn test_policy_rules_first_match_wins() {
        let rules = vec![
            ConflictRuleConfig {
                pattern: "**/*.docx".to_string(),
                strategy: "keep_both".to_string(),
            },
            ConflictRuleConfig {
                pattern: "**/*".to_string(),
                strategy: "prefer_remote".to_string(),
            },
        ];
        let policy = PolicyRules::from_config("last_writer_wins", &rules);
        assert_eq!(policy.evaluate("Documents/report.docx"), Strategy::KeepBoth);
        assert_eq!(policy.evaluate("Documents/report.pdf"), Strategy::PreferRemote);
    }

    #[test]
    fn test_policy_rules_invalid_skipped() {
        let rules = vec![
            ConflictRuleConfig {
                pattern: "[bad".to_string(),
                strategy: "keep_both".to_string(),
            },
            ConflictRuleConfig {
                pattern: "*.txt".to_string(),
                strategy: "bogus".to_string(),
            },
        ];
        let policy = PolicyRules::from_config("prefer_local", &rules);
        assert_eq!(policy.rules_count(), 0);
        assert_eq!(policy.evaluate("a.txt"), Strategy::PreferLocal);
    }
}

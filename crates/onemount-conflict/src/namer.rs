//! Conflict-copy naming
//!
//! Produces the suffixed name for the losing local copy when both versions
//! are kept: `report (conflict copy 2026-08-01).docx`, with a numeric
//! disambiguator when that name is itself taken.

use chrono::NaiveDate;

/// Builds a conflict-copy name, keeping the extension in place.
#[must_use]
pub fn conflict_copy_name(name: &str, date: NaiveDate) -> String {
    let suffix = format!(" (conflict copy {})", date.format("%Y-%m-%d"));
    match name.rsplit_once('.') {
        // dotfiles like ".bashrc" have no stem to suffix after
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}{suffix}.{ext}"),
        _ => format!("{name}{suffix}"),
    }
}

/// Appends ` 2`, ` 3`, ... before the extension until the name is free of
/// collisions with `taken` (compared case-insensitively).
#[must_use]
pub fn ensure_unique(candidate: &str, taken: &[String]) -> String {
    let collides = |name: &str| {
        taken
            .iter()
            .any(|t| t.to_lowercase() == name.to_lowercase())
    };
    if !collides(candidate) {
        return candidate.to_string();
    }
    for n in 2u32.. {
        let numbered = match candidate.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{stem} {n}.{ext}"),
            _ => format!("{candidate} {n}"),
        };
        if !collides(&numbered) {
            return numbered;
        }
    }
    unreachable!("u32 counter exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()
    }

    #[test]
    fn test_suffix_before_extension() {
        assert_eq!(
            conflict_copy_name("report.docx", date()),
            "report (conflict copy 2026-08-01).docx"
        );
    }

    #[test]
    fn test_no_extension() {
        assert_eq!(
            conflict_copy_name("Makefile", date()),
            "Makefile (conflict copy 2026-08-01)"
        );
    }

    #[test]
    fn test_dotfile_keeps_whole_name() {
        assert_eq!(
            conflict_copy_name(".bashrc", date()),
            ".bashrc (conflict copy 2026-08-01)"
        );
    }

    #[test]
    fn test_multiple_dots_splits_at_last() {
        assert_eq!(
            conflict_copy_name("archive.tar.gz", date()),
            "archive.tar (conflict copy 2026-08-01).gz"
        );
    }

    #[test]
    fn test_ensure_unique_no_collision() {
        assert_eq!(ensure_unique("a.txt", &[]), "a.txt");
    }

    #[test]
    fn test_ensure_unique_counts_up() {
        let taken = vec!["a.txt".to_string(), "A 2.TXT".to_string()];
        assert_eq!(ensure_unique("a.txt", &taken), "a 3.txt");
    }
}

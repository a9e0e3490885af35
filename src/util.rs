use std::fs;
use std::path::Path;

/// Truncate to at most `max` characters, marking the cut with `...` (Unicode-safe).
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Prefix of `s` holding at most `max_chars` characters, without a marker.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `-`.
pub fn sanitize_file_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Write `content` to `path` through a sibling temp file and a rename, so
/// readers never observe a half-written file.
pub fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("bak");
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err.into());
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

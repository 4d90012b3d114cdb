use std::path::{Path, PathBuf};

use crate::error::DispatchError;
use crate::ready_set::ReadySet;
use crate::schema::Schema;
use crate::workunit::WorkUnit;

/// Filename for a primary key in the persistent database directory: the key
/// itself if non-negative, `m<abs>` if negative (matches the original
/// database's `filepath_from_primary_id` convention).
pub fn db_filename(primary: i64) -> String {
    if primary >= 0 {
        primary.to_string()
    } else {
        format!("m{}", -primary)
    }
}

fn db_path(db_dir: &Path, primary: i64) -> PathBuf {
    db_dir.join(db_filename(primary))
}

/// Removes from `ready_set` every unit whose primary key is in `touched`
/// and whose secondary key already has a record in `db_dir`. Matching is
/// prefix-based: a database line's leading fields (split on `;`) are
/// compared against a candidate unit's secondary key, using that unit's own
/// arity; trailing output columns are ignored. Absent files are skipped.
pub fn remove_already_in_db(
    ready_set: &ReadySet,
    touched: &[i64],
    db_dir: &Path,
) -> Result<usize, DispatchError> {
    let mut removed = 0;
    for &primary in touched {
        let path = db_path(db_dir, primary);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(DispatchError::io(path.display().to_string(), e)),
        };
        let db_keys: Vec<Vec<&str>> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.split(';').collect())
            .collect();
        removed += ready_set.remove_matching(|unit| {
            if unit.primary() != primary {
                return false;
            }
            let arity = unit.secondary().len();
            db_keys.iter().any(|fields| {
                fields.len() >= arity && fields[..arity] == unit.secondary()[..]
            })
        });
    }
    Ok(removed)
}

/// Removes from `ready_set` every unit named by a completed record line in
/// any regular file directly under `output_dir`. Used to rediscover
/// already-computed units left over from a previous, interrupted run.
/// Matching is arity-aware, exactly like [`remove_already_in_db`]: each
/// candidate unit's own secondary length is used to extract the identity
/// from a line, discarding any trailing output data it carries.
pub fn remove_already_in_output_dir(
    ready_set: &ReadySet,
    output_dir: &Path,
    schema: &dyn Schema,
) -> Result<usize, DispatchError> {
    let entries = match std::fs::read_dir(output_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(DispatchError::io(output_dir.display().to_string(), e)),
    };
    let mut completed_lines: Vec<String> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DispatchError::io(output_dir.display().to_string(), e))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let text = std::fs::read_to_string(entry.path())
            .map_err(|e| DispatchError::io(entry.path().display().to_string(), e))?;
        completed_lines.extend(text.lines().map(str::to_string));
    }
    Ok(ready_set.remove_matching(|unit| {
        let arity = unit.secondary().len();
        completed_lines.iter().any(|line| {
            schema
                .extract_work_unit(line, arity)
                .map(|extracted| &extracted == unit)
                .unwrap_or(false)
        })
    }))
}

/// Scans `output_dir` for filenames that are pure integers (the per-process
/// output files, `<id><extension>` with the extension stripped by the
/// caller) and returns the maximum, or 0 if none exist. Used to initialize
/// the process-id counter so a resumed run doesn't reuse ids.
pub fn last_used_process_id(output_dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(output_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.path().file_stem().and_then(|s| s.to_str().map(str::to_string)))
        .filter_map(|stem| stem.parse::<u64>().ok())
        .max()
        .unwrap_or(0)
}

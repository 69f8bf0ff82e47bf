//! Directory listing and rsync-style synchronization
//!
//! Mirrors `rsync.py`'s `Rsync` mixin: `mcu_files` walks the device via the
//! `_mcu_list` remote program, `host_files` walks the corresponding host
//! project directories, `rdiff` computes a three-way add/delete/update set,
//! and `rsync` reports (and, unless `dry_run`, applies) that plan through
//! `fput`/`rm_rf`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{Datelike, Local, Timelike};
use tracing::debug;

use crate::constants::RSYNC_CLOCK_SYNC_TOLERANCE_SECS;
use crate::error::Result;
use crate::mcu_programs;
use crate::repl::{Output, Session};

/// A device-side file or directory entry as reported by `_mcu_list`.
/// `size == -1` marks a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McuEntry {
    pub mtime: i64,
    pub size: i64,
}

/// A host-side file or directory entry, tagged with the project it came
/// from so a later `fput` knows which project root to read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub project: String,
    pub mtime: i64,
    pub size: i64,
}

/// The result of comparing a device's filesystem against the host's.
#[derive(Debug, Default, Clone)]
pub struct RsyncPlan {
    /// Paths present on the host but not the device, mapped to the project
    /// they should be copied from.
    pub to_add: BTreeMap<String, String>,
    /// Paths present on the device but not the host, in reverse sorted
    /// order (so children are deleted before their parent directory).
    pub to_delete: Vec<String>,
    /// Paths present on both, but out of date on the device, mapped to
    /// the project they should be copied from.
    pub to_update: BTreeMap<String, String>,
}

impl RsyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty() && self.to_update.is_empty()
    }
}

fn trim_slashes(path: &str) -> &str {
    path.trim_start_matches('/').trim_end_matches('/')
}

impl<'a> Session<'a> {
    /// Pretty-print the device's filesystem to `output`, matching the
    /// `ListOutput` formatting in `rsync.py` (minus terminal color, which
    /// has no equivalent ambient dependency here).
    pub async fn rlist(&mut self, path: &str, output: &mut dyn Output) -> Result<()> {
        let raw = self.mcu_list_raw(path).await?;
        for line in raw.lines() {
            let Some(entry) = parse_listing_line(line) else { continue };
            if entry.level == 0 {
                // the root entry only sets ListOutput's indent baseline
                continue;
            }
            let indent = "    ".repeat((entry.level - 1) as usize);
            let ts = format_mtime(entry.mtime);
            let rendered = match entry.kind {
                ListingKind::Dir => format!("{:>7}  {}  {}{}/\n", "", ts, indent, entry.path),
                ListingKind::File => {
                    format!("{:>7}  {}  {}{}\n", entry.size, ts, indent, entry.path)
                }
            };
            output.ans(rendered.as_bytes());
        }
        Ok(())
    }

    /// Recursive directory listing of the device's filesystem rooted at
    /// `path`, keyed by path relative to `path` (root itself keyed `""`).
    pub async fn mcu_files(&mut self, path: &str) -> Result<BTreeMap<String, McuEntry>> {
        let raw = self.mcu_list_raw(path).await?;
        Ok(parse_mcu_listing(&raw))
    }

    async fn mcu_list_raw(&mut self, path: &str) -> Result<String> {
        let program = mcu_programs::mcu_list_program(trim_slashes(path));
        self.eval_program(&program).await
    }

    /// Compare the device's filesystem under `path` against the host's
    /// `projects` (each resolved under `host_dir`).
    pub async fn rdiff(
        &mut self,
        host_dir: &Path,
        path: &str,
        projects: &[String],
    ) -> Result<RsyncPlan> {
        let mcu = self.mcu_files(path).await?;
        let host = host_files(host_dir, path, projects);
        let mut plan = RsyncPlan::default();

        for (rel_path, entry) in &host {
            if !mcu.contains_key(rel_path) {
                plan.to_add.insert(rel_path.clone(), entry.project.clone());
            }
        }
        for rel_path in mcu.keys() {
            if !host.contains_key(rel_path) {
                plan.to_delete.push(rel_path.clone());
            }
        }
        plan.to_delete.sort_unstable_by(|a, b| b.cmp(a));
        for (rel_path, host_entry) in &host {
            if let Some(mcu_entry) = mcu.get(rel_path) {
                let needs_update = (mcu_entry.size != host_entry.size)
                    || (mcu_entry.mtime < host_entry.mtime && mcu_entry.size >= 0);
                if needs_update {
                    plan.to_update.insert(rel_path.clone(), host_entry.project.clone());
                }
            }
        }
        Ok(plan)
    }

    /// Compute a sync plan and, unless `dry_run`, apply it: copy additions
    /// and updates, delete removals, reporting each action to `output`.
    /// Synchronizes the device clock first when not a dry run.
    pub async fn rsync(
        &mut self,
        host_dir: &Path,
        path: &str,
        projects: &[String],
        dry_run: bool,
        output: &mut dyn Output,
    ) -> Result<RsyncPlan> {
        debug!(path, dry_run, "rsync");
        if !dry_run {
            self.sync_time(
                host_local_time_now(),
                std::time::Duration::from_secs(RSYNC_CLOCK_SYNC_TOLERANCE_SECS as u64),
            )
            .await?;
        }
        let plan = self.rdiff(host_dir, path, projects).await?;
        if plan.is_empty() {
            output.ans(b"Directories match\n");
            return Ok(plan);
        }

        for (rel_path, project) in &plan.to_add {
            let src_file = host_dir.join(project).join(rel_path);
            if src_file.is_file() {
                output.ans(format!("COPY    {rel_path}\n").as_bytes());
            }
            if !dry_run {
                self.fput(&src_file, &remote_path(rel_path)).await?;
            }
        }
        for rel_path in &plan.to_delete {
            output.ans(format!("DELETE  {rel_path}\n").as_bytes());
            if !dry_run {
                self.rm_rf(&remote_path(rel_path), true).await?;
            }
        }
        for (rel_path, project) in &plan.to_update {
            output.ans(format!("UPDATE  {rel_path}\n").as_bytes());
            if !dry_run {
                let src_file = host_dir.join(project).join(rel_path);
                self.fput(&src_file, &remote_path(rel_path)).await?;
            }
        }
        Ok(plan)
    }
}

fn remote_path(rel_path: &str) -> String {
    format!("/{rel_path}")
}

/// Walk `host_dir`/`project` for every project, returning every file and
/// directory under `path`, keyed by path relative to `path` (`""` for the
/// root itself). Hidden entries (dotfiles) are skipped, matching
/// `Rsync.__host_list`.
pub fn host_files(host_dir: &Path, path: &str, projects: &[String]) -> BTreeMap<String, HostEntry> {
    let path = trim_slashes(path);
    let mut files = BTreeMap::new();
    for project in projects {
        let root = host_dir.join(project);
        host_list(&mut files, &root, project, path);
    }
    files
}

fn host_list(files: &mut BTreeMap<String, HostEntry>, root: &Path, project: &str, rel_path: &str) {
    let full_path: PathBuf = if rel_path.is_empty() { root.to_path_buf() } else { root.join(rel_path) };
    let Ok(meta) = std::fs::symlink_metadata(&full_path) else { return };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    if meta.is_dir() {
        files.insert(
            rel_path.to_string(),
            HostEntry { project: project.to_string(), mtime, size: -1 },
        );
        let Ok(entries) = std::fs::read_dir(&full_path) else { return };
        let mut names: Vec<String> =
            entries.filter_map(|e| e.ok()).map(|e| e.file_name().to_string_lossy().into_owned()).collect();
        names.sort();
        for name in names {
            if name.starts_with('.') {
                continue;
            }
            let child_rel =
                if rel_path.is_empty() { name.clone() } else { format!("{rel_path}/{name}") };
            host_list(files, root, project, &child_rel);
        }
    } else if meta.is_file() {
        files.insert(
            rel_path.to_string(),
            HostEntry { project: project.to_string(), mtime, size: meta.len() as i64 },
        );
    }
}

/// The host's local time as a `time.localtime()`-shaped 9-tuple, for
/// `sync_time`. Exposed so CLI binaries can drive `Session::sync_time`
/// directly without duplicating the clock-shape conversion.
pub fn host_local_time_now() -> [i64; 9] {
    let now = Local::now();
    [
        now.year() as i64,
        now.month() as i64,
        now.day() as i64,
        now.hour() as i64,
        now.minute() as i64,
        now.second() as i64,
        now.weekday().num_days_from_monday() as i64,
        now.ordinal() as i64,
        0,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListingKind {
    Dir,
    File,
}

struct ListingLine {
    kind: ListingKind,
    level: u32,
    path: String,
    mtime: i64,
    size: i64,
}

/// Parse one line of `_mcu_list` output: ` D,0,'',1690000000,0` or
/// ` F,1,'main.py',1690000000,512`.
fn parse_listing_line(line: &str) -> Option<ListingLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut fields = line.splitn(5, ',');
    let kind = match fields.next()? {
        "D" => ListingKind::Dir,
        "F" => ListingKind::File,
        _ => return None,
    };
    let level: u32 = fields.next()?.trim().parse().ok()?;
    let path = py_unrepr(fields.next()?.trim());
    let mtime: i64 = fields.next()?.trim().parse().ok()?;
    let size: i64 = fields.next()?.trim().parse().ok()?;
    Some(ListingLine { kind, level, path, mtime, size })
}

/// Build the full `mcu_files` map from raw `_mcu_list` output, tracking the
/// directory stack the way `PathOutput` does so nested entries get their
/// full relative path rather than just their own name.
fn parse_mcu_listing(raw: &str) -> BTreeMap<String, McuEntry> {
    let mut files = BTreeMap::new();
    let mut path_stack: Vec<String> = Vec::new();
    for line in raw.lines() {
        let Some(entry) = parse_listing_line(line) else { continue };
        if entry.path.starts_with('.') {
            continue;
        }
        let level = entry.level as usize;
        let full_path = if level == 0 {
            entry.path.clone()
        } else {
            // Mirrors `os.path.join(*path_stack[:level], path)`: Python's
            // join drops empty components instead of emitting a leading
            // separator for them, which matters because the root's own
            // stack entry is always "".
            let mut parts: Vec<&str> =
                path_stack[..level].iter().map(|s| s.as_str()).filter(|s| !s.is_empty()).collect();
            parts.push(&entry.path);
            parts.join("/")
        };
        match entry.kind {
            ListingKind::Dir => {
                files.insert(full_path, McuEntry { mtime: entry.mtime, size: -1 });
                while path_stack.len() < level + 1 {
                    path_stack.push(String::new());
                }
                path_stack[level] = entry.path;
            }
            ListingKind::File => {
                files.insert(full_path, McuEntry { mtime: entry.mtime, size: entry.size });
            }
        }
    }
    files
}

fn format_mtime(epoch_secs: i64) -> String {
    match chrono::DateTime::from_timestamp(epoch_secs, 0) {
        Some(dt) => dt.format("%b %d %H:%M %Y").to_string(),
        None => "?".to_string(),
    }
}

/// Best-effort reversal of a Python `repr()` of a string: strip the
/// surrounding quote and undo the handful of escapes our own `py_repr`
/// (and MicroPython's `repr`) are expected to produce. Not a full Python
/// literal parser - device paths are plain filenames, never arbitrary text.
fn py_unrepr(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() < 2 {
        return s.to_string();
    }
    let quote = bytes[0];
    if (quote != b'\'' && quote != b'"') || bytes[bytes.len() - 1] != quote {
        return s.to_string();
    }
    let inner = &s[1..s.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

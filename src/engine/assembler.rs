//! File completion: joining decoded article parts into the final file
//!
//! Runs on the worker that observed the last article of a file reach a
//! terminal state, outside the queue lock. Three shapes exist:
//! decoded-and-joined (concatenate per-article temp files), direct-write
//! (the file already has its final bytes, move it into place) and rawmode
//! (store the raw articles as numbered subfiles).

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::queue::FileCompletion;

/// Outcome of assembling one file
pub(crate) struct CompletedFile {
    /// Where the assembled output ended up
    pub path: PathBuf,
    /// At least one article was missing or failed
    pub broken: bool,
}

/// Copy buffer for joining article parts
const JOIN_BUFFER: usize = 50 * 1024;

/// Join, move or re-home the parts of a completed file
pub(crate) async fn complete_file(config: &Config, completion: &FileCompletion) -> CompletedFile {
    let decode = config.download.decode;
    let direct = {
        let state = completion.output_state.lock().await;
        config.download.direct_write && state.initialized
    };
    let info_name = format!("{}/{}", completion.nzb_name, completion.filename);

    if !decode {
        debug!(file = %info_name, "moving articles");
    } else if direct {
        debug!(file = %info_name, "checking articles");
    } else {
        debug!(file = %info_name, "joining articles");
    }

    let dest_dir = completion.dest_dir.join(&completion.nzb_name);
    if let Err(e) = std::fs::create_dir_all(&dest_dir) {
        warn!(dir = %dest_dir.display(), error = %e, "could not create destination directory");
        return CompletedFile {
            path: dest_dir.join(&completion.filename),
            broken: true,
        };
    }

    // Never overwrite what is already there
    let mut target = dest_dir.join(&completion.filename);
    let mut dupcount = 0;
    while target.exists() {
        dupcount += 1;
        target = dest_dir.join(format!("{}_duplicate{}", completion.filename, dupcount));
    }

    let broken_count = if decode && !direct {
        join_parts(&target, completion, config.download.write_buffer_size)
    } else if !decode {
        move_raw_parts(&target, completion)
    } else {
        // direct-write: bytes are already in place, just account failures
        let mut failed = completion
            .articles
            .iter()
            .filter(|(_, _, finished)| !finished)
            .count() as u64;
        if let Some(output) = &completion.output_filename {
            if let Err(e) = move_file(output, &target) {
                warn!(
                    from = %output.display(),
                    to = %target.display(),
                    error = %e,
                    "could not move direct-write output"
                );
                failed += 1;
            }
            cleanup_staging_dir(output, &dest_dir);
        }
        failed
    };

    // The per-article temp files served their purpose; under
    // continue-partial the direct-write flag files go too, the assembled
    // file is the record now
    if !direct || config.download.continue_partial {
        for (_, result_filename, _) in &completion.articles {
            let _ = std::fs::remove_file(result_filename);
        }
    }

    let total = completion.total_articles();
    let broken = broken_count > 0;
    if !broken {
        info!(file = %info_name, "successfully downloaded");
    } else {
        warn!(
            file = %info_name,
            failed = broken_count,
            total,
            "article downloads failed for file"
        );
        if config.download.rename_broken {
            let renamed = PathBuf::from(format!("{}_broken", target.display()));
            if std::fs::rename(&target, &renamed).is_ok() {
                debug!(from = %target.display(), to = %renamed.display(), "renamed broken file");
                target = renamed;
            } else {
                warn!(file = %target.display(), "renaming broken file failed");
            }
        }
        if config.download.create_broken_log {
            append_broken_log(&dest_dir, &completion.filename, total - broken_count, total);
        }
    }

    CompletedFile {
        path: target,
        broken,
    }
}

/// Concatenate the decoded parts, in part order, into `<target>.tmp`, then
/// rename. Returns the number of broken (failed or missing) parts.
fn join_parts(target: &Path, completion: &FileCompletion, buffer_size: usize) -> u64 {
    let tmp_target = PathBuf::from(format!("{}.tmp", target.display()));
    let _ = std::fs::remove_file(&tmp_target);

    let out = match std::fs::File::create(&tmp_target) {
        Ok(file) => file,
        Err(e) => {
            warn!(file = %tmp_target.display(), error = %e, "could not create output file");
            return completion.total_articles();
        }
    };
    let capacity = if buffer_size == 0 { JOIN_BUFFER } else { buffer_size };
    let mut out = BufWriter::with_capacity(capacity, out);

    let mut broken_count = 0u64;
    for (part, result_filename, finished) in &completion.articles {
        if !finished {
            broken_count += 1;
            continue;
        }
        match std::fs::File::open(result_filename) {
            Ok(mut part_file) => {
                if let Err(e) = std::io::copy(&mut part_file, &mut out) {
                    warn!(part, error = %e, "copying article part failed");
                    broken_count += 1;
                }
            }
            Err(_) => {
                broken_count += 1;
                debug!(
                    part,
                    file = %result_filename.display(),
                    "could not find article file, status is broken"
                );
            }
        }
    }

    if let Err(e) = out.flush() {
        warn!(file = %tmp_target.display(), error = %e, "flushing joined file failed");
        return completion.total_articles();
    }
    drop(out);
    if let Err(e) = std::fs::rename(&tmp_target, target) {
        warn!(
            from = %tmp_target.display(),
            to = %target.display(),
            error = %e,
            "could not move joined file into place"
        );
    }
    broken_count
}

/// rawmode: `target` becomes a directory of numbered part files
fn move_raw_parts(target: &Path, completion: &FileCompletion) -> u64 {
    if let Err(e) = std::fs::create_dir_all(target) {
        warn!(dir = %target.display(), error = %e, "could not create parts directory");
        return completion.total_articles();
    }
    let mut broken_count = 0u64;
    for (part, result_filename, finished) in &completion.articles {
        if !finished {
            broken_count += 1;
            continue;
        }
        let dst = target.join(format!("{part:03}"));
        if let Err(e) = move_file(result_filename, &dst) {
            warn!(
                from = %result_filename.display(),
                to = %dst.display(),
                error = %e,
                "could not move article file"
            );
            broken_count += 1;
        }
    }
    broken_count
}

/// Rename, falling back to copy+remove across filesystems
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}

/// Remove the per-bundle staging directory once its last file moved out
fn cleanup_staging_dir(output: &Path, dest_dir: &Path) {
    let Some(staging) = output.parent() else {
        return;
    };
    if staging == dest_dir {
        return;
    }
    if let Ok(mut entries) = std::fs::read_dir(staging) {
        if entries.next().is_none() {
            debug!(dir = %staging.display(), "removing empty staging directory");
            let _ = std::fs::remove_dir(staging);
        }
    }
}

/// `_brokenlog.txt`: one `<filename> (<success>/<total>)` line per broken file
fn append_broken_log(dest_dir: &Path, filename: &str, success: u64, total: u64) {
    let log_path = dest_dir.join("_brokenlog.txt");
    let entry = format!("{filename} ({success}/{total})\n");
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .and_then(|mut file| file.write_all(entry.as_bytes()));
    if let Err(e) = result {
        warn!(file = %log_path.display(), error = %e, "could not append to broken log");
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OutputState;
    use crate::types::{FileId, NzbId};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn completion_with_parts(
        dir: &Path,
        parts: Vec<(u32, &[u8], bool)>,
        dest_dir: &Path,
    ) -> FileCompletion {
        let mut articles = Vec::new();
        let mut failed = 0;
        let mut success = 0;
        for (part, bytes, finished) in parts {
            let path = dir.join(format!("{part}.tmp"));
            if finished {
                std::fs::write(&path, bytes).unwrap();
                success += 1;
            } else {
                failed += 1;
            }
            articles.push((part, path, finished));
        }
        FileCompletion {
            nzb_id: NzbId(1),
            file_id: FileId(1),
            nzb_name: "bundle".into(),
            dest_dir: dest_dir.to_path_buf(),
            filename: "joined.bin".into(),
            articles,
            success_articles: success,
            failed_articles: failed,
            output_filename: None,
            output_state: Arc::new(Mutex::new(OutputState::default())),
        }
    }

    #[tokio::test]
    async fn joins_parts_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let completion = completion_with_parts(
            temp.path(),
            vec![(1, &b"AAA"[..], true), (2, &b"BBB"[..], true), (3, &b"C"[..], true)],
            dest.path(),
        );
        let config = Config::default();

        let done = complete_file(&config, &completion).await;
        assert!(!done.broken);
        assert_eq!(done.path, dest.path().join("bundle").join("joined.bin"));
        assert_eq!(std::fs::read(&done.path).unwrap(), b"AAABBBC");
        // part temp files are gone
        assert!(!temp.path().join("1.tmp").exists());
    }

    #[tokio::test]
    async fn broken_file_is_logged_and_optionally_renamed() {
        let temp = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let completion = completion_with_parts(
            temp.path(),
            vec![(1, &b"AAA"[..], true), (2, &b""[..], false)],
            dest.path(),
        );
        let mut config = Config::default();
        config.download.rename_broken = true;
        config.download.create_broken_log = true;

        let done = complete_file(&config, &completion).await;
        assert!(done.broken);
        assert!(done.path.to_string_lossy().ends_with("_broken"));
        assert_eq!(std::fs::read(&done.path).unwrap(), b"AAA");

        let log = std::fs::read_to_string(dest.path().join("bundle").join("_brokenlog.txt"))
            .unwrap();
        assert_eq!(log, "joined.bin (1/2)\n");
    }

    #[tokio::test]
    async fn existing_target_gets_duplicate_suffix() {
        let temp = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let bundle_dir = dest.path().join("bundle");
        std::fs::create_dir_all(&bundle_dir).unwrap();
        std::fs::write(bundle_dir.join("joined.bin"), b"already here").unwrap();

        let completion =
            completion_with_parts(temp.path(), vec![(1, &b"NEW"[..], true)], dest.path());
        let done = complete_file(&Config::default(), &completion).await;
        assert_eq!(done.path, bundle_dir.join("joined.bin_duplicate1"));
        assert_eq!(std::fs::read(&done.path).unwrap(), b"NEW");
        assert_eq!(
            std::fs::read(bundle_dir.join("joined.bin")).unwrap(),
            b"already here"
        );
    }

    #[tokio::test]
    async fn rawmode_stores_numbered_subfiles() {
        let temp = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let completion = completion_with_parts(
            temp.path(),
            vec![(1, &b"one"[..], true), (2, &b"two"[..], true)],
            dest.path(),
        );
        let mut config = Config::default();
        config.download.decode = false;

        let done = complete_file(&config, &completion).await;
        assert!(done.path.is_dir());
        assert_eq!(std::fs::read(done.path.join("001")).unwrap(), b"one");
        assert_eq!(std::fs::read(done.path.join("002")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn direct_write_output_is_moved_into_place() {
        let temp = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let staging = temp.path().join("nzb-1");
        std::fs::create_dir_all(&staging).unwrap();
        let output = staging.join("joined.bin.out");
        std::fs::write(&output, b"DIRECT").unwrap();

        let mut completion = completion_with_parts(temp.path(), vec![(1, &b""[..], true)], dest.path());
        completion.output_filename = Some(output.clone());
        completion.output_state = Arc::new(Mutex::new(OutputState {
            initialized: true,
            duplicate: false,
        }));
        let mut config = Config::default();
        config.download.direct_write = true;

        let done = complete_file(&config, &completion).await;
        assert!(!done.broken);
        assert_eq!(std::fs::read(&done.path).unwrap(), b"DIRECT");
        assert!(
            !staging.exists(),
            "empty staging directory must be cleaned up"
        );
    }
}

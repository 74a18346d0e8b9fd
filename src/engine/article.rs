//! Per-article download: the retry/failover state machine and the NNTP
//! session that fetches and stream-decodes one article
//!
//! Server management for one article works like this: a list of burned
//! servers starts empty and the failover level starts at 0. Connection
//! problems retry the same server indefinitely; NotFound and CRC errors
//! burn the server immediately; generic failures burn it after the
//! configured number of retries. When every server at the current level is
//! burned (counting group peers), the level advances; when no level
//! remains, the article terminally fails.

use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::decoder::{detect_format, ArticleDecoder, ArticleSink, DecodeVerdict, Format};
use crate::error::NntpError;
use crate::nntp::{Connection, Leased, ServerPool};
use crate::queue::ArticleTask;
use crate::speed::SpeedMeter;
use crate::types::{ArticleOutcome, ServerId};

/// Maximum accepted line length during article transfer
const LINE_BUF_SIZE: usize = 10 * 1024;
/// Quantum for the interruptible retry sleep
const SLEEP_QUANTUM: Duration = Duration::from_millis(100);
/// ARTICLE is re-issued this many times on a non-2xx response
const ARTICLE_SEND_ATTEMPTS: u32 = 3;

/// Shared collaborators a worker threads through one article download
pub(crate) struct ArticleContext {
    pub pool: Arc<ServerPool>,
    pub config: Arc<Config>,
    pub speed: SpeedMeter,
    /// Worker stop signal; observed within one sleep quantum
    pub stop: CancellationToken,
    /// Global download pause
    pub paused: Arc<AtomicBool>,
}

impl ArticleContext {
    fn stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

/// What one full failover loop produced
pub(crate) struct DownloadResult {
    pub outcome: ArticleOutcome,
    /// In-band filename carried by the encoding, when one was seen
    pub article_filename: Option<String>,
}

/// Run the complete failover loop for one article and publish the final
/// outcome. The worker owns at most one leased connection at any time.
pub(crate) async fn download_article(ctx: &ArticleContext, task: &ArticleTask) -> DownloadResult {
    if ctx.config.download.continue_partial && task.result_filename.exists() {
        debug!(article = %task.info_name, "result file already present, skipping");
        return DownloadResult {
            outcome: ArticleOutcome::Finished,
            article_filename: None,
        };
    }

    let retries = ctx.config.download.retries.max(1);
    let mut retries_left = retries;
    let mut failed_servers: Vec<ServerId> = Vec::new();
    let mut want_server: Option<ServerId> = None;
    let mut level = 0u32;
    // A connection that failed to connect is held across iterations and
    // retried, so a connect-storm cannot fan out across worker threads.
    let mut held: Option<Leased> = None;
    let mut article_filename = None;
    let mut outcome;

    loop {
        let mut leased = match held.take() {
            Some(leased) => leased,
            None => {
                match ctx
                    .pool
                    .get_connection(level, want_server, &failed_servers, &ctx.stop)
                    .await
                {
                    Some(leased) => leased,
                    None => {
                        // stopped while waiting for a connection
                        outcome = ArticleOutcome::Retry;
                        break;
                    }
                }
            }
        };

        if ctx.stopped() || ctx.paused() {
            leased.conn.set_suppress_errors(ctx.stopped());
            ctx.pool.free_connection(leased, false).await;
            outcome = ArticleOutcome::Retry;
            break;
        }

        let last_server = leased.server().id;
        leased.conn.set_suppress_errors(false);

        let mut connected = match leased.conn.connect().await {
            Ok(()) => true,
            Err(e) => {
                if !ctx.stopped() {
                    warn!(article = %task.info_name, server = %last_server, error = %e, "connect failed");
                }
                false
            }
        };

        outcome = ArticleOutcome::Failed;
        if connected && !ctx.stopped() {
            debug!(article = %task.info_name, server = %last_server, "downloading");
            let session = download_session(ctx, task, &mut leased.conn).await;
            outcome = session.outcome;
            if session.article_filename.is_some() {
                article_filename = session.article_filename;
            }
        }

        if ctx.stopped() {
            // errors from the torn-down socket are expected from here on
            leased.conn.set_suppress_errors(true);
        }

        if connected {
            if outcome == ArticleOutcome::ConnectError {
                // Keep the connection leased and retry the same server;
                // freeing it here would let every waiting worker run into
                // the same connect error at once.
                leased.conn.disconnect().await;
                connected = false;
                outcome = ArticleOutcome::Failed;
                held = Some(leased);
            } else {
                let keep = matches!(
                    outcome,
                    ArticleOutcome::Finished | ArticleOutcome::NotFound
                );
                ctx.pool.free_connection(leased, keep).await;
            }
        } else {
            held = Some(leased);
        }

        if matches!(
            outcome,
            ArticleOutcome::Finished | ArticleOutcome::FatalError
        ) {
            break;
        }

        want_server = None;

        if connected && outcome == ArticleOutcome::Failed {
            retries_left = retries_left.saturating_sub(1);
        }

        if !connected || (outcome == ArticleOutcome::Failed && retries_left > 0) {
            want_server = Some(last_server);
        }

        if matches!(outcome, ArticleOutcome::NotFound | ArticleOutcome::CrcError)
            || (outcome == ArticleOutcome::Failed && retries_left == 0)
        {
            failed_servers.push(last_server);
        }

        if want_server.is_some() && !ctx.stopped() && !ctx.paused() {
            debug!(
                article = %task.info_name,
                seconds = ctx.config.download.retry_interval.as_secs(),
                "waiting to retry"
            );
            interruptible_sleep(ctx, ctx.config.download.retry_interval).await;
        }

        if ctx.stopped() || ctx.paused() {
            outcome = ArticleOutcome::Retry;
            break;
        }

        if want_server.is_none() {
            if ctx.pool.level_exhausted(level, &failed_servers) {
                if level < ctx.pool.max_level() {
                    debug!(article = %task.info_name, level, "all servers at level failed, increasing level");
                    level += 1;
                } else {
                    warn!(article = %task.info_name, "all servers failed");
                    outcome = ArticleOutcome::Failed;
                    break;
                }
            }
            retries_left = retries;
        }
    }

    // A connect-error lease may still be held when the loop ends
    if let Some(mut leased) = held.take() {
        leased.conn.set_suppress_errors(true);
        ctx.pool
            .free_connection(leased, outcome == ArticleOutcome::Finished)
            .await;
    }

    if ctx.stopped() {
        debug!(article = %task.info_name, "download cancelled");
        outcome = ArticleOutcome::Retry;
    }
    if !matches!(
        outcome,
        ArticleOutcome::Finished | ArticleOutcome::Retry | ArticleOutcome::FatalError
    ) {
        outcome = ArticleOutcome::Failed;
    }
    if outcome == ArticleOutcome::Failed {
        warn!(article = %task.info_name, "download failed");
    }

    DownloadResult {
        outcome,
        article_filename,
    }
}

/// Sleep `total`, broken into ≤100ms quanta so stop and pause interrupt
async fn interruptible_sleep(ctx: &ArticleContext, total: Duration) {
    let mut remaining = total;
    while !ctx.stopped() && !ctx.paused() && !remaining.is_zero() {
        let step = remaining.min(SLEEP_QUANTUM);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}

/// Response classification per RFC 977 leading digits
fn classify_response(
    conn: &Connection,
    response: &Result<String, NntpError>,
    task: &ArticleTask,
    context: &str,
) -> ArticleOutcome {
    match response {
        Err(e) => {
            if !matches!(e, NntpError::Cancelled) {
                warn!(article = %task.info_name, server = %conn.server().id, error = %e, "{context}");
            }
            ArticleOutcome::ConnectError
        }
        Ok(line) => {
            if conn.auth_error() || line.starts_with("400") || line.starts_with("499") {
                warn!(article = %task.info_name, server = %conn.server().id, response = %line, "{context}");
                ArticleOutcome::ConnectError
            } else if line.starts_with("41") || line.starts_with("42") || line.starts_with("43") {
                warn!(article = %task.info_name, server = %conn.server().id, response = %line, "{context}");
                ArticleOutcome::NotFound
            } else if line.starts_with('2') {
                ArticleOutcome::Finished
            } else {
                warn!(article = %task.info_name, server = %conn.server().id, response = %line, "{context}");
                ArticleOutcome::Failed
            }
        }
    }
}

struct SessionResult {
    outcome: ArticleOutcome,
    article_filename: Option<String>,
}

impl SessionResult {
    fn bare(outcome: ArticleOutcome) -> Self {
        Self {
            outcome,
            article_filename: None,
        }
    }
}

/// One NNTP session: join groups, request the article, stream the body
/// through the decoder, verify, and move the result into place.
async fn download_session(
    ctx: &ArticleContext,
    task: &ArticleTask,
    conn: &mut Connection,
) -> SessionResult {
    // Group selection, only for servers that require it
    if conn.server().join_group {
        let mut response = Err(NntpError::Protocol("no groups to join".into()));
        for group in &task.groups {
            response = conn.join_group(group).await;
            if matches!(&response, Ok(line) if line.starts_with('2')) {
                break;
            }
        }
        let status = classify_response(conn, &response, task, "could not join group");
        if status != ArticleOutcome::Finished {
            return SessionResult::bare(status);
        }
    }

    // Request the article; transient non-2xx responses are retried a few
    // times before classification
    let command = format!("ARTICLE <{}>", task.message_id);
    let mut response = Err(NntpError::Protocol("article not requested".into()));
    for _ in 0..ARTICLE_SEND_ATTEMPTS {
        response = conn.request(&command).await;
        match &response {
            Ok(line) if !line.starts_with('2') => continue,
            _ => break,
        }
    }
    let status = classify_response(conn, &response, task, "could not fetch article");
    if status != ArticleOutcome::Finished {
        return SessionResult::bare(status);
    }

    let decode = ctx.config.download.decode;
    let direct_write = ctx.config.download.direct_write;
    let temp_filename = temp_path(&task.result_filename);
    let expected_id = format!("<{}>", task.message_id);

    let mut decoder: Option<ArticleDecoder> = None;
    let mut format = Format::Unknown;
    let mut sink: Option<FileSink> = None;
    let mut in_body = false;
    let mut saw_end = false;
    let mut outcome = ArticleOutcome::Finished;

    'transfer: while !ctx.stopped() {
        // Bandwidth throttling: stay under the configured aggregate rate
        ctx.speed.throttle(|| ctx.stop.is_cancelled()).await;

        let line = tokio::select! {
            _ = ctx.stop.cancelled() => None,
            read = conn.read_line(LINE_BUF_SIZE) => Some(read),
        };
        let mut line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                if !ctx.stopped() {
                    warn!(
                        article = %task.info_name,
                        server = %conn.server().id,
                        error = %e,
                        "unexpected end of article"
                    );
                }
                outcome = ArticleOutcome::Failed;
                break 'transfer;
            }
            None => {
                outcome = ArticleOutcome::Failed;
                break 'transfer;
            }
        };
        ctx.speed.add_bytes(line.len() as u64);

        if line == b".\r\n" || line == b".\n" {
            saw_end = true;
            break 'transfer;
        }

        // De-stuff lines that start with ".."
        if line.starts_with(b"..") {
            line.remove(0);
        }

        if !in_body {
            if line == b"\r\n" || line == b"\n" {
                in_body = true;
            } else if let Some(value) = line.strip_prefix(b"Message-ID: ") {
                if !value.starts_with(expected_id.as_bytes()) {
                    let returned = String::from_utf8_lossy(crate::decoder::trim_eol(value));
                    warn!(
                        article = %task.info_name,
                        server = %conn.server().id,
                        expected = %expected_id,
                        returned = %returned,
                        "wrong message-id"
                    );
                    outcome = ArticleOutcome::Failed;
                    break 'transfer;
                }
            }
        } else if decode && format == Format::Unknown {
            format = detect_format(&line);
            if format != Format::Unknown {
                decoder = ArticleDecoder::for_format(
                    format,
                    direct_write && format == Format::Yenc,
                    ctx.config.download.crc_check,
                );
            }
        }

        // Decoded mode writes body lines once a format is recognized
        // (preamble before the encoding header is skipped); rawmode stores
        // the whole article, headers included
        if (in_body && format != Format::Unknown) || !decode {
            if sink.is_none() {
                match prepare_sink(ctx, task, format, &line, &temp_filename).await {
                    Ok(prepared) => sink = Some(prepared),
                    Err(e) => {
                        error!(article = %task.info_name, error = %e, "could not create output file");
                        outcome = ArticleOutcome::FatalError;
                        break 'transfer;
                    }
                }
            }
            if let Some(sink_ref) = sink.as_mut() {
                let write_result = match &mut decoder {
                    Some(active) => active.write(&line, sink_ref),
                    None => sink_ref.write_all(&line),
                };
                if let Err(e) = write_result {
                    error!(article = %task.info_name, error = %e, "write failed");
                    outcome = ArticleOutcome::FatalError;
                    break 'transfer;
                }
            }
        }
    }

    if !saw_end && outcome == ArticleOutcome::Finished && !ctx.stopped() {
        warn!(
            article = %task.info_name,
            server = %conn.server().id,
            "article incomplete"
        );
        outcome = ArticleOutcome::Failed;
    }
    if ctx.stopped() {
        outcome = ArticleOutcome::Failed;
    }

    let article_filename = decoder
        .as_ref()
        .and_then(|d| d.article_filename())
        .map(str::to_string);

    if outcome != ArticleOutcome::Finished {
        drop(sink);
        remove_quietly(&temp_filename);
        return SessionResult {
            outcome,
            article_filename,
        };
    }

    let outcome = decode_check(ctx, task, decoder.as_ref(), sink, &temp_filename).await;
    SessionResult {
        outcome,
        article_filename,
    }
}

/// Verify the decoded article and move it into its result location
async fn decode_check(
    ctx: &ArticleContext,
    task: &ArticleTask,
    decoder: Option<&ArticleDecoder>,
    sink: Option<FileSink>,
    temp_filename: &Path,
) -> ArticleOutcome {
    let direct = ctx.config.download.direct_write
        && matches!(decoder, Some(ArticleDecoder::Yenc(_)));

    if let Some(mut sink) = sink {
        if let Err(e) = sink.finish() {
            error!(article = %task.info_name, error = %e, "flush failed");
            remove_quietly(temp_filename);
            return ArticleOutcome::FatalError;
        }
    }

    if !ctx.config.download.decode {
        // rawmode: the raw lines are the result
        if let Err(e) = std::fs::rename(temp_filename, &task.result_filename) {
            error!(
                article = %task.info_name,
                from = %temp_filename.display(),
                to = %task.result_filename.display(),
                error = %e,
                "could not move article file"
            );
        } else {
            debug!(article = %task.info_name, "article stored");
        }
        return ArticleOutcome::Finished;
    }

    let Some(decoder) = decoder else {
        warn!(article = %task.info_name, "no binary data or unsupported encoding");
        remove_quietly(temp_filename);
        return ArticleOutcome::Failed;
    };

    let verdict = decoder.check();
    if verdict == DecodeVerdict::Finished && !direct {
        if let Err(e) = std::fs::rename(temp_filename, &task.result_filename) {
            error!(
                article = %task.info_name,
                from = %temp_filename.display(),
                to = %task.result_filename.display(),
                error = %e,
                "could not rename decoded article"
            );
        }
    }
    remove_quietly(temp_filename);

    match verdict {
        DecodeVerdict::Finished => {
            debug!(article = %task.info_name, "successfully downloaded");
            if direct && ctx.config.download.continue_partial {
                // flag file marks the part as downloaded for future runs
                if let Err(e) = std::fs::File::create(&task.result_filename) {
                    warn!(
                        article = %task.info_name,
                        error = %e,
                        "could not create continuation flag file"
                    );
                }
            }
            ArticleOutcome::Finished
        }
        DecodeVerdict::CrcError => {
            warn!(article = %task.info_name, "decoding failed: CRC mismatch");
            remove_quietly(&task.result_filename);
            ArticleOutcome::CrcError
        }
        DecodeVerdict::ArticleIncomplete => {
            warn!(article = %task.info_name, "decoding failed: article incomplete");
            remove_quietly(&task.result_filename);
            ArticleOutcome::Failed
        }
        DecodeVerdict::InvalidSize => {
            warn!(article = %task.info_name, "decoding failed: size mismatch");
            remove_quietly(&task.result_filename);
            ArticleOutcome::Failed
        }
        DecodeVerdict::NoBinaryData => {
            warn!(article = %task.info_name, "decoding failed: no binary data found");
            remove_quietly(&task.result_filename);
            ArticleOutcome::Failed
        }
        DecodeVerdict::UnknownError => {
            warn!(article = %task.info_name, "decoding failed");
            remove_quietly(&task.result_filename);
            ArticleOutcome::Failed
        }
    }
}

/// Open the destination for decoded bytes. Direct-write mode initializes
/// the shared output file under the file's output mutex on first touch.
async fn prepare_sink(
    ctx: &ArticleContext,
    task: &ArticleTask,
    format: Format,
    first_line: &[u8],
    temp_filename: &Path,
) -> std::io::Result<FileSink> {
    let direct = ctx.config.download.direct_write && format == Format::Yenc;
    if direct {
        if let Some(output) = &task.output_filename {
            let declared = ybegin_size(first_line);
            {
                let mut state = task.output_state.lock().await;
                if state.duplicate {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "file already marked as duplicate",
                    ));
                }
                if !state.initialized {
                    if let Some(dir) = output.parent() {
                        std::fs::create_dir_all(dir)?;
                    }
                    // stale file from a previous session
                    remove_quietly(output);
                    let file = std::fs::File::create(output)?;
                    // sparse pre-allocation: concurrent parts write
                    // disjoint ranges of the final size
                    file.set_len(declared.unwrap_or(0))?;
                    state.initialized = true;
                }
            }
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(output)?;
            return Ok(FileSink::direct(file));
        }
    }

    if let Some(dir) = temp_filename.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::File::create(temp_filename)?;
    Ok(FileSink::sequential(
        file,
        ctx.config.download.write_buffer_size,
    ))
}

/// `size=` attribute of an `=ybegin` line, for sparse pre-allocation
fn ybegin_size(line: &[u8]) -> Option<u64> {
    if !line.starts_with(b"=ybegin ") {
        return None;
    }
    let key = b" size=";
    let start = line
        .windows(key.len())
        .position(|window| window == key)?
        + key.len();
    let rest = &line[start..];
    let end = rest
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end]).ok()?.parse().ok()
}

fn temp_path(result_filename: &Path) -> PathBuf {
    let mut path = result_filename.as_os_str().to_owned();
    path.push(".part");
    PathBuf::from(path)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "could not remove file");
        }
    }
}

/// Sink over a real file: buffered sequential writes for temp files,
/// positioned writes for the shared direct-write output
pub(crate) enum FileSink {
    Sequential(BufWriter<std::fs::File>),
    Direct { file: std::fs::File, pos: u64 },
}

impl FileSink {
    fn sequential(file: std::fs::File, buffer_size: usize) -> Self {
        let capacity = if buffer_size == 0 { 8 * 1024 } else { buffer_size };
        Self::Sequential(BufWriter::with_capacity(capacity, file))
    }

    fn direct(file: std::fs::File) -> Self {
        Self::Direct { file, pos: 0 }
    }

    fn finish(&mut self) -> std::io::Result<()> {
        match self {
            Self::Sequential(writer) => writer.flush(),
            Self::Direct { .. } => Ok(()),
        }
    }
}

impl ArticleSink for FileSink {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Sequential(writer) => writer.write_all(buf),
            Self::Direct { file, pos } => {
                write_at(file, buf, *pos)?;
                *pos += buf.len() as u64;
                Ok(())
            }
        }
    }

    fn seek_to(&mut self, target: u64) -> std::io::Result<()> {
        match self {
            Self::Sequential(writer) => {
                writer.flush()?;
                writer.get_mut().seek(SeekFrom::Start(target))?;
                Ok(())
            }
            Self::Direct { pos, .. } => {
                *pos = target;
                Ok(())
            }
        }
    }
}

/// Positional write; takes `&File`, so concurrent parts of one file never
/// contend on a seek cursor
#[cfg(unix)]
fn write_at(file: &std::fs::File, buf: &[u8], pos: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, pos)
}

#[cfg(windows)]
fn write_at(file: &std::fs::File, buf: &[u8], pos: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        written += file.seek_write(&buf[written..], pos + written as u64)?;
    }
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ybegin_size_parses_the_declared_total() {
        assert_eq!(
            ybegin_size(b"=ybegin part=1 line=128 size=123456 name=a.bin\r\n"),
            Some(123456)
        );
        assert_eq!(ybegin_size(b"=ypart begin=1 end=2\r\n"), None);
        assert_eq!(ybegin_size(b"=ybegin line=128 name=a.bin\r\n"), None);
    }

    #[test]
    fn temp_path_appends_part_suffix() {
        assert_eq!(
            temp_path(Path::new("/tmp/17.tmp")),
            PathBuf::from("/tmp/17.tmp.part")
        );
    }

    #[test]
    fn direct_sink_writes_disjoint_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(10).unwrap();

        let reopen = || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap()
        };
        let mut first = FileSink::direct(reopen());
        first.seek_to(0).unwrap();
        first.write_all(b"HELLO").unwrap();
        let mut second = FileSink::direct(reopen());
        second.seek_to(5).unwrap();
        second.write_all(b"WORLD").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"HELLOWORLD");
    }

    #[test]
    fn sequential_sink_honors_buffer_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.bin");
        let mut sink = FileSink::sequential(std::fs::File::create(&path).unwrap(), 4096);
        sink.write_all(b"abc").unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }
}

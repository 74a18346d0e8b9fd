//! Shared test infrastructure: a scripted in-process NNTP server, yEnc
//! encoding helpers, and engine builders.

#![allow(dead_code)] // each integration test binary uses a subset

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use usenet_engine::queue::persistence::{PostSnapshot, QueuePersistence, QueueSnapshot};
use usenet_engine::{Config, Event, ServerConfig};

/// How a scripted server answers `ARTICLE <message-id>`
#[derive(Clone)]
pub enum ArticleBehavior {
    /// Serve a complete yEnc article
    Serve(ServedArticle),
    /// Answer 430
    NotFound,
    /// Answer an arbitrary status line
    Respond(String),
    /// Serve part of the body, signal the test, then hang
    StallMidBody {
        article: ServedArticle,
        after_lines: usize,
    },
}

/// Payload of a served yEnc article
#[derive(Clone)]
pub struct ServedArticle {
    pub filename: String,
    /// Full size of the destination file
    pub file_size: u64,
    /// This part's slice of the file
    pub data: Vec<u8>,
    /// 1-based part number; `None` = single-part post
    pub part: Option<(u32, u64, u64)>,
    /// Write a wrong CRC into the trailer
    pub bad_crc: bool,
}

impl ServedArticle {
    pub fn single(filename: &str, data: &[u8]) -> Self {
        Self {
            filename: filename.to_string(),
            file_size: data.len() as u64,
            data: data.to_vec(),
            part: None,
            bad_crc: false,
        }
    }

    /// Part `n` covering `begin..=end` (1-based, inclusive) of a file
    pub fn part(filename: &str, full: &[u8], n: u32, begin: u64, end: u64) -> Self {
        Self {
            filename: filename.to_string(),
            file_size: full.len() as u64,
            data: full[(begin - 1) as usize..end as usize].to_vec(),
            part: Some((n, begin, end)),
            bad_crc: false,
        }
    }

    pub fn with_bad_crc(mut self) -> Self {
        self.bad_crc = true;
        self
    }
}

/// A scripted NNTP server listening on a local port
pub struct NntpTestServer {
    pub port: u16,
    articles: Arc<StdMutex<HashMap<String, ArticleBehavior>>>,
    /// Close this many accepted sockets immediately (connect failures)
    drop_connects: Arc<AtomicUsize>,
    /// Total sockets accepted
    pub accepts: Arc<AtomicUsize>,
    /// Set once a stalled article reached its stall point
    pub stalled: Arc<AtomicBool>,
}

impl NntpTestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let port = listener.local_addr().expect("local addr").port();
        let articles: Arc<StdMutex<HashMap<String, ArticleBehavior>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let drop_connects = Arc::new(AtomicUsize::new(0));
        let accepts = Arc::new(AtomicUsize::new(0));
        let stalled = Arc::new(AtomicBool::new(false));

        let articles_task = Arc::clone(&articles);
        let drop_task = Arc::clone(&drop_connects);
        let accepts_task = Arc::clone(&accepts);
        let stalled_task = Arc::clone(&stalled);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                accepts_task.fetch_add(1, Ordering::SeqCst);
                if drop_task
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    // simulate a server dropping the connection on connect
                    drop(socket);
                    continue;
                }
                let articles = Arc::clone(&articles_task);
                let stalled = Arc::clone(&stalled_task);
                tokio::spawn(async move {
                    let _ = serve_session(socket, articles, stalled).await;
                });
            }
        });

        Self {
            port,
            articles,
            drop_connects,
            accepts,
            stalled,
        }
    }

    pub fn add(&self, message_id: &str, behavior: ArticleBehavior) {
        self.articles
            .lock()
            .expect("script lock")
            .insert(message_id.to_string(), behavior);
    }

    pub fn drop_next_connects(&self, n: usize) {
        self.drop_connects.store(n, Ordering::SeqCst);
    }
}

async fn serve_session(
    socket: TcpStream,
    articles: Arc<StdMutex<HashMap<String, ArticleBehavior>>>,
    stalled: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let (read_half, mut writer) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    writer.write_all(b"200 test server ready\r\n").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end();
        if command.starts_with("AUTHINFO USER") {
            writer.write_all(b"381 password required\r\n").await?;
        } else if command.starts_with("AUTHINFO PASS") {
            writer.write_all(b"281 authenticated\r\n").await?;
        } else if command.starts_with("GROUP ") {
            writer.write_all(b"211 10 1 10 group selected\r\n").await?;
        } else if command == "QUIT" {
            writer.write_all(b"205 bye\r\n").await?;
            return Ok(());
        } else if let Some(rest) = command.strip_prefix("ARTICLE ") {
            let message_id = rest.trim_matches(['<', '>']).to_string();
            let behavior = articles.lock().expect("script lock").get(&message_id).cloned();
            match behavior {
                None | Some(ArticleBehavior::NotFound) => {
                    writer.write_all(b"430 no such article\r\n").await?;
                }
                Some(ArticleBehavior::Respond(status)) => {
                    writer.write_all(status.as_bytes()).await?;
                    writer.write_all(b"\r\n").await?;
                }
                Some(ArticleBehavior::Serve(article)) => {
                    write_article(&mut writer, &message_id, &article, None).await?;
                }
                Some(ArticleBehavior::StallMidBody {
                    article,
                    after_lines,
                }) => {
                    write_article(&mut writer, &message_id, &article, Some(after_lines)).await?;
                    stalled.store(true, Ordering::SeqCst);
                    // hold the socket open; only cancellation frees the client
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return Ok(());
                }
            }
        } else {
            writer.write_all(b"500 command not recognized\r\n").await?;
        }
        writer.flush().await?;
    }
}

async fn write_article(
    writer: &mut (impl AsyncWriteExt + Unpin),
    message_id: &str,
    article: &ServedArticle,
    stop_after_body_lines: Option<usize>,
) -> std::io::Result<()> {
    writer
        .write_all(format!("220 0 <{message_id}> article follows\r\n").as_bytes())
        .await?;
    writer
        .write_all(format!("Message-ID: <{message_id}>\r\n").as_bytes())
        .await?;
    writer
        .write_all(b"From: poster@example.com\r\nSubject: test post\r\n\r\n")
        .await?;

    let mut body_lines = 0usize;
    for line in yenc_article_lines(article) {
        // NNTP dot-stuffing
        if line.starts_with(b".") {
            writer.write_all(b".").await?;
        }
        writer.write_all(&line).await?;
        writer.write_all(b"\r\n").await?;
        body_lines += 1;
        if let Some(limit) = stop_after_body_lines {
            if body_lines >= limit {
                writer.flush().await?;
                return Ok(());
            }
        }
    }
    writer.write_all(b".\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// yEnc-encode a served article into its body lines (without line endings)
pub fn yenc_article_lines(article: &ServedArticle) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let header = match article.part {
        Some((n, _, _)) => format!(
            "=ybegin part={n} line=128 size={} name={}",
            article.file_size, article.filename
        ),
        None => format!(
            "=ybegin line=128 size={} name={}",
            article.file_size, article.filename
        ),
    };
    lines.push(header.into_bytes());
    if let Some((_, begin, end)) = article.part {
        lines.push(format!("=ypart begin={begin} end={end}").into_bytes());
    }

    let mut encoded = Vec::new();
    for &byte in &article.data {
        let value = byte.wrapping_add(42);
        match value {
            0x00 | 0x0a | 0x0d | b'=' => {
                encoded.push(b'=');
                encoded.push(value.wrapping_add(64));
            }
            _ => encoded.push(value),
        }
    }
    for chunk in encoded.chunks(128) {
        lines.push(chunk.to_vec());
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&article.data);
    let crc = if article.bad_crc {
        hasher.finalize() ^ 0xffff_ffff
    } else {
        hasher.finalize()
    };
    let trailer = match article.part {
        Some((n, _, _)) => format!(
            "=yend size={} part={n} pcrc32={crc:08x}",
            article.data.len()
        ),
        None => format!("=yend size={} crc32={crc:08x}", article.data.len()),
    };
    lines.push(trailer.into_bytes());
    lines
}

/// Engine config pointed at scripted servers, with fast test timings
pub fn test_config(
    servers: Vec<ServerConfig>,
    temp_dir: &std::path::Path,
    dest_dir: &std::path::Path,
) -> Config {
    let mut config = Config {
        servers,
        ..Default::default()
    };
    config.download.temp_dir = temp_dir.to_path_buf();
    config.download.dest_dir = dest_dir.to_path_buf();
    config.download.workers = 2;
    config.download.retry_interval = Duration::from_millis(50);
    config.download.connection_timeout = Duration::from_secs(5);
    config.download.read_timeout = Duration::from_secs(5);
    config
}

/// Server entry pointing at a scripted server
pub fn test_server(id: u32, port: u16, level: u32) -> ServerConfig {
    let mut server = ServerConfig::new(id, "127.0.0.1", port);
    server.level = level;
    server.max_connections = 2;
    server
}

/// Wait for the first event matching `pred`, with a deadline
pub async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
    deadline: Duration,
    mut pred: impl FnMut(&Event) -> bool,
) -> Event {
    tokio::time::timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Persistence hook that records every queue snapshot it is handed;
/// the last snapshot containing a bundle preserves its final counters
#[derive(Clone, Default)]
pub struct RecordingPersistence {
    pub snapshots: Arc<StdMutex<Vec<QueueSnapshot>>>,
}

#[async_trait::async_trait]
impl QueuePersistence for RecordingPersistence {
    async fn save_queue(&self, snapshot: &QueueSnapshot) -> usenet_engine::Result<()> {
        self.snapshots
            .lock()
            .expect("snapshot lock")
            .push(snapshot.clone());
        Ok(())
    }

    async fn load_queue(&self) -> usenet_engine::Result<Option<QueueSnapshot>> {
        Ok(None)
    }

    async fn save_post_queue(&self, _entries: &[PostSnapshot]) -> usenet_engine::Result<()> {
        Ok(())
    }
}

impl RecordingPersistence {
    /// The last recorded state of a bundle, restored into a live queue
    pub fn last_state_of(&self, id: usenet_engine::NzbId) -> Option<usenet_engine::NzbStats> {
        let snapshots = self.snapshots.lock().expect("snapshot lock");
        snapshots
            .iter()
            .rev()
            .find(|s| s.nzbs.iter().any(|n| n.id == id))
            .map(|s| {
                let queue = s.clone().restore();
                queue
                    .find_nzb(id)
                    .map(|n| n.stats())
                    .expect("bundle present in snapshot")
            })
    }
}

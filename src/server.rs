use crate::gateway::Gateway;
use crate::smtp::{Action, Reply, Session};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

/// Longest command line accepted, CRLF included.
const MAX_COMMAND_LINE: u64 = 4096;
/// Body lines longer than this are staged in several pieces.
const MAX_BODY_SEGMENT: u64 = 64 * 1024;
/// How long open connections may finish after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Server {
    gateway: Arc<Gateway>,
    command_timeout: Duration,
}

impl Server {
    pub fn new(gateway: Arc<Gateway>, command_timeout: Duration) -> Self {
        Self {
            gateway,
            command_timeout,
        }
    }

    /// Listen on `address` until Ctrl-C.
    pub async fn run(&self, address: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                log::error!("Ports under 1024 require root privileges");
            }
            anyhow::anyhow!("Failed to bind {address}: {e}")
        })?;
        log::info!("SMTP server listening on {}", listener.local_addr()?);

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Unable to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            log::info!("Received shutdown signal, stopping");
        })
        .await
    }

    /// Accept connections until `shutdown` resolves, then wait for the open
    /// ones to finish.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let gateway = self.gateway.clone();
                        let timeout = self.command_timeout;
                        connections.spawn(handle_connection(stream, remote, gateway, timeout));
                    }
                    Err(e) => log::error!("Failed to accept connection: {e}"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        log::info!("No longer accepting connections, {} still open", connections.len());

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("Aborting {} connection(s) after grace period", connections.len());
            connections.shutdown().await;
        }

        log::info!("SMTP server closed");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    gateway: Arc<Gateway>,
    timeout: Duration,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut session = Session::new(gateway, remote);
    log::info!("{} Connection from {remote}", session.id());

    if let Err(e) = converse(&mut session, &mut reader, &mut writer, timeout).await {
        log::warn!("{} Connection error from {remote}: {e}", session.id());
    }
    // staged bodies are removed when the buffer is dropped
    session.abort();
    log::debug!("{} Connection from {remote} closed", session.id());
}

enum Segment {
    Data,
    Eof,
    TimedOut,
}

enum BodyEnd {
    Complete,
    Eof,
    TimedOut,
}

/// Drive one session over a byte stream until QUIT, EOF or timeout.
pub(crate) async fn converse<R, W>(
    session: &mut Session,
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send(writer, &session.greeting()).await?;

    let mut line = Vec::new();
    loop {
        line.clear();
        match read_segment(reader, &mut line, MAX_COMMAND_LINE, timeout).await? {
            Segment::Data => {}
            Segment::Eof => return Ok(()),
            Segment::TimedOut => return send(writer, &session.timed_out()).await,
        }

        // no newline: the line hit the length limit or the peer closed mid-line
        if !line.ends_with(b"\n") {
            if !skip_rest_of_line(reader, timeout).await? {
                return Ok(());
            }
            send(writer, &Reply::new(500, "5.5.2 Error: line too long")).await?;
            continue;
        }

        let text = String::from_utf8_lossy(&line);
        let action = session.handle_line(text.trim_end_matches(['\r', '\n'])).await;
        send(writer, action.reply()).await?;

        match action {
            Action::Reply(_) => {}
            Action::Close(_) => return Ok(()),
            Action::StartData(_) => match receive_body(session, reader, timeout).await? {
                BodyEnd::Complete => {
                    let reply = session.finish_data().await;
                    send(writer, &reply).await?;
                }
                BodyEnd::Eof => {
                    log::warn!("{} Connection closed during message body", session.id());
                    return Ok(());
                }
                BodyEnd::TimedOut => return send(writer, &session.timed_out()).await,
            },
        }
    }
}

/// Stream the body into the session until the lone-dot terminator,
/// removing the dot-stuffing of lines that start with `.`.
async fn receive_body<R>(session: &mut Session, reader: &mut R, timeout: Duration) -> io::Result<BodyEnd>
where
    R: AsyncBufRead + Unpin,
{
    let mut segment = Vec::new();
    let mut at_line_start = true;

    loop {
        segment.clear();
        match read_segment(reader, &mut segment, MAX_BODY_SEGMENT, timeout).await? {
            Segment::Data => {}
            Segment::Eof => return Ok(BodyEnd::Eof),
            Segment::TimedOut => return Ok(BodyEnd::TimedOut),
        }

        let mut bytes = segment.as_slice();
        if at_line_start {
            if bytes == b".\r\n" || bytes == b".\n" {
                return Ok(BodyEnd::Complete);
            }
            if let Some(rest) = bytes.strip_prefix(b".") {
                bytes = rest;
            }
        }
        at_line_start = segment.ends_with(b"\n");

        session.write_body(bytes).await;
    }
}

async fn read_segment<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: u64,
    timeout: Duration,
) -> io::Result<Segment>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = (&mut *reader).take(limit);
    match tokio::time::timeout(timeout, limited.read_until(b'\n', buf)).await {
        Err(_) => Ok(Segment::TimedOut),
        Ok(Ok(0)) => Ok(Segment::Eof),
        Ok(Ok(_)) => Ok(Segment::Data),
        Ok(Err(e)) => Err(e),
    }
}

/// Discard input up to the next newline. Returns false on EOF or timeout.
async fn skip_rest_of_line<R>(reader: &mut R, timeout: Duration) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    let mut discard = Vec::new();
    loop {
        discard.clear();
        match read_segment(reader, &mut discard, MAX_COMMAND_LINE, timeout).await? {
            Segment::Data if discard.ends_with(b"\n") => return Ok(true),
            Segment::Data => {}
            Segment::Eof | Segment::TimedOut => return Ok(false),
        }
    }
}

async fn send<W>(writer: &mut W, reply: &Reply) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(reply.to_wire().as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::gateway::testing;
    use crate::queue::MemoryQueue;

    async fn run_dialogue(
        input: &[u8],
        queue: Arc<MemoryQueue>,
        dir: &std::path::Path,
        timeout: Duration,
    ) -> String {
        let gateway = testing::gateway(
            dir,
            queue,
            testing::settings(),
            &ValidationConfig::default(),
            None,
            4,
        );
        let mut session = Session::new(gateway, "127.0.0.1:40000".parse().unwrap());
        let mut reader = BufReader::new(input);
        let mut output = Vec::new();
        converse(&mut session, &mut reader, &mut output, timeout)
            .await
            .unwrap();
        session.abort();
        String::from_utf8(output).unwrap()
    }

    fn codes(output: &str) -> Vec<&str> {
        output
            .split("\r\n")
            .filter(|l| l.len() >= 4 && &l[3..4] == " ")
            .map(|l| &l[..3])
            .collect()
    }

    #[tokio::test]
    async fn test_dot_unstuffing_and_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let input = b"EHLO client.test\r\n\
MAIL FROM:<s@client.test>\r\n\
RCPT TO:<alice@example.com>\r\n\
DATA\r\n\
Subject: dots\r\n\
\r\n\
..starts with a dot\r\n\
.\r\n\
QUIT\r\n";

        let output = run_dialogue(input, queue.clone(), dir.path(), Duration::from_secs(5)).await;
        assert_eq!(codes(&output), vec!["220", "250", "250", "250", "354", "250", "221"]);

        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].payload().raw_mail(),
            b"Subject: dots\r\n\r\n.starts with a dot\r\n"
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_bare_lf_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let input = b"HELO c\nMAIL FROM:<>\nRCPT TO:<a@b.example.com>\nDATA\nhi\n.\nQUIT\n";

        let output = run_dialogue(input, queue.clone(), dir.path(), Duration::from_secs(5)).await;
        assert_eq!(codes(&output), vec!["220", "250", "250", "250", "354", "250", "221"]);
        assert_eq!(queue.jobs()[0].payload().raw_mail(), b"hi\n");
        assert_eq!(queue.jobs()[0].payload().username(), Some("b"));
    }

    #[tokio::test]
    async fn test_eof_during_body_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let input = b"EHLO c\r\nMAIL FROM:<>\r\nRCPT TO:<a@example.com>\r\nDATA\r\npartial body\r\n";

        let output = run_dialogue(input, queue.clone(), dir.path(), Duration::from_secs(5)).await;
        assert!(output.ends_with("354 End data with <CR><LF>.<CR><LF>\r\n"));
        assert!(queue.jobs().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_overlong_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = b"NOOP ".to_vec();
        input.extend(std::iter::repeat(b'x').take(10_000));
        input.extend_from_slice(b"\r\nNOOP\r\n");

        let output = run_dialogue(
            &input,
            Arc::new(MemoryQueue::new()),
            dir.path(),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(codes(&output), vec!["220", "500", "250"]);
    }

    #[tokio::test]
    async fn test_idle_client_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = testing::gateway(
            dir.path(),
            Arc::new(MemoryQueue::new()),
            testing::settings(),
            &ValidationConfig::default(),
            None,
            4,
        );
        let mut session = Session::new(gateway, "127.0.0.1:40000".parse().unwrap());

        // the client half stays open and silent
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, mut write_half) = tokio::io::split(server);
        let mut reader = BufReader::new(read_half);
        converse(&mut session, &mut reader, &mut write_half, Duration::from_millis(100))
            .await
            .unwrap();

        drop(reader);
        drop(write_half);
        let mut client = client;
        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        assert!(output.starts_with("220 "));
        assert!(output.contains("421 4.4.2 mx.test Error: timeout exceeded"));
    }
}

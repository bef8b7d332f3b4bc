use std::ffi::OsStr;
use std::io::{self, PipeWriter, Read};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

// Time allowed for a pipe to reach EOF after its process exited, and again
// after its process group was killed
const DRAIN_GRACE: Duration = Duration::from_millis(200);
const READ_CHUNK: usize = 8192;

/// Output read from a pipe, cut at the configured limit
#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct Captured {
    pub text: String,
    pub truncated: bool,
}

pub(super) enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Aborted,
}

/// Creates a command that leads its own process group and dies with its handle
pub(super) fn command(program: impl AsRef<OsStr>) -> Command {
    let mut std_cmd = std::process::Command::new(program);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }
    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);
    cmd
}

/// Bytes kept so far by a draining reader
#[derive(Default)]
struct Buffer {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Buffer {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    fn captured(&self, truncated: bool) -> Captured {
        let end = if truncated {
            char_boundary(&self.bytes)
        } else {
            self.bytes.len()
        };
        Captured {
            text: String::from_utf8_lossy(&self.bytes[..end]).into_owned(),
            truncated,
        }
    }
}

/// Length of `bytes` without a multi-byte UTF-8 sequence cut off at its end
fn char_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            _ => 4,
        };
        return if width > back { len - back } else { len };
    }
    len
}

/// Read end of an OS pipe drained on its own thread
pub(super) struct Capture {
    buffer: Arc<Mutex<Buffer>>,
    done: oneshot::Receiver<io::Result<()>>,
}

/// Opens a pipe and starts draining it, returning the end to hand to a child.
///
/// Every copy of the returned writer must be dropped in the parent once the
/// child is spawned, otherwise the reader never sees EOF.
pub(super) fn capture(limit: usize) -> io::Result<(Capture, PipeWriter)> {
    let (reader, writer) = io::pipe()?;
    let buffer = Arc::new(Mutex::new(Buffer::default()));
    let (tx, done) = oneshot::channel();

    // Not a blocking task: a detached descendant can hold the pipe open for
    // as long as it lives, and runtime shutdown must not wait for it.
    let shared = Arc::clone(&buffer);
    std::thread::Builder::new()
        .name("kodetron-capture".to_string())
        .spawn(move || {
            let _ = tx.send(read_capped(reader, limit, &shared));
        })?;

    Ok((Capture { buffer, done }, writer))
}

impl Capture {
    /// Collects the captured output of an exited process group.
    ///
    /// A descendant that outlived the group leader keeps the pipe open. After
    /// a short grace period the whole group is killed; if the pipe is still
    /// open after a second grace period (the holder left the group), the
    /// bytes read so far are returned marked as truncated.
    pub(super) async fn finish(self, pgid: Option<u32>) -> io::Result<Captured> {
        let Capture { buffer, mut done } = self;

        if let Ok(read) = tokio::time::timeout(DRAIN_GRACE, &mut done).await {
            return drained(read, &buffer);
        }
        log::debug!("Pipe still open after exit, killing process group {pgid:?}");
        kill_group(pgid);

        if let Ok(read) = tokio::time::timeout(DRAIN_GRACE, &mut done).await {
            return drained(read, &buffer);
        }
        log::warn!("Pipe held open by a process outside group {pgid:?}, keeping partial output");
        Ok(buffer.lock().captured(true))
    }
}

fn drained(
    read: Result<io::Result<()>, oneshot::error::RecvError>,
    buffer: &Mutex<Buffer>,
) -> io::Result<Captured> {
    read.map_err(io::Error::other)??;
    let buffer = buffer.lock();
    Ok(buffer.captured(buffer.truncated))
}

/// Waits for `child` to exit, at most `limit`, or until `cancel` fires.
///
/// On timeout or cancellation the process group is killed and the child
/// reaped before returning, so nothing it started keeps running.
pub(super) async fn wait_bounded(
    child: &mut Child,
    limit: Duration,
    cancel: &CancellationToken,
) -> io::Result<Waited> {
    let pid = child.id();
    let waited = tokio::select! {
        status = child.wait() => return status.map(Waited::Exited),
        _ = tokio::time::sleep(limit) => Waited::TimedOut,
        _ = cancel.cancelled() => Waited::Aborted,
    };

    kill_group(pid);
    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill process {pid:?}: {e}");
    }
    Ok(waited)
}

#[cfg(unix)]
fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; ESRCH for a vanished group is expected
    let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if ret != 0 {
        log::debug!(
            "killpg({pgid}) failed: {}",
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>) {}

/// Reads `reader` to EOF into `buffer`, keeping at most `limit` bytes.
///
/// Bytes past the limit are still consumed so the writer never blocks on a
/// full pipe.
fn read_capped(mut reader: impl Read, limit: usize, buffer: &Mutex<Buffer>) -> io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        buffer.lock().push(&chunk[..n], limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn read_all(reader: impl Read, limit: usize) -> Captured {
        let buffer = Mutex::new(Buffer::default());
        read_capped(reader, limit, &buffer).unwrap();
        let buffer = buffer.lock();
        buffer.captured(buffer.truncated)
    }

    #[test]
    fn test_read_capped_under_limit() {
        let captured = read_all(&b"hello\nworld\n"[..], 64);
        assert_eq!(
            captured,
            Captured {
                text: "hello\nworld\n".to_string(),
                truncated: false,
            }
        );
    }

    #[test]
    fn test_read_capped_exact_limit_is_not_truncated() {
        let captured = read_all(&b"12345"[..], 5);
        assert_eq!(captured.text, "12345");
        assert!(!captured.truncated);
    }

    #[test]
    fn test_read_capped_drains_past_limit() {
        let input = vec![b'y'; READ_CHUNK * 3 + 17];
        let mut cursor = std::io::Cursor::new(input);

        let captured = read_all(&mut cursor, 10);

        assert_eq!(captured.text, "yyyyyyyyyy");
        assert!(captured.truncated);
        assert_eq!(cursor.position() as usize, READ_CHUNK * 3 + 17);
    }

    #[test]
    fn test_limit_never_splits_a_character() {
        let captured = read_all("aé".as_bytes(), 2);
        assert_eq!(
            captured,
            Captured {
                text: "a".to_string(),
                truncated: true,
            }
        );

        let captured = read_all("日本語".as_bytes(), 7);
        assert_eq!(captured.text, "日本");
        assert!(!captured.text.contains('\u{FFFD}'));
    }

    #[test]
    fn test_char_boundary_keeps_complete_tail() {
        assert_eq!(char_boundary("é".as_bytes()), 2);
        assert_eq!(char_boundary("ab".as_bytes()), 2);
        assert_eq!(char_boundary(&[0xF0, 0x9F, 0x98]), 0);
        assert_eq!(char_boundary(&[]), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_bounded_kills_on_timeout() {
        let mut child = command("sleep").arg("30").spawn().unwrap();
        let token = CancellationToken::new();

        let waited = wait_bounded(&mut child, Duration::from_millis(100), &token)
            .await
            .unwrap();

        assert!(matches!(waited, Waited::TimedOut));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_bounded_honours_cancellation() {
        let mut child = command("sleep").arg("30").spawn().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let waited = wait_bounded(&mut child, Duration::from_secs(30), &token)
            .await
            .unwrap();

        assert!(matches!(waited, Waited::Aborted));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_merges_streams() {
        let (capture, writer) = capture(1024).unwrap();
        let mut child = {
            let mut cmd = command("sh");
            cmd.args(["-c", "echo out; echo err >&2"])
                .stdout(writer.try_clone().unwrap())
                .stderr(writer);
            cmd.spawn().unwrap()
        };
        let pid = child.id();
        let token = CancellationToken::new();

        let waited = wait_bounded(&mut child, Duration::from_secs(5), &token)
            .await
            .unwrap();
        let captured = capture.finish(pid).await.unwrap();

        assert!(matches!(waited, Waited::Exited(status) if status.success()));
        assert_eq!(captured.text, "out\nerr\n");
    }

    #[tokio::test]
    async fn test_finish_returns_when_writer_is_held() {
        let (capture, mut writer) = capture(1024).unwrap();
        io::Write::write_all(&mut writer, b"partial").unwrap();

        let started = std::time::Instant::now();
        let captured = capture.finish(None).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            captured,
            Captured {
                text: "partial".to_string(),
                truncated: true,
            }
        );
        drop(writer);
    }
}

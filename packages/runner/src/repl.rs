// ABOUTME: Persistent interpreter kernel driven over a length-prefixed stdin protocol
// ABOUTME: Completion is signalled by per-request sentinels on both stdout and stderr

use crate::error::{Result, RunnerError};
use crate::kernel::{Execution, ExecutionFailure, Kernel, NamespaceBindings};
use async_trait::async_trait;
use codebox_protocol::TailBuffer;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Interpreter bootstrap defining the namespace, helpers and request loop
pub const KERNEL_SOURCE: &str = include_str!("../assets/kernel.py");

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Longest run of guest output without a newline held in memory at once
const MAX_LINE_BYTES: usize = 64 * 1024;

struct ReplProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<ChildStderr>,
}

struct Reply {
    stdout: String,
    stderr: String,
    status: i32,
    payload: Value,
}

pub struct ReplKernel {
    python: String,
    working_dir: PathBuf,
    capture_chars: usize,
    process: Option<ReplProcess>,
    counter: u64,
}

impl ReplKernel {
    pub fn new(python: impl Into<String>, working_dir: impl Into<PathBuf>, capture_chars: usize) -> Self {
        Self {
            python: python.into(),
            working_dir: working_dir.into(),
            capture_chars,
            process: None,
            counter: 0,
        }
    }

    /// Create the kernel and start its interpreter immediately.
    pub async fn spawn(
        python: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        capture_chars: usize,
    ) -> Result<Self> {
        let mut kernel = Self::new(python, working_dir, capture_chars);
        kernel.ensure_running()?;
        Ok(kernel)
    }

    fn start_process(&self) -> Result<ReplProcess> {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-u")
            .arg("-c")
            .arg(KERNEL_SOURCE)
            .current_dir(&self.working_dir)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("MPLBACKEND", "Agg")
            .env("MPLCONFIGDIR", std::env::temp_dir().join("matplotlib"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::KernelExited("stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::KernelExited("stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::KernelExited("stderr unavailable".to_string()))?;

        debug!("Started interpreter {} (pid {:?})", self.python, child.id());

        Ok(ReplProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr: BufReader::new(stderr),
        })
    }

    fn ensure_running(&mut self) -> Result<()> {
        let alive = match self.process.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        };
        if !alive {
            if self.process.is_some() {
                warn!("Interpreter exited; starting a fresh one, namespace state is lost");
            }
            self.process = Some(self.start_process()?);
        }
        Ok(())
    }

    fn next_sentinel(&mut self) -> String {
        self.counter += 1;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("{}{}", nanos, self.counter)
    }

    async fn request(&mut self, op: &str, payload: &[u8]) -> Result<Reply> {
        self.ensure_running()?;
        let sentinel = self.next_sentinel();
        let capture = self.capture_chars;
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| RunnerError::KernelExited("interpreter not running".to_string()))?;

        let result = exchange(process, &sentinel, op, payload, capture).await;
        if result.is_err() {
            if let Some(mut process) = self.process.take() {
                let _ = process.child.kill().await;
            }
        }
        result
    }
}

async fn exchange(
    process: &mut ReplProcess,
    sentinel: &str,
    op: &str,
    payload: &[u8],
    capture_chars: usize,
) -> Result<Reply> {
    let header = format!("{} {} {}\n", sentinel, op, payload.len());
    process.stdin.write_all(header.as_bytes()).await?;
    process.stdin.write_all(payload).await?;
    process.stdin.flush().await?;

    let out_marker = format!("__CODEBOX_{}__", sentinel);
    let err_prefix = format!("__CODEBOX_{}_", sentinel);

    let mut stdout = TailBuffer::new(capture_chars);
    let mut stderr = TailBuffer::new(capture_chars);
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut out_done = false;
    let mut status: Option<(i32, Value)> = None;

    while !(out_done && status.is_some()) {
        // Once the status sentinel has started arriving, read its line in full
        let err_cap = if find_bytes(&err_buf, err_prefix.as_bytes()).is_some() {
            usize::MAX
        } else {
            MAX_LINE_BYTES
        };

        tokio::select! {
            read = read_capped_line(&mut process.stdout, &mut out_buf, MAX_LINE_BYTES), if !out_done => {
                if read? == 0 {
                    return Err(RunnerError::KernelExited("stdout closed".to_string()));
                }
                match find_bytes(&out_buf, out_marker.as_bytes()) {
                    Some(pos) => {
                        stdout.push(&String::from_utf8_lossy(&out_buf[..pos]));
                        out_buf.clear();
                        out_done = true;
                    }
                    None => stdout.push(&drain_scanned(&mut out_buf, out_marker.len())),
                }
            }
            read = read_capped_line(&mut process.stderr, &mut err_buf, err_cap), if status.is_none() => {
                if read? == 0 {
                    return Err(RunnerError::KernelExited("stderr closed".to_string()));
                }
                match find_bytes(&err_buf, err_prefix.as_bytes()) {
                    Some(pos) if err_buf.ends_with(b"\n") => {
                        stderr.push(&String::from_utf8_lossy(&err_buf[..pos]));
                        let rest = String::from_utf8_lossy(&err_buf[pos + err_prefix.len()..]).into_owned();
                        err_buf.clear();
                        status = Some(parse_status(&rest)?);
                    }
                    Some(_) => {}
                    None => stderr.push(&drain_scanned(&mut err_buf, err_prefix.len())),
                }
            }
        }
    }

    let (status, payload) = status.unwrap_or((2, Value::Null));
    Ok(Reply {
        stdout: stdout.finish(),
        stderr: stderr.finish(),
        status,
        payload,
    })
}

/// Append bytes from `reader` to `buf` up to and including the next newline,
/// stopping early once `buf` holds `max` bytes. Returns the bytes read, 0 at EOF.
///
/// Bytes are only consumed after they are copied, so dropping the future
/// between reads loses nothing.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read);
        }
        let room = max.saturating_sub(buf.len()).max(1);
        let window = &available[..available.len().min(room)];
        let (used, done) = match window.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (window.len(), buf.len() + window.len() >= max),
        };
        buf.extend_from_slice(&window[..used]);
        reader.consume(used);
        read += used;
        if done {
            return Ok(read);
        }
    }
}

/// Take the text of a scanned chunk out of `buf`. A chunk cut short by the
/// line cap keeps its last `keep` bytes, so a sentinel split across two reads
/// is still found.
fn drain_scanned(buf: &mut Vec<u8>, keep: usize) -> String {
    let mut split = if buf.ends_with(b"\n") {
        buf.len()
    } else {
        buf.len().saturating_sub(keep)
    };
    while split > 0 && split < buf.len() && buf[split] & 0xC0 == 0x80 {
        split -= 1;
    }
    let text: Vec<u8> = buf.drain(..split).collect();
    String::from_utf8_lossy(&text).into_owned()
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse `<status>__ <json>` following the stderr sentinel prefix.
fn parse_status(rest: &str) -> Result<(i32, Value)> {
    let (code, json) = rest
        .trim_end()
        .split_once("__ ")
        .ok_or_else(|| RunnerError::KernelProtocol(format!("bad sentinel: {}", rest.trim_end())))?;
    let code = code
        .parse::<i32>()
        .map_err(|_| RunnerError::KernelProtocol(format!("bad status: {}", code)))?;
    Ok((code, serde_json::from_str(json)?))
}

fn payload_message(payload: &Value, fallback: &str) -> String {
    payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

#[async_trait]
impl Kernel for ReplKernel {
    async fn bind(&mut self, bindings: &NamespaceBindings) -> Result<()> {
        let reply = self.request("bind", &serde_json::to_vec(bindings)?).await?;
        if reply.status != 0 {
            return Err(RunnerError::KernelProtocol(payload_message(
                &reply.payload,
                "bind failed",
            )));
        }
        Ok(())
    }

    async fn execute(&mut self, code: &str) -> Result<Execution> {
        let reply = self.request("exec", code.as_bytes()).await?;
        let failure = (reply.status != 0).then(|| ExecutionFailure {
            message: payload_message(&reply.payload, "Execution failed"),
            traceback: reply
                .payload
                .get("traceback")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
        Ok(Execution {
            stdout: reply.stdout,
            stderr: reply.stderr,
            failure,
        })
    }

    async fn autosave_figures(&mut self, output_dir: &Path) -> Result<Vec<String>> {
        let dir = output_dir.to_string_lossy().into_owned();
        let reply = self.request("autosave", dir.as_bytes()).await?;
        if reply.status != 0 {
            return Err(RunnerError::KernelProtocol(payload_message(
                &reply.payload,
                "autosave failed",
            )));
        }
        Ok(reply
            .payload
            .get("files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            drop(process.stdin);
            match tokio::time::timeout(SHUTDOWN_GRACE, process.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("Interpreter did not exit after stdin closed, killing it");
                    let _ = process.child.kill().await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_parse_status_with_payload() {
        let (code, payload) =
            parse_status("1__ {\"message\": \"ZeroDivisionError: division by zero\"}\n").unwrap();
        assert_eq!(code, 1);
        assert_eq!(payload["message"], "ZeroDivisionError: division by zero");
    }

    #[rstest]
    #[case("0__ null\n", 0)]
    #[case("2__ {}", 2)]
    #[case("-1__ {\"files\": []}\n", -1)]
    fn test_parse_status_codes(#[case] rest: &str, #[case] expected: i32) {
        assert_eq!(parse_status(rest).unwrap().0, expected);
    }

    #[rstest]
    #[case("nonsense")]
    #[case("x__ {}")]
    #[case("0__ {not json")]
    #[case("0 {}")]
    fn test_parse_status_rejects_garbage(#[case] rest: &str) {
        assert!(parse_status(rest).is_err());
    }

    #[tokio::test]
    async fn test_runaway_line_is_read_in_bounded_pieces() {
        let data = b"abcdefgh\nxy".to_vec();
        let mut reader = BufReader::with_capacity(3, &data[..]);
        let mut pieces = Vec::new();
        loop {
            let mut buf = Vec::new();
            if read_capped_line(&mut reader, &mut buf, 4).await.unwrap() == 0 {
                break;
            }
            assert!(buf.len() <= 4);
            pieces.push(String::from_utf8(buf).unwrap());
        }
        assert_eq!(pieces, vec!["abcd", "efgh", "\n", "xy"]);
    }

    #[test]
    fn test_drain_keeps_possible_sentinel_tail() {
        let mut buf = b"abc__MARK".to_vec();
        assert_eq!(drain_scanned(&mut buf, 6), "abc");
        assert_eq!(buf, b"__MARK".to_vec());

        let mut line = b"done\n".to_vec();
        assert_eq!(drain_scanned(&mut line, 6), "done\n");
        assert!(line.is_empty());
    }

    #[test]
    fn test_drain_does_not_split_characters() {
        let mut buf = "\u{e9}\u{e9}\u{e9}".as_bytes().to_vec();
        assert_eq!(drain_scanned(&mut buf, 3), "\u{e9}");
        assert_eq!(buf.len(), 4);
    }

    /// Requires python3 on PATH
    #[tokio::test]
    #[ignore]
    async fn test_namespace_persists_in_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let mut kernel = ReplKernel::spawn("python3", dir.path(), 4_000).await.unwrap();
        kernel
            .bind(&NamespaceBindings {
                input_dir: dir.path().to_path_buf(),
                output_dir: dir.path().to_path_buf(),
                input_files: vec![],
            })
            .await
            .unwrap();

        let first = kernel.execute("x = 41").await.unwrap();
        assert!(first.succeeded());
        let second = kernel.execute("print(x + 1)").await.unwrap();
        assert_eq!(second.stdout, "42\n");

        let failed = kernel.execute("1 / 0").await.unwrap();
        let failure = failed.failure.unwrap();
        assert!(failure.message.starts_with("ZeroDivisionError"));
        assert!(failure.traceback.unwrap().contains("<cell>"));

        kernel.shutdown().await.unwrap();
    }
}

//! Output streaming for the active command process.

use bytes::Bytes;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{broadcast, mpsc, watch};

use mirrorbox_protocol::SandboxEvent;

use crate::sandbox::SpawnedProcess;

/// A local dev server announcing itself, e.g. `http://localhost:5173/`.
static SERVER_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d{2,5})")
        .expect("server url pattern is valid")
});

/// Terminal escape sequences (colors, cursor movement).
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ansi escape pattern is valid")
});

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit code; `128 + signal` when the process was killed.
    pub exit_code: i32,
    /// Everything the process wrote, decoded as UTF-8.
    pub output: String,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One running command.
///
/// Reading drains the process output in production order, keeps a copy in
/// an accumulating buffer and watches it for a dev server URL. The stream
/// does not own the kill switch; the bridge keeps that so it can terminate
/// the process from outside.
#[derive(Debug)]
pub struct ProcessStream {
    pid: Option<u32>,
    command: String,
    output: mpsc::Receiver<Bytes>,
    exit: watch::Receiver<Option<i32>>,
    events: broadcast::Sender<SandboxEvent>,
    decoder: Utf8Decoder,
    buffer: String,
    scan_from: usize,
    server_port: Option<u16>,
}

impl ProcessStream {
    pub(crate) fn new(
        process: SpawnedProcess,
        command: impl Into<String>,
        events: broadcast::Sender<SandboxEvent>,
    ) -> Self {
        Self {
            pid: process.pid,
            command: command.into(),
            output: process.output,
            exit: process.exit,
            events,
            decoder: Utf8Decoder::default(),
            buffer: String::new(),
            scan_from: 0,
            server_port: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Output accumulated so far.
    pub fn output(&self) -> &str {
        &self.buffer
    }

    /// Port of the dev server this process announced, if any.
    pub fn server_port(&self) -> Option<u16> {
        self.server_port
    }

    /// Next decoded chunk, or `None` once the output stream has closed.
    ///
    /// Chunks that end inside a multi-byte character are held back until
    /// the rest arrives, so a chunk may come back empty.
    pub async fn next_chunk(&mut self) -> Option<String> {
        let text = match self.output.recv().await {
            Some(bytes) => self.decoder.decode(&bytes),
            None => {
                let rest = self.decoder.finish();
                if rest.is_empty() {
                    return None;
                }
                rest
            }
        };
        self.buffer.push_str(&text);
        self.scan_for_server();
        Some(text)
    }

    /// Read until the process has exited, forwarding each chunk.
    pub async fn run<F>(mut self, mut on_chunk: F) -> ProcessOutcome
    where
        F: FnMut(&str),
    {
        while let Some(chunk) = self.next_chunk().await {
            if !chunk.is_empty() {
                on_chunk(&chunk);
            }
        }
        self.finish().await
    }

    /// Wait for the exit code once output is drained.
    async fn finish(mut self) -> ProcessOutcome {
        let exit_code = match self.exit.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(-1),
            Err(_) => -1,
        };
        debug!(
            "`{}` (PID {:?}) finished with exit code {}",
            self.command, self.pid, exit_code
        );

        let _ = self.events.send(SandboxEvent::ProcessExited {
            pid: self.pid,
            exit_code,
        });
        if exit_code != 0 && self.server_port.is_some() {
            info!(
                "Dev server on port {:?} crashed with exit code {}",
                self.server_port, exit_code
            );
            let _ = self.events.send(SandboxEvent::ServerCrash {
                port: self.server_port,
                exit_code,
            });
        }

        ProcessOutcome {
            exit_code,
            output: self.buffer,
        }
    }

    /// Look for a server URL in lines completed since the last scan.
    fn scan_for_server(&mut self) {
        if self.server_port.is_some() {
            return;
        }
        let pending = &self.buffer[self.scan_from..];
        let Some(newline) = pending.rfind('\n') else {
            return;
        };
        let lines = ANSI_ESCAPE.replace_all(&pending[..newline], "");
        self.scan_from += newline + 1;

        let found = SERVER_URL
            .captures(&lines)
            .and_then(|caps| Some((caps[1].parse::<u16>().ok()?, caps[0].to_string())));
        if let Some((port, url)) = found {
            info!("`{}` is serving {}", self.command, url);
            self.server_port = Some(port);
            let _ = self.events.send(SandboxEvent::ServerReady { port, url });
        }
    }
}

/// Decodes a byte stream as UTF-8 across chunk boundaries.
///
/// Invalid sequences become U+FFFD; an incomplete sequence at the end of a
/// chunk is carried into the next one.
#[derive(Debug, Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(text) => {
                    out.push_str(text);
                    self.carry.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.carry[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + len);
                        }
                        None => {
                            self.carry.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        stream: ProcessStream,
        output: mpsc::Sender<Bytes>,
        exit: watch::Sender<Option<i32>>,
        events: broadcast::Receiver<SandboxEvent>,
    }

    fn fixture() -> Fixture {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (events_tx, events_rx) = broadcast::channel(16);
        let process = SpawnedProcess {
            pid: Some(42),
            output: out_rx,
            exit: exit_rx,
            kill: CancellationToken::new(),
        };
        Fixture {
            stream: ProcessStream::new(process, "npm run dev", events_tx),
            output: out_tx,
            exit: exit_tx,
            events: events_rx,
        }
    }

    #[test]
    fn test_decoder_carries_split_characters() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo".as_bytes();
        assert_eq!(decoder.decode(&bytes[..2]), "h");
        assert_eq!(decoder.decode(&bytes[2..]), "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(decoder.decode(b"\xe2\x82"), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[tokio::test]
    async fn test_run_forwards_chunks_in_order() {
        let Fixture {
            stream,
            output,
            exit,
            ..
        } = fixture();

        output.send(Bytes::from_static(b"one ")).await.unwrap();
        output.send(Bytes::from_static(b"two ")).await.unwrap();
        output.send(Bytes::from_static(b"three")).await.unwrap();
        drop(output);
        exit.send_replace(Some(1));

        let mut seen = Vec::new();
        let outcome = stream.run(|chunk| seen.push(chunk.to_string())).await;
        assert_eq!(seen, vec!["one ", "two ", "three"]);
        assert_eq!(outcome.output, "one two three");
        assert_eq!(outcome.exit_code, 1);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_server_ready_and_crash_events() {
        let Fixture {
            stream,
            output,
            exit,
            mut events,
        } = fixture();

        output
            .send(Bytes::from_static(b"  Local:   http://localhost:\x1b[1m51"))
            .await
            .unwrap();
        output
            .send(Bytes::from_static(b"73\x1b[22m/\n"))
            .await
            .unwrap();
        drop(output);
        exit.send_replace(Some(137));

        let outcome = stream.run(|_| {}).await;
        assert_eq!(outcome.exit_code, 137);

        assert_eq!(
            events.recv().await.unwrap(),
            SandboxEvent::ServerReady {
                port: 5173,
                url: "http://localhost:5173".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SandboxEvent::ProcessExited {
                pid: Some(42),
                exit_code: 137
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SandboxEvent::ServerCrash {
                port: Some(5173),
                exit_code: 137
            }
        );
    }

    #[tokio::test]
    async fn test_missing_exit_code_reports_minus_one() {
        let Fixture {
            stream,
            output,
            exit,
            ..
        } = fixture();
        drop(output);
        drop(exit);

        let outcome = stream.run(|_| {}).await;
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.output.is_empty());
    }
}

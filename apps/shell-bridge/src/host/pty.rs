use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::HostError;
use crate::surface::Viewport;

const READ_CHUNK: usize = 8192;

/// One shell process attached to a PTY. The child is killed when this is dropped.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtySession {
    /// Spawns `command` on a fresh PTY. Output arrives on the returned channel as UTF-8
    /// text; the channel closes when the PTY reaches EOF.
    pub fn spawn(
        command: &[String],
        viewport: Viewport,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), HostError> {
        let (program, args) = command.split_first().ok_or(HostError::EmptyCommand)?;
        let mut builder = CommandBuilder::new(program);
        builder.args(args);
        builder.env("TERM", "xterm-256color");
        if let Ok(cwd) = std::env::current_dir() {
            builder.cwd(cwd);
        }

        let pair = native_pty_system()
            .openpty(pty_size(viewport))
            .map_err(|err| HostError::Pty(err.to_string()))?;
        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| HostError::Pty(err.to_string()))?;
        // Keep only the master side open so EOF is seen once the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| HostError::Pty(err.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| HostError::Pty(err.to_string()))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || pump_output(reader, output_tx))
            .map_err(|err| HostError::Pty(err.to_string()))?;

        debug!(target = "host::pty", program = %program, %viewport, "shell spawned");
        Ok((
            Self {
                master: pair.master,
                writer,
                child,
            },
            output_rx,
        ))
    }

    pub fn write(&mut self, data: &str) -> Result<(), HostError> {
        self.writer
            .write_all(data.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|err| HostError::Pty(err.to_string()))
    }

    pub fn resize(&self, viewport: Viewport) -> Result<(), HostError> {
        self.master
            .resize(pty_size(viewport))
            .map_err(|err| HostError::Pty(err.to_string()))
    }

    pub fn kill(&mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            trace!(target = "host::pty", ?status, "shell already exited");
            return;
        }
        if let Err(err) = self.child.kill() {
            warn!(target = "host::pty", error = %err, "failed to kill shell");
            return;
        }
        let _ = self.child.wait();
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.kill();
    }
}

fn pty_size(viewport: Viewport) -> PtySize {
    PtySize {
        rows: viewport.rows(),
        cols: viewport.cols(),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>, output: mpsc::UnboundedSender<String>) {
    let mut carry = Utf8Carry::default();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = carry.decode(&buf[..n]);
                if !text.is_empty() && output.send(text).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                // EIO is how Linux reports a PTY whose child has exited.
                trace!(target = "host::pty", error = %err, "pty read ended");
                break;
            }
        }
    }
    let rest = carry.finish();
    if !rest.is_empty() {
        let _ = output.send(rest);
    }
}

/// Decodes a byte stream as UTF-8 across chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Returns the complete characters available so far; an unfinished trailing sequence
    /// is held back for the next chunk. Invalid bytes become U+FFFD.
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flushes whatever is left, lossily.
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn split_multibyte_sequences_are_joined() {
        let bytes = "héllo ✓".as_bytes();
        let mut carry = Utf8Carry::default();
        // 'é' is two bytes starting at index 1; split inside it.
        let first = carry.decode(&bytes[..2]);
        let second = carry.decode(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(format!("{first}{second}"), "héllo ✓");
        assert_eq!(carry.finish(), "");
    }

    #[test_timeout::timeout]
    fn invalid_bytes_are_replaced() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(b"ok\xffok"), "ok\u{FFFD}ok");
    }

    #[test_timeout::timeout]
    fn unfinished_tail_is_flushed_lossily() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(&[b'a', 0xe2, 0x9c]), "a");
        assert_eq!(carry.finish(), "\u{FFFD}");
    }

    #[test_timeout::timeout]
    fn empty_command_is_rejected() {
        assert!(matches!(
            PtySession::spawn(&[], Viewport::DEFAULT),
            Err(HostError::EmptyCommand)
        ));
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test(20)]
    async fn shell_output_reaches_the_channel() {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "printf 'pty-ready\\n'".to_string(),
        ];
        let (_session, mut output) =
            PtySession::spawn(&command, Viewport::DEFAULT).expect("spawn shell");
        let mut seen = String::new();
        while let Some(chunk) = output.recv().await {
            seen.push_str(&chunk);
            if seen.contains("pty-ready") {
                break;
            }
        }
        assert!(seen.contains("pty-ready"), "output was {seen:?}");
    }
}

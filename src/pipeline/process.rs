//! Child-process isolation for the producer.
//!
//! The child writes one JSON array per line on stdout. In the parent a bridge
//! thread parses those lines and feeds the in-memory sample channel, so the
//! delivery side reads from the same [`SampleReceiver`] in both isolation
//! modes. When the child exits its stdout closes, the bridge returns and the
//! dropped sender shows up as end of stream.
//!
//! [`SampleReceiver`]: super::channel::SampleReceiver

use std::{
    ffi::OsString,
    io::{self, BufRead, BufReader, Write},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::atomic::AtomicBool,
    thread,
};

use anyhow::{Context, Result};

use super::{
    camera::CaptureBackend,
    channel::{SampleSender, SampleSink},
    producer::{ProducerExit, ProducerSummary, run_producer},
    recognizer::EngineBackend,
};
use crate::{error::ChannelError, types::Sample};

/// Publishes samples as newline-delimited JSON.
#[derive(Debug)]
pub struct LineSink<W: Write> {
    writer: W,
}

impl<W: Write> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> SampleSink for LineSink<W> {
    fn publish(&mut self, sample: Sample) -> Result<(), ChannelError> {
        let written = serde_json::to_writer(&mut self.writer, &sample)
            .map_err(io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush());

        written.map_err(|err| {
            log::debug!("sample pipe write failed: {err}");
            ChannelError::Closed
        })
    }
}

/// Body of the `produce` subcommand: runs the producer loop against stdout.
pub fn run_child_producer(capture: &CaptureBackend, engine: &EngineBackend) -> ProducerSummary {
    let mut source = match capture.open() {
        Ok(source) => source,
        Err(err) => {
            log::error!("failed to open {} source: {err}", capture.label());
            return ProducerSummary {
                exit: ProducerExit::Fatal(err),
                frames: 0,
                published: 0,
            };
        }
    };
    let mut engine = match engine.build() {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("failed to build face engine: {err:?}");
            return ProducerSummary {
                exit: ProducerExit::EngineUnavailable(format!("{err:#}")),
                frames: 0,
                published: 0,
            };
        }
    };

    let mut sink = LineSink::new(io::stdout().lock());
    // The parent stops us by closing the pipe or killing the process.
    let never = AtomicBool::new(false);
    run_producer(&mut source, &mut engine, &mut sink, &never)
}

/// Copies samples from a line-oriented reader into the channel until the
/// reader ends or the channel closes. Returns the number of samples forwarded.
pub fn bridge_lines<R: BufRead>(reader: R, sender: SampleSender) -> u64 {
    let mut forwarded = 0u64;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::warn!("producer pipe read failed: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let sample: Sample = match serde_json::from_str(&line) {
            Ok(sample) => sample,
            Err(err) => {
                log::warn!("discarding malformed sample line: {err}");
                continue;
            }
        };

        if let Err(err) = sender.send(sample) {
            log::debug!("bridge stopping: {err}");
            break;
        }
        forwarded += 1;
    }

    forwarded
}

/// Producer running in a child process. Dropping the handle kills the child.
#[derive(Debug)]
pub struct ProducerProcess {
    child: Child,
    bridge: Option<thread::JoinHandle<u64>>,
}

impl ProducerProcess {
    pub fn spawn(program: &Path, args: &[OsString], sender: SampleSender) -> Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        // Own process group: a terminal Ctrl-C reaches only the server, which
        // then stops the child itself.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn producer {}", program.display()))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("producer stdout was not captured");
            }
        };

        let bridge = thread::Builder::new()
            .name("facestream-bridge".into())
            .spawn(move || bridge_lines(BufReader::new(stdout), sender));
        let bridge = match bridge {
            Ok(bridge) => bridge,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err).context("failed to spawn producer bridge thread");
            }
        };

        log::info!("producer process started (pid {})", child.id());
        Ok(Self {
            child,
            bridge: Some(bridge),
        })
    }

    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Kills the child if it is still running and reaps it. Returns the exit
    /// status and the number of samples the bridge forwarded.
    pub fn stop(mut self) -> (Option<ExitStatus>, u64) {
        self.shutdown()
    }

    fn shutdown(&mut self) -> (Option<ExitStatus>, u64) {
        if self.try_wait().is_none() {
            if let Err(err) = self.child.kill() {
                log::warn!("failed to kill producer process: {err}");
            }
        }
        let status = match self.child.wait() {
            Ok(status) => Some(status),
            Err(err) => {
                log::warn!("failed to reap producer process: {err}");
                None
            }
        };
        let forwarded = self
            .bridge
            .take()
            .and_then(|bridge| bridge.join().ok())
            .unwrap_or(0);
        (status, forwarded)
    }
}

impl Drop for ProducerProcess {
    fn drop(&mut self) {
        if self.bridge.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::pipeline::channel::sample_channel;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn line_sink_writes_one_array_per_line() {
        let mut sink = LineSink::new(Vec::new());
        sink.publish(Sample(vec![0.1, 0.9, 0.0])).unwrap();
        sink.publish(Sample(vec![0.5])).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Vec<f32> = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, vec![0.1, 0.9, 0.0]);
    }

    #[test]
    fn broken_pipe_is_a_closed_channel() {
        let mut sink = LineSink::new(BrokenPipe);
        assert_eq!(
            sink.publish(Sample(vec![1.0])),
            Err(ChannelError::Closed)
        );
    }

    #[test]
    fn bridge_skips_garbage_and_ends_the_stream() {
        let input = "[0.1,0.2]\n\nnot json\n[0.3,0.4]\n";
        let (sender, receiver) = sample_channel();

        let forwarded = bridge_lines(Cursor::new(input), sender);

        assert_eq!(forwarded, 2);
        assert_eq!(receiver.try_recv(), Ok(Some(Sample(vec![0.3, 0.4]))));
        assert_eq!(receiver.try_recv(), Err(ChannelError::EndOfStream));
    }

    #[test]
    fn bridge_stops_when_receiver_is_gone() {
        let input = "[0.1]\n[0.2]\n[0.3]\n";
        let (sender, receiver) = sample_channel();
        drop(receiver);

        assert_eq!(bridge_lines(Cursor::new(input), sender), 0);
    }

    #[cfg(unix)]
    #[test]
    fn child_output_reaches_the_channel() {
        let (sender, receiver) = sample_channel();
        let args = vec![
            OsString::from("-c"),
            OsString::from("echo '[0.1,0.9,0.0]'"),
        ];
        let producer = ProducerProcess::spawn(Path::new("sh"), &args, sender).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut last = None;
        loop {
            match receiver.try_recv() {
                Ok(Some(sample)) => last = Some(sample),
                Ok(None) => thread::sleep(std::time::Duration::from_millis(5)),
                Err(ChannelError::EndOfStream) => break,
                Err(err) => panic!("unexpected channel error: {err}"),
            }
            assert!(std::time::Instant::now() < deadline, "child never finished");
        }

        assert_eq!(last, Some(Sample(vec![0.1, 0.9, 0.0])));
        let (status, forwarded) = producer.stop();
        assert!(status.is_some_and(|status| status.success()));
        assert_eq!(forwarded, 1);
    }

    #[cfg(unix)]
    #[test]
    fn stop_kills_a_running_child() {
        let (sender, receiver) = sample_channel();
        let args = vec![OsString::from("-c"), OsString::from("exec sleep 30")];
        let producer = ProducerProcess::spawn(Path::new("sh"), &args, sender).unwrap();

        let (status, forwarded) = producer.stop();
        assert!(status.is_some_and(|status| !status.success()));
        assert_eq!(forwarded, 0);
        assert_eq!(receiver.try_recv(), Err(ChannelError::EndOfStream));
    }
}

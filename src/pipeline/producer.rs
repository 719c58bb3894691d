use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use anyhow::{Context, Result};

use super::{
    camera::{CaptureBackend, FrameSource},
    channel::{SampleSender, SampleSink},
    recognizer::{EngineBackend, FaceEngine},
};
use crate::error::CaptureError;

#[derive(Debug)]
pub enum ProducerExit {
    /// The stop flag was raised.
    Stopped,
    /// Nobody is reading samples any more.
    ChannelClosed,
    /// The capture device could not be opened or went away.
    Fatal(CaptureError),
    /// The engine could not be built.
    EngineUnavailable(String),
}

#[derive(Debug)]
pub struct ProducerSummary {
    pub exit: ProducerExit,
    pub frames: u64,
    pub published: u64,
}

/// Pulls frames, runs inference and publishes the first face's scores.
///
/// Frames without a detected face publish nothing. Returns once the stop flag
/// is set, the sink is closed, or the source fails fatally.
pub fn run_producer<S, E, K>(
    source: &mut S,
    engine: &mut E,
    sink: &mut K,
    stop: &AtomicBool,
) -> ProducerSummary
where
    S: FrameSource + ?Sized,
    E: FaceEngine + ?Sized,
    K: SampleSink + ?Sized,
{
    let mut frames = 0u64;
    let mut published = 0u64;

    let exit = loop {
        if stop.load(Ordering::Relaxed) {
            break ProducerExit::Stopped;
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(err) if err.is_fatal() => {
                log::error!("{err}");
                break ProducerExit::Fatal(err);
            }
            Err(err) => {
                log::warn!("{err}");
                continue;
            }
        };
        frames += 1;

        let detection = match engine.infer(&frame) {
            Ok(detection) => detection,
            Err(err) => {
                log::warn!("face inference failed: {err:?}");
                continue;
            }
        };

        let Some(sample) = detection.primary_sample() else {
            continue;
        };

        match sink.publish(sample) {
            Ok(()) => published += 1,
            Err(err) => {
                log::info!("{err}, stopping producer");
                break ProducerExit::ChannelClosed;
            }
        }
    };

    log::debug!("producer finished after {frames} frames, {published} samples published");
    ProducerSummary {
        exit,
        frames,
        published,
    }
}

/// Producer running on its own OS thread. Dropping the handle stops it.
#[derive(Debug)]
pub struct ProducerThread {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<ProducerSummary>>,
}

impl ProducerThread {
    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    pub fn stop(mut self) -> Option<ProducerSummary> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

impl Drop for ProducerThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Starts the producer loop on a dedicated thread.
///
/// The source and engine are built on that thread, since capture devices are
/// generally not `Send`. A failure to build either ends the thread, which
/// drops `sender` and so surfaces as end of stream on the reading side.
pub fn spawn_producer_thread(
    capture: CaptureBackend,
    engine: EngineBackend,
    sender: SampleSender,
) -> Result<ProducerThread> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let handle = thread::Builder::new()
        .name("facestream-producer".into())
        .spawn(move || {
            let mut sender = sender;
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

            run_producer(&mut source, &mut engine, &mut sender, &stop_flag)
        })
        .context("failed to spawn producer thread")?;

    Ok(ProducerThread {
        stop,
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Instant};

    use super::*;
    use crate::{
        error::ChannelError,
        pipeline::channel::sample_channel,
        types::{Blendshape, Detection, Frame, Sample},
    };

    struct ScriptedSource {
        frames: VecDeque<Result<Frame, CaptureError>>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<Result<Frame, CaptureError>>) -> Self {
            Self {
                frames: frames.into(),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            self.frames
                .pop_front()
                .unwrap_or_else(|| Err(CaptureError::Unavailable("script exhausted".into())))
        }
    }

    /// Reports the first byte of each frame as a one-element face, or no face
    /// when that byte is zero.
    struct ByteEngine;

    impl FaceEngine for ByteEngine {
        fn infer(&mut self, frame: &Frame) -> anyhow::Result<Detection> {
            let value = frame.rgba[0];
            if value == 0 {
                return Ok(Detection::empty());
            }
            if value == 255 {
                anyhow::bail!("model exploded");
            }
            Ok(Detection {
                faces: vec![vec![Blendshape {
                    name: "jawOpen".into(),
                    score: value as f32 / 100.0,
                }]],
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        samples: Vec<Sample>,
        close_after: Option<usize>,
    }

    impl SampleSink for RecordingSink {
        fn publish(&mut self, sample: Sample) -> Result<(), ChannelError> {
            if Some(self.samples.len()) == self.close_after {
                return Err(ChannelError::Closed);
            }
            self.samples.push(sample);
            Ok(())
        }
    }

    fn frame(value: u8) -> Result<Frame, CaptureError> {
        Ok(Frame {
            rgba: vec![value, 0, 0, 255],
            width: 1,
            height: 1,
        })
    }

    #[test]
    fn skips_empty_detections_and_transient_failures() {
        let mut source = ScriptedSource::new(vec![
            frame(10),
            frame(0),
            Err(CaptureError::Frame("glitch".into())),
            frame(255),
            frame(20),
        ]);
        let mut sink = RecordingSink::default();
        let stop = AtomicBool::new(false);

        let summary = run_producer(&mut source, &mut ByteEngine, &mut sink, &stop);

        assert!(matches!(summary.exit, ProducerExit::Fatal(_)));
        assert_eq!(summary.frames, 4);
        assert_eq!(summary.published, 2);
        assert_eq!(sink.samples, vec![Sample(vec![0.1]), Sample(vec![0.2])]);
    }

    #[test]
    fn closed_sink_ends_the_loop_cleanly() {
        let mut source = ScriptedSource::new(vec![frame(10), frame(20), frame(30)]);
        let mut sink = RecordingSink {
            close_after: Some(1),
            ..Default::default()
        };
        let stop = AtomicBool::new(false);

        let summary = run_producer(&mut source, &mut ByteEngine, &mut sink, &stop);

        assert!(matches!(summary.exit, ProducerExit::ChannelClosed));
        assert_eq!(summary.published, 1);
    }

    #[test]
    fn stop_flag_wins_before_reading() {
        let mut source = ScriptedSource::new(vec![frame(10)]);
        let mut sink = RecordingSink::default();
        let stop = AtomicBool::new(true);

        let summary = run_producer(&mut source, &mut ByteEngine, &mut sink, &stop);

        assert!(matches!(summary.exit, ProducerExit::Stopped));
        assert_eq!(summary.frames, 0);
    }

    #[test]
    fn producer_thread_exits_when_receiver_is_dropped() {
        let (sender, receiver) = sample_channel();
        let producer = spawn_producer_thread(
            CaptureBackend::Synthetic {
                width: 2,
                height: 2,
                fps: 500,
            },
            EngineBackend::Placeholder,
            sender,
        )
        .unwrap();

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let first = loop {
            if let Some(sample) = receiver.try_recv().unwrap() {
                break sample;
            }
            assert!(Instant::now() < deadline, "no sample produced");
            thread::yield_now();
        };
        assert_eq!(first.0.len(), crate::types::BLENDSHAPE_NAMES.len());

        drop(receiver);
        while !producer.is_finished() {
            assert!(Instant::now() < deadline, "producer did not exit");
            thread::sleep(std::time::Duration::from_millis(5));
        }
        let summary = producer.stop().unwrap();
        assert!(matches!(summary.exit, ProducerExit::ChannelClosed));
    }
}

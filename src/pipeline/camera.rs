use std::{
    thread,
    time::{Duration, Instant},
};

use crate::{error::CaptureError, types::Frame};

/// Blocking supplier of frames for the producer loop.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).next_frame()
    }
}

/// Which capture source the producer opens.
#[derive(Clone, Debug)]
pub enum CaptureBackend {
    Synthetic { width: u32, height: u32, fps: u32 },
    #[cfg(feature = "camera-nokhwa")]
    Camera { index: u32 },
}

impl Default for CaptureBackend {
    fn default() -> Self {
        CaptureBackend::Synthetic {
            width: 64,
            height: 48,
            fps: 30,
        }
    }
}

impl CaptureBackend {
    pub fn label(&self) -> &'static str {
        match self {
            CaptureBackend::Synthetic { .. } => "synthetic",
            #[cfg(feature = "camera-nokhwa")]
            CaptureBackend::Camera { .. } => "camera",
        }
    }

    /// Opens the source. Must be called on the thread that will read from it.
    pub fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        match self {
            CaptureBackend::Synthetic { width, height, fps } => {
                Ok(Box::new(SyntheticSource::new(*width, *height, *fps)))
            }
            #[cfg(feature = "camera-nokhwa")]
            CaptureBackend::Camera { index } => Ok(Box::new(CameraSource::open(*index)?)),
        }
    }
}

/// Test pattern whose brightness sweeps slowly, paced like a real camera.
#[derive(Debug)]
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    next_due: Option<Instant>,
    frame_index: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            frame_interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            next_due: None,
            frame_index: 0,
        }
    }

    fn brightness(&self) -> u8 {
        // One full sweep every 256 frames, never fully black.
        let phase = (self.frame_index % 256) as f32 / 256.0;
        let wave = (phase * std::f32::consts::TAU).sin() * 0.5 + 0.5;
        (16.0 + wave * 223.0) as u8
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.frame_interval);

        let value = self.brightness();
        self.frame_index = self.frame_index.wrapping_add(1);

        let mut rgba = vec![value; self.width as usize * self.height as usize * 4];
        for px in rgba.chunks_exact_mut(4) {
            px[3] = 255;
        }

        Ok(Frame {
            rgba,
            width: self.width,
            height: self.height,
        })
    }
}

#[cfg(feature = "camera-nokhwa")]
pub use self::nokhwa_source::CameraSource;

#[cfg(feature = "camera-nokhwa")]
mod nokhwa_source {
    use anyhow::{Result, anyhow};
    use nokhwa::{
        Camera,
        pixel_format::RgbFormat,
        utils::{CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    };

    use super::FrameSource;
    use crate::{error::CaptureError, types::Frame};

    const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
        FrameFormat::MJPEG,
        FrameFormat::YUYV,
        FrameFormat::NV12,
        FrameFormat::RAWRGB,
    ];

    // Consecutive read failures after which the device is treated as gone.
    const MAX_CONSECUTIVE_FAILURES: u32 = 30;

    fn requested_formats() -> [RequestedFormat<'static>; 3] {
        [
            RequestedFormat::with_formats(
                RequestedFormatType::AbsoluteHighestFrameRate,
                PREFERRED_PIXEL_FORMATS,
            ),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
        ]
    }

    pub struct CameraSource {
        camera: Camera,
        consecutive_failures: u32,
    }

    impl CameraSource {
        /// Opens the device with the first pixel format it accepts.
        ///
        /// `nokhwa::Camera` is not `Send`, so this has to run on the thread
        /// (or in the process) that will read frames.
        pub fn open(index: u32) -> Result<Self, CaptureError> {
            let mut last_err = None;

            for requested in requested_formats() {
                match Camera::new(CameraIndex::Index(index), requested) {
                    Ok(mut camera) => match camera.open_stream() {
                        Ok(()) => {
                            log::info!(
                                "camera {index} streaming {:?} at {} fps",
                                camera.resolution(),
                                camera.frame_rate()
                            );
                            return Ok(Self {
                                camera,
                                consecutive_failures: 0,
                            });
                        }
                        Err(err) => last_err = Some(anyhow!(err)),
                    },
                    Err(err) => last_err = Some(anyhow!(err)),
                }
            }

            let reason = last_err
                .unwrap_or_else(|| anyhow!("no supported format"))
                .to_string();
            Err(CaptureError::Unavailable(format!(
                "could not open video device {index}: {reason}"
            )))
        }

        fn read_frame(&mut self) -> Result<Frame> {
            let buffer = self.camera.frame()?;
            let decoded = buffer.decode_image::<RgbFormat>()?;
            let (width, height) = (decoded.width(), decoded.height());
            let rgb = decoded.into_raw();

            let mut rgba = vec![255u8; width as usize * height as usize * 4];
            for (dst, src) in rgba.chunks_exact_mut(4).zip(rgb.chunks_exact(3)) {
                dst[..3].copy_from_slice(src);
            }

            Ok(Frame {
                rgba,
                width,
                height,
            })
        }
    }

    impl FrameSource for CameraSource {
        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            match self.read_frame() {
                Ok(frame) => {
                    self.consecutive_failures = 0;
                    Ok(frame)
                }
                Err(err) => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        Err(CaptureError::Unavailable(format!(
                            "{} consecutive frame failures, last: {err:?}",
                            self.consecutive_failures
                        )))
                    } else {
                        Err(CaptureError::Frame(format!("{err:?}")))
                    }
                }
            }
        }
    }

    impl Drop for CameraSource {
        fn drop(&mut self) {
            if let Err(err) = self.camera.stop_stream() {
                log::warn!("failed to stop camera stream: {err:?}");
            }
        }
    }
}

//! Microphone level extraction
//!
//! Owns the microphone capture lifecycle: reads fixed-size PCM16 frames,
//! computes RMS amplitude, maps it to a normalized [0,1] level, and
//! publishes it on a watch channel so a late subscriber immediately sees
//! the last value. The device is accessed through the [`Recorder`] /
//! [`RecorderProvider`] seam so tests can substitute a fake recorder.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::{Error, Result};

/// Sample rate for level extraction (16kHz mono, speech band)
pub const SAMPLE_RATE: u32 = 16_000;

/// Safe floor for the capture buffer, in samples
pub const MIN_BUFFER_SAMPLES: usize = 4096;

/// RMS divisor tuned empirically for voice on PCM16 input
const RMS_SENSITIVITY: f32 = 1200.0;

/// Gain applied after normalization, before the final clamp
const LEVEL_GAIN: f32 = 1.8;

/// Pacing interval between frame reads (~60Hz updates)
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// An open recording handle
///
/// Implementations release the underlying device on drop, so an aborted
/// capture loop can never leak a handle.
pub trait Recorder: Send {
    /// Read up to `buf.len()` samples into `buf`
    ///
    /// Returns the number of samples written, `0` when nothing is
    /// available yet, or a negative value on a device read error.
    fn read(&mut self, buf: &mut [i16]) -> isize;

    /// Whether the device is still in the recording state
    fn is_active(&self) -> bool;

    /// Stop recording and release the device handle
    ///
    /// Idempotent; release errors are swallowed by implementations.
    fn stop(&mut self);
}

/// Factory for recording handles
///
/// The seam for substituting a fake recorder in tests: one operation to
/// query the minimum buffer size for a rate, one to open a handle.
pub trait RecorderProvider: Send + Sync {
    /// Minimum usable buffer size for the given sample rate
    ///
    /// `None` means the query failed; the caller falls back to
    /// [`MIN_BUFFER_SAMPLES`].
    fn min_buffer_size(&self, sample_rate: u32) -> Option<usize>;

    /// Open a recording handle at the given rate and buffer size
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be acquired. Implementations
    /// must release any partially-acquired handle before returning.
    fn open(&self, sample_rate: u32, buffer_size: usize) -> Result<Box<dyn Recorder>>;
}

// cpal-backed provider

/// Recording handles backed by the default cpal host input device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalRecorderProvider;

impl RecorderProvider for CpalRecorderProvider {
    fn min_buffer_size(&self, sample_rate: u32) -> Option<usize> {
        let host = cpal::default_host();
        let device = host.default_input_device()?;
        let supported = device
            .supported_input_configs()
            .ok()?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })?;
        match supported.buffer_size() {
            cpal::SupportedBufferSize::Range { min, .. } => Some(*min as usize),
            cpal::SupportedBufferSize::Unknown => None,
        }
    }

    fn open(&self, sample_rate: u32, buffer_size: usize) -> Result<Box<dyn Recorder>> {
        CpalRecorder::open(sample_rate, buffer_size).map(|r| Box::new(r) as Box<dyn Recorder>)
    }
}

/// Shared flags between the recorder handle and its stream thread
struct CpalShared {
    buffer: Mutex<VecDeque<i16>>,
    active: AtomicBool,
    failed: AtomicBool,
    stop: AtomicBool,
}

/// Recorder reading from a cpal input stream
///
/// `cpal::Stream` is not `Send`, so the stream lives on a dedicated
/// thread that feeds a shared ring buffer; the recorder handle itself is
/// `Send` and can move into the capture task.
struct CpalRecorder {
    shared: Arc<CpalShared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalRecorder {
    fn open(sample_rate: u32, buffer_size: usize) -> Result<Self> {
        let shared = Arc::new(CpalShared {
            buffer: Mutex::new(VecDeque::with_capacity(buffer_size * 4)),
            active: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let thread_shared = Arc::clone(&shared);
        let ring_capacity = buffer_size * 4;

        let thread = std::thread::Builder::new()
            .name("aria-voice-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, ring_capacity, &thread_shared) {
                    Ok(stream) => {
                        thread_shared.active.store(true, Ordering::SeqCst);
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        // Any partially-acquired handle is dropped here,
                        // before the error is reported.
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while !thread_shared.stop.load(Ordering::SeqCst)
                    && !thread_shared.failed.load(Ordering::SeqCst)
                {
                    std::thread::sleep(Duration::from_millis(10));
                }
                drop(stream);
                thread_shared.active.store(false, Ordering::SeqCst);
                tracing::debug!("capture stream released");
            })
            .map_err(|e| Error::Audio(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!(sample_rate, buffer_size, "microphone acquired");
                Ok(Self {
                    shared,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio(
                    "capture thread exited before initialization".to_string(),
                ))
            }
        }
    }
}

/// Build and start the cpal input stream, feeding the shared ring buffer
fn build_input_stream(
    sample_rate: u32,
    ring_capacity: usize,
    shared: &Arc<CpalShared>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .ok_or_else(|| Error::Audio("no suitable input config found".to_string()))?;

    let config = supported.with_sample_rate(SampleRate(sample_rate)).config();

    let data_shared = Arc::clone(shared);
    let error_shared = Arc::clone(shared);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = data_shared.buffer.lock() {
                    for &sample in data {
                        if buf.len() >= ring_capacity {
                            buf.pop_front();
                        }
                        #[allow(clippy::cast_possible_truncation)]
                        buf.push_back((sample * 32767.0).clamp(-32768.0, 32767.0) as i16);
                    }
                }
            },
            move |err| {
                tracing::error!(error = %err, "input stream error");
                error_shared.failed.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

impl Recorder for CpalRecorder {
    fn read(&mut self, buf: &mut [i16]) -> isize {
        if self.shared.failed.load(Ordering::SeqCst) {
            return -1;
        }
        let Ok(mut ring) = self.shared.buffer.lock() else {
            return -1;
        };
        let count = ring.len().min(buf.len());
        for slot in buf.iter_mut().take(count) {
            // count <= ring.len(), pop cannot fail
            *slot = ring.pop_front().unwrap_or(0);
        }
        #[allow(clippy::cast_possible_wrap)]
        {
            count as isize
        }
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst) && !self.shared.failed.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

// Level source

/// Lock the shared recorder slot, recovering the guard if the capture
/// task panicked while holding it
fn lock_recorder(
    slot: &Mutex<Option<Box<dyn Recorder>>>,
) -> std::sync::MutexGuard<'_, Option<Box<dyn Recorder>>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Publishes a normalized microphone amplitude level at ~60Hz
///
/// Exclusively owns the device handle; `start` is idempotent and fails
/// closed (a failed acquisition logs and leaves the source stopped),
/// `stop` is safe from any state and has released the device by the
/// time it returns, so an immediate restart can reacquire it.
pub struct AudioLevelSource {
    provider: Arc<dyn RecorderProvider>,
    levels_tx: watch::Sender<f32>,
    recorder: Arc<Mutex<Option<Box<dyn Recorder>>>>,
    task: Option<JoinHandle<()>>,
}

impl Default for AudioLevelSource {
    fn default() -> Self {
        Self::new(Arc::new(CpalRecorderProvider))
    }
}

impl AudioLevelSource {
    /// Create a level source over the given recorder provider
    #[must_use]
    pub fn new(provider: Arc<dyn RecorderProvider>) -> Self {
        let (levels_tx, _) = watch::channel(0.0);
        Self {
            provider,
            levels_tx,
            recorder: Arc::new(Mutex::new(None)),
            task: None,
        }
    }

    /// Subscribe to the level stream
    ///
    /// Watch semantics: a late subscriber immediately observes the most
    /// recently published level.
    #[must_use]
    pub fn levels(&self) -> watch::Receiver<f32> {
        self.levels_tx.subscribe()
    }

    /// Subscribe to the level stream as a `futures::Stream`
    ///
    /// Convenience wrapper over [`Self::levels`] for consumers that
    /// compose streams rather than poll a watch receiver.
    #[must_use]
    pub fn level_stream(&self) -> WatchStream<f32> {
        WatchStream::new(self.levels_tx.subscribe())
    }

    /// Whether the capture loop is currently running
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start capturing; no-op if already started
    ///
    /// Never returns an error to the caller: acquisition failures are
    /// logged and the source stays stopped.
    pub fn start(&mut self) {
        if self.is_started() {
            tracing::debug!("level source already started");
            return;
        }

        let buffer_size = self
            .provider
            .min_buffer_size(SAMPLE_RATE)
            .unwrap_or(MIN_BUFFER_SAMPLES)
            .max(MIN_BUFFER_SAMPLES);

        let recorder = match self.provider.open(SAMPLE_RATE, buffer_size) {
            Ok(recorder) => recorder,
            Err(e) => {
                tracing::error!(error = %e, "microphone acquisition failed, level source stopped");
                return;
            }
        };
        *lock_recorder(&self.recorder) = Some(recorder);

        // The recorder stays in the shared slot so stop() can release it
        // synchronously; the loop never holds the guard across an await.
        let recorder_slot = Arc::clone(&self.recorder);
        let levels_tx = self.levels_tx.clone();
        self.task = Some(tokio::spawn(async move {
            let mut frame = vec![0i16; buffer_size];
            loop {
                let level = {
                    let mut guard = lock_recorder(&recorder_slot);
                    let Some(recorder) = guard.as_mut() else {
                        break;
                    };
                    if !recorder.is_active() {
                        tracing::debug!("device left recording state, capture loop exiting");
                        if let Some(mut recorder) = guard.take() {
                            recorder.stop();
                        }
                        break;
                    }

                    let read = recorder.read(&mut frame);
                    if read < 0 {
                        tracing::warn!(code = read, "device read error");
                        None
                    } else if read > 0 {
                        #[allow(clippy::cast_sign_loss)]
                        let filled = &frame[..read as usize];
                        Some(frame_level(filled))
                    } else {
                        // Nothing available yet, skip publish
                        None
                    }
                };

                if let Some(level) = level {
                    let _ = levels_tx.send(level);
                }
                tokio::time::sleep(FRAME_INTERVAL).await;
            }
        }));
        tracing::debug!(buffer_size, "level source started");
    }

    /// Stop capturing; the device is released before this returns, so an
    /// immediate `start()` can reacquire it. Safe to call in any state.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(mut recorder) = lock_recorder(&self.recorder).take() {
            recorder.stop();
            tracing::debug!("level source stopped, device released");
        }
    }
}

impl Drop for AudioLevelSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map one PCM16 frame to a normalized [0,1] level
///
/// RMS over the frame, divided by the voice sensitivity constant,
/// amplified, and clamped.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn frame_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| f64::from(s) * f64::from(s))
        .sum();
    #[allow(clippy::cast_possible_truncation)]
    let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
    let normalized = (rms / RMS_SENSITIVITY).clamp(0.0, 1.0);
    (normalized * LEVEL_GAIN).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_level_silence() {
        let silence = vec![0i16; 256];
        assert!(frame_level(&silence) < f32::EPSILON);
    }

    #[test]
    fn test_frame_level_full_scale_clamps() {
        let loud = vec![i16::MAX; 256];
        assert!((frame_level(&loud) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_frame_level_quiet_voice_in_range() {
        // RMS of a constant 600 signal is 600; 600/1200 * 1.8 = 0.9
        let voice = vec![600i16; 256];
        let level = frame_level(&voice);
        assert!((level - 0.9).abs() < 1e-3, "got {level}");
    }

    #[test]
    fn test_frame_level_empty_frame() {
        assert!(frame_level(&[]).abs() < f32::EPSILON);
    }
}

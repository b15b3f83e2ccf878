//! Audio I/O adapter (C1). Blocking pull/push of fixed-size linear PCM
//! frames over `cpal` device streams. The physical device and its driver are
//! the external collaborator named by spec.md §1; this module is the named
//! interface spec.md §4.1 describes around it.

use crate::error::VoipError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use ringbuf::HeapRb;
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

const OPEN_RETRIES: usize = 3;
const CAPTURE_QUEUE_FRAMES: usize = 8;
const PLAYBACK_RING_FRAMES: usize = 10;

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    pub supported_rates: Vec<u32>,
}

pub struct AudioIo {
    host: cpal::Host,
}

impl AudioIo {
    pub fn new() -> Self {
        AudioIo {
            host: cpal::default_host(),
        }
    }

    pub fn enumerate(&self) -> Vec<DeviceInfo> {
        let mut out = Vec::new();
        let Ok(devices) = self.host.devices() else {
            return out;
        };
        for (idx, device) in devices.enumerate() {
            let name = device.name().unwrap_or_else(|_| "unknown".into());
            let max_in = device
                .supported_input_configs()
                .map(|c| c.map(|r| r.channels()).max().unwrap_or(0))
                .unwrap_or(0);
            let max_out = device
                .supported_output_configs()
                .map(|c| c.map(|r| r.channels()).max().unwrap_or(0))
                .unwrap_or(0);
            let mut rates: Vec<u32> = device
                .supported_input_configs()
                .map(|c| c.map(|r| r.min_sample_rate().0).collect())
                .unwrap_or_default();
            rates.sort_unstable();
            rates.dedup();
            out.push(DeviceInfo {
                id: idx.to_string(),
                name,
                max_input_channels: max_in,
                max_output_channels: max_out,
                supported_rates: rates,
            });
        }
        out
    }

    fn find_device(&self, device_id: Option<&str>, input: bool) -> Option<cpal::Device> {
        match device_id {
            None => {
                if input {
                    self.host.default_input_device()
                } else {
                    self.host.default_output_device()
                }
            }
            Some(id) => {
                let idx: usize = id.parse().ok()?;
                let devices: Vec<_> = self.host.devices().ok()?.collect();
                devices.into_iter().nth(idx)
            }
        }
    }

    /// Retries up to 3 times before failing, matching the original
    /// implementation's capture/playback `start_stream` retry count.
    pub fn open_capture(
        &self,
        device_id: Option<&str>,
        rate: u32,
        channels: u16,
        frame_samples: usize,
    ) -> Result<CaptureHandle, VoipError> {
        let device = self
            .find_device(device_id, true)
            .ok_or_else(|| VoipError::DeviceUnavailable("no input device".into()))?;

        let mut last_err = None;
        for attempt in 1..=OPEN_RETRIES {
            match build_capture_stream(&device, rate, channels, frame_samples) {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!(attempt, error = %e, "audio input open failed, retrying");
                    last_err = Some(e);
                }
            }
        }
        Err(VoipError::DeviceUnavailable(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    pub fn open_playback(
        &self,
        device_id: Option<&str>,
        rate: u32,
        channels: u16,
        frame_samples: usize,
    ) -> Result<PlaybackHandle, VoipError> {
        let device = self
            .find_device(device_id, false)
            .ok_or_else(|| VoipError::DeviceUnavailable("no output device".into()))?;

        let mut last_err = None;
        for attempt in 1..=OPEN_RETRIES {
            match build_playback_stream(&device, rate, channels, frame_samples) {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!(attempt, error = %e, "audio output open failed, retrying");
                    last_err = Some(e);
                }
            }
        }
        Err(VoipError::DeviceUnavailable(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

impl Default for AudioIo {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CaptureHandle {
    _stream: cpal::Stream,
    frame_rx: Receiver<Vec<u8>>,
}

impl CaptureHandle {
    /// Blocks until one frame is available. Returns `None` if the capture
    /// stream has been torn down.
    pub fn read_frame(&self) -> Option<Vec<u8>> {
        self.frame_rx.recv().ok()
    }
}

pub struct PlaybackHandle {
    _stream: cpal::Stream,
    frame_tx: Sender<Vec<u8>>,
}

impl PlaybackHandle {
    /// Blocks (via the bounded channel's backpressure) until the device has
    /// room to accept this frame.
    pub fn write_frame(&self, bytes: &[u8]) {
        let _ = self.frame_tx.send(bytes.to_vec());
    }
}

/// Converts one interleaved sample of an arbitrary cpal format to a 16-bit
/// linear sample, mirroring the original project's int16 PCM convention.
fn to_i16_u16(s: u16) -> i16 {
    ((s as i32) - (u16::MAX as i32 / 2)) as i16
}

fn to_i16_f32(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn build_capture_stream(
    device: &cpal::Device,
    rate: u32,
    channels: u16,
    frame_samples: usize,
) -> anyhow::Result<CaptureHandle> {
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let sample_format = device.default_input_config()?.sample_format();
    let (tx, rx) = bounded::<Vec<u8>>(CAPTURE_QUEUE_FRAMES);
    let frame_bytes = frame_samples * channels as usize * 2;
    let err_fn = |e| error!(error = %e, "audio input stream error");

    let stream = match sample_format {
        cpal::SampleFormat::I16 => {
            let mut acc = Vec::<u8>::with_capacity(frame_bytes);
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    for &s in data {
                        push_sample(&mut acc, s, frame_bytes, &tx);
                    }
                },
                err_fn,
                None,
            )?
        }
        cpal::SampleFormat::U16 => {
            let mut acc = Vec::<u8>::with_capacity(frame_bytes);
            device.build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    for &s in data {
                        push_sample(&mut acc, to_i16_u16(s), frame_bytes, &tx);
                    }
                },
                err_fn,
                None,
            )?
        }
        cpal::SampleFormat::F32 => {
            let mut acc = Vec::<u8>::with_capacity(frame_bytes);
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &s in data {
                        push_sample(&mut acc, to_i16_f32(s), frame_bytes, &tx);
                    }
                },
                err_fn,
                None,
            )?
        }
        other => anyhow::bail!("unsupported sample format {other:?}"),
    };
    stream.play()?;
    Ok(CaptureHandle {
        _stream: stream,
        frame_rx: rx,
    })
}

/// Accumulates one frame's worth of samples, then hands it to the reader
/// channel. On overflow (reader lagging) drops the oldest queued frame
/// rather than blocking the audio callback.
fn push_sample(acc: &mut Vec<u8>, sample: i16, frame_bytes: usize, tx: &Sender<Vec<u8>>) {
    acc.extend_from_slice(&sample.to_le_bytes());
    if acc.len() == frame_bytes {
        if tx.try_send(acc.clone()).is_err() {
            let _ = tx.try_recv();
            let _ = tx.try_send(acc.clone());
        }
        acc.clear();
    }
}

fn build_playback_stream(
    device: &cpal::Device,
    rate: u32,
    channels: u16,
    frame_samples: usize,
) -> anyhow::Result<PlaybackHandle> {
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let sample_format = device.default_output_config()?.sample_format();

    let ring = HeapRb::<i16>::new(frame_samples * channels as usize * PLAYBACK_RING_FRAMES);
    let (mut producer, mut consumer) = ring.split();

    let (frame_tx, frame_rx) = bounded::<Vec<u8>>(CAPTURE_QUEUE_FRAMES);
    thread::spawn(move || {
        while let Ok(bytes) = frame_rx.recv() {
            for chunk in bytes.chunks_exact(2) {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                while producer.push(sample).is_err() {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    });

    let err_fn = |e| error!(error = %e, "audio output stream error");
    let stream = match sample_format {
        cpal::SampleFormat::I16 => device.build_output_stream(
            &config,
            move |out: &mut [i16], _: &cpal::OutputCallbackInfo| {
                for sample in out.iter_mut() {
                    *sample = consumer.pop().unwrap_or(0);
                }
            },
            err_fn,
            None,
        )?,
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config,
            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for sample in out.iter_mut() {
                    let s = consumer.pop().unwrap_or(0);
                    *sample = s as f32 / i16::MAX as f32;
                }
            },
            err_fn,
            None,
        )?,
        other => anyhow::bail!("unsupported sample format {other:?}"),
    };
    stream.play()?;
    Ok(PlaybackHandle {
        _stream: stream,
        frame_tx,
    })
}

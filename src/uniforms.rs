//! Per-frame shader inputs.
//!
//! [`GpuInput`] is the uniform block every pass receives, laid out to match this
//! GLSL declaration under std140 rules:
//!
//! ```glsl
//! layout(set = 0, binding = 0, std140) uniform ShaderToyInput {
//!     vec3  iResolution;
//!     float iTime;
//!     float iTimeDelta;
//!     float iFrameRate;
//!     int   iFrame;
//!     vec4  iChannelTime;
//!     vec4  iChannelResolution[4];
//!     vec4  iMouse;
//!     vec4  iDate;
//!     float iSampleRate;
//! };
//! ```
//!
//! [`FrameClock`] produces the time related fields.

use std::time::{Duration, Instant};

use chrono::{Datelike, Local, Timelike};

/// Audio sample rate reported to shaders.
pub const SAMPLE_RATE: f32 = 44100.0;

const FPS_WINDOW: Duration = Duration::from_millis(500);

/// The uniform block bound at set 0, binding 0 of every pass.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuInput {
    /// Output size in pixels, z is the pixel aspect ratio (always 1).
    pub resolution: [f32; 3],
    /// Seconds since the last reset, excluding paused time.
    pub time: f32,
    pub time_delta: f32,
    pub frame_rate: f32,
    pub frame: i32,
    pub _pad0: f32,
    pub channel_time: [f32; 4],
    /// xyz of every entry is the size of the image bound to that channel.
    pub channel_resolution: [[f32; 4]; 4],
    /// xy: position while the left button is down, zw: click origin or -1.
    pub mouse: [f32; 4],
    /// Year, month (0 based), day, seconds since midnight.
    pub date: [f32; 4],
    pub sample_rate: f32,
    pub _pad1: [f32; 3],
}

impl Default for GpuInput {
    fn default() -> Self {
        Self {
            resolution: [0.0, 0.0, 1.0],
            time: 0.0,
            time_delta: f32::MIN_POSITIVE,
            frame_rate: 0.0,
            frame: 0,
            _pad0: 0.0,
            channel_time: [0.0; 4],
            channel_resolution: [[0.0; 4]; 4],
            mouse: [0.0, 0.0, -1.0, -1.0],
            date: [0.0; 4],
            sample_rate: SAMPLE_RATE,
            _pad1: [0.0; 3],
        }
    }
}

/// The current local date in ShaderToy's `iDate` convention.
pub fn local_date() -> [f32; 4] {
    let now = Local::now();
    let seconds = now.num_seconds_from_midnight() as f32 + now.nanosecond() as f32 * 1e-9;
    [
        now.year() as f32,
        now.month0() as f32,
        now.day() as f32,
        seconds,
    ]
}

/// Tracks shader time, frame delta, measured fps and the frame counter.
///
/// All methods take the current instant so the clock can be driven
/// deterministically.
#[derive(Debug, Clone)]
pub struct FrameClock {
    start: Instant,
    prev: Instant,
    paused_at: Option<Instant>,
    /// Set by [`reset`](Self::reset) while paused: resuming restarts from zero.
    reset_while_paused: bool,
    time: f32,
    delta: f32,
    frame: i32,
    fps_window_start: Instant,
    fps_count: u32,
    fps: f32,
}

impl FrameClock {
    pub fn new(now: Instant) -> Self {
        Self {
            start: now,
            prev: now,
            paused_at: None,
            reset_while_paused: false,
            time: 0.0,
            delta: f32::MIN_POSITIVE,
            frame: 0,
            fps_window_start: now,
            fps_count: 0,
            fps: 1.0,
        }
    }

    /// Advances time to `now`. Does nothing while paused.
    pub fn tick(&mut self, now: Instant) {
        if self.paused_at.is_some() {
            return;
        }
        self.time = now.duration_since(self.start).as_secs_f32();
        self.delta = now
            .duration_since(self.prev)
            .as_secs_f32()
            .max(f32::MIN_POSITIVE);
        self.prev = now;

        if now.duration_since(self.fps_window_start) > FPS_WINDOW {
            self.fps_window_start = now;
            self.fps = self.fps_count as f32 / FPS_WINDOW.as_secs_f32();
            self.fps_count = 0;
        }
        self.fps_count += 1;
    }

    /// Counts a rendered frame.
    pub fn advance_frame(&mut self) {
        self.frame += 1;
    }

    pub fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
            self.reset_while_paused = false;
        }
    }

    /// Resumes after [`pause`](Self::pause). Paused time is not counted.
    pub fn resume(&mut self, now: Instant) {
        let Some(paused_at) = self.paused_at.take() else {
            return;
        };
        if self.reset_while_paused {
            self.start = now;
            self.prev = now;
        } else {
            let paused_for = now.duration_since(paused_at);
            self.start += paused_for;
            self.prev += paused_for;
        }
        self.reset_while_paused = false;
    }

    pub fn toggle_pause(&mut self, now: Instant) {
        if self.is_paused() {
            self.resume(now);
        } else {
            self.pause(now);
        }
    }

    /// Restarts time and the frame counter.
    pub fn reset(&mut self, now: Instant) {
        self.frame = 0;
        self.delta = now
            .duration_since(self.prev)
            .as_secs_f32()
            .max(f32::MIN_POSITIVE);
        self.start = now;
        self.prev = now;
        self.time = 0.0;
        self.fps_window_start = now;
        self.fps_count = 0;
        self.fps = 1.0;
        self.reset_while_paused = self.paused_at.is_some();
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    /// Seconds between the last two ticks, never zero.
    pub fn delta(&self) -> f32 {
        self.delta
    }

    /// Instantaneous rate derived from the last delta.
    pub fn frame_rate(&self) -> f32 {
        1.0 / self.delta
    }

    /// Frames per second averaged over the last half-second window.
    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn frame(&self) -> i32 {
        self.frame
    }

    /// Fills the clock driven fields of `input`.
    pub fn write(&self, input: &mut GpuInput) {
        input.time = self.time;
        input.time_delta = self.delta;
        input.frame_rate = self.frame_rate();
        input.frame = self.frame;
        input.channel_time = [self.time; 4];
    }
}

use std::collections::HashMap;

use parking_lot::Mutex;

use super::error_text;
use crate::models::sample::StreamDirection;
use crate::native::handle::RawHandle;
use crate::traits::simple_api::{SimpleApi, SimpleStreamParams};

/// In-process implementation of [`SimpleApi`].
///
/// Playback streams append to one shared sink; record streams read a
/// repeating capture pattern.
pub struct FakeSimple {
    state: Mutex<SimpleState>,
}

struct SimpleState {
    next_id: usize,
    streams: HashMap<RawHandle, StreamDirection>,
    written: Vec<u8>,
    capture: Vec<u8>,
    capture_pos: usize,
    latency_micros: u64,
    fail_open: Option<i32>,
    fail_io: Option<i32>,
    free_count: usize,
    drain_count: usize,
    write_calls: usize,
}

impl FakeSimple {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimpleState {
                next_id: 0x2000,
                streams: HashMap::new(),
                written: Vec::new(),
                capture: Vec::new(),
                capture_pos: 0,
                latency_micros: 0,
                fail_open: None,
                fail_io: None,
                free_count: 0,
                drain_count: 0,
                write_calls: 0,
            }),
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Bytes that record streams cycle through. Empty reads as silence.
    pub fn set_capture(&self, pattern: Vec<u8>) {
        let mut state = self.state.lock();
        state.capture = pattern;
        state.capture_pos = 0;
    }

    pub fn set_latency_micros(&self, latency: u64) {
        self.state.lock().latency_micros = latency;
    }

    pub fn fail_open(&self, code: Option<i32>) {
        self.state.lock().fail_open = code;
    }

    /// Make every read, write, drain and flush fail with `code`.
    pub fn fail_io(&self, code: Option<i32>) {
        self.state.lock().fail_io = code;
    }

    pub fn live_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free_count
    }

    pub fn drain_count(&self) -> usize {
        self.state.lock().drain_count
    }

    pub fn write_calls(&self) -> usize {
        self.state.lock().write_calls
    }

    fn check(state: &SimpleState, stream: RawHandle) -> Result<StreamDirection, i32> {
        let Some(direction) = state.streams.get(&stream) else {
            panic!("unknown simple stream {:?}", stream);
        };
        match state.fail_io {
            Some(code) => Err(code),
            None => Ok(*direction),
        }
    }
}

impl Default for FakeSimple {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleApi for FakeSimple {
    fn simple_new(&self, params: &SimpleStreamParams<'_>) -> Result<RawHandle, i32> {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_open {
            return Err(code);
        }
        state.next_id += 0x10;
        let raw = RawHandle::new(state.next_id).ok_or(-1)?;
        state.streams.insert(raw, params.direction);
        Ok(raw)
    }

    fn simple_free(&self, stream: RawHandle) {
        let mut state = self.state.lock();
        if state.streams.remove(&stream).is_none() {
            panic!("double free of simple stream {:?}", stream);
        }
        state.free_count += 1;
    }

    fn simple_write(&self, stream: RawHandle, data: &[u8]) -> Result<(), i32> {
        let mut state = self.state.lock();
        state.write_calls += 1;
        Self::check(&state, stream)?;
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn simple_read(&self, stream: RawHandle, buffer: &mut [u8]) -> Result<(), i32> {
        let mut state = self.state.lock();
        Self::check(&state, stream)?;
        if state.capture.is_empty() {
            buffer.fill(0);
            return Ok(());
        }
        for byte in buffer.iter_mut() {
            *byte = state.capture[state.capture_pos];
            state.capture_pos = (state.capture_pos + 1) % state.capture.len();
        }
        Ok(())
    }

    fn simple_drain(&self, stream: RawHandle) -> Result<(), i32> {
        let mut state = self.state.lock();
        Self::check(&state, stream)?;
        state.drain_count += 1;
        Ok(())
    }

    fn simple_flush(&self, stream: RawHandle) -> Result<(), i32> {
        let state = self.state.lock();
        Self::check(&state, stream).map(|_| ())
    }

    fn simple_get_latency(&self, stream: RawHandle) -> Result<u64, i32> {
        let state = self.state.lock();
        Self::check(&state, stream)?;
        Ok(state.latency_micros)
    }

    fn strerror(&self, code: i32) -> String {
        error_text(code)
    }
}

//! Simulated devices on either side of the proxy.

use obdgate_lib::responder::{ECU_REPLY_ID, FUNCTIONAL_REQUEST_ID};
use obdgate_lib::virtual_bus::PeerHook;
use obdgate_lib::{Frame, VirtualController};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Padding byte for unused payload positions.
const PAD: u8 = 0xcc;

/// Requests the scan tool cycles through: mode 01 PIDs, then mode 03 and 07.
const SCAN_SEQUENCE: [&[u8]; 9] = [
    &[0x02, 0x01, 0x00],
    &[0x02, 0x01, 0x01],
    &[0x02, 0x01, 0x0c],
    &[0x02, 0x01, 0x0d],
    &[0x02, 0x01, 0x05],
    &[0x02, 0x01, 0x11],
    &[0x01, 0x03],
    &[0x01, 0x07],
    &[0x02, 0x01, 0x0c],
];

/// Engine speed keyframes as (seconds into the cycle, rpm). The profile
/// repeats once the last keyframe is reached.
const RPM_PROFILE: [(f32, f32); 5] = [
    (0.0, 800.0),
    (4.0, 3500.0),
    (7.0, 3500.0),
    (11.0, 800.0),
    (14.0, 800.0),
];

/// Linear interpolation over [`RPM_PROFILE`] at `t` seconds.
fn profile_rpm(t: f32) -> f32 {
    let cycle = RPM_PROFILE[RPM_PROFILE.len() - 1].0;
    let t = t % cycle;
    RPM_PROFILE
        .windows(2)
        .find(|pair| t < pair[1].0)
        .map_or(RPM_PROFILE[0].1, |pair| {
            let ((t0, rpm0), (t1, rpm1)) = (pair[0], pair[1]);
            rpm0 + (rpm1 - rpm0) * (t - t0) / (t1 - t0)
        })
}

/// Single-frame reply padded to eight bytes.
fn single_frame(body: &[u8]) -> Frame {
    let body = &body[..body.len().min(7)];
    let mut payload = [PAD; 8];
    payload[0] = u8::try_from(body.len()).unwrap_or(7);
    payload[1..=body.len()].copy_from_slice(body);
    Frame::new(ECU_REPLY_ID, &payload)
}

/// Engine ECU answering mode 01, 03 and 07 requests on bus B.
pub struct MockEcu {
    start_time: Instant,
}

impl Default for MockEcu {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEcu {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    /// Engine RPM right now, in the 1/4 rpm units PID 0C reports.
    fn quarter_rpm(&self) -> u16 {
        let rpm = profile_rpm(self.start_time.elapsed().as_secs_f32());
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // at most 14000
        let quarter_rpm = (rpm * 4.0) as u16;
        quarter_rpm
    }

    /// Mode 01 data bytes for `pid`.
    fn pid_data(&self, pid: u8) -> Option<Vec<u8>> {
        let data = match pid {
            0x00 => vec![0xbe, 0x3f, 0xa8, 0x13], // PIDs supported 01-20
            0x01 => vec![0x00, 0x07, 0xe5, 0x00], // Monitor status
            0x04 => vec![0x64],                   // Engine load: 39.2%
            0x05 => vec![0x4f],                   // Coolant temp: 39°C
            0x0c => self.quarter_rpm().to_be_bytes().to_vec(),
            0x0d => vec![0x28],                   // Speed: 40 km/h
            0x0f => vec![0x38],                   // Intake air temp: 16°C
            0x11 => vec![0x45],                   // Throttle: 27%
            0x20 => vec![0x80, 0x00, 0x00, 0x01], // PIDs supported 21-40
            _ => return None,
        };
        Some(data)
    }

    pub fn reply(&self, request: &Frame) -> Option<Frame> {
        if request.id != FUNCTIONAL_REQUEST_ID {
            return None;
        }
        match request.payload() {
            [_, 0x01, pid, ..] => {
                let data = self.pid_data(*pid)?;
                let mut body = vec![0x41, *pid];
                body.extend_from_slice(&data);
                Some(single_frame(&body))
            }
            [_, 0x03, ..] => Some(single_frame(&[0x43, 0x00])),
            [_, 0x07, ..] => Some(single_frame(&[0x47, 0x00])),
            _ => None,
        }
    }

    pub fn into_peer(self) -> PeerHook {
        Box::new(move |frame| self.reply(frame))
    }
}

/// Scan tool thread injecting requests on bus A at a fixed interval.
pub struct ScanTool {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<u64>,
}

impl ScanTool {
    pub fn spawn(bus: Arc<VirtualController>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let mut sent = 0u64;
            for request in SCAN_SEQUENCE.iter().cycle() {
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                bus.inject(Frame::new(FUNCTIONAL_REQUEST_ID, request));
                sent += 1;
                std::thread::sleep(interval);
            }
            sent
        });
        Self { stop, handle }
    }

    /// Stop injecting and return how many requests were sent.
    pub fn stop(self) -> u64 {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap_or(0)
    }
}

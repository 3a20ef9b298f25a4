//! Common test utilities for MP-285 integration tests
//!
//! [`MockStage`] answers the MP-285 wire protocol on one end of an in-memory
//! duplex pipe and records every request frame it receives.

#![allow(dead_code)] // Utilities may not all be used by every test binary

use mp285::config::{LogConfig, StageConfig};
use mp285::event_log::AlwaysOverwrite;
use mp285::session::{DynSerial, Session};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// Behavior of the simulated controller.
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Position in microsteps at power-up
    pub steps: [i32; 3],
    /// Reported active manipulator
    pub manipulator: u8,
    /// Time a move takes before the acknowledgement is sent
    pub move_delay: Duration,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            steps: [0, 0, 0],
            manipulator: 1,
            move_delay: Duration::from_millis(5),
        }
    }
}

/// Handle to a running simulated MP-285.
pub struct MockStage {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    steps: Arc<Mutex<[i32; 3]>>,
    responsive: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockStage {
    /// Start the controller and return the host end of the link.
    pub fn spawn(options: MockOptions) -> (DynSerial, MockStage) {
        let (host, device) = tokio::io::duplex(256);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let steps = Arc::new(Mutex::new(options.steps));
        let responsive = Arc::new(AtomicBool::new(true));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(serve(
            device,
            options,
            frames.clone(),
            steps.clone(),
            responsive.clone(),
            overlaps.clone(),
        ));

        let stage = MockStage {
            frames,
            steps,
            responsive,
            overlaps,
            task,
        };
        (Box::new(host), stage)
    }

    /// Every request frame received so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    /// Targets of the `M` frames received so far, in microsteps.
    pub fn move_targets(&self) -> Vec<[i32; 3]> {
        self.frames()
            .iter()
            .filter(|f| f[0] == b'M')
            .map(|f| decode_steps(&f[1..13]))
            .collect()
    }

    /// Stop (or resume) answering requests.
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    /// Move the stage behind the host's back.
    pub fn set_steps(&self, steps: [i32; 3]) {
        *self.steps.lock().unwrap() = steps;
    }

    /// Requests that arrived while a move was still in progress.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

impl Drop for MockStage {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn decode_steps(bytes: &[u8]) -> [i32; 3] {
    let mut steps = [0i32; 3];
    for (slot, chunk) in steps.iter_mut().zip(bytes.chunks_exact(4)) {
        *slot = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    steps
}

async fn serve(
    mut device: DuplexStream,
    options: MockOptions,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    steps: Arc<Mutex<[i32; 3]>>,
    responsive: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
) {
    let mut pending: Option<u8> = None;
    loop {
        let opcode = match pending.take() {
            Some(b) => b,
            None => match device.read_u8().await {
                Ok(b) => b,
                Err(_) => return,
            },
        };

        let mut frame = vec![opcode];
        if opcode == b'M' {
            let mut payload = [0u8; 12];
            if device.read_exact(&mut payload).await.is_err() {
                return;
            }
            frame.extend_from_slice(&payload);
        }
        frames.lock().unwrap().push(frame.clone());

        if !responsive.load(Ordering::SeqCst) {
            continue;
        }

        let reply = match opcode {
            b'C' => {
                let current = *steps.lock().unwrap();
                let mut reply = vec![b'D'];
                for v in current {
                    reply.extend_from_slice(&v.to_le_bytes());
                }
                reply.push(b'\r');
                reply
            }
            b'M' => {
                tokio::time::sleep(options.move_delay).await;
                // Anything arriving before the acknowledgement overlapped this move.
                if let Ok(Ok(b)) =
                    tokio::time::timeout(Duration::from_millis(2), device.read_u8()).await
                {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                    pending = Some(b);
                }
                *steps.lock().unwrap() = decode_steps(&frame[1..13]);
                vec![b'\r']
            }
            b'K' => vec![options.manipulator, b'\r'],
            _ => continue,
        };

        if device.write_all(&reply).await.is_err() {
            return;
        }
    }
}

/// Stage settings with a short timeout for tests.
pub fn test_config() -> StageConfig {
    StageConfig {
        timeout_secs: 0.25,
        ..StageConfig::new("mock")
    }
}

/// Open a session on a fresh mock, logging to `log`.
pub async fn open_mock(options: MockOptions, log: Option<&Path>) -> (Session, MockStage) {
    let (port, stage) = MockStage::spawn(options);
    let log = LogConfig {
        path: log.map(Path::to_path_buf),
    };
    let session = Session::with_port(port, test_config(), &log, &AlwaysOverwrite)
        .await
        .unwrap();
    (session, stage)
}

/// Temporary directory plus a log path inside it.
pub fn temp_log() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.csv");
    (dir, path)
}

/// Log rows, header included.
pub fn log_rows(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

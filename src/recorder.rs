// ===============================
// src/recorder.rs
// ===============================
//
// Ledger journal as JSONL:
// - every committed Event is appended as one line
// - BufWriter, flushed every 200ms and every 64 events
// - parent directory is created on open
// - a failed write reopens the file once and retries
//
// `load` reads the same file back at startup; a torn last line (crash mid-write) is
// skipped with a warning.
//
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;

use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;
use crate::error::EngineResult;

const FLUSH_EVERY_N_EVENTS: u32 = 64;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, journal disabled");
            // keep draining so the fan-out never blocks on us
            while rx.recv().await.is_some() {}
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_millis(200));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_vec(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    let _ = writer.flush().await;
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, event dropped");
                            continue;
                        }
                    }
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, "recorder: write failed again after reopen, event dropped");
                        continue;
                    }
                }
                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                if since_last_flush > 0 {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
        }
    }
}

/// Reads a journal back. A missing file is an empty journal.
pub fn load(path: &str) -> EngineResult<Vec<Event>> {
    match File::open(path) {
        Ok(f) => read_journal(BufReader::new(f), path),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn read_journal(reader: impl BufRead, path: &str) -> EngineResult<Vec<Event>> {
    let mut events = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(ev) => events.push(ev),
            Err(e) => warn!(line = n + 1, error = %e, %path, "journal line skipped"),
        }
    }
    Ok(events)
}

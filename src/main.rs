use std::io::{self, BufRead};

use anyhow::{bail, Result};
use log::{debug, error, info, warn};

use ps02_rs::controller::{ControllerConfig, StreamController};
use ps02_rs::types::{SensorEvent, TransportKind};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=ps02_rs=debug cargo run -- usb
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Arguments: `ps02 [usb|ble] [--json]` ──────────────────────────────────
    let mut kind = TransportKind::Serial;
    let mut json_output = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "usb" => kind = TransportKind::Serial,
            "ble" => kind = TransportKind::Ble,
            "--json" => json_output = true,
            other => bail!("unknown argument {other:?} (usage: ps02 [usb|ble] [--json])"),
        }
    }

    let mut session = StreamController::new(ControllerConfig::default());
    let mut events = session.subscribe();

    // ── Connect ───────────────────────────────────────────────────────────────
    info!("Scanning for a PS02 sensor over {kind:?} …");
    let device = session.connect_first(kind).await?;
    info!(
        "Connected: {} ({})",
        device.id,
        device.name.as_deref().unwrap_or("unnamed")
    );

    // ── Start streaming ───────────────────────────────────────────────────────
    session.start().await?;
    info!("Measuring. Commands (type + Enter):");
    info!("  stop   – pause the measurement");
    info!("  start  – resume the measurement");
    info!("  g <N>  – set gain (0-15), live");
    info!("  stats  – print session counters");
    info!("  q      – disconnect and quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (to avoid holding a non-Send
    // StdinLock across await points), then relayed into the async loop.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // ── Main loop: events and commands interleaved ────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SensorEvent::Frame(frame)) => {
                    if json_output {
                        // One JSON object per line, ready to pipe into a viewer.
                        println!("{}", serde_json::to_string(&frame)?);
                    } else {
                        let min = frame.samples.iter().copied().min().unwrap_or(0);
                        let max = frame.samples.iter().copied().max().unwrap_or(0);
                        println!(
                            "[FRAME] seq={:3}  n={:2}  min={min:+5}  max={max:+5}",
                            frame.seq,
                            frame.samples.len()
                        );
                    }
                }
                Ok(SensorEvent::SequenceGap { expected, got, missed }) => {
                    warn!("gap: expected seq {expected}, got {got} ({missed} frame(s) missed)");
                }
                Ok(SensorEvent::StateChanged(state)) => {
                    info!("state -> {state:?}");
                }
                Ok(SensorEvent::MalformedLine { total }) => {
                    debug!("malformed line dropped ({total} so far)");
                }
                Ok(SensorEvent::LinkLost { reason }) => {
                    error!("link lost: {reason}");
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event feed lagged, {n} event(s) skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },

            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match line.as_str() {
                    "" => {}
                    "q" => {
                        info!("Quit requested.");
                        break;
                    }
                    "stop" => {
                        if let Err(e) = session.stop().await {
                            error!("stop: {e}");
                        }
                    }
                    "start" => {
                        if let Err(e) = session.start().await {
                            error!("start: {e}");
                        }
                    }
                    "stats" => {
                        let s = session.stats();
                        info!(
                            "frames={}  malformed={}  gaps={}  missed={}",
                            s.frames, s.malformed_lines, s.sequence_gaps, s.missed_frames
                        );
                    }
                    cmd => {
                        if let Some(value) = cmd.strip_prefix("g ") {
                            match value.trim().parse::<u8>() {
                                Ok(gain) => {
                                    if let Err(e) = session.set_gain(gain).await {
                                        error!("set_gain: {e}");
                                    } else {
                                        info!("gain set to {gain}");
                                    }
                                }
                                Err(_) => warn!("not a gain value: {value:?}"),
                            }
                        } else {
                            warn!("unknown command {cmd:?}");
                        }
                    }
                }
            }
        }
    }

    session.disconnect().await.ok();
    info!("Session closed.");
    Ok(())
}

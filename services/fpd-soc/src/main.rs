//! Detector SoC daemon.
//!
//! Streams synthetic panel frames to a host over the data channel while
//! serving authenticated commands on the control port. The real readout
//! front-end is the FPGA; here a pattern generator plays its role so the
//! firmware path (ring, FSM, registers, transmitter, command server) runs
//! exactly as it does on hardware.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{App, Arg};
use log::{error, info};

use fpd_soc::api::{ScanEvent, ScanState};
use fpd_soc::cmdsrv::{CommandContext, CommandServer};
use fpd_soc::config::DetectorConfig;
use fpd_soc::framebuf::FrameBufferManager;
use fpd_soc::registers::RegisterFile;
use fpd_soc::sequence::SequenceFsm;
use fpd_soc::udp_tx::UdpTransmitter;

fn main() {
    env_logger::init();
    let matches = App::new("fpd-soc")
        .about("flat-panel detector SoC firmware daemon")
        .arg(Arg::with_name("host").long("host").takes_value(true).help("destination host IP"))
        .arg(Arg::with_name("data-port").long("data-port").takes_value(true))
        .arg(Arg::with_name("control-port").long("control-port").takes_value(true))
        .arg(Arg::with_name("rows").long("rows").takes_value(true))
        .arg(Arg::with_name("cols").long("cols").takes_value(true))
        .arg(Arg::with_name("fps").long("fps").takes_value(true))
        .arg(
            Arg::with_name("key")
                .long("key")
                .takes_value(true)
                .help("pre-shared command channel key"),
        )
        .arg(
            Arg::with_name("payload")
                .long("payload")
                .takes_value(true)
                .help("max UDP payload bytes (1472 for standard MTU, 8192 for jumbo)"),
        )
        .arg(
            Arg::with_name("frames")
                .long("frames")
                .takes_value(true)
                .help("stop after N frames (0 = run until killed)"),
        )
        .get_matches();

    let mut config = DetectorConfig::default();
    if let Some(v) = matches.value_of("host") {
        config.host_ip = v.to_string();
    }
    if let Some(v) = matches.value_of("data-port") {
        config.data_port = v.parse().unwrap_or(config.data_port);
    }
    if let Some(v) = matches.value_of("control-port") {
        config.control_port = v.parse().unwrap_or(config.control_port);
    }
    if let Some(v) = matches.value_of("rows") {
        config.rows = v.parse().unwrap_or(config.rows);
    }
    if let Some(v) = matches.value_of("cols") {
        config.cols = v.parse().unwrap_or(config.cols);
    }
    if let Some(v) = matches.value_of("fps") {
        config.frame_rate = v.parse().unwrap_or(config.frame_rate);
    }
    if let Err(e) = config.validate() {
        error!("bad configuration: {}", e);
        std::process::exit(1);
    }
    let key = matches.value_of("key").unwrap_or("fpd-dev-key").as_bytes().to_vec();
    let max_payload: usize =
        matches.value_of("payload").and_then(|v| v.parse().ok()).unwrap_or(fpd_protocol::MAX_PAYLOAD_JUMBO);
    let frame_limit: u64 = matches.value_of("frames").and_then(|v| v.parse().ok()).unwrap_or(0);

    if let Err(e) = serve(config, key, max_payload, frame_limit) {
        error!("daemon failed: {}", e);
        std::process::exit(1);
    }
}

fn serve(
    config: DetectorConfig,
    key: Vec<u8>,
    max_payload: usize,
    frame_limit: u64,
) -> std::io::Result<()> {
    let run = Arc::new(AtomicBool::new(true));
    let ring = Arc::new(FrameBufferManager::new(config.frame_bytes()));
    let registers = Arc::new(RegisterFile::new());
    let fsm = Arc::new(Mutex::new(SequenceFsm::new_standalone()));
    let shared_config = Arc::new(Mutex::new(config.clone()));

    // control plane
    let control_socket = UdpSocket::bind(("0.0.0.0", config.control_port))?;
    let server = CommandServer::new(
        key,
        CommandContext {
            fsm: fsm.clone(),
            registers: registers.clone(),
            config: shared_config.clone(),
            ring: ring.clone(),
        },
    );
    let control_run = run.clone();
    let control_thread = std::thread::spawn(move || {
        if let Err(e) = server.run(control_socket, control_run) {
            error!("command server died: {}", e);
        }
    });

    // data plane
    let data_socket = UdpSocket::bind("0.0.0.0:0")?;
    let dest = format!("{}:{}", config.host_ip, config.data_port)
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad host address"))?;
    let transmitter = UdpTransmitter::new(data_socket, dest, max_payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let tx_ring = ring.clone();
    let tx_fsm = fsm.clone();
    let tx_registers = registers.clone();
    let tx_run = run.clone();
    let tx_thread =
        std::thread::spawn(move || transmitter.run(tx_ring, tx_fsm, tx_registers, tx_run));

    info!(
        "streaming {}x{} @ {} fps to {} (control port {})",
        config.cols, config.rows, config.frame_rate, dest, config.control_port
    );

    // pattern-generator producer, standing in for the CSI-2 receive path
    let mut frame_number: u32 = 0;
    let mut sent: u64 = 0;
    while run.load(Ordering::Relaxed) {
        let (state, period_ns) = {
            let fsm = fsm.lock().expect("fsm guard");
            let cfg = shared_config.lock().expect("config guard");
            (fsm.state(), cfg.frame_period_ns())
        };
        if state != ScanState::Scanning {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        let (rows, cols, bit_depth) = {
            let cfg = shared_config.lock().expect("config guard");
            (cfg.rows as usize, cfg.cols as usize, cfg.bit_depth)
        };
        match ring.acquire(frame_number) {
            Ok(mut storage) => {
                fill_gradient(&mut storage, rows, cols, bit_depth, frame_number);
                if let Err(e) = ring.commit(frame_number, storage) {
                    error!("commit of frame {} failed: {}", frame_number, e);
                } else {
                    let mut fsm = fsm.lock().expect("fsm guard");
                    let state = fsm.handle(ScanEvent::FrameReady);
                    registers.note_state(state);
                }
            }
            Err(e) => error!("acquire of frame {} failed: {}", frame_number, e),
        }
        frame_number = frame_number.wrapping_add(1);
        sent += 1;
        if frame_limit != 0 && sent >= frame_limit {
            info!("frame limit reached");
            break;
        }
        std::thread::sleep(Duration::from_nanos(period_ns));
    }

    run.store(false, Ordering::Relaxed);
    let _ = tx_thread.join();
    let _ = control_thread.join();
    let stats = ring.stats();
    info!(
        "shutdown: {} received, {} sent, {} dropped",
        stats.frames_received, stats.frames_sent, stats.frames_dropped
    );
    Ok(())
}

/// Diagonal gradient pattern, big-endian pixel bytes, clamped to bit depth.
fn fill_gradient(storage: &mut Vec<u8>, rows: usize, cols: usize, bit_depth: u8, frame_number: u32) {
    storage.clear();
    storage.reserve(rows * cols * 2);
    for r in 0..rows {
        for c in 0..cols {
            let px = fpd_fpga::clamp_to_depth(
                ((r + c) as u32 + frame_number) as u16,
                bit_depth,
            );
            storage.extend_from_slice(&px.to_be_bytes());
        }
    }
}

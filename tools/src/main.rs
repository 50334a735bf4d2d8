//! Whole-pipeline simulator.
//!
//! Every hardware stage is replaced by its software model and wired
//! together over loopback UDP: pattern generator → ping-pong line buffer →
//! CSI-2 packetizer → backpressured link → SoC receive path → frame ring →
//! UDP transmitter → host SDK receiver. The control plane runs for real
//! too: the sim starts and stops the scan through the authenticated
//! command channel.
//!
//! Example:
//!
//! ```text
//! RUST_LOG=info fpd-sim --frames 10 --width 256 --height 256 --pattern noise
//! ```

use std::fs::File;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{App, Arg};
use log::{error, info, warn};
use rand::Rng;

use fpd_protocol::ScanMode;
use fpd_sdk::cmdclient::CommandClient;
use fpd_sdk::reassembler::FrameReassembler;
use fpd_sdk::receiver::FrameReceiver;
use fpd_soc::api::{ScanEvent, ScanState};
use fpd_soc::cmdsrv::{CommandContext, CommandServer};
use fpd_soc::config::DetectorConfig;
use fpd_soc::csi_rx::CsiRxAssembler;
use fpd_soc::framebuf::FrameBufferManager;
use fpd_soc::registers::RegisterFile;
use fpd_soc::sequence::SequenceFsm;
use fpd_soc::udp_tx::UdpTransmitter;

const SIM_KEY: &[u8] = b"fpd-sim-key";

#[derive(Clone, Copy, PartialEq)]
enum Pattern {
    Gradient,
    Noise,
}

fn main() {
    env_logger::init();
    let matches = App::new("fpd-sim")
        .about("software rendition of the full detector pipeline")
        .arg(Arg::with_name("frames").long("frames").takes_value(true).default_value("10"))
        .arg(Arg::with_name("width").long("width").takes_value(true).default_value("256"))
        .arg(Arg::with_name("height").long("height").takes_value(true).default_value("256"))
        .arg(
            Arg::with_name("payload")
                .long("payload")
                .takes_value(true)
                .default_value("1472")
                .help("max UDP payload (8192 with jumbo frames)"),
        )
        .arg(
            Arg::with_name("pattern")
                .long("pattern")
                .takes_value(true)
                .possible_values(&["gradient", "noise"])
                .default_value("gradient"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .help("JSON detector config file"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => match File::open(path).map_err(|e| e.to_string()).and_then(|file| {
            serde_json::from_reader::<_, DetectorConfig>(file).map_err(|e| e.to_string())
        }) {
            Ok(config) => config,
            Err(e) => {
                error!("cannot load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => DetectorConfig::default(),
    };
    config.rows = matches.value_of("height").and_then(|v| v.parse().ok()).unwrap_or(config.rows);
    config.cols = matches.value_of("width").and_then(|v| v.parse().ok()).unwrap_or(config.cols);
    if let Err(e) = config.validate() {
        error!("bad configuration: {}", e);
        std::process::exit(1);
    }
    let frames: u32 = matches.value_of("frames").and_then(|v| v.parse().ok()).unwrap_or(10);
    let max_payload: usize = matches.value_of("payload").and_then(|v| v.parse().ok()).unwrap_or(1472);
    let pattern = match matches.value_of("pattern") {
        Some("noise") => Pattern::Noise,
        _ => Pattern::Gradient,
    };

    if let Err(e) = simulate(config, frames, max_payload, pattern) {
        error!("simulation failed: {}", e);
        std::process::exit(1);
    }
}

fn simulate(
    config: DetectorConfig,
    frames: u32,
    max_payload: usize,
    pattern: Pattern,
) -> Result<(), Box<dyn std::error::Error>> {
    let width = config.cols as usize;
    let height = config.rows as usize;
    let run = Arc::new(AtomicBool::new(true));
    let ring = Arc::new(FrameBufferManager::new(config.frame_bytes()));
    let registers = Arc::new(RegisterFile::new());
    let fsm = Arc::new(Mutex::new(SequenceFsm::new_standalone()));
    let shared_config = Arc::new(Mutex::new(config.clone()));

    // control plane, loopback
    let control_socket = UdpSocket::bind("127.0.0.1:0")?;
    let control_addr = control_socket.local_addr()?;
    let server = CommandServer::new(
        SIM_KEY.to_vec(),
        CommandContext {
            fsm: fsm.clone(),
            registers: registers.clone(),
            config: shared_config.clone(),
            ring: ring.clone(),
        },
    );
    let control_run = run.clone();
    let control_thread = std::thread::spawn(move || server.run(control_socket, control_run));

    // host side
    let (receiver, frames_rx) =
        FrameReceiver::spawn("127.0.0.1:0".parse()?, FrameReassembler::new(), 32)?;

    // data plane
    let data_socket = UdpSocket::bind("127.0.0.1:0")?;
    let transmitter = UdpTransmitter::new(data_socket, receiver.local_addr(), max_payload)
        .map_err(|e| e.to_string())?;
    let tx_thread = {
        let ring = ring.clone();
        let fsm = fsm.clone();
        let registers = registers.clone();
        let run = run.clone();
        std::thread::spawn(move || transmitter.run(ring, fsm, registers, run))
    };

    let mut client = CommandClient::connect(control_addr, SIM_KEY)?;
    client.start_scan(Some(ScanMode::Continuous))?;
    info!(
        "scan started: {} frames of {}x{}, payload {} bytes",
        frames, width, height, max_payload
    );

    // consumer thread tallies what the SDK delivers
    let consumer = std::thread::spawn(move || {
        let mut complete = 0u32;
        let mut partial = 0u32;
        let mut checksum = 0u64;
        while let Ok(frame) = frames_rx.recv_timeout(Duration::from_secs(5)) {
            if frame.complete {
                complete += 1;
            } else {
                partial += 1;
                warn!("frame {} partial, {} packets missing", frame.frame_number, frame.missing.len());
            }
            checksum = checksum.wrapping_add(frame.pixels.iter().map(|&p| p as u64).sum::<u64>());
            if complete + partial == frames {
                break;
            }
        }
        (complete, partial, checksum)
    });

    // the FPGA front-end, stage by stage
    let started = Instant::now();
    let mut rx = CsiRxAssembler::new(width, height, 0);
    let mut line_buffer = fpd_fpga::LineBuffer::new(width)?;
    let mut link = fpd_fpga::AxiStreamModel::default();
    let mut rng = rand::thread_rng();
    let mut generated_checksum = 0u64;
    for frame in 0..frames {
        let mut packetizer = fpd_fpga::csi2::Csi2Packetizer::new(0)?;
        let mut wire = fpd_fpga::csi2::serialize(&packetizer.start_frame(frame as u16)?);
        for row in 0..height {
            let line: Vec<u16> = (0..width)
                .map(|col| {
                    let raw = match pattern {
                        Pattern::Gradient => (row + col) as u32 + frame,
                        Pattern::Noise => rng.gen::<u16>() as u32,
                    };
                    fpd_fpga::clamp_to_depth(raw as u16, config.bit_depth)
                })
                .collect();
            line_buffer.write_line(&line)?;
            line_buffer.toggle_write();
            line_buffer.toggle_read();
            let staged = line_buffer.read_line();
            generated_checksum =
                generated_checksum.wrapping_add(staged.iter().map(|&p| p as u64).sum::<u64>());
            for packet in packetizer.push_line(&staged)? {
                wire.extend(fpd_fpga::csi2::serialize(&packet));
            }
        }
        wire.extend(fpd_fpga::csi2::serialize(&packetizer.end_frame()?));
        // 4 bytes in per byte-clock cycle, 2 out: the FIFO pushes back
        link.transfer_all(wire.len(), 2);
        rx.push_bytes(&wire, &ring).map_err(|e| e.to_string())?;
        fsm.lock().expect("fsm guard").handle(ScanEvent::FrameReady);
        while fsm.lock().expect("fsm guard").state() == ScanState::Streaming {
            std::thread::sleep(Duration::from_micros(200));
        }
    }
    let (complete, partial, received_checksum) = consumer.join().expect("consumer");
    let elapsed = started.elapsed();

    let status = client.get_status()?;
    client.stop_scan()?;
    run.store(false, Ordering::Relaxed);
    let tx_stats = tx_thread.join().expect("transmitter");
    let _ = control_thread.join().expect("command server");
    let rx_stats = receiver.stop();

    println!("frames generated       {}", frames);
    println!("frames complete        {}", complete);
    println!("frames partial         {}", partial);
    println!("packets sent           {}", tx_stats.packets_sent);
    println!("bytes sent             {}", tx_stats.bytes_sent);
    println!("link stall cycles      {}", link.stall_cycles());
    println!("ring drops             {}", status.frames_dropped);
    println!("reassembly evictions   {}", rx_stats.evictions);
    println!("elapsed                {:.1?} ({:.1} fps)", elapsed, frames as f64 / elapsed.as_secs_f64());
    if generated_checksum == received_checksum {
        println!("pixel checksum         OK ({:#018x})", received_checksum);
    } else {
        println!(
            "pixel checksum         MISMATCH generated {:#018x} received {:#018x}",
            generated_checksum, received_checksum
        );
    }
    Ok(())
}

//! End-to-end exercises over loopback UDP: SoC firmware objects on one
//! side, the SDK on the other, real sockets in between.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use fpd_protocol::{ScanMode, StatusCode};
use fpd_sdk::cmdclient::CommandClient;
use fpd_sdk::reassembler::FrameReassembler;
use fpd_sdk::receiver::FrameReceiver;
use fpd_sdk::SdkError;
use fpd_soc::api::{ScanEvent, ScanState};
use fpd_soc::cmdsrv::{CommandContext, CommandServer};
use fpd_soc::config::DetectorConfig;
use fpd_soc::csi_rx::CsiRxAssembler;
use fpd_soc::framebuf::FrameBufferManager;
use fpd_soc::registers::RegisterFile;
use fpd_soc::sequence::SequenceFsm;
use fpd_soc::udp_tx::UdpTransmitter;

const KEY: &[u8] = b"loopback-test-key";

fn be_payload(pixels: &[u16]) -> Vec<u8> {
    let mut bytes = vec![0u8; pixels.len() * 2];
    BigEndian::write_u16_into(pixels, &mut bytes);
    bytes
}

#[test]
fn frames_cross_the_data_channel() {
    let (receiver, frames) = FrameReceiver::spawn(
        "127.0.0.1:0".parse().unwrap(),
        FrameReassembler::new(),
        16,
    )
    .unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    // small payload budget forces fragmentation
    let mut tx = UdpTransmitter::new(socket, receiver.local_addr(), 32).unwrap();

    let frame_a: Vec<u16> = (0..64).collect();
    let frame_b: Vec<u16> = (1000..1064).collect();
    assert_eq!(tx.send_frame(0, &be_payload(&frame_a)).unwrap(), 4);
    assert_eq!(tx.send_frame(1, &be_payload(&frame_b)).unwrap(), 4);

    let mut got = Vec::new();
    for _ in 0..2 {
        got.push(frames.recv_timeout(Duration::from_secs(2)).expect("frame delivery"));
    }
    got.sort_by_key(|f| f.frame_number);
    assert!(got[0].complete);
    assert_eq!(got[0].pixels, frame_a);
    assert!(got[1].complete);
    assert_eq!(got[1].pixels, frame_b);
    let stats = receiver.stop();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.crc_errors, 0);
}

#[test]
fn fpga_to_sdk_pipeline() {
    // FPGA model -> CSI-2 bytes -> SoC RX -> ring -> UDP -> SDK receiver
    let width = 8usize;
    let height = 4usize;
    let ring = Arc::new(FrameBufferManager::new(width * height * 2));
    let fsm = Arc::new(Mutex::new(SequenceFsm::new_standalone()));
    let registers = Arc::new(RegisterFile::new());
    let run = Arc::new(AtomicBool::new(true));

    let (receiver, frames) = FrameReceiver::spawn(
        "127.0.0.1:0".parse().unwrap(),
        FrameReassembler::new(),
        16,
    )
    .unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let tx = UdpTransmitter::new(socket, receiver.local_addr(), 32).unwrap();
    let tx_thread = {
        let ring = ring.clone();
        let fsm = fsm.clone();
        let registers = registers.clone();
        let run = run.clone();
        std::thread::spawn(move || tx.run(ring, fsm, registers, run))
    };

    fsm.lock().unwrap().handle(ScanEvent::StartScan(ScanMode::Continuous));

    let mut rx = CsiRxAssembler::new(width, height, 0);
    let mut line_buffer = fpd_fpga::LineBuffer::new(width).unwrap();
    let mut link = fpd_fpga::AxiStreamModel::default();
    let mut sent_frames = Vec::new();
    for frame in 0..3u16 {
        let mut packetizer = fpd_fpga::csi2::Csi2Packetizer::new(0).unwrap();
        let mut wire = fpd_fpga::csi2::serialize(&packetizer.start_frame(frame).unwrap());
        let mut pixels_of_frame = Vec::new();
        for row in 0..height {
            let line: Vec<u16> = (0..width)
                .map(|col| fpd_fpga::clamp_to_depth((frame * 1000) + (row * width + col) as u16, 14))
                .collect();
            // through the ping-pong buffer, as the readout path does
            line_buffer.write_line(&line).unwrap();
            line_buffer.toggle_write();
            line_buffer.toggle_read();
            let staged = line_buffer.read_line();
            pixels_of_frame.extend_from_slice(&staged);
            for packet in packetizer.push_line(&staged).unwrap() {
                wire.extend(fpd_fpga::csi2::serialize(&packet));
            }
        }
        wire.extend(fpd_fpga::csi2::serialize(&packetizer.end_frame().unwrap()));
        // the link applies backpressure but loses nothing
        link.transfer_all(wire.len(), 2);
        let committed = rx.push_bytes(&wire, &ring).unwrap();
        assert_eq!(committed.len(), 1);
        fsm.lock().unwrap().handle(ScanEvent::FrameReady);
        sent_frames.push(pixels_of_frame);
        // wait for the transmitter's Complete before producing the next
        // frame, as the frame period does on hardware
        while fsm.lock().unwrap().state() != ScanState::Scanning {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(frames.recv_timeout(Duration::from_secs(2)).expect("frame delivery"));
    }
    run.store(false, Ordering::Relaxed);
    let tx_stats = tx_thread.join().unwrap();
    assert_eq!(tx_stats.frames_sent, 3);
    assert!(link.bytes_transferred() > 0);

    received.sort_by_key(|f| f.frame_number);
    for (n, frame) in received.iter().enumerate() {
        assert!(frame.complete, "frame {} arrived partial", n);
        assert_eq!(frame.frame_number, n as u32);
        // the receiver pads the tail of the last packet to the stride
        assert!(frame.pixels.len() >= sent_frames[n].len());
        assert_eq!(&frame.pixels[..sent_frames[n].len()], &sent_frames[n][..]);
    }
    assert_eq!(fsm.lock().unwrap().stats().frames_sent, 3);
    assert_eq!(registers.frame_count(), 3);
    receiver.stop();
}

#[test]
fn command_channel_end_to_end() {
    let ring = Arc::new(FrameBufferManager::new(64));
    let ctx = CommandContext {
        fsm: Arc::new(Mutex::new(SequenceFsm::new_standalone())),
        registers: Arc::new(RegisterFile::new()),
        config: Arc::new(Mutex::new(DetectorConfig::default())),
        ring: ring.clone(),
    };
    let server = CommandServer::new(KEY.to_vec(), ctx);
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    let run = Arc::new(AtomicBool::new(true));
    let server_run = run.clone();
    let server_thread = std::thread::spawn(move || server.run(socket, server_run));

    let mut client = CommandClient::connect(addr, KEY).unwrap();
    client.start_scan(Some(ScanMode::Continuous)).unwrap();

    let status = client.get_status().unwrap();
    assert_eq!(status.state, 3, "device should be Scanning");
    assert_eq!(status.mode, ScanMode::Continuous.to_wire());
    assert_eq!(status.auth_failures, 0);

    // hot parameter applies mid-scan, cold one is refused
    client.set_config("frame_rate", "30").unwrap();
    match client.set_config("rows", "1024") {
        Err(SdkError::Rejected(StatusCode::Busy)) => {}
        other => panic!("cold param mid-scan should be Busy, got {:?}", other.err()),
    }

    client.stop_scan().unwrap();
    client.set_config("rows", "1024").unwrap();
    let status = client.get_status().unwrap();
    assert_eq!(status.state, 0, "device should be Idle");

    // a client with the wrong key is rejected and counted
    let mut intruder = CommandClient::connect(addr, b"wrong-key").unwrap();
    assert!(intruder.start_scan(None).is_err());
    let status = client.get_status().unwrap();
    assert_eq!(status.auth_failures, 1);

    run.store(false, Ordering::Relaxed);
    server_thread.join().unwrap().unwrap();
}

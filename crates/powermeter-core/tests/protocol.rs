use powermeter_core::protocol::crc::{crc16, crc16_bytes, verify_crc};
use powermeter_core::protocol::{
    build_command, expected_response_length, parse_response, wire_address, FrameError,
    FunctionCode, ModbusMaster, ProtocolError, Response, SerialLink, SerialSettings, Transport,
};
use powermeter_core::simulator::SimulatedMeter;
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;

/// Mock serial link replaying canned replies, one per written frame
struct MockSerial {
    replies: VecDeque<Vec<u8>>,
    pending: VecDeque<u8>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockSerial {
    fn with_replies(replies: Vec<Vec<u8>>) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                replies: replies.into(),
                pending: VecDeque::new(),
                sent: sent.clone(),
            },
            sent,
        )
    }
}

impl SerialLink for MockSerial {
    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        self.sent.lock().unwrap().push(data.to_vec());
        if let Some(reply) = self.replies.pop_front() {
            self.pending.extend(reply);
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

fn framed(bytes: &[u8]) -> Vec<u8> {
    let mut v = bytes.to_vec();
    v.extend_from_slice(&crc16_bytes(bytes));
    v
}

fn mock_master(replies: Vec<Vec<u8>>) -> (ModbusMaster, Arc<Mutex<Vec<Vec<u8>>>>) {
    let (link, sent) = MockSerial::with_replies(replies);
    let mut settings = SerialSettings::for_port("mock");
    settings.timeout_ms = 50;
    (
        ModbusMaster::new(Transport::with_link(settings, Box::new(link)), 1),
        sent,
    )
}

fn simulated_master() -> ModbusMaster {
    let mut settings = SerialSettings::for_port("simulated");
    settings.timeout_ms = 200;
    let link = SimulatedMeter::with_seed(1, 42);
    ModbusMaster::new(Transport::with_link(settings, Box::new(link)), 1)
}

#[test]
fn test_logical_address_44001() {
    let address = wire_address(44001);
    assert_eq!(address, 0x0FA0);

    let frame = build_command(1, FunctionCode::ReadHoldingRegisters, 44001, 22, None).unwrap();
    assert_eq!(frame[2], 0x0F);
    assert_eq!(frame[3], 0xA0);
}

#[test]
fn test_every_built_frame_carries_its_crc() {
    let frames = vec![
        build_command(1, FunctionCode::ReadHoldingRegisters, 44001, 64, None).unwrap(),
        build_command(17, FunctionCode::ReadInputRegisters, 30001, 2, None).unwrap(),
        build_command(247, FunctionCode::WriteSingleRegister, 44603, 1, Some(&[15])).unwrap(),
        build_command(
            3,
            FunctionCode::WriteMultipleRegisters,
            44602,
            2,
            Some(&[3, 15]),
        )
        .unwrap(),
    ];
    for frame in frames {
        let (body, tail) = frame.split_at(frame.len() - 2);
        assert_eq!(crc16(body).to_le_bytes(), [tail[0], tail[1]]);
        assert!(verify_crc(&frame).is_ok());
    }
}

#[test]
fn test_expected_lengths() {
    let read22 = build_command(1, FunctionCode::ReadHoldingRegisters, 44001, 22, None).unwrap();
    assert_eq!(expected_response_length(&read22), 49);

    let write = build_command(1, FunctionCode::WriteSingleRegister, 44603, 1, Some(&[9])).unwrap();
    assert_eq!(expected_response_length(&write), 8);
}

#[test]
fn test_exception_frame_is_never_a_read() {
    let cmd = build_command(1, FunctionCode::ReadHoldingRegisters, 44001, 1, None).unwrap();
    // An exception reply whose code byte would also pass as a byte count
    let reply = framed(&[0x01, 0x83, 0x02]);
    let result = parse_response(&cmd, &reply);
    assert!(matches!(result, Err(ProtocolError::Exception(_))));
}

#[test]
fn test_master_reads_registers() {
    let reply = framed(&[0x01, 0x03, 0x04, 0x00, 0x03, 0x00, 0x0F]);
    let (master, sent) = mock_master(vec![reply]);

    let values = master.read_holding_registers(44602, 2).unwrap();
    assert_eq!(values, vec![3, 15]);

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0][..6], &[0x01, 0x03, 0x11, 0xF9, 0x00, 0x02]);
}

#[test]
fn test_master_surfaces_exception() {
    let (master, _) = mock_master(vec![framed(&[0x01, 0x83, 0x02])]);
    match master.read_register(45000) {
        Err(ProtocolError::Exception(e)) => assert_eq!(e.message(), "Illegal Data Address"),
        other => panic!("expected exception, got {:?}", other),
    }
}

#[test]
fn test_master_rejects_corrupt_reply() {
    let mut reply = framed(&[0x01, 0x03, 0x02, 0x00, 0x03]);
    let last = reply.len() - 1;
    reply[last] ^= 0xFF;
    let (master, _) = mock_master(vec![reply]);
    assert!(matches!(
        master.read_register(44602),
        Err(ProtocolError::Frame(FrameError::CrcMismatch { .. }))
    ));
}

#[test]
fn test_write_register_checks_echo() {
    let good = framed(&[0x01, 0x06, 0x11, 0xFA, 0x00, 0x1E]);
    let wrong_value = framed(&[0x01, 0x06, 0x11, 0xFA, 0x00, 0x1F]);
    let (master, _) = mock_master(vec![good, wrong_value]);

    assert!(master.write_register(44603, 30).is_ok());
    assert!(matches!(
        master.write_register(44603, 30),
        Err(ProtocolError::Frame(FrameError::EchoMismatch { address: 44603 }))
    ));
}

#[test]
fn test_silent_device_times_out() {
    let (master, _) = mock_master(vec![]);
    assert!(matches!(
        master.read_register(44602),
        Err(ProtocolError::Transport(_))
    ));
}

#[test]
fn test_simulated_meter_round_trip() {
    let master = simulated_master();

    assert_eq!(master.read_register(44602).unwrap(), 3);
    assert_eq!(master.read_input_registers(44602, 1).unwrap(), vec![3]);

    master.write_register(44603, 60).unwrap();
    assert_eq!(master.read_register(44603).unwrap(), 60);

    // Only single-register writes are answered
    let write_many =
        build_command(1, FunctionCode::WriteMultipleRegisters, 44603, 1, Some(&[15])).unwrap();
    assert!(matches!(
        parse_response(&write_many, &master.send_raw(&write_many).unwrap()),
        Err(ProtocolError::Exception(e)) if e.code == 1
    ));

    assert!(matches!(
        master.write_register(44001, 1),
        Err(ProtocolError::Exception(_))
    ));
}

#[test]
fn test_raw_command_and_parse() {
    let master = simulated_master();
    let cmd = build_command(1, FunctionCode::ReadHoldingRegisters, 44602, 1, None).unwrap();
    let raw = master.send_raw(&cmd).unwrap();
    match parse_response(&cmd, &raw).unwrap() {
        Response::Registers { values, .. } => assert_eq!(values, vec![3]),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_concurrent_callers_never_interleave() {
    let master = Arc::new(simulated_master());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let master = master.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    assert_eq!(master.read_register(44602).unwrap(), 3);
                    assert_eq!(master.read_holding_registers(44001, 22).unwrap().len(), 22);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let (tx_bytes, rx_bytes, tx_frames, rx_frames) = master.counters();
    assert_eq!(tx_frames, 80);
    assert_eq!(rx_frames, 80);
    assert_eq!(tx_bytes, 80 * 8);
    assert_eq!(rx_bytes, 40 * 7 + 40 * 49);
}

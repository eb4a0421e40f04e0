// Simulated PLC shared by the integration tests: an in-memory device answered
// either directly through `SimConnector` or over loopback TCP.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use a3ot_modbus_access::{
    ConnectionError, Connector, ModbusTransportError, Session, SessionConfig, Transport,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Never answers requests touching this address
    Timeout,
    /// Fails to answer the first request only
    TimeoutOnce,
    /// Drops the connection
    Reset,
    /// Answers with this Modbus exception code
    Exception(u8),
    /// Answers after the given delay (TCP only; a timeout in memory)
    Late(u64),
    /// Answers with protocol id 1 in the MBAP header
    BadProtocolId,
}

pub enum SimReply {
    Pdu(Vec<u8>),
    Silent,
    Reset,
    Late(Vec<u8>, Duration),
    BadProtocol(Vec<u8>),
}

/// Points that exist answer normally; absent points answer exception 0x02.
#[derive(Default)]
pub struct SimDevice {
    pub coils: BTreeMap<u16, bool>,
    pub discrete: BTreeMap<u16, bool>,
    pub registers: BTreeMap<u16, u16>,
    pub faults: BTreeMap<u16, Fault>,
    /// Acknowledge writes with a wrong value
    pub corrupt_write_echo: bool,
    pub requests: Vec<Vec<u8>>,
}

impl SimDevice {
    pub fn with_coils<I: IntoIterator<Item = u16>>(addresses: I) -> Self {
        Self {
            coils: addresses.into_iter().map(|a| (a, false)).collect(),
            ..Self::default()
        }
    }

    pub fn fault(mut self, address: u16, fault: Fault) -> Self {
        self.faults.insert(address, fault);
        self
    }

    pub fn handle(&mut self, pdu: &[u8]) -> SimReply {
        self.requests.push(pdu.to_vec());
        if pdu.len() < 5 {
            return SimReply::Pdu(exception(pdu.first().copied().unwrap_or(0), 0x03));
        }

        let fc = pdu[0];
        let address = be(pdu[1], pdu[2]);
        let quantity = match fc {
            0x05 | 0x06 => 1,
            _ => be(pdu[3], pdu[4]),
        };

        if let Some(reply) = self.apply_fault(fc, address, quantity) {
            return reply;
        }

        let reply = match fc {
            0x01 => read_bits(&self.coils, fc, address, quantity),
            0x02 => read_bits(&self.discrete, fc, address, quantity),
            0x03 => read_words(&self.registers, address, quantity),
            0x05 => self.write_single_coil(pdu, address),
            0x06 => self.write_single_register(pdu, address),
            0x0F => self.write_multiple_coils(pdu, address, quantity),
            0x10 => self.write_multiple_registers(pdu, address, quantity),
            _ => exception(fc, 0x01),
        };
        SimReply::Pdu(reply)
    }

    fn apply_fault(&mut self, fc: u8, address: u16, quantity: u16) -> Option<SimReply> {
        let end = address as u32 + quantity.max(1) as u32;
        let (faulty, fault) = self
            .faults
            .iter()
            .find(|(a, _)| (address as u32..end).contains(&(**a as u32)))
            .map(|(a, f)| (*a, *f))?;

        match fault {
            Fault::Timeout => Some(SimReply::Silent),
            Fault::TimeoutOnce => {
                self.faults.remove(&faulty);
                Some(SimReply::Silent)
            }
            Fault::Reset => Some(SimReply::Reset),
            Fault::Exception(code) => Some(SimReply::Pdu(exception(fc, code))),
            Fault::Late(ms) => {
                self.faults.remove(&faulty);
                let reply = match self.handle_clean(fc, address, quantity) {
                    SimReply::Pdu(pdu) => pdu,
                    _ => exception(fc, 0x04),
                };
                Some(SimReply::Late(reply, Duration::from_millis(ms)))
            }
            Fault::BadProtocolId => match self.handle_clean(fc, address, quantity) {
                SimReply::Pdu(pdu) => Some(SimReply::BadProtocol(pdu)),
                other => Some(other),
            },
        }
    }

    fn handle_clean(&self, fc: u8, address: u16, quantity: u16) -> SimReply {
        match fc {
            0x01 => SimReply::Pdu(read_bits(&self.coils, fc, address, quantity)),
            0x02 => SimReply::Pdu(read_bits(&self.discrete, fc, address, quantity)),
            0x03 => SimReply::Pdu(read_words(&self.registers, address, quantity)),
            _ => SimReply::Pdu(exception(fc, 0x01)),
        }
    }

    fn write_single_coil(&mut self, pdu: &[u8], address: u16) -> Vec<u8> {
        let value = match be(pdu[3], pdu[4]) {
            0xFF00 => true,
            0x0000 => false,
            _ => return exception(0x05, 0x03),
        };
        match self.coils.get_mut(&address) {
            Some(coil) => *coil = value,
            None => return exception(0x05, 0x02),
        }
        let mut echo = pdu[..5].to_vec();
        if self.corrupt_write_echo {
            echo[3] ^= 0xFF;
        }
        echo
    }

    fn write_single_register(&mut self, pdu: &[u8], address: u16) -> Vec<u8> {
        match self.registers.get_mut(&address) {
            Some(register) => *register = be(pdu[3], pdu[4]),
            None => return exception(0x06, 0x02),
        }
        let mut echo = pdu[..5].to_vec();
        if self.corrupt_write_echo {
            echo[4] ^= 0xFF;
        }
        echo
    }

    fn write_multiple_coils(&mut self, pdu: &[u8], address: u16, quantity: u16) -> Vec<u8> {
        let addresses = address..address + quantity;
        if addresses.clone().any(|a| !self.coils.contains_key(&a)) {
            return exception(0x0F, 0x02);
        }
        for (i, a) in addresses.enumerate() {
            let bit = (pdu[6 + i / 8] >> (i % 8)) & 1 == 1;
            self.coils.insert(a, bit);
        }
        pdu[..5].to_vec()
    }

    fn write_multiple_registers(&mut self, pdu: &[u8], address: u16, quantity: u16) -> Vec<u8> {
        let addresses = address..address + quantity;
        if addresses.clone().any(|a| !self.registers.contains_key(&a)) {
            return exception(0x10, 0x02);
        }
        for (i, a) in addresses.enumerate() {
            self.registers.insert(a, be(pdu[6 + i * 2], pdu[7 + i * 2]));
        }
        pdu[..5].to_vec()
    }
}

fn be(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

fn exception(fc: u8, code: u8) -> Vec<u8> {
    vec![fc | 0x80, code]
}

fn read_bits(points: &BTreeMap<u16, bool>, fc: u8, address: u16, quantity: u16) -> Vec<u8> {
    let mut bytes = vec![0u8; (quantity as usize).div_ceil(8)];
    for i in 0..quantity as usize {
        match points.get(&(address + i as u16)) {
            Some(true) => bytes[i / 8] |= 1 << (i % 8),
            Some(false) => {}
            None => return exception(fc, 0x02),
        }
    }
    let mut pdu = vec![fc, bytes.len() as u8];
    pdu.extend(bytes);
    pdu
}

fn read_words(points: &BTreeMap<u16, u16>, address: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = vec![0x03, (quantity * 2) as u8];
    for i in 0..quantity {
        match points.get(&(address + i)) {
            Some(value) => pdu.extend_from_slice(&value.to_be_bytes()),
            None => return exception(0x03, 0x02),
        }
    }
    pdu
}

#[derive(Clone)]
pub struct SimConnector {
    pub device: Arc<Mutex<SimDevice>>,
    pub opened: Arc<AtomicUsize>,
    pub reachable: bool,
}

impl SimConnector {
    pub fn new(device: SimDevice) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            opened: Arc::new(AtomicUsize::new(0)),
            reachable: true,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new(SimDevice::default())
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.device.lock().unwrap().requests.len()
    }
}

pub struct SimTransport {
    device: Arc<Mutex<SimDevice>>,
}

impl Connector for SimConnector {
    type Transport = SimTransport;

    fn connect(&self, config: &SessionConfig) -> Result<SimTransport, ConnectionError> {
        if !self.reachable {
            return Err(ConnectionError::Io {
                addr: config.address(),
                source: io::Error::new(ErrorKind::ConnectionRefused, "simulated PLC is offline"),
            });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(SimTransport {
            device: Arc::clone(&self.device),
        })
    }
}

impl Transport for SimTransport {
    fn exchange(&mut self, pdu: &[u8]) -> Result<Vec<u8>, ModbusTransportError> {
        match self.device.lock().unwrap().handle(pdu) {
            SimReply::Pdu(response) => Ok(response),
            SimReply::Silent | SimReply::Late(..) => Err(ModbusTransportError::Timeout),
            SimReply::Reset => Err(ModbusTransportError::ConnectionClosed),
            SimReply::BadProtocol(_) => Err(ModbusTransportError::InvalidProtocolId(1)),
        }
    }
}

/// A connected in-memory session and a handle to inspect the device.
pub fn sim_session(device: SimDevice) -> (Session<SimConnector>, SimConnector) {
    init_logging();
    let connector = SimConnector::new(device);
    let mut session = Session::with_connector(SessionConfig::default(), connector.clone());
    session.connect().unwrap();
    (session, connector)
}

pub struct TcpSim {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    pub device: Arc<Mutex<SimDevice>>,
}

impl TcpSim {
    pub fn config(&self, timeout: Duration) -> SessionConfig {
        SessionConfig::new(self.addr.ip().to_string(), self.addr.port(), 1).with_timeout(timeout)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

pub fn spawn_tcp_sim(device: SimDevice) -> TcpSim {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let device = Arc::new(Mutex::new(device));

    let server_accepted = Arc::clone(&accepted);
    let server_device = Arc::clone(&device);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            server_accepted.fetch_add(1, Ordering::SeqCst);
            let device = Arc::clone(&server_device);
            thread::spawn(move || serve(stream, device));
        }
    });

    TcpSim {
        addr,
        accepted,
        device,
    }
}

fn serve(mut stream: TcpStream, device: Arc<Mutex<SimDevice>>) {
    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let length = be(header[4], header[5]) as usize;
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        if stream.read_exact(&mut pdu).is_err() {
            return;
        }

        let reply = device.lock().unwrap().handle(&pdu);
        let mut protocol_id = [0x00, 0x00];
        let response = match reply {
            SimReply::Pdu(response) => response,
            SimReply::BadProtocol(response) => {
                protocol_id = [0x00, 0x01];
                response
            }
            SimReply::Silent => continue,
            SimReply::Reset => {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            SimReply::Late(response, delay) => {
                thread::sleep(delay);
                response
            }
        };

        let mut frame = Vec::with_capacity(7 + response.len());
        frame.extend_from_slice(&header[..2]);
        frame.extend_from_slice(&protocol_id);
        frame.extend_from_slice(&((response.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend(response);
        if stream.write_all(&frame).is_err() {
            return;
        }
    }
}

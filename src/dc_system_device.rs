use crate::publisher::Publication;
use std::{
    collections::HashMap,
    future,
    sync::{Arc, Mutex},
};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tracing::{debug, info, warn};

pub const DEVICE_INSTANCE: u16 = 1024;
const CONNECTED: u16 = 1;

// Holding register map of the virtual DC system device
pub const REG_MARKER: u16 = 0;
pub const REG_DEVICE_INSTANCE: u16 = 2;
pub const REG_CONNECTED: u16 = 3;
pub const REG_POWER: u16 = 10;
pub const REG_VOLTAGE: u16 = 12;
pub const REG_CURRENT: u16 = 14;
pub const REG_ENERGY_IN: u16 = 16;
pub const REG_ENERGY_OUT: u16 = 18;
pub const REG_ALARM_LOW_VOLTAGE: u16 = 20;
pub const REG_ALARM_HIGH_VOLTAGE: u16 = 21;
pub const REG_ALARM_LOW_TEMPERATURE: u16 = 22;
pub const REG_ALARM_HIGH_TEMPERATURE: u16 = 23;
pub const REG_CONTRIBUTING_PEERS: u16 = 24;
pub const REG_PUBLICATION_COUNT: u16 = 25;
const REG_LAST: u16 = REG_PUBLICATION_COUNT;

/// "DCSY"
const MARKER: [u16; 2] = [0x4443, 0x5359];

/// Exposes the published DC system values as a Modbus TCP device.
///
/// Values are f32 spread over two registers, high word first. An unknown value
/// is written as NaN so readers can tell it apart from a genuine zero.
#[derive(Clone)]
pub struct DcSystemDevice {
    holding_registers: Arc<Mutex<HashMap<u16, u16>>>,
}

impl tokio_modbus::server::Service for DcSystemDevice {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => self
                .with_registers(|registers| register_read(registers, addr, cnt))
                .map(Response::ReadHoldingRegisters),
            // Input registers mirror the holding registers
            Request::ReadInputRegisters(addr, cnt) => self
                .with_registers(|registers| register_read(registers, addr, cnt))
                .map(Response::ReadInputRegisters),
            _ => {
                debug!("Unsupported function code in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

impl DcSystemDevice {
    /// Creates the device and the channel through which publications reach it.
    pub fn new() -> (Self, Sender<Publication>) {
        let mut holding_registers = HashMap::new();
        for register in 0..=REG_LAST {
            holding_registers.insert(register, 0);
        }
        holding_registers.insert(REG_MARKER, MARKER[0]);
        holding_registers.insert(REG_MARKER + 1, MARKER[1]);
        holding_registers.insert(REG_DEVICE_INSTANCE, DEVICE_INSTANCE);
        holding_registers.insert(REG_CONNECTED, CONNECTED);

        let device = Self {
            holding_registers: Arc::new(Mutex::new(holding_registers)),
        };
        // Nothing has been published yet
        device.write_publication(&Publication::invalid());
        device.set_register(REG_PUBLICATION_COUNT, 0);

        let (tx, rx) = mpsc::channel(32);
        let handler_device = device.clone();
        tokio::spawn(async move {
            handler_device.handle_publications(rx).await;
        });
        (device, tx)
    }

    async fn handle_publications(self, mut publications: Receiver<Publication>) {
        debug!("Starting DC system device update task");
        while let Some(publication) = publications.recv().await {
            self.write_publication(&publication);
        }
        info!("Publication channel closed, DC system device values frozen");
    }

    /// Writes one publication into the register map.
    pub fn write_publication(&self, publication: &Publication) {
        let Ok(mut registers) = self.holding_registers.lock() else {
            warn!("DC system register map poisoned, dropping publication");
            return;
        };
        set_f32(&mut registers, REG_POWER, publication.power);
        set_f32(&mut registers, REG_VOLTAGE, publication.voltage);
        set_f32(&mut registers, REG_CURRENT, publication.current);
        set_f32(&mut registers, REG_ENERGY_IN, publication.energy_in);
        set_f32(&mut registers, REG_ENERGY_OUT, publication.energy_out);

        let alarms = &publication.alarms;
        registers.insert(REG_ALARM_LOW_VOLTAGE, alarms.low_voltage.into());
        registers.insert(REG_ALARM_HIGH_VOLTAGE, alarms.high_voltage.into());
        registers.insert(REG_ALARM_LOW_TEMPERATURE, alarms.low_temperature.into());
        registers.insert(REG_ALARM_HIGH_TEMPERATURE, alarms.high_temperature.into());
        registers.insert(
            REG_CONTRIBUTING_PEERS,
            u16::try_from(publication.contributing_peers).unwrap_or(u16::MAX),
        );
        let count = registers.get(&REG_PUBLICATION_COUNT).copied().unwrap_or(0);
        registers.insert(REG_PUBLICATION_COUNT, count.wrapping_add(1));
    }

    /// Reads a block of registers, as a Modbus client would.
    pub fn read(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        self.with_registers(|registers| register_read(registers, addr, cnt))
    }

    fn set_register(&self, register: u16, value: u16) {
        if let Ok(mut registers) = self.holding_registers.lock() {
            registers.insert(register, value);
        }
    }

    fn with_registers<T>(
        &self,
        f: impl FnOnce(&HashMap<u16, u16>) -> Result<T, ExceptionCode>,
    ) -> Result<T, ExceptionCode> {
        match self.holding_registers.lock() {
            Ok(registers) => f(&registers),
            Err(_) => Err(ExceptionCode::ServerDeviceFailure),
        }
    }
}

/// Serves the device on an already bound listener until the server fails.
pub async fn serve(listener: TcpListener, device: DcSystemDevice) -> anyhow::Result<()> {
    info!("DC system device listening on {}", listener.local_addr()?);
    let server = Server::new(listener);
    let new_service = |_socket_addr| Ok(Some(device.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        warn!("Modbus connection error: {err}");
    };
    server.serve(&on_connected, on_process_error).await?;
    Ok(())
}

/// Encodes an optional value as f32, high word first; unknown becomes NaN.
pub fn encode_f32(value: Option<f64>) -> [u16; 2] {
    let bits = value.map_or(f32::NAN, |v| v as f32).to_bits();
    [(bits >> 16) as u16, (bits & 0xFFFF) as u16]
}

/// Inverse of [`encode_f32`].
pub fn decode_f32(high: u16, low: u16) -> Option<f32> {
    let value = f32::from_bits(((high as u32) << 16) | low as u32);
    (!value.is_nan()).then_some(value)
}

fn set_f32(registers: &mut HashMap<u16, u16>, register_base_number: u16, value: Option<f64>) {
    let [high, low] = encode_f32(value);
    registers.insert(register_base_number, high);
    registers.insert(register_base_number + 1, low);
}

/// Helper function implementing reading registers from a HashMap.
fn register_read(
    registers: &HashMap<u16, u16>,
    addr: u16,
    cnt: u16,
) -> Result<Vec<u16>, ExceptionCode> {
    let mut response_values = vec![0; cnt.into()];
    for i in 0..cnt {
        let reg_addr = addr.checked_add(i).ok_or(ExceptionCode::IllegalDataAddress)?;
        if let Some(r) = registers.get(&reg_addr) {
            response_values[i as usize] = *r;
        } else {
            debug!("Read of unmapped register {reg_addr}/0x{reg_addr:X}");
            return Err(ExceptionCode::IllegalDataAddress);
        }
    }
    Ok(response_values)
}

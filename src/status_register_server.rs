use crate::snapshot::{HistoryPoint, Snapshot, SnapshotHandle};
use std::{
    collections::HashMap,
    future,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::net::TcpListener;
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tracing::{debug, info, warn};

pub const VOLTAGE_REGISTER: u16 = 40000;
pub const SMOKE_REGISTER: u16 = 40002;
pub const ENERGY_REGISTER: u16 = 40004;
pub const IMPACT_REGISTER: u16 = 40006;
pub const MAINTENANCE_REGISTER: u16 = 40008;
pub const MICROGRID_REGISTER: u16 = 40009;
pub const EMERGENCY_REGISTER: u16 = 40010;
pub const ENERGY_HISTORY_LEN_REGISTER: u16 = 40011;
pub const IMPACT_HISTORY_LEN_REGISTER: u16 = 40012;
pub const SEQUENCE_REGISTER: u16 = 40013;
pub const ENERGY_HISTORY_BASE: u16 = 40100;
pub const IMPACT_HISTORY_BASE: u16 = 40200;
/// History points exported per trace (two registers each)
pub const EXPORTED_HISTORY_POINTS: usize = 50;

/// Read-only Modbus view of the latest snapshot for SCADA and HMI panels
#[derive(Clone)]
pub struct StatusRegisterServer {
    holding_registers: Arc<Mutex<HashMap<u16, u16>>>,
}

impl tokio_modbus::server::Service for StatusRegisterServer {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => match self.holding_registers.lock() {
                Ok(registers) => {
                    register_read(&registers, addr, cnt).map(Response::ReadHoldingRegisters)
                }
                Err(_) => Err(ExceptionCode::ServerDeviceFailure),
            },
            _ => {
                debug!("Unimplemented function code in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

impl StatusRegisterServer {
    /// Creates the register map and keeps it in step with `snapshots`
    pub fn new(snapshots: SnapshotHandle) -> Self {
        let holding_registers = Arc::new(Mutex::new(encode_snapshot(&snapshots.current())));
        let handler_holding_registers = holding_registers.clone();
        tokio::spawn(async move {
            Self::handle_snapshot_updates(snapshots, handler_holding_registers).await;
        });
        Self { holding_registers }
    }

    async fn handle_snapshot_updates(
        mut snapshots: SnapshotHandle,
        holding_registers: Arc<Mutex<HashMap<u16, u16>>>,
    ) {
        debug!("Starting status register update task");
        while let Some(snapshot) = snapshots.changed().await {
            let encoded = encode_snapshot(&snapshot);
            match holding_registers.lock() {
                Ok(mut registers) => *registers = encoded,
                Err(_) => {
                    warn!("Status register map poisoned, stopping updates");
                    return;
                }
            }
        }
        debug!("Snapshot feed closed, status registers frozen");
    }

    /// Serves the register map until the listener fails
    pub async fn serve(self, socket_addr: SocketAddr) -> anyhow::Result<()> {
        info!("Starting status register server on {socket_addr}");
        let listener = TcpListener::bind(socket_addr).await?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let server = Server::new(listener);
        let new_service = |_socket_addr| Ok(Some(self.clone()));
        let on_connected = |stream, socket_addr| async move {
            accept_tcp_connection(stream, socket_addr, new_service)
        };
        let on_process_error = |err| {
            warn!("Status register server error: {err}");
        };
        server.serve(&on_connected, on_process_error).await?;
        Ok(())
    }
}

/// Lays a snapshot out as holding registers
pub fn encode_snapshot(snapshot: &Snapshot) -> HashMap<u16, u16> {
    let mut registers = HashMap::new();
    set_f32(&mut registers, VOLTAGE_REGISTER, snapshot.voltage);
    set_f32(&mut registers, SMOKE_REGISTER, snapshot.smoke);
    set_f32(&mut registers, ENERGY_REGISTER, snapshot.energy);
    set_f32(&mut registers, IMPACT_REGISTER, snapshot.impact);
    registers.insert(MAINTENANCE_REGISTER, snapshot.maintenance.register_code());
    registers.insert(MICROGRID_REGISTER, snapshot.microgrid.register_code());
    registers.insert(EMERGENCY_REGISTER, snapshot.emergency.register_code());
    registers.insert(
        ENERGY_HISTORY_LEN_REGISTER,
        exported_len(&snapshot.energy_history),
    );
    registers.insert(
        IMPACT_HISTORY_LEN_REGISTER,
        exported_len(&snapshot.impact_history),
    );
    let sequence = snapshot.sequence as u32;
    registers.insert(SEQUENCE_REGISTER, (sequence >> 16) as u16);
    registers.insert(SEQUENCE_REGISTER + 1, (sequence & 0xFFFF) as u16);
    set_history(&mut registers, ENERGY_HISTORY_BASE, &snapshot.energy_history);
    set_history(&mut registers, IMPACT_HISTORY_BASE, &snapshot.impact_history);
    registers
}

fn exported_len(history: &[HistoryPoint]) -> u16 {
    history.len().min(EXPORTED_HISTORY_POINTS) as u16
}

/// Most recent points, oldest first, with the unused tail of the block zeroed
fn set_history(registers: &mut HashMap<u16, u16>, base: u16, history: &[HistoryPoint]) {
    let skip = history.len().saturating_sub(EXPORTED_HISTORY_POINTS);
    let mut values = history[skip..].iter().map(|point| point.value);
    for slot in 0..EXPORTED_HISTORY_POINTS {
        let value = values.next().unwrap_or(0.0);
        set_f32(registers, base + 2 * slot as u16, value);
    }
}

/// Stores a value as an IEEE f32, high word first
fn set_f32(registers: &mut HashMap<u16, u16>, register_base_number: u16, value: f64) {
    let int_encoding: u32 = (value as f32).to_bits();
    registers.insert(register_base_number, (int_encoding >> 16) as u16);
    registers.insert(register_base_number + 1, (int_encoding & 0xFFFF) as u16);
}

/// Helper function implementing reading registers from a HashMap.
fn register_read(
    registers: &HashMap<u16, u16>,
    addr: u16,
    cnt: u16,
) -> Result<Vec<u16>, ExceptionCode> {
    let mut response_values = vec![0; cnt.into()];
    for i in 0..cnt {
        let reg_addr = addr.wrapping_add(i);
        if let Some(r) = registers.get(&reg_addr) {
            response_values[i as usize] = *r;
        } else {
            debug!("Can't handle read of register {reg_addr}/0x{reg_addr:X}");
            return Err(ExceptionCode::IllegalDataAddress);
        }
    }
    Ok(response_values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{Channel, Reading};
    use crate::snapshot::SnapshotPublisher;
    use crate::state_engine::DerivedStateEngine;
    use chrono::Utc;
    use std::time::Duration;

    fn read_f32(registers: &HashMap<u16, u16>, base: u16) -> f32 {
        let high = registers[&base] as u32;
        let low = registers[&(base + 1)] as u32;
        f32::from_bits((high << 16) | low)
    }

    #[test]
    fn test_encode_default_snapshot() {
        let registers = encode_snapshot(&Snapshot::default());
        assert_eq!(read_f32(&registers, VOLTAGE_REGISTER), 0.0);
        assert_eq!(registers[&MICROGRID_REGISTER], 0);
        assert_eq!(registers[&ENERGY_HISTORY_LEN_REGISTER], 0);
        assert_eq!(read_f32(&registers, ENERGY_HISTORY_BASE + 98), 0.0);
        assert!(!registers.contains_key(&(IMPACT_HISTORY_BASE + 100)));
    }

    #[test]
    fn test_encode_tripped_snapshot() {
        let mut engine = DerivedStateEngine::default();
        engine.apply(&Reading::numeric(Channel::Energy, 95.5, Utc::now()));
        engine.apply(&Reading::numeric(Channel::Voltage, 262.5, Utc::now()));
        let registers = encode_snapshot(&Snapshot::capture(engine.state()));

        assert_eq!(read_f32(&registers, VOLTAGE_REGISTER), 262.5);
        assert_eq!(read_f32(&registers, ENERGY_REGISTER), 95.5);
        assert_eq!(read_f32(&registers, IMPACT_REGISTER), 2.0);
        assert_eq!(registers[&EMERGENCY_REGISTER], 1);
        assert_eq!(registers[&MICROGRID_REGISTER], 1);
        assert_eq!(registers[&MAINTENANCE_REGISTER], 0);
        assert_eq!(registers[&ENERGY_HISTORY_LEN_REGISTER], 2);
        assert_eq!(registers[&(SEQUENCE_REGISTER + 1)], 2);
        assert_eq!(read_f32(&registers, IMPACT_HISTORY_BASE), 0.0);
        assert_eq!(read_f32(&registers, IMPACT_HISTORY_BASE + 2), 1.0);
    }

    #[test]
    fn test_register_read_out_of_map() {
        let registers = encode_snapshot(&Snapshot::default());
        assert_eq!(
            register_read(&registers, VOLTAGE_REGISTER, 2).map(|v| v.len()),
            Ok(2)
        );
        assert_eq!(
            register_read(&registers, 30000, 1),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[tokio::test]
    async fn test_registers_follow_snapshot_updates() {
        let (publisher, handle) = SnapshotPublisher::new(Snapshot::default());
        let server = StatusRegisterServer::new(handle);

        let mut engine = DerivedStateEngine::default();
        engine.apply(&Reading::numeric(Channel::Smoke, 7.0, Utc::now()));
        publisher.publish(engine.state());

        let mut emergency = 0;
        for _ in 0..50 {
            emergency = server.holding_registers.lock().unwrap()[&EMERGENCY_REGISTER];
            if emergency == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(emergency, 1);
    }
}

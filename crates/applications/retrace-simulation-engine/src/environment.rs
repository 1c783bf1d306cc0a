//! SC18 environment reader
//!
//! Cluster topology as JSON: rooms contain racks, racks contain machines,
//! machines reference CPU and memory models by numeric id.

use retrace_core::{EnvironmentError, HostSpec};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct Setup {
    #[serde(default)]
    name: String,
    rooms: Vec<Room>,
}

#[derive(Debug, Deserialize)]
struct Room {
    #[serde(rename = "type", default)]
    _kind: String,
    objects: Vec<RoomObject>,
}

#[derive(Debug, Deserialize)]
struct RoomObject {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    machines: Vec<Machine>,
}

#[derive(Debug, Deserialize)]
struct Machine {
    cpus: Vec<u32>,
    memories: Vec<u32>,
}

/// Known CPU model: (cores, clock speed in MHz)
fn cpu_model(id: u32) -> Result<(u32, u32), EnvironmentError> {
    match id {
        1 => Ok((4, 4100)),
        2 => Ok((2, 3500)),
        other => Err(EnvironmentError::UnknownCpu(other)),
    }
}

/// Known memory model: capacity in MB
fn memory_model(id: u32) -> Result<u64, EnvironmentError> {
    match id {
        1 => Ok(4000),
        other => Err(EnvironmentError::UnknownMemory(other)),
    }
}

/// Read host definitions from an SC18 environment file
pub fn read_environment_file(path: impl AsRef<Path>) -> Result<Vec<HostSpec>, EnvironmentError> {
    let path = path.as_ref();
    let hosts = {
        let file = File::open(path)?;
        read_environment(BufReader::new(file))?
    };
    info!(path = %path.display(), hosts = hosts.len(), "Loaded environment");
    Ok(hosts)
}

/// Parse host definitions from SC18 JSON
pub fn read_environment(reader: impl Read) -> Result<Vec<HostSpec>, EnvironmentError> {
    let setup: Setup = serde_json::from_reader(reader)?;
    let mut hosts = Vec::new();

    for (room_idx, room) in setup.rooms.iter().enumerate() {
        let racks = room.objects.iter().filter(|o| o.kind == "RACK");
        for (rack_idx, rack) in racks.enumerate() {
            for (machine_idx, machine) in rack.machines.iter().enumerate() {
                let mut cores = 0;
                let mut cpu_speed_mhz = 0;
                for &cpu in &machine.cpus {
                    let (count, speed) = cpu_model(cpu)?;
                    cores += count;
                    cpu_speed_mhz = cpu_speed_mhz.max(speed);
                }

                let mut memory_mb = 0;
                for &memory in &machine.memories {
                    memory_mb += memory_model(memory)?;
                }

                hosts.push(HostSpec {
                    id: hosts.len() as u64,
                    name: format!("node-{room_idx}-{rack_idx}-{machine_idx}"),
                    cores,
                    cpu_speed_mhz,
                    memory_mb,
                });
            }
        }
    }

    debug!(setup = %setup.name, hosts = hosts.len(), "Parsed SC18 environment");
    Ok(hosts)
}

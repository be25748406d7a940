//! Launcher/aggregator wire messages
//!
//! Control-plane messages start with a 4-byte little-endian tag:
//!
//! ```text
//! HELLO 0 | JOB 1 | DROP 2 | STOP 3 | TIMEOUT 4 | SIMU-STATUS 5 | SERVER 6
//! ALIVE 7 | DONE 8 | CONNECTION-REQUEST 9 | CONNECTION-RESPONSE 10 | JOB-REQUEST 11
//! ```
//!
//! Strings are a u32 byte length followed by UTF-8, float vectors a u32 count
//! followed by f64 values. Data-plane messages carry no tag:
//!
//! ```text
//! timestep u32 | simulation id u32 | client rank u32 | data size u32 |
//! field name [u8; 128] | data size x f64
//! ```

use crate::error::{ProtocolError, Result};
use crate::types::{JobId, ProcessStatus, SimulationId};

/// Width of the NUL-padded field name in data-plane messages
pub const FIELD_NAME_WIDTH: usize = 128;

/// Control-plane message tags
pub mod tag {
    pub const HELLO: i32 = 0;
    pub const JOB: i32 = 1;
    pub const DROP: i32 = 2;
    pub const STOP: i32 = 3;
    pub const TIMEOUT: i32 = 4;
    pub const SIMU_STATUS: i32 = 5;
    pub const SERVER: i32 = 6;
    pub const ALIVE: i32 = 7;
    pub const DONE: i32 = 8;
    pub const CONNECTION_REQUEST: i32 = 9;
    pub const CONNECTION_RESPONSE: i32 = 10;
    pub const JOB_REQUEST: i32 = 11;
}

/// Aggregator topology handed to a connecting simulation
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    /// Number of aggregator ranks
    pub comm_size: u32,
    pub sobol: bool,
    pub learning: bool,
    pub nb_parameters: u32,
    pub verbosity: u32,
    /// One data-plane address per aggregator rank
    pub data_endpoints: Vec<String>,
}

/// Control-plane message. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Launcher liveness ping
    Hello,
    /// Parameter assignment for one simulation
    Job {
        simulation_id: SimulationId,
        job_id: JobId,
        parameters: Vec<f64>,
    },
    /// Permanently exclude a simulation from completion accounting
    Drop {
        simulation_id: SimulationId,
        job_id: JobId,
    },
    Stop,
    /// A simulation went silent for longer than the simulation timeout
    Timeout { simulation_id: SimulationId },
    SimuStatus {
        simulation_id: SimulationId,
        status: ProcessStatus,
    },
    /// Aggregator is ready to accept connections
    Server { rank: i32, node_name: String },
    /// Aggregator reply to `Hello`
    Alive,
    /// Every expected simulation has finished
    Done { finished: u32 },
    ConnectionRequest {
        simulation_id: SimulationId,
        comm_size: u32,
    },
    ConnectionResponse(ConnectionInfo),
    /// Metadata pull for a simulation the aggregator has not seen yet
    JobRequest { simulation_id: SimulationId },
}

impl Message {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Job { .. } => "JOB",
            Self::Drop { .. } => "DROP",
            Self::Stop => "STOP",
            Self::Timeout { .. } => "TIMEOUT",
            Self::SimuStatus { .. } => "SIMU-STATUS",
            Self::Server { .. } => "SERVER",
            Self::Alive => "ALIVE",
            Self::Done { .. } => "DONE",
            Self::ConnectionRequest { .. } => "CONNECTION-REQUEST",
            Self::ConnectionResponse(_) => "CONNECTION-RESPONSE",
            Self::JobRequest { .. } => "JOB-REQUEST",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        match self {
            Self::Hello => w.put_i32(tag::HELLO),
            Self::Job {
                simulation_id,
                job_id,
                parameters,
            } => {
                w.put_i32(tag::JOB);
                w.put_u32(simulation_id.0);
                w.put_str(job_id.as_str());
                w.put_f64s(parameters);
            }
            Self::Drop {
                simulation_id,
                job_id,
            } => {
                w.put_i32(tag::DROP);
                w.put_u32(simulation_id.0);
                w.put_str(job_id.as_str());
            }
            Self::Stop => w.put_i32(tag::STOP),
            Self::Timeout { simulation_id } => {
                w.put_i32(tag::TIMEOUT);
                w.put_u32(simulation_id.0);
            }
            Self::SimuStatus {
                simulation_id,
                status,
            } => {
                w.put_i32(tag::SIMU_STATUS);
                w.put_u32(simulation_id.0);
                w.put_i32(status.code());
            }
            Self::Server { rank, node_name } => {
                w.put_i32(tag::SERVER);
                w.put_i32(*rank);
                w.put_str(node_name);
            }
            Self::Alive => w.put_i32(tag::ALIVE),
            Self::Done { finished } => {
                w.put_i32(tag::DONE);
                w.put_u32(*finished);
            }
            Self::ConnectionRequest {
                simulation_id,
                comm_size,
            } => {
                w.put_i32(tag::CONNECTION_REQUEST);
                w.put_u32(simulation_id.0);
                w.put_u32(*comm_size);
            }
            Self::ConnectionResponse(info) => {
                w.put_i32(tag::CONNECTION_RESPONSE);
                w.put_u32(info.comm_size);
                w.put_u32(info.sobol as u32);
                w.put_u32(info.learning as u32);
                w.put_u32(info.nb_parameters);
                w.put_u32(info.verbosity);
                w.put_u32(info.data_endpoints.len() as u32);
                for endpoint in &info.data_endpoints {
                    w.put_str(endpoint);
                }
            }
            Self::JobRequest { simulation_id } => {
                w.put_i32(tag::JOB_REQUEST);
                w.put_u32(simulation_id.0);
            }
        }
        w.0
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let message = match r.get_i32()? {
            tag::HELLO => Self::Hello,
            tag::JOB => Self::Job {
                simulation_id: SimulationId(r.get_u32()?),
                job_id: JobId(r.get_str()?),
                parameters: r.get_f64s()?,
            },
            tag::DROP => Self::Drop {
                simulation_id: SimulationId(r.get_u32()?),
                job_id: JobId(r.get_str()?),
            },
            tag::STOP => Self::Stop,
            tag::TIMEOUT => Self::Timeout {
                simulation_id: SimulationId(r.get_u32()?),
            },
            tag::SIMU_STATUS => Self::SimuStatus {
                simulation_id: SimulationId(r.get_u32()?),
                status: ProcessStatus::from_code(r.get_i32()?)?,
            },
            tag::SERVER => Self::Server {
                rank: r.get_i32()?,
                node_name: r.get_str()?,
            },
            tag::ALIVE => Self::Alive,
            tag::DONE => Self::Done {
                finished: r.get_u32()?,
            },
            tag::CONNECTION_REQUEST => Self::ConnectionRequest {
                simulation_id: SimulationId(r.get_u32()?),
                comm_size: r.get_u32()?,
            },
            tag::CONNECTION_RESPONSE => {
                let comm_size = r.get_u32()?;
                let sobol = r.get_u32()? != 0;
                let learning = r.get_u32()? != 0;
                let nb_parameters = r.get_u32()?;
                let verbosity = r.get_u32()?;
                let count = r.get_u32()? as usize;
                let mut data_endpoints = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    data_endpoints.push(r.get_str()?);
                }
                Self::ConnectionResponse(ConnectionInfo {
                    comm_size,
                    sobol,
                    learning,
                    nb_parameters,
                    verbosity,
                    data_endpoints,
                })
            }
            tag::JOB_REQUEST => Self::JobRequest {
                simulation_id: SimulationId(r.get_u32()?),
            },
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(message)
    }
}

/// One timestep of one field from one simulation rank
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub timestep: u32,
    pub simulation_id: SimulationId,
    pub client_rank: u32,
    pub field: String,
    pub data: Vec<f64>,
}

impl DataMessage {
    pub fn new(
        simulation_id: SimulationId,
        field: impl Into<String>,
        timestep: u32,
        data: Vec<f64>,
    ) -> Self {
        Self {
            timestep,
            simulation_id,
            client_rank: 0,
            field: field.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.field.as_bytes();
        if name.len() > FIELD_NAME_WIDTH {
            return Err(ProtocolError::FieldNameTooLong(name.len()));
        }

        let mut w = Writer::default();
        w.put_u32(self.timestep);
        w.put_u32(self.simulation_id.0);
        w.put_u32(self.client_rank);
        w.put_u32(self.data.len() as u32);
        let mut padded = [0u8; FIELD_NAME_WIDTH];
        padded[..name.len()].copy_from_slice(name);
        w.0.extend_from_slice(&padded);
        for value in &self.data {
            w.put_f64(*value);
        }
        Ok(w.0)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let timestep = r.get_u32()?;
        let simulation_id = SimulationId(r.get_u32()?);
        let client_rank = r.get_u32()?;
        let size = r.get_u32()? as usize;
        let raw = r.take(FIELD_NAME_WIDTH)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(FIELD_NAME_WIDTH);
        let field = String::from_utf8(raw[..end].to_vec())?;
        let mut data = Vec::with_capacity(size.min(r.remaining() / 8));
        for _ in 0..size {
            data.push(r.get_f64()?);
        }
        Ok(Self {
            timestep,
            simulation_id,
            client_rank,
            field,
            data,
        })
    }
}

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn put_i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f64(&mut self, v: f64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.0.extend_from_slice(s.as_bytes());
    }

    fn put_f64s(&mut self, values: &[f64]) {
        self.put_u32(values.len() as u32);
        for v in values {
            self.put_f64(*v);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.get_array()?))
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.get_array()?))
    }

    fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.get_array()?))
    }

    fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        Ok(String::from_utf8(self.take(len)?.to_vec())?)
    }

    fn get_f64s(&mut self) -> Result<Vec<f64>> {
        let count = self.get_u32()? as usize;
        let mut values = Vec::with_capacity(count.min(self.remaining() / 8));
        for _ in 0..count {
            values.push(self.get_f64()?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_prefix() {
        let bytes = Message::Stop.encode();
        assert_eq!(bytes, tag::STOP.to_le_bytes().to_vec());

        let bytes = Message::Timeout {
            simulation_id: SimulationId(7),
        }
        .encode();
        assert_eq!(&bytes[..4], &tag::TIMEOUT.to_le_bytes());
        assert_eq!(&bytes[4..8], &7u32.to_le_bytes());
    }

    #[test]
    fn test_job_message_layout() {
        let message = Message::Job {
            simulation_id: SimulationId(3),
            job_id: JobId::new("4242"),
            parameters: vec![0.25, 0.75],
        };
        let bytes = message.encode();
        // tag + id + (len + "4242") + (count + 2 floats)
        assert_eq!(bytes.len(), 4 + 4 + 4 + 4 + 4 + 16);
        assert_eq!(Message::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_connection_response_decode() {
        let message = Message::ConnectionResponse(ConnectionInfo {
            comm_size: 2,
            sobol: true,
            learning: false,
            nb_parameters: 3,
            verbosity: 2,
            data_endpoints: vec!["tcp://node1:5000".into(), "tcp://node2:5000".into()],
        });
        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let bytes = 99i32.to_le_bytes();
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::UnknownTag(99))
        ));
    }

    #[test]
    fn test_truncated_message_rejected() {
        let mut bytes = Message::Drop {
            simulation_id: SimulationId(1),
            job_id: JobId::new("abc"),
        }
        .encode();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_data_message_fixed_width_field() {
        let message = DataMessage::new(SimulationId(12), "temperature", 4, vec![1.0, 2.0, 3.0]);
        let bytes = message.encode().unwrap();
        assert_eq!(bytes.len(), 16 + FIELD_NAME_WIDTH + 3 * 8);
        assert_eq!(DataMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_data_message_field_too_long() {
        let message = DataMessage::new(SimulationId(0), "x".repeat(FIELD_NAME_WIDTH + 1), 0, vec![]);
        assert!(matches!(
            message.encode(),
            Err(ProtocolError::FieldNameTooLong(_))
        ));
    }
}

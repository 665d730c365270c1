//! Message model and codec.
//!
//! A frame payload is a sequence of messages. Each message is a fixed
//! header (info bits, result code, generation, record TTL, field and op
//! counts) followed by length-prefixed fields and ops. The same model is
//! used for incoming scan requests, outgoing record / value responses,
//! partition-done markers, the terminal fin, and the internal message
//! templates carried by background scan origins.

use bytes::{BufMut, BytesMut};

use crate::job::ResultCode;
use crate::proto;
use crate::record::{Particle, Record};

pub const INFO1_READ: u8 = 0x01;
pub const INFO1_GET_ALL: u8 = 0x02;
pub const INFO1_GET_NO_BINS: u8 = 0x20;

pub const INFO2_WRITE: u8 = 0x01;
pub const INFO2_DELETE: u8 = 0x02;
pub const INFO2_DURABLE_DELETE: u8 = 0x10;

pub const INFO3_LAST: u8 = 0x01;
pub const INFO3_PARTITION_DONE: u8 = 0x02;
pub const INFO3_UPDATE_ONLY: u8 = 0x08;
pub const INFO3_REPLACE_ONLY: u8 = 0x20;

const MSG_HEADER_SZ: usize = 16;

/// Message field types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Namespace = 0,
    Set = 1,
    ScanOptions = 2,
    PidArray = 3,
    DigestArray = 4,
    SampleMax = 5,
    RecsPerSec = 6,
    SocketTimeout = 7,
    Predicate = 8,
    UdfOp = 9,
    UdfModule = 10,
    UdfFunction = 11,
    UdfArgList = 12,
    Trid = 13,
    Pid = 14,
    Digest = 15,
}

impl FieldType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => FieldType::Namespace,
            1 => FieldType::Set,
            2 => FieldType::ScanOptions,
            3 => FieldType::PidArray,
            4 => FieldType::DigestArray,
            5 => FieldType::SampleMax,
            6 => FieldType::RecsPerSec,
            7 => FieldType::SocketTimeout,
            8 => FieldType::Predicate,
            9 => FieldType::UdfOp,
            10 => FieldType::UdfModule,
            11 => FieldType::UdfFunction,
            12 => FieldType::UdfArgList,
            13 => FieldType::Trid,
            14 => FieldType::Pid,
            15 => FieldType::Digest,
            _ => return None,
        })
    }
}

/// UDF operation selector carried in the `UdfOp` field.
pub const UDF_OP_AGGREGATE: u8 = 1;
pub const UDF_OP_BACKGROUND: u8 = 2;

#[derive(Clone, Debug, PartialEq)]
pub struct MsgField {
    pub ftype: FieldType,
    pub data: Vec<u8>,
}

impl MsgField {
    pub fn bytes(ftype: FieldType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            ftype,
            data: data.into(),
        }
    }

    pub fn str(ftype: FieldType, value: &str) -> Self {
        Self::bytes(ftype, value.as_bytes().to_vec())
    }

    pub fn u8(ftype: FieldType, value: u8) -> Self {
        Self::bytes(ftype, vec![value])
    }

    pub fn u32_be(ftype: FieldType, value: u32) -> Self {
        Self::bytes(ftype, value.to_be_bytes().to_vec())
    }

    pub fn u64_be(ftype: FieldType, value: u64) -> Self {
        Self::bytes(ftype, value.to_be_bytes().to_vec())
    }
}

/// Op codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Read = 1,
    Write = 2,
    Incr = 5,
}

impl OpType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => OpType::Read,
            2 => OpType::Write,
            5 => OpType::Incr,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MsgOp {
    pub op: OpType,
    pub bin_name: String,
    pub particle: Option<Particle>,
}

impl MsgOp {
    pub fn read(bin_name: impl Into<String>) -> Self {
        Self {
            op: OpType::Read,
            bin_name: bin_name.into(),
            particle: None,
        }
    }

    pub fn write(bin_name: impl Into<String>, value: Particle) -> Self {
        Self {
            op: OpType::Write,
            bin_name: bin_name.into(),
            particle: Some(value),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Msg {
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub result_code: u8,
    pub generation: u32,
    pub record_ttl: u32,
    pub fields: Vec<MsgField>,
    pub ops: Vec<MsgOp>,
}

impl Msg {
    pub fn field(&self, ftype: FieldType) -> Option<&MsgField> {
        self.fields.iter().find(|f| f.ftype == ftype)
    }

    pub fn has_field(&self, ftype: FieldType) -> bool {
        self.field(ftype).is_some()
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.info1);
        out.put_u8(self.info2);
        out.put_u8(self.info3);
        out.put_u8(self.result_code);
        out.put_u32(self.generation);
        out.put_u32(self.record_ttl);
        out.put_u16(self.fields.len() as u16);
        out.put_u16(self.ops.len() as u16);
        for field in &self.fields {
            out.put_u32((1 + field.data.len()) as u32);
            out.put_u8(field.ftype as u8);
            out.put_slice(&field.data);
        }
        for op in &self.ops {
            let value_len = op.particle.as_ref().map_or(0, Particle::encoded_len);
            out.put_u32((3 + op.bin_name.len() + value_len) as u32);
            out.put_u8(op.op as u8);
            out.put_u8(op.particle.as_ref().map_or(0, Particle::wire_type));
            out.put_u8(op.bin_name.len() as u8);
            out.put_slice(op.bin_name.as_bytes());
            if let Some(particle) = &op.particle {
                particle.encode_value(out);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.to_vec()
    }

    /// Decode one message; returns it and the number of bytes consumed.
    pub fn decode_one(data: &[u8]) -> anyhow::Result<(Msg, usize)> {
        anyhow::ensure!(data.len() >= MSG_HEADER_SZ, "short msg header");
        let mut msg = Msg {
            info1: data[0],
            info2: data[1],
            info3: data[2],
            result_code: data[3],
            generation: be_u32_at(data, 4),
            record_ttl: be_u32_at(data, 8),
            ..Msg::default()
        };
        let n_fields = be_u16_at(data, 12) as usize;
        let n_ops = be_u16_at(data, 14) as usize;
        let mut offset = MSG_HEADER_SZ;

        for _ in 0..n_fields {
            let sz = read_u32(data, &mut offset)? as usize;
            anyhow::ensure!(sz >= 1, "empty msg field");
            anyhow::ensure!(offset + sz <= data.len(), "short msg field");
            let ftype = FieldType::from_u8(data[offset])
                .ok_or_else(|| anyhow::anyhow!("unknown field type {}", data[offset]))?;
            msg.fields
                .push(MsgField::bytes(ftype, data[offset + 1..offset + sz].to_vec()));
            offset += sz;
        }

        for _ in 0..n_ops {
            let sz = read_u32(data, &mut offset)? as usize;
            anyhow::ensure!(sz >= 3, "short msg op");
            anyhow::ensure!(offset + sz <= data.len(), "short msg op");
            let op = OpType::from_u8(data[offset])
                .ok_or_else(|| anyhow::anyhow!("unknown op {}", data[offset]))?;
            let wire_type = data[offset + 1];
            let name_len = data[offset + 2] as usize;
            anyhow::ensure!(3 + name_len <= sz, "op name overruns op");
            let name_start = offset + 3;
            let bin_name = String::from_utf8(data[name_start..name_start + name_len].to_vec())?;
            let value = &data[name_start + name_len..offset + sz];
            let particle = if wire_type == 0 {
                anyhow::ensure!(value.is_empty(), "value bytes on null particle");
                None
            } else {
                Some(Particle::decode(wire_type, value)?)
            };
            msg.ops.push(MsgOp {
                op,
                bin_name,
                particle,
            });
            offset += sz;
        }

        Ok((msg, offset))
    }

    /// Decode a full frame payload into its message sequence.
    pub fn decode_all(mut data: &[u8]) -> anyhow::Result<Vec<Msg>> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let (msg, used) = Msg::decode_one(data)?;
            out.push(msg);
            data = &data[used..];
        }
        Ok(out)
    }
}

/// Internal message template for background sub-transactions.
pub fn make_internal(ns_name: &str, info2: u8, info3: u8, ops: Vec<MsgOp>) -> Msg {
    Msg {
        info2,
        info3,
        fields: vec![MsgField::str(FieldType::Namespace, ns_name)],
        ops,
        ..Msg::default()
    }
}

/// Append a record response. `bin_names` of `None` selects all bins.
pub fn make_record_response(
    bb: &mut proto::ChunkBuffer,
    r: &Record,
    set_name: Option<&str>,
    no_bin_data: bool,
    bin_names: Option<&[String]>,
) {
    let mut msg = Msg {
        info1: if no_bin_data { INFO1_GET_NO_BINS } else { 0 },
        result_code: ResultCode::Ok as u8,
        generation: r.generation,
        record_ttl: r.void_time_s as u32,
        fields: vec![MsgField::bytes(FieldType::Digest, r.digest.0.to_vec())],
        ..Msg::default()
    };
    if let Some(set_name) = set_name.filter(|s| !s.is_empty()) {
        msg.fields.push(MsgField::str(FieldType::Set, set_name));
    }
    if !no_bin_data {
        for bin in &r.bins {
            if let Some(names) = bin_names {
                if !names.iter().any(|n| n == &bin.name) {
                    continue;
                }
            }
            msg.ops.push(MsgOp {
                op: OpType::Read,
                bin_name: bin.name.clone(),
                particle: Some(bin.value.clone()),
            });
        }
    }
    msg.encode(bb.out());
}

/// Append an aggregation value response.
pub fn make_val_response(bb: &mut proto::ChunkBuffer, val: &Particle, success: bool) {
    let msg = Msg {
        result_code: if success {
            ResultCode::Ok as u8
        } else {
            ResultCode::Unknown as u8
        },
        ops: vec![MsgOp {
            op: OpType::Read,
            bin_name: if success { "SUCCESS" } else { "FAILURE" }.to_string(),
            particle: Some(val.clone()),
        }],
        ..Msg::default()
    };
    msg.encode(bb.out());
}

/// Append a partition-done marker.
pub fn make_pid_done(bb: &mut proto::ChunkBuffer, pid: u32, result: ResultCode) {
    let msg = Msg {
        info3: INFO3_PARTITION_DONE,
        result_code: result as u8,
        fields: vec![MsgField::u32_be(FieldType::Pid, pid)],
        ..Msg::default()
    };
    msg.encode(bb.out());
}

/// Build a complete fin frame bearing the job's terminal result.
pub fn fin_frame(result: ResultCode) -> Vec<u8> {
    let msg = Msg {
        info3: INFO3_LAST,
        result_code: result as u8,
        ..Msg::default()
    };
    proto::frame_payload(&msg.to_bytes())
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let out = be_u32_at(data, *offset);
    *offset += 4;
    Ok(out)
}

fn be_u16_at(data: &[u8], at: usize) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&data[at..at + 2]);
    u16::from_be_bytes(buf)
}

fn be_u32_at(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_be_bytes(buf)
}

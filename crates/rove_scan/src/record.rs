//! Records, digests, and bin particles.
//!
//! A record is keyed by a fixed-size digest; the digest's low bits select
//! the partition it lives in. Records carry metadata (generation,
//! last-update time, void time, tombstone state) plus a bin vector. The
//! scan core only ever distinguishes live / tombstone / doomed states.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

pub const DIGEST_SZ: usize = 20;
/// Fixed partition count per namespace.
pub const N_PARTITIONS: u32 = 4096;
/// Upper bound on bins per record.
pub const RECORD_MAX_BINS: usize = 256;
/// Maximum set name length.
pub const SET_NAME_MAX: usize = 63;
/// Maximum bin name length.
pub const BIN_NAME_MAX: usize = 15;

/// Record key digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; DIGEST_SZ]);

impl Digest {
    /// Partition id from the digest's first two little-endian bytes.
    pub fn partition_id(&self) -> u32 {
        (u16::from_le_bytes([self.0[0], self.0[1]]) as u32) & (N_PARTITIONS - 1)
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() != DIGEST_SZ {
            return None;
        }
        let mut out = [0u8; DIGEST_SZ];
        out.copy_from_slice(data);
        Some(Self(out))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..")
    }
}

/// Bin value particle.
#[derive(Clone, Debug, PartialEq)]
pub enum Particle {
    Int(i64),
    Str(String),
    Blob(Vec<u8>),
}

pub const PARTICLE_INT: u8 = 1;
pub const PARTICLE_STR: u8 = 3;
pub const PARTICLE_BLOB: u8 = 4;

impl Particle {
    pub fn wire_type(&self) -> u8 {
        match self {
            Particle::Int(_) => PARTICLE_INT,
            Particle::Str(_) => PARTICLE_STR,
            Particle::Blob(_) => PARTICLE_BLOB,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Particle::Int(_) => 8,
            Particle::Str(s) => s.len(),
            Particle::Blob(b) => b.len(),
        }
    }

    pub fn encode_value(&self, out: &mut BytesMut) {
        match self {
            Particle::Int(v) => out.put_slice(&v.to_be_bytes()),
            Particle::Str(s) => out.put_slice(s.as_bytes()),
            Particle::Blob(b) => out.put_slice(b),
        }
    }

    pub fn decode(wire_type: u8, data: &[u8]) -> anyhow::Result<Self> {
        match wire_type {
            PARTICLE_INT => {
                anyhow::ensure!(data.len() == 8, "int particle size {}", data.len());
                let mut buf = [0u8; 8];
                buf.copy_from_slice(data);
                Ok(Particle::Int(i64::from_be_bytes(buf)))
            }
            PARTICLE_STR => Ok(Particle::Str(String::from_utf8(data.to_vec())?)),
            PARTICLE_BLOB => Ok(Particle::Blob(data.to_vec())),
            other => anyhow::bail!("unknown particle type {other}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Bin {
    pub name: String,
    pub value: Particle,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: Particle) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One record in a partition's index tree.
#[derive(Clone, Debug)]
pub struct Record {
    pub digest: Digest,
    pub set_id: u16,
    pub generation: u32,
    pub last_update_ms: u64,
    /// Expiration, epoch seconds. Zero means the record never expires.
    pub void_time_s: u64,
    pub tombstone: bool,
    /// Storage failure injection: bins cannot be loaded.
    pub unreadable: bool,
    pub bins: Vec<Bin>,
}

impl Record {
    pub fn new(digest: Digest, set_id: u16) -> Self {
        Self {
            digest,
            set_id,
            generation: 1,
            last_update_ms: now_ms(),
            void_time_s: 0,
            tombstone: false,
            unreadable: false,
            bins: Vec::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        !self.tombstone
    }

    /// Expired or pending-delete records are never returned.
    pub fn is_doomed(&self) -> bool {
        self.void_time_s != 0 && self.void_time_s <= now_s()
    }

    pub fn bin(&self, name: &str) -> Option<&Bin> {
        self.bins.iter().find(|b| b.name == name)
    }

    /// Insert or overwrite a bin, enforcing the per-record bin cap.
    pub fn write_bin(&mut self, name: &str, value: Particle) -> anyhow::Result<()> {
        if let Some(bin) = self.bins.iter_mut().find(|b| b.name == name) {
            bin.value = value;
            return Ok(());
        }
        anyhow::ensure!(
            self.bins.len() < RECORD_MAX_BINS,
            "record has {} bins already",
            self.bins.len()
        );
        self.bins.push(Bin::new(name, value));
        Ok(())
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_with_prefix(b0: u8, b1: u8) -> Digest {
        let mut d = [7u8; DIGEST_SZ];
        d[0] = b0;
        d[1] = b1;
        Digest(d)
    }

    #[test]
    fn partition_id_uses_low_bits() {
        assert_eq!(digest_with_prefix(0, 0).partition_id(), 0);
        assert_eq!(digest_with_prefix(1, 0).partition_id(), 1);
        assert_eq!(digest_with_prefix(0xff, 0x0f).partition_id(), 4095);
        // Bits above the partition mask are ignored.
        assert_eq!(digest_with_prefix(0xff, 0xff).partition_id(), 4095);
    }

    #[test]
    fn doomed_needs_nonzero_void_time() {
        let mut r = Record::new(digest_with_prefix(0, 0), 0);
        assert!(!r.is_doomed());
        r.void_time_s = 1;
        assert!(r.is_doomed());
        r.void_time_s = now_s() + 1000;
        assert!(!r.is_doomed());
    }

    #[test]
    fn write_bin_overwrites_and_caps() {
        let mut r = Record::new(digest_with_prefix(0, 0), 0);
        r.write_bin("a", Particle::Int(1)).unwrap();
        r.write_bin("a", Particle::Int(2)).unwrap();
        assert_eq!(r.bins.len(), 1);
        assert_eq!(r.bin("a").unwrap().value, Particle::Int(2));

        for i in 1..RECORD_MAX_BINS {
            r.write_bin(&format!("b{i}"), Particle::Int(0)).unwrap();
        }
        assert!(r.write_bin("overflow", Particle::Int(0)).is_err());
    }

    #[test]
    fn particle_codec_round_trip() {
        for p in [
            Particle::Int(-42),
            Particle::Str("abc".to_string()),
            Particle::Blob(vec![1, 2, 3]),
        ] {
            let mut buf = BytesMut::new();
            p.encode_value(&mut buf);
            let back = Particle::decode(p.wire_type(), &buf).unwrap();
            assert_eq!(back, p);
        }
    }
}

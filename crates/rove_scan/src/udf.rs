//! UDF definitions and the per-namespace function registry.
//!
//! The server registers named functions ahead of time: aggregation
//! functions fold a slice's records into emitted values, record writers
//! mutate a single record inside an internal write sub-transaction.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::msg::{FieldType, Msg};
use crate::record::{Bin, Digest, Record};

/// UDF call target decoded from the client message.
#[derive(Clone, Debug, PartialEq)]
pub struct UdfDef {
    pub module: String,
    pub function: String,
    pub args: Vec<u8>,
}

impl UdfDef {
    /// Decode module/function (required) and the optional arg list.
    pub fn from_msg(msg: &Msg) -> Option<Self> {
        let module = msg.field(FieldType::UdfModule)?;
        let function = msg.field(FieldType::UdfFunction)?;
        Some(Self {
            module: String::from_utf8(module.data.clone()).ok()?,
            function: String::from_utf8(function.data.clone()).ok()?,
            args: msg
                .field(FieldType::UdfArgList)
                .map(|f| f.data.clone())
                .unwrap_or_default(),
        })
    }

    fn key(&self) -> String {
        format!("{}:{}", self.module, self.function)
    }
}

/// Read-only view of a record handed to aggregation functions.
#[derive(Clone, Debug)]
pub struct RecordView {
    pub digest: Digest,
    pub set_id: u16,
    pub generation: u32,
    pub last_update_ms: u64,
    pub bins: Vec<Bin>,
}

impl RecordView {
    pub fn of(r: &Record) -> Self {
        Self {
            digest: r.digest,
            set_id: r.set_id,
            generation: r.generation,
            last_update_ms: r.last_update_ms,
            bins: r.bins.clone(),
        }
    }

    pub fn bin(&self, name: &str) -> Option<&Bin> {
        self.bins.iter().find(|b| b.name == name)
    }
}

/// Aggregation function: fold records, emit values through the output
/// stream. The emitter returns `false` when the stream is closed.
pub type AggrFn = Arc<
    dyn Fn(&[RecordView], &mut dyn FnMut(crate::record::Particle) -> bool) -> Result<(), String>
        + Send
        + Sync,
>;

/// Record writer applied by a background sub-transaction.
pub type WriteFn = Arc<dyn Fn(&mut Record) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
pub struct UdfRegistry {
    aggregations: RwLock<HashMap<String, AggrFn>>,
    writers: RwLock<HashMap<String, WriteFn>>,
}

impl UdfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_aggregation(&self, module: &str, function: &str, f: AggrFn) {
        if let Ok(mut map) = self.aggregations.write() {
            map.insert(format!("{module}:{function}"), f);
        }
    }

    pub fn aggregation(&self, def: &UdfDef) -> Option<AggrFn> {
        self.aggregations.read().ok()?.get(&def.key()).cloned()
    }

    pub fn register_writer(&self, module: &str, function: &str, f: WriteFn) {
        if let Ok(mut map) = self.writers.write() {
            map.insert(format!("{module}:{function}"), f);
        }
    }

    pub fn writer(&self, def: &UdfDef) -> Option<WriteFn> {
        self.writers.read().ok()?.get(&def.key()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::MsgField;
    use crate::record::Particle;

    #[test]
    fn def_requires_module_and_function() {
        let mut msg = Msg::default();
        assert!(UdfDef::from_msg(&msg).is_none());

        msg.fields.push(MsgField::str(FieldType::UdfModule, "m"));
        assert!(UdfDef::from_msg(&msg).is_none());

        msg.fields.push(MsgField::str(FieldType::UdfFunction, "f"));
        let def = UdfDef::from_msg(&msg).unwrap();
        assert_eq!(def.module, "m");
        assert_eq!(def.function, "f");
        assert!(def.args.is_empty());
    }

    #[test]
    fn registry_resolves_by_module_and_function() {
        let registry = UdfRegistry::new();
        registry.register_aggregation(
            "stats",
            "count",
            Arc::new(|records, emit| {
                emit(Particle::Int(records.len() as i64));
                Ok(())
            }),
        );

        let hit = UdfDef {
            module: "stats".into(),
            function: "count".into(),
            args: Vec::new(),
        };
        assert!(registry.aggregation(&hit).is_some());

        let miss = UdfDef {
            module: "stats".into(),
            function: "sum".into(),
            args: Vec::new(),
        };
        assert!(registry.aggregation(&miss).is_none());
        assert!(registry.writer(&hit).is_none());
    }
}

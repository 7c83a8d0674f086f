//! Typed projection of decoded values into the parcel envelope and bodies.
//!
//! A parcel envelope may carry the keepalive ids `ka` and `kk` and at most one
//! body, keyed `md` (message data), `ma` (message ack) or `lc` (last-contact
//! gossip). A parcel with only keepalive ids and no body is valid.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::util::clock::Timestamp;
use crate::util::sid::Sid;
use crate::wire::value::{self, DecodeError, Value};

/// The type for keepalive tokens
pub type KeepaliveId = u32;

/// The type for message tokens
pub type MsgId = u32;

/// The type for sequence numbers
pub type SeqNum = u32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("parcel is not a dictionary")]
    NotADict,
    #[error("more than one body key in the envelope")]
    MultipleBodies,
    #[error("unknown envelope key {0:?}")]
    UnknownEnvelopeKey(String),
    #[error("unknown field {0:?} in a parcel body")]
    UnknownBodyField(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong kind")]
    WrongKind(&'static str),
    #[error("unknown message tag {0:?}")]
    UnknownMessageTag(String),
    #[error("integer field `{0}` out of range")]
    OutOfRange(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Whether unknown envelope keys are rejected (the default) or ignored for
///  forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaMode {
    #[default]
    Strict,
    Lenient,
}

/// Parcels are the basic unit of communication between nodes in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
    pub ka_rq: Option<KeepaliveId>,
    pub ka_ok: Option<KeepaliveId>,
    pub body: ParcelBody,
}

impl Parcel {
    pub fn decode(buf: &[u8], mode: SchemaMode) -> Result<Parcel, WireError> {
        let value = value::decode(buf)?;
        Ok(Parcel::from_value(value, mode)?)
    }

    pub fn from_value(v: Value, mode: SchemaMode) -> Result<Parcel, SchemaError> {
        let mut map = v.into_dict().ok_or(SchemaError::NotADict)?;

        let ka_rq = take_opt_u32(&mut map, "ka")?;
        let ka_ok = take_opt_u32(&mut map, "kk")?;

        let mut body = ParcelBody::Missing;
        for key in [b"md" as &[u8], b"ma", b"lc"] {
            if let Some(raw) = map.remove(key) {
                if !matches!(body, ParcelBody::Missing) {
                    return Err(SchemaError::MultipleBodies);
                }
                body = match key {
                    b"md" => ParcelBody::MsgData(MsgData::from_value(raw)?),
                    b"ma" => ParcelBody::MsgAck(MsgAck::from_value(raw)?),
                    _ => ParcelBody::LcGossip(LcGossip::from_value(raw)?),
                };
            }
        }

        if mode == SchemaMode::Strict {
            if let Some(key) = map.keys().next() {
                return Err(SchemaError::UnknownEnvelopeKey(lossy(key)));
            }
        }

        Ok(Parcel { ka_rq, ka_ok, body })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        Value::from(self.clone()).to_bytes()
    }
}

impl From<Parcel> for Value {
    fn from(p: Parcel) -> Value {
        let mut map = BTreeMap::new();

        if let Some(ka) = p.ka_rq {
            map.insert(b"ka".to_vec(), Value::Int(ka as i64));
        }
        if let Some(kk) = p.ka_ok {
            map.insert(b"kk".to_vec(), Value::Int(kk as i64));
        }

        match p.body {
            ParcelBody::Missing => {}
            ParcelBody::MsgData(md) => {
                map.insert(b"md".to_vec(), md.into());
            }
            ParcelBody::MsgAck(ma) => {
                map.insert(b"ma".to_vec(), ma.into());
            }
            ParcelBody::LcGossip(lc) => {
                map.insert(b"lc".to_vec(), lc.into());
            }
        }

        Value::Dict(map)
    }
}

/// The body of a [Parcel] can take a handful of forms, captured in this `enum`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParcelBody {
    Missing,
    MsgData(MsgData),
    MsgAck(MsgAck),
    LcGossip(LcGossip),
}

/// A message data (`md`) body. The payload `d` is itself an encoded value:
/// raw octets for datagrams, or a tagged dictionary for the stream control
/// and stream data messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgData {
    pub to: Sid,
    pub fr: Sid,
    pub id: Option<MsgId>,
    pub body: MsgDataBody,
}

impl MsgData {
    fn from_value(v: Value) -> Result<MsgData, SchemaError> {
        let mut map = v.into_dict().ok_or(SchemaError::WrongKind("md"))?;

        let to = take_sid(&mut map, "to")?;
        let fr = take_sid(&mut map, "fr")?;
        let id = take_opt_u32(&mut map, "id")?;
        let body = match map.remove(b"d" as &[u8]) {
            Some(d) => MsgDataBody::from_value(d)?,
            None => return Err(SchemaError::MissingField("d")),
        };
        reject_leftovers(&map)?;

        Ok(MsgData { to, fr, id, body })
    }
}

impl From<MsgData> for Value {
    fn from(md: MsgData) -> Value {
        let mut map = BTreeMap::new();
        map.insert(b"to".to_vec(), Value::from(md.to));
        map.insert(b"fr".to_vec(), Value::from(md.fr));
        if let Some(id) = md.id {
            map.insert(b"id".to_vec(), Value::Int(id as i64));
        }
        map.insert(b"d".to_vec(), md.body.into());
        Value::Dict(map)
    }
}

/// A message acknowledgement (`ma`) body. `to` is the original sender whose
/// message is acknowledged, `fr` the acknowledger. Forwardable like `md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgAck {
    pub to: Sid,
    pub fr: Sid,
    pub id: MsgId,
}

impl MsgAck {
    fn from_value(v: Value) -> Result<MsgAck, SchemaError> {
        let mut map = v.into_dict().ok_or(SchemaError::WrongKind("ma"))?;

        let to = take_sid(&mut map, "to")?;
        let fr = take_sid(&mut map, "fr")?;
        let id = take_opt_u32(&mut map, "id")?.ok_or(SchemaError::MissingField("id"))?;
        reject_leftovers(&map)?;

        Ok(MsgAck { to, fr, id })
    }
}

impl From<MsgAck> for Value {
    fn from(ma: MsgAck) -> Value {
        let mut map = BTreeMap::new();
        map.insert(b"to".to_vec(), Value::from(ma.to));
        map.insert(b"fr".to_vec(), Value::from(ma.fr));
        map.insert(b"id".to_vec(), Value::Int(ma.id as i64));
        Value::Dict(map)
    }
}

/// A last-contact gossip (`lc`) body: a fragment of the sender's view of the
/// last-contact matrix, observer row by observer row. Cells without
/// information are simply absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LcGossip {
    pub rows: BTreeMap<Sid, BTreeMap<Sid, Timestamp>>,
}

impl LcGossip {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn from_value(v: Value) -> Result<LcGossip, SchemaError> {
        let raw_rows = v.into_dict().ok_or(SchemaError::WrongKind("lc"))?;

        let mut rows = BTreeMap::new();
        for (observer, raw_row) in raw_rows {
            let raw_row = raw_row.into_dict().ok_or(SchemaError::WrongKind("lc row"))?;
            let mut row = BTreeMap::new();
            for (observed, cell) in raw_row {
                let t = cell.into_time().ok_or(SchemaError::WrongKind("lc cell"))?;
                row.insert(Sid::from(&observed[..]), t);
            }
            rows.insert(Sid::from(&observer[..]), row);
        }

        Ok(LcGossip { rows })
    }
}

impl From<LcGossip> for Value {
    fn from(lc: LcGossip) -> Value {
        Value::Dict(
            lc.rows
                .into_iter()
                .map(|(observer, row)| {
                    let row = row
                        .into_iter()
                        .map(|(observed, t)| (Vec::from(observed), Value::Time(t)))
                        .collect();
                    (Vec::from(observer), Value::Dict(row))
                })
                .collect(),
        )
    }
}

/// The payload of a [MsgData], distinguished by the `m` tag when it is a
/// dictionary; raw octets are an untagged datagram payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgDataBody {
    Blob(Vec<u8>),
    MsgSync(MsgSync),
    MsgFinal(MsgFinal),
    MsgBrd(MsgBrd),
    MsgOne(MsgOne),
}

/// Synchronization: declares the sender's current sequence floors, one less
/// than the next sequence number to expect on each stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgSync {
    pub brd: SeqNum,
    pub one: SeqNum,
}

/// Finalization: declares the last sequence numbers that will ever be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgFinal {
    pub brd: SeqNum,
    pub one: SeqNum,
}

/// A broadcast stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgBrd {
    pub seq: SeqNum,
    pub data: Vec<u8>,
}

/// A one-to-one stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgOne {
    pub seq: SeqNum,
    pub data: Vec<u8>,
}

impl MsgDataBody {
    fn from_value(v: Value) -> Result<MsgDataBody, SchemaError> {
        let mut map = match v {
            Value::Octets(data) => return Ok(MsgDataBody::Blob(data)),
            Value::Dict(map) => map,
            _ => return Err(SchemaError::WrongKind("d")),
        };

        let tag = map
            .remove(b"m" as &[u8])
            .ok_or(SchemaError::MissingField("m"))?
            .into_octets()
            .ok_or(SchemaError::WrongKind("m"))?;

        let body = match &tag[..] {
            b"s" => MsgDataBody::MsgSync(MsgSync {
                brd: take_u32(&mut map, "b")?,
                one: take_u32(&mut map, "1")?,
            }),
            b"f" => MsgDataBody::MsgFinal(MsgFinal {
                brd: take_u32(&mut map, "b")?,
                one: take_u32(&mut map, "1")?,
            }),
            b"b" => MsgDataBody::MsgBrd(MsgBrd {
                seq: take_u32(&mut map, "s")?,
                data: take_octets(&mut map, "d")?,
            }),
            b"1" => MsgDataBody::MsgOne(MsgOne {
                seq: take_u32(&mut map, "s")?,
                data: take_octets(&mut map, "d")?,
            }),
            _ => return Err(SchemaError::UnknownMessageTag(lossy(&tag))),
        };
        reject_leftovers(&map)?;

        Ok(body)
    }
}

impl From<MsgDataBody> for Value {
    fn from(body: MsgDataBody) -> Value {
        let mut map = BTreeMap::new();
        match body {
            MsgDataBody::Blob(data) => return Value::Octets(data),
            MsgDataBody::MsgSync(syn) => {
                map.insert(b"m".to_vec(), Value::from(&b"s"[..]));
                map.insert(b"b".to_vec(), Value::Int(syn.brd as i64));
                map.insert(b"1".to_vec(), Value::Int(syn.one as i64));
            }
            MsgDataBody::MsgFinal(fin) => {
                map.insert(b"m".to_vec(), Value::from(&b"f"[..]));
                map.insert(b"b".to_vec(), Value::Int(fin.brd as i64));
                map.insert(b"1".to_vec(), Value::Int(fin.one as i64));
            }
            MsgDataBody::MsgBrd(brd) => {
                map.insert(b"m".to_vec(), Value::from(&b"b"[..]));
                map.insert(b"s".to_vec(), Value::Int(brd.seq as i64));
                map.insert(b"d".to_vec(), Value::Octets(brd.data));
            }
            MsgDataBody::MsgOne(one) => {
                map.insert(b"m".to_vec(), Value::from(&b"1"[..]));
                map.insert(b"s".to_vec(), Value::Int(one.seq as i64));
                map.insert(b"d".to_vec(), Value::Octets(one.data));
            }
        }
        Value::Dict(map)
    }
}

impl From<Sid> for Value {
    fn from(sid: Sid) -> Value {
        Value::Octets(sid.into())
    }
}

fn lossy(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

fn reject_leftovers(map: &BTreeMap<Vec<u8>, Value>) -> Result<(), SchemaError> {
    match map.keys().next() {
        Some(key) => Err(SchemaError::UnknownBodyField(lossy(key))),
        None => Ok(()),
    }
}

fn take_opt_u32(
    map: &mut BTreeMap<Vec<u8>, Value>,
    field: &'static str,
) -> Result<Option<u32>, SchemaError> {
    match map.remove(field.as_bytes()) {
        None => Ok(None),
        Some(v) => {
            let raw = v.into_int().ok_or(SchemaError::WrongKind(field))?;
            let v = u32::try_from(raw).map_err(|_| SchemaError::OutOfRange(field))?;
            Ok(Some(v))
        }
    }
}

fn take_u32(map: &mut BTreeMap<Vec<u8>, Value>, field: &'static str) -> Result<u32, SchemaError> {
    take_opt_u32(map, field)?.ok_or(SchemaError::MissingField(field))
}

fn take_sid(map: &mut BTreeMap<Vec<u8>, Value>, field: &'static str) -> Result<Sid, SchemaError> {
    let raw = map
        .remove(field.as_bytes())
        .ok_or(SchemaError::MissingField(field))?
        .into_octets()
        .ok_or(SchemaError::WrongKind(field))?;
    Ok(Sid::from(&raw[..]))
}

fn take_octets(
    map: &mut BTreeMap<Vec<u8>, Value>,
    field: &'static str,
) -> Result<Vec<u8>, SchemaError> {
    map.remove(field.as_bytes())
        .ok_or(SchemaError::MissingField(field))?
        .into_octets()
        .ok_or(SchemaError::WrongKind(field))
}

pub mod parcel;
pub mod value;

pub use parcel::{
    KeepaliveId, LcGossip, MsgAck, MsgBrd, MsgData, MsgDataBody, MsgFinal, MsgId, MsgOne, MsgSync,
    Parcel, ParcelBody, SchemaError, SchemaMode, SeqNum, WireError,
};
pub use value::{decode, DecodeError, Value};

//! Typed replica protocol messages and their fixed wire format.
//!
//! A message is serialized as `[u16 version][u16 msg_type][u64 from]
//! [u64 to][u32 term][u64 index][u64 commit_index][u32 log_count][logs...]
//! [u16 shard_no_len][shard_no]`, with each log encoded as `[u64 index]
//! [u32 term][u32 len][data]`. All integers are big-endian. The `reject`
//! flag never crosses the wire; it only rides on locally stepped messages.

use bytes::{Buf, BufMut, BytesMut};
use get_size::GetSize;

use crate::replica::log::Log;
use crate::replica::NodeId;
use crate::utils::ClusterError;

/// Wire protocol version stamped on every encoded message.
pub const MESSAGE_VERSION: u16 = 1;

/// Typed message kinds driving the replica state machine.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, GetSize)]
pub enum MsgType {
    #[default]
    Unknown,
    /// Local: client data to append at the leader.
    Propose,
    /// The authority layer designates a leader for a term.
    AppointLeaderReq,
    /// The appointed leader announces itself to the other replicas.
    AppointLeaderResp,
    /// Leader tells a follower that new entries are available.
    NotifySync,
    /// Follower asks the leader for entries from `index` on.
    Sync,
    /// Leader ships entries back to a follower.
    SyncResp,
    /// Leader heartbeat carrying its commit index.
    Ping,
    /// Follower heartbeat reply carrying its last log index.
    Pong,
    /// Local: committed-but-unapplied entries handed to the applier.
    ApplyLogsReq,
    /// Local: the applier acknowledges application up to `index`.
    ApplyLogsResp,
    /// Local: storage acknowledges persistence up to `index`.
    StoreAppendResp,
}

impl MsgType {
    pub fn to_u16(self) -> u16 {
        match self {
            MsgType::Unknown => 0,
            MsgType::Propose => 1,
            MsgType::AppointLeaderReq => 2,
            MsgType::AppointLeaderResp => 3,
            MsgType::NotifySync => 4,
            MsgType::Sync => 5,
            MsgType::SyncResp => 6,
            MsgType::Ping => 7,
            MsgType::Pong => 8,
            MsgType::ApplyLogsReq => 9,
            MsgType::ApplyLogsResp => 10,
            MsgType::StoreAppendResp => 11,
        }
    }

    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => MsgType::Propose,
            2 => MsgType::AppointLeaderReq,
            3 => MsgType::AppointLeaderResp,
            4 => MsgType::NotifySync,
            5 => MsgType::Sync,
            6 => MsgType::SyncResp,
            7 => MsgType::Ping,
            8 => MsgType::Pong,
            9 => MsgType::ApplyLogsReq,
            10 => MsgType::ApplyLogsResp,
            11 => MsgType::StoreAppendResp,
            _ => MsgType::Unknown,
        }
    }

    /// Control-plane message kinds must never be dropped by the receive
    /// queue.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MsgType::AppointLeaderReq
                | MsgType::AppointLeaderResp
                | MsgType::Ping
                | MsgType::Pong
        )
    }

    /// Locally originated kinds that never carry a meaningful term.
    pub(crate) fn is_local(self) -> bool {
        matches!(
            self,
            MsgType::Propose
                | MsgType::ApplyLogsReq
                | MsgType::ApplyLogsResp
                | MsgType::StoreAppendResp
        )
    }
}

/// A replica protocol message.
#[derive(Debug, Default, PartialEq, Eq, Clone, GetSize)]
pub struct Message {
    pub msg_type: MsgType,
    pub from: NodeId,
    pub to: NodeId,
    pub term: u32,
    pub index: u64,
    pub commit_index: u64,
    pub reject: bool,
    pub logs: Vec<Log>,
    pub shard_no: String,
}

impl Message {
    /// Serializes the message into the fixed big-endian wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64 + self.shard_no.len());
        buf.put_u16(MESSAGE_VERSION);
        buf.put_u16(self.msg_type.to_u16());
        buf.put_u64(self.from);
        buf.put_u64(self.to);
        buf.put_u32(self.term);
        buf.put_u64(self.index);
        buf.put_u64(self.commit_index);
        buf.put_u32(self.logs.len() as u32);
        for log in &self.logs {
            buf.put_u64(log.index);
            buf.put_u32(log.term);
            buf.put_u32(log.data.len() as u32);
            buf.put_slice(&log.data);
        }
        buf.put_u16(self.shard_no.len() as u16);
        buf.put_slice(self.shard_no.as_bytes());
        buf.to_vec()
    }

    /// Deserializes a message from the fixed big-endian wire layout.
    pub fn decode(data: &[u8]) -> Result<Message, ClusterError> {
        let mut buf = data;
        let version = get_u16(&mut buf)?;
        if version != MESSAGE_VERSION {
            return Err(ClusterError::Other(format!(
                "unsupported message version {}",
                version
            )));
        }
        let msg_type = MsgType::from_u16(get_u16(&mut buf)?);
        let from = get_u64(&mut buf)?;
        let to = get_u64(&mut buf)?;
        let term = get_u32(&mut buf)?;
        let index = get_u64(&mut buf)?;
        let commit_index = get_u64(&mut buf)?;
        let log_count = get_u32(&mut buf)?;
        let mut logs = Vec::with_capacity(log_count as usize);
        for _ in 0..log_count {
            let log_index = get_u64(&mut buf)?;
            let log_term = get_u32(&mut buf)?;
            let len = get_u32(&mut buf)? as usize;
            logs.push(Log {
                index: log_index,
                term: log_term,
                data: get_bytes(&mut buf, len)?,
            });
        }
        let shard_no_len = get_u16(&mut buf)? as usize;
        let shard_no =
            String::from_utf8(get_bytes(&mut buf, shard_no_len)?)?;
        Ok(Message {
            msg_type,
            from,
            to,
            term,
            index,
            commit_index,
            reject: false,
            logs,
            shard_no,
        })
    }
}

fn check_remaining(buf: &[u8], need: usize) -> Result<(), ClusterError> {
    if buf.remaining() < need {
        Err(ClusterError::Other(format!(
            "message decode short buffer: need {} have {}",
            need,
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

pub(crate) fn get_u16(buf: &mut &[u8]) -> Result<u16, ClusterError> {
    check_remaining(buf, 2)?;
    Ok(buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut &[u8]) -> Result<u32, ClusterError> {
    check_remaining(buf, 4)?;
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut &[u8]) -> Result<u64, ClusterError> {
    check_remaining(buf, 8)?;
    Ok(buf.get_u64())
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> Result<u8, ClusterError> {
    check_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_bytes(
    buf: &mut &[u8],
    len: usize,
) -> Result<Vec<u8>, ClusterError> {
    check_remaining(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_string(buf: &mut &[u8]) -> Result<String, ClusterError> {
    let len = get_u16(buf)? as usize;
    Ok(String::from_utf8(get_bytes(buf, len)?)?)
}

#[cfg(test)]
mod message_tests {
    use super::*;

    #[test]
    fn msg_type_round_trip() {
        for v in 0..=12u16 {
            let ty = MsgType::from_u16(v);
            if ty != MsgType::Unknown {
                assert_eq!(ty.to_u16(), v);
            }
        }
    }

    #[test]
    fn encode_decode_round_trip() -> Result<(), ClusterError> {
        let msg = Message {
            msg_type: MsgType::SyncResp,
            from: 1,
            to: 2,
            term: 3,
            index: 4,
            commit_index: 2,
            reject: false,
            logs: vec![
                Log {
                    index: 4,
                    term: 3,
                    data: b"hello".to_vec(),
                },
                Log {
                    index: 5,
                    term: 3,
                    data: vec![],
                },
            ],
            shard_no: "channel-2-test".into(),
        };
        assert_eq!(Message::decode(&msg.encode())?, msg);
        Ok(())
    }

    #[test]
    fn encode_decode_empty_logs() -> Result<(), ClusterError> {
        let msg = Message {
            msg_type: MsgType::Ping,
            from: 7,
            to: 8,
            term: 1,
            commit_index: 9,
            shard_no: "slot-12".into(),
            ..Default::default()
        };
        assert_eq!(Message::decode(&msg.encode())?, msg);
        Ok(())
    }

    #[test]
    fn decode_short_buffer() {
        let msg = Message {
            msg_type: MsgType::Sync,
            shard_no: "slot-1".into(),
            ..Default::default()
        };
        let bytes = msg.encode();
        assert!(Message::decode(&bytes[..bytes.len() - 3]).is_err());
        assert!(Message::decode(&[]).is_err());
    }

    #[test]
    fn integers_are_big_endian() {
        let msg = Message {
            msg_type: MsgType::Ping,
            from: 0x0102030405060708,
            ..Default::default()
        };
        let bytes = msg.encode();
        // version, msg_type, then `from` starting at byte 4
        assert_eq!(&bytes[..2], &[0, 1]);
        assert_eq!(&bytes[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}

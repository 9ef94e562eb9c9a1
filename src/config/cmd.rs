//! Control-plane command envelope and payload codecs for the config
//! replication group.
//!
//! A command is serialized as `[u16 version=1][u16 cmd_type][payload]`;
//! payload integers are big-endian, strings are u16-length-prefixed
//! UTF-8, nested descriptors are length-prefixed MessagePack.

use bytes::{BufMut, BytesMut};

use crate::config::{Node, NodeStatus, Slot};
use crate::replica::{
    get_bytes, get_string, get_u16, get_u32, get_u64, get_u8, put_string,
    NodeId, SlotId,
};
use crate::utils::ClusterError;

/// Envelope version stamped on every encoded command.
pub const CMD_VERSION: u16 = 1;

/// Command kinds replicated on the config group.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConfigCmdType {
    ConfigInit = 1,
    ApiServerAddrChange = 2,
    NodeJoin = 3,
    NodeJoining = 4,
    NodeJoined = 5,
    NodeOnlineStatusChange = 6,
    SlotMigrate = 7,
    SlotUpdate = 8,
    NodeStatusChange = 9,
}

impl ConfigCmdType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => ConfigCmdType::ConfigInit,
            2 => ConfigCmdType::ApiServerAddrChange,
            3 => ConfigCmdType::NodeJoin,
            4 => ConfigCmdType::NodeJoining,
            5 => ConfigCmdType::NodeJoined,
            6 => ConfigCmdType::NodeOnlineStatusChange,
            7 => ConfigCmdType::SlotMigrate,
            8 => ConfigCmdType::SlotUpdate,
            9 => ConfigCmdType::NodeStatusChange,
            _ => return None,
        })
    }
}

/// A control-plane command: type tag plus opaque payload.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Cmd {
    pub cmd_type: u16,
    pub data: Vec<u8>,
}

impl Cmd {
    pub fn new(cmd_type: ConfigCmdType, data: Vec<u8>) -> Self {
        Cmd {
            cmd_type: cmd_type as u16,
            data,
        }
    }

    /// Builds a command with a raw type tag (used by the channel-meta
    /// command namespace, which shares this envelope).
    pub fn with_type(cmd_type: u16, data: Vec<u8>) -> Self {
        Cmd { cmd_type, data }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.data.len());
        buf.put_u16(CMD_VERSION);
        buf.put_u16(self.cmd_type);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Cmd, ClusterError> {
        let mut buf = data;
        let version = get_u16(&mut buf)?;
        if version != CMD_VERSION {
            return Err(ClusterError::Other(format!(
                "unsupported cmd version {}",
                version
            )));
        }
        let cmd_type = get_u16(&mut buf)?;
        Ok(Cmd {
            cmd_type,
            data: buf.to_vec(),
        })
    }
}

pub fn encode_api_server_addr_change(
    node_id: NodeId,
    api_addr: &str,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u64(node_id);
    put_string(&mut buf, api_addr);
    buf.to_vec()
}

pub fn decode_api_server_addr_change(
    data: &[u8],
) -> Result<(NodeId, String), ClusterError> {
    let mut buf = data;
    let node_id = get_u64(&mut buf)?;
    let api_addr = get_string(&mut buf)?;
    Ok((node_id, api_addr))
}

pub fn encode_node_online_status_change(
    node_id: NodeId,
    online: bool,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u64(node_id);
    buf.put_u8(online as u8);
    buf.to_vec()
}

pub fn decode_node_online_status_change(
    data: &[u8],
) -> Result<(NodeId, bool), ClusterError> {
    let mut buf = data;
    let node_id = get_u64(&mut buf)?;
    let online = get_u8(&mut buf)? != 0;
    Ok((node_id, online))
}

pub fn encode_slot_migrate(
    slot_id: SlotId,
    from_node_id: NodeId,
    to_node_id: NodeId,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(slot_id);
    buf.put_u64(from_node_id);
    buf.put_u64(to_node_id);
    buf.to_vec()
}

pub fn decode_slot_migrate(
    data: &[u8],
) -> Result<(SlotId, NodeId, NodeId), ClusterError> {
    let mut buf = data;
    let slot_id = get_u32(&mut buf)?;
    let from_node_id = get_u64(&mut buf)?;
    let to_node_id = get_u64(&mut buf)?;
    Ok((slot_id, from_node_id, to_node_id))
}

pub fn encode_node_status_change(
    node_id: NodeId,
    status: NodeStatus,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u64(node_id);
    buf.put_u32(status as u32);
    buf.to_vec()
}

pub fn decode_node_status_change(
    data: &[u8],
) -> Result<(NodeId, NodeStatus), ClusterError> {
    let mut buf = data;
    let node_id = get_u64(&mut buf)?;
    let status = match get_u32(&mut buf)? {
        1 => NodeStatus::Joining,
        2 => NodeStatus::Joined,
        _ => NodeStatus::Unknown,
    };
    Ok((node_id, status))
}

pub fn encode_node(node: &Node) -> Result<Vec<u8>, ClusterError> {
    Ok(rmp_serde::to_vec(node)?)
}

pub fn decode_node(data: &[u8]) -> Result<Node, ClusterError> {
    Ok(rmp_serde::from_slice(data)?)
}

pub fn encode_node_id(node_id: NodeId) -> Vec<u8> {
    node_id.to_be_bytes().to_vec()
}

pub fn decode_node_id(data: &[u8]) -> Result<NodeId, ClusterError> {
    let mut buf = data;
    get_u64(&mut buf)
}

pub fn encode_slots(slots: &[Slot]) -> Result<Vec<u8>, ClusterError> {
    let mut buf = BytesMut::new();
    buf.put_u32(slots.len() as u32);
    for slot in slots {
        let bytes = rmp_serde::to_vec(slot)?;
        buf.put_u32(bytes.len() as u32);
        buf.put_slice(&bytes);
    }
    Ok(buf.to_vec())
}

pub fn decode_slots(data: &[u8]) -> Result<Vec<Slot>, ClusterError> {
    let mut buf = data;
    let count = get_u32(&mut buf)?;
    let mut slots = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = get_u32(&mut buf)? as usize;
        let bytes = get_bytes(&mut buf, len)?;
        slots.push(rmp_serde::from_slice(&bytes)?);
    }
    Ok(slots)
}

pub fn encode_node_joined(
    node_id: NodeId,
    slots: &[Slot],
) -> Result<Vec<u8>, ClusterError> {
    let mut buf = BytesMut::new();
    buf.put_u64(node_id);
    buf.put_slice(&encode_slots(slots)?);
    Ok(buf.to_vec())
}

pub fn decode_node_joined(
    data: &[u8],
) -> Result<(NodeId, Vec<Slot>), ClusterError> {
    let mut buf = data;
    let node_id = get_u64(&mut buf)?;
    let slots = decode_slots(buf)?;
    Ok((node_id, slots))
}

#[cfg(test)]
mod cmd_tests {
    use super::*;

    #[test]
    fn envelope_round_trip() -> Result<(), ClusterError> {
        let cmd = Cmd::new(
            ConfigCmdType::NodeOnlineStatusChange,
            encode_node_online_status_change(42, true),
        );
        let decoded = Cmd::decode(&cmd.encode())?;
        assert_eq!(decoded, cmd);
        assert_eq!(
            ConfigCmdType::from_u16(decoded.cmd_type),
            Some(ConfigCmdType::NodeOnlineStatusChange)
        );
        assert_eq!(
            decode_node_online_status_change(&decoded.data)?,
            (42, true)
        );
        Ok(())
    }

    #[test]
    fn envelope_rejects_bad_version() {
        let mut bytes = Cmd::new(ConfigCmdType::NodeJoining, vec![]).encode();
        bytes[0] = 0;
        bytes[1] = 9;
        assert!(Cmd::decode(&bytes).is_err());
    }

    #[test]
    fn payload_round_trips() -> Result<(), ClusterError> {
        assert_eq!(
            decode_api_server_addr_change(&encode_api_server_addr_change(
                7,
                "10.1.2.3:8080"
            ))?,
            (7, "10.1.2.3:8080".to_string())
        );
        assert_eq!(
            decode_slot_migrate(&encode_slot_migrate(3, 1, 2))?,
            (3, 1, 2)
        );
        assert_eq!(
            decode_node_status_change(&encode_node_status_change(
                5,
                NodeStatus::Joined
            ))?,
            (5, NodeStatus::Joined)
        );
        assert_eq!(decode_node_id(&encode_node_id(11))?, 11);

        let node = Node {
            id: 4,
            cluster_addr: "10.0.0.4:11110".into(),
            api_addr: "10.0.0.4:11120".into(),
            online: true,
            allow_vote: true,
            ..Default::default()
        };
        assert_eq!(decode_node(&encode_node(&node)?)?, node);

        let slots = vec![
            Slot {
                id: 1,
                leader: 4,
                term: 2,
                replicas: vec![4, 5],
                replica_count: 2,
                ..Default::default()
            },
            Slot {
                id: 2,
                ..Default::default()
            },
        ];
        assert_eq!(decode_slots(&encode_slots(&slots)?)?, slots);
        assert_eq!(
            decode_node_joined(&encode_node_joined(4, &slots)?)?,
            (4, slots)
        );
        Ok(())
    }
}

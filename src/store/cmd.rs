//! Channel-metadata command codecs, replicated on slot groups. Commands
//! share the control-plane envelope `[u16 version=1][u16 cmd_type]
//! [payload]`; membership payloads are `[string channel_id]
//! [u8 channel_type][u32 count][strings...]`.

use bytes::{BufMut, BytesMut};

use crate::replica::{get_string, get_u32, get_u8, put_string};
use crate::store::ChannelInfo;
use crate::utils::ClusterError;

/// Command kinds replicated on slot groups.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChannelCmdType {
    AddSubscribers = 1,
    RemoveSubscribers = 2,
    RemoveAllSubscribers = 3,
    AddOrUpdateChannel = 4,
    DeleteChannel = 5,
    AddDenylist = 6,
    RemoveDenylist = 7,
    RemoveAllDenylist = 8,
    AddAllowlist = 9,
    RemoveAllowlist = 10,
    RemoveAllAllowlist = 11,
}

impl ChannelCmdType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => ChannelCmdType::AddSubscribers,
            2 => ChannelCmdType::RemoveSubscribers,
            3 => ChannelCmdType::RemoveAllSubscribers,
            4 => ChannelCmdType::AddOrUpdateChannel,
            5 => ChannelCmdType::DeleteChannel,
            6 => ChannelCmdType::AddDenylist,
            7 => ChannelCmdType::RemoveDenylist,
            8 => ChannelCmdType::RemoveAllDenylist,
            9 => ChannelCmdType::AddAllowlist,
            10 => ChannelCmdType::RemoveAllowlist,
            11 => ChannelCmdType::RemoveAllAllowlist,
            _ => return None,
        })
    }
}

/// Encodes a channel-plus-members payload (subscribers, denylist and
/// allowlist changes all share this shape).
pub fn encode_members(
    channel_id: &str,
    channel_type: u8,
    members: &[String],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, channel_id);
    buf.put_u8(channel_type);
    buf.put_u32(members.len() as u32);
    for member in members {
        put_string(&mut buf, member);
    }
    buf.to_vec()
}

pub fn decode_members(
    data: &[u8],
) -> Result<(String, u8, Vec<String>), ClusterError> {
    let mut buf = data;
    let channel_id = get_string(&mut buf)?;
    let channel_type = get_u8(&mut buf)?;
    let count = get_u32(&mut buf)?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        members.push(get_string(&mut buf)?);
    }
    Ok((channel_id, channel_type, members))
}

/// Encodes a bare channel reference payload.
pub fn encode_channel(channel_id: &str, channel_type: u8) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, channel_id);
    buf.put_u8(channel_type);
    buf.to_vec()
}

pub fn decode_channel(data: &[u8]) -> Result<(String, u8), ClusterError> {
    let mut buf = data;
    let channel_id = get_string(&mut buf)?;
    let channel_type = get_u8(&mut buf)?;
    Ok((channel_id, channel_type))
}

pub fn encode_channel_info(
    info: &ChannelInfo,
) -> Result<Vec<u8>, ClusterError> {
    Ok(rmp_serde::to_vec(info)?)
}

pub fn decode_channel_info(
    data: &[u8],
) -> Result<ChannelInfo, ClusterError> {
    Ok(rmp_serde::from_slice(data)?)
}

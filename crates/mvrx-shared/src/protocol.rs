//! MVR-xchange wire format.
//!
//! Every message travels in a TCP packet made of a fixed 28-byte big-endian
//! header followed by the payload. The payload is either a UTF-8 JSON object
//! ([`WireMessage`]) or the raw bytes of a scene file.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{MAX_JSON_PAYLOAD, PACKET_HEADER_LEN, PACKET_MAGIC, PACKET_VERSION};
use crate::error::MvrxError;
use crate::types::{Commit, StationUuid};

// ---------------------------------------------------------------------------
// Packet header
// ---------------------------------------------------------------------------

/// What the packet payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadKind {
    Json = 0,
    File = 1,
}

impl TryFrom<u32> for PayloadKind {
    type Error = MvrxError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Json),
            1 => Ok(Self::File),
            other => Err(MvrxError::protocol(format!("unknown payload type: {other}"))),
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u32,
    /// Index of this packet within a multi-packet message; always 0 here.
    pub number: u32,
    pub count: u32,
    pub kind: PayloadKind,
    pub payload_len: u64,
}

impl PacketHeader {
    pub fn new(kind: PayloadKind, payload_len: u64) -> Self {
        Self {
            version: PACKET_VERSION,
            number: 0,
            count: 1,
            kind,
            payload_len,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(PACKET_HEADER_LEN);
        buf.put_u32(PACKET_MAGIC);
        buf.put_u32(self.version);
        buf.put_u32(self.number);
        buf.put_u32(self.count);
        buf.put_u32(self.kind as u32);
        buf.put_u64(self.payload_len);
    }

    /// Decode a header, rejecting bad magic, unknown versions, unknown
    /// payload types and oversized JSON payloads.
    pub fn decode(raw: &[u8; PACKET_HEADER_LEN]) -> Result<Self, MvrxError> {
        let mut buf = &raw[..];

        let magic = buf.get_u32();
        if magic != PACKET_MAGIC {
            return Err(MvrxError::protocol(format!("bad packet magic: {magic}")));
        }

        let version = buf.get_u32();
        if version != PACKET_VERSION {
            return Err(MvrxError::protocol(format!("unsupported packet version: {version}")));
        }

        let number = buf.get_u32();
        let count = buf.get_u32();
        let kind = PayloadKind::try_from(buf.get_u32())?;
        let payload_len = buf.get_u64();

        if kind == PayloadKind::Json && payload_len > MAX_JSON_PAYLOAD {
            return Err(MvrxError::protocol(format!(
                "JSON payload too large: {payload_len} bytes (max {MAX_JSON_PAYLOAD})"
            )));
        }

        Ok(Self {
            version,
            number,
            count,
            kind,
            payload_len,
        })
    }
}

// ---------------------------------------------------------------------------
// JSON messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "MVR_JOIN")]
    Join,
    #[serde(rename = "MVR_JOIN_RET")]
    JoinRet,
    #[serde(rename = "MVR_LEAVE")]
    Leave,
    #[serde(rename = "MVR_LEAVE_RET")]
    LeaveRet,
    #[serde(rename = "MVR_COMMIT")]
    Commit,
    #[serde(rename = "MVR_COMMIT_RET")]
    CommitRet,
    #[serde(rename = "MVR_FILE_REQUEST", alias = "MVR_REQUEST")]
    FileRequest,
    #[serde(rename = "MVR_FILE_REQUEST_RET", alias = "MVR_REQUEST_RET")]
    FileRequestRet,
}

/// A JSON message exchanged between stations.
///
/// `StationUUID` is optional at the serde level so that a message lacking it
/// still decodes; [`WireMessage::sender`] turns its absence into a protocol
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "Type")]
    pub kind: MessageKind,
    #[serde(rename = "OK", default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(rename = "StationUUID", default, skip_serializing_if = "Option::is_none")]
    pub station_uuid: Option<Uuid>,
    #[serde(rename = "StationName", default, skip_serializing_if = "Option::is_none")]
    pub station_name: Option<String>,
    #[serde(rename = "Provider", default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(rename = "Port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(rename = "Commits", default, skip_serializing_if = "Option::is_none")]
    pub commits: Option<Vec<Commit>>,
    #[serde(rename = "FileUUID", default, skip_serializing_if = "Option::is_none")]
    pub file_uuid: Option<Uuid>,
    #[serde(rename = "Comment", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "FileName", default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(rename = "FileSize", default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(rename = "Message", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WireMessage {
    pub fn new(kind: MessageKind, sender: StationUuid) -> Self {
        Self {
            kind,
            ok: None,
            station_uuid: Some(sender.0),
            station_name: None,
            provider: None,
            port: None,
            commits: None,
            file_uuid: None,
            comment: None,
            file_name: None,
            file_size: None,
            message: None,
        }
    }

    /// A response carrying `OK` and, when refusing, a reason.
    pub fn reply(kind: MessageKind, sender: StationUuid, ok: bool, reason: Option<String>) -> Self {
        let mut msg = Self::new(kind, sender);
        msg.ok = Some(ok);
        msg.message = reason;
        msg
    }

    pub fn with_station(mut self, name: &str, provider: &str) -> Self {
        self.station_name = Some(name.to_string());
        self.provider = Some(provider.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_commits(mut self, commits: Vec<Commit>) -> Self {
        self.commits = Some(commits);
        self
    }

    pub fn with_file(mut self, file_uuid: Uuid) -> Self {
        self.file_uuid = Some(file_uuid);
        self
    }

    /// The sender's station identifier, required on every message.
    pub fn sender(&self) -> Result<StationUuid, MvrxError> {
        let uuid = self
            .station_uuid
            .ok_or_else(|| MvrxError::protocol(format!("{:?} message without StationUUID", self.kind)))?;
        StationUuid::new(uuid)
    }

    /// `OK` defaults to true when a peer omits it.
    pub fn is_ok(&self) -> bool {
        self.ok.unwrap_or(true)
    }

    /// Commits carried by this message, attributed to `sender` where the
    /// commit itself names no station.
    ///
    /// An `MVR_COMMIT` may carry a single commit flattened into the message
    /// (`FileUUID`, `Comment`, ...) instead of a `Commits` array.
    pub fn commits(&self, sender: StationUuid) -> Vec<Commit> {
        let mut commits = match (&self.commits, self.kind, self.file_uuid) {
            (Some(list), _, _) => list.clone(),
            (None, MessageKind::Commit, Some(file_uuid)) => vec![Commit {
                commit_uuid: file_uuid,
                file_uuid,
                station_uuid: sender,
                timestamp: chrono::Utc::now(),
                comment: self.comment.clone().unwrap_or_default(),
                file_name: self.file_name.clone(),
                file_size: self.file_size,
            }],
            _ => Vec::new(),
        };
        for commit in &mut commits {
            if commit.station_uuid.is_nil() {
                commit.station_uuid = sender;
            }
        }
        commits
    }

    /// Encode into a complete JSON packet (header + payload).
    pub fn to_packet(&self) -> Result<BytesMut, MvrxError> {
        let json = serde_json::to_vec(self)?;
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + json.len());
        PacketHeader::new(PayloadKind::Json, json.len() as u64).encode(&mut buf);
        buf.put_slice(&json);
        Ok(buf)
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, MvrxError> {
        serde_json::from_slice(payload).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(buf: &BytesMut) -> [u8; PACKET_HEADER_LEN] {
        buf[..PACKET_HEADER_LEN].try_into().unwrap()
    }

    #[test]
    fn test_packet_header_layout() {
        let mut buf = BytesMut::new();
        PacketHeader::new(PayloadKind::File, 0x0102_0304_0506).encode(&mut buf);

        assert_eq!(buf.len(), PACKET_HEADER_LEN);
        assert_eq!(&buf[..4], &PACKET_MAGIC.to_be_bytes());
        assert_eq!(&buf[16..20], &1u32.to_be_bytes());
        assert_eq!(&buf[20..28], &0x0102_0304_0506u64.to_be_bytes());

        let header = PacketHeader::decode(&header_bytes(&buf)).unwrap();
        assert_eq!(header.kind, PayloadKind::File);
        assert_eq!(header.payload_len, 0x0102_0304_0506);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = BytesMut::new();
        PacketHeader::new(PayloadKind::Json, 2).encode(&mut buf);
        buf[0] = 0xFF;
        let err = PacketHeader::decode(&header_bytes(&buf)).unwrap_err();
        assert!(err.to_string().contains("bad packet magic"));
    }

    #[test]
    fn test_unknown_payload_type_rejected() {
        let mut buf = BytesMut::new();
        PacketHeader::new(PayloadKind::Json, 2).encode(&mut buf);
        buf[19] = 7;
        assert!(PacketHeader::decode(&header_bytes(&buf)).is_err());
    }

    #[test]
    fn test_oversized_json_rejected() {
        let mut buf = BytesMut::new();
        PacketHeader::new(PayloadKind::Json, MAX_JSON_PAYLOAD + 1).encode(&mut buf);
        assert!(PacketHeader::decode(&header_bytes(&buf)).is_err());

        // File payloads are bounded by the transfer layer instead.
        let mut buf = BytesMut::new();
        PacketHeader::new(PayloadKind::File, MAX_JSON_PAYLOAD + 1).encode(&mut buf);
        assert!(PacketHeader::decode(&header_bytes(&buf)).is_ok());
    }

    #[test]
    fn test_join_message_field_names() {
        let station = StationUuid::generate();
        let msg = WireMessage::new(MessageKind::Join, station).with_station("FOH", "mvrx-station");
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["Type"], "MVR_JOIN");
        assert_eq!(json["StationUUID"], station.to_string());
        assert_eq!(json["StationName"], "FOH");
        assert_eq!(json["Provider"], "mvrx-station");
        assert!(json.get("OK").is_none());
        assert!(json.get("Commits").is_none());
    }

    #[test]
    fn test_request_alias_accepted() {
        let json = br#"{"Type":"MVR_REQUEST","StationUUID":"4aa2b3a4-5f7e-4b43-9c1d-38c4b6f5a1d2","FileUUID":"0b0f3e32-3d5b-44a2-8d3b-4f3b8a2c7e11"}"#;
        let msg = WireMessage::from_json(json).unwrap();
        assert_eq!(msg.kind, MessageKind::FileRequest);
    }

    #[test]
    fn test_missing_station_uuid_is_protocol_error() {
        let msg = WireMessage::from_json(br#"{"Type":"MVR_LEAVE"}"#).unwrap();
        assert!(matches!(msg.sender(), Err(MvrxError::Protocol(_))));
    }

    #[test]
    fn test_unknown_type_fails_to_decode() {
        assert!(WireMessage::from_json(br#"{"Type":"MVR_DANCE","StationUUID":"4aa2b3a4-5f7e-4b43-9c1d-38c4b6f5a1d2"}"#).is_err());
    }

    #[test]
    fn test_flattened_commit_is_attributed_to_sender() {
        let sender = StationUuid::generate();
        let file = Uuid::new_v4();
        let mut msg = WireMessage::new(MessageKind::Commit, sender).with_file(file);
        msg.comment = Some("focus update".into());

        let commits = msg.commits(sender);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].commit_uuid, file);
        assert_eq!(commits[0].station_uuid, sender);
        assert_eq!(commits[0].comment, "focus update");
    }

    #[test]
    fn test_file_request_is_not_a_commit() {
        let sender = StationUuid::generate();
        let msg = WireMessage::new(MessageKind::FileRequest, sender).with_file(Uuid::new_v4());
        assert!(msg.commits(sender).is_empty());
    }

    #[test]
    fn test_packet_carries_json_payload() {
        let station = StationUuid::generate();
        let commit = Commit::new_local(station, "first look");
        let msg = WireMessage::new(MessageKind::Commit, station).with_commits(vec![commit.clone()]);

        let packet = msg.to_packet().unwrap();
        let header = PacketHeader::decode(&header_bytes(&packet)).unwrap();
        assert_eq!(header.kind, PayloadKind::Json);
        assert_eq!(header.payload_len as usize, packet.len() - PACKET_HEADER_LEN);

        let decoded = WireMessage::from_json(&packet[PACKET_HEADER_LEN..]).unwrap();
        assert_eq!(decoded.commits(station), vec![commit]);
    }
}

// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! NCI packet parser and serializer.
//!
//! Packets are generated from `nci_packets.pdl`. Only the subset of the NCI
//! control plane driven by the HAL core is modelled: the common packet
//! header, the CORE group commands used during bring-up and the
//! configuration parameter TLVs.

use crate::error::{HalError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use pdl_runtime::Packet;

/// Generated NCI packets.
pub mod packets {
    #![allow(clippy::all)]
    #![allow(unused)]
    #![allow(missing_docs)]

    include!(concat!(env!("OUT_DIR"), "/nci_packets.rs"));

    impl Status {
        /// Decode a status byte. Every value maps to a status.
        pub fn from_byte(status: u8) -> Self {
            Status::try_from(status).unwrap_or(Status::Failed)
        }
    }

    impl NciVersion {
        /// Whether the version uses the NCI 2.0 command layouts.
        pub fn is_v2(self) -> bool {
            self == NciVersion::Version20
        }

        /// The version whose CORE_INIT layout is the other one.
        pub fn flipped(self) -> Self {
            if self.is_v2() {
                NciVersion::Version11
            } else {
                NciVersion::Version20
            }
        }
    }
}

pub use packets::{
    ConfigStatus, MessageType, NciVersion, PacketBoundaryFlag, PacketHeader, ResetTrigger,
    ResetType, Status,
};
pub use packets::ControlPacket;
use packets::CorePacketChild;

/// Size of the common NCI packet header.
pub const HEADER_SIZE: usize = 3;

/// Largest frame exchanged with the controller, header included.
pub const MAX_FRAME_SIZE: usize = 260;

/// Group identifiers.
pub mod gid {
    #![allow(missing_docs)]
    pub const CORE: u8 = 0x0;
    pub const RF: u8 = 0x1;
    pub const NFCEE: u8 = 0x2;
    pub const PROPRIETARY: u8 = 0xf;
}

/// Opcode identifiers of the CORE group.
pub mod oid {
    #![allow(missing_docs)]
    pub const CORE_RESET: u8 = 0x00;
    pub const CORE_INIT: u8 = 0x01;
    pub const CORE_SET_CONFIG: u8 = 0x02;
    pub const CORE_GET_CONFIG: u8 = 0x03;
    pub const CORE_GENERIC_ERROR: u8 = 0x07;
    pub const CORE_INTERFACE_ERROR: u8 = 0x08;
}

/// CORE_RESET_NTF reporting an unrecoverable controller error. Delivered to
/// the upper layer when the transport stops accepting writes.
pub const CORE_RESET_NTF_UNRECOVERABLE: [u8; 9] =
    [0x60, 0x00, 0x06, 0xa0, 0x00, 0xc7, 0xd4, 0x00, 0x00];

/// A complete NCI frame as read from or written to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    mt: MessageType,
    gid: u8,
    oid: u8,
    bytes: Bytes,
}

impl Frame {
    /// Validate `bytes` as a single NCI frame. The payload length announced
    /// in the header must match the number of trailing bytes.
    pub fn parse(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        let header = bytes.get(..HEADER_SIZE).ok_or(HalError::InvalidFrame("truncated header"))?;
        let header = PacketHeader::parse(header)
            .map_err(|_| HalError::InvalidFrame("reserved message type"))?;
        if bytes.len() != HEADER_SIZE + header.get_payload_length() as usize {
            return Err(HalError::InvalidFrame("payload length mismatch"));
        }
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(HalError::InvalidFrame("frame exceeds the maximum size"));
        }
        Ok(Frame { mt: header.get_mt(), gid: header.get_gid(), oid: header.get_oid(), bytes })
    }

    #[allow(missing_docs)]
    pub fn message_type(&self) -> MessageType {
        self.mt
    }

    /// Group identifier. For data packets this is the Conn ID.
    pub fn gid(&self) -> u8 {
        self.gid
    }

    #[allow(missing_docs)]
    pub fn oid(&self) -> u8 {
        self.oid
    }

    #[allow(missing_docs)]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// Raw bytes, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Status carried by the frame. Responses start their payload with the
    /// status, and so do the CORE error notifications.
    pub fn status(&self) -> Option<Status> {
        let carries_status = match self.mt {
            MessageType::Response => true,
            MessageType::Notification => {
                self.gid == gid::CORE
                    && matches!(self.oid, oid::CORE_GENERIC_ERROR | oid::CORE_INTERFACE_ERROR)
            }
            _ => false,
        };
        if !carries_status {
            return None;
        }
        self.payload().first().map(|status| Status::from_byte(*status))
    }

    /// Whether this frame is of type `mt` with the given group and opcode.
    pub fn is(&self, mt: MessageType, gid: u8, oid: u8) -> bool {
        self.mt == mt && self.gid == gid && self.oid == oid
    }

    /// Whether this frame is the response matching the command `cmd`.
    pub fn is_response_to(&self, cmd: &[u8]) -> bool {
        match cmd.get(..HEADER_SIZE).map(PacketHeader::parse) {
            Some(Ok(header)) => self.is(MessageType::Response, header.get_gid(), header.get_oid()),
            _ => false,
        }
    }

    /// Decode the frame as a CORE group packet.
    fn core_packet(&self) -> Result<CorePacketChild> {
        let packet = ControlPacket::parse(&self.bytes)
            .map_err(|_| HalError::InvalidFrame("malformed control packet"))?;
        match packet.specialize() {
            packets::ControlPacketChild::CorePacket(packet) => Ok(packet.specialize()),
            _ => Err(HalError::InvalidFrame("not a CORE packet")),
        }
    }
}

/// Identifier of a configuration parameter. Proprietary identifiers in the
/// 0xA0xx and 0xA1xx ranges are encoded on two bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigParamId(pub u16);

impl ConfigParamId {
    fn is_extended(self) -> bool {
        matches!(self.0 >> 8, 0xa0 | 0xa1)
    }

    fn put(self, buf: &mut BytesMut) {
        if self.is_extended() {
            buf.put_u16(self.0);
        } else {
            buf.put_u8(self.0 as u8);
        }
    }

    /// Decode an identifier, returning it along with its encoded size.
    fn take(bytes: &[u8]) -> Result<(Self, usize)> {
        match bytes {
            [prefix @ (0xa0 | 0xa1), low, ..] => {
                Ok((ConfigParamId(u16::from_be_bytes([*prefix, *low])), 2))
            }
            [0xa0 | 0xa1] => Err(HalError::InvalidFrame("truncated parameter identifier")),
            [id, ..] => Ok((ConfigParamId(*id as u16), 1)),
            [] => Err(HalError::InvalidFrame("missing parameter identifier")),
        }
    }
}

impl std::fmt::Display for ConfigParamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_extended() {
            write!(f, "{:#06x}", self.0)
        } else {
            write!(f, "{:#04x}", self.0)
        }
    }
}

/// A configuration parameter TLV.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ConfigParam {
    pub id: ConfigParamId,
    pub value: Vec<u8>,
}

/// Parse `count` parameter TLVs.
pub fn parse_config_params(count: u8, mut bytes: &[u8]) -> Result<Vec<ConfigParam>> {
    let mut params = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (id, consumed) = ConfigParamId::take(bytes)?;
        bytes = &bytes[consumed..];
        let (&len, tail) =
            bytes.split_first().ok_or(HalError::InvalidFrame("missing parameter length"))?;
        if tail.len() < len as usize {
            return Err(HalError::InvalidFrame("truncated parameter value"));
        }
        params.push(ConfigParam { id, value: tail[..len as usize].to_vec() });
        bytes = &tail[len as usize..];
    }
    Ok(params)
}

/// Parse `count` parameter identifiers.
pub fn parse_config_ids(count: u8, mut bytes: &[u8]) -> Result<Vec<ConfigParamId>> {
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (id, consumed) = ConfigParamId::take(bytes)?;
        bytes = &bytes[consumed..];
        ids.push(id);
    }
    Ok(ids)
}

/// Encode parameter TLVs, without the count.
pub fn encode_config_params(params: &[ConfigParam]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for param in params {
        param.id.put(&mut buf);
        buf.put_u8(param.value.len() as u8);
        buf.put_slice(&param.value);
    }
    buf.to_vec()
}

/// Encode parameter identifiers, without the count.
pub fn encode_config_ids(ids: &[ConfigParamId]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for id in ids {
        id.put(&mut buf);
    }
    buf.to_vec()
}

/// Extract the parameters written by a CORE_SET_CONFIG_CMD.
pub fn set_config_params(cmd: &Frame) -> Option<Vec<ConfigParam>> {
    match cmd.core_packet().ok()? {
        CorePacketChild::CoreSetConfigCommand(cmd) => {
            parse_config_params(cmd.get_parameter_count(), &cmd.get_parameters()[..]).ok()
        }
        _ => None,
    }
}

/// Extract the parameters returned by a successful CORE_GET_CONFIG_RSP.
pub fn get_config_params(rsp: &Frame) -> Result<Vec<ConfigParam>> {
    if !rsp.is(MessageType::Response, gid::CORE, oid::CORE_GET_CONFIG) {
        return Err(HalError::InvalidFrame("not a CORE_GET_CONFIG_RSP"));
    }
    match rsp.status() {
        Some(Status::Ok) => (),
        Some(status) => return Err(HalError::Status(status)),
        None => return Err(HalError::InvalidFrame("empty CORE_GET_CONFIG_RSP")),
    }
    match rsp.core_packet()? {
        CorePacketChild::CoreGetConfigResponse(rsp) => {
            parse_config_params(rsp.get_parameter_count(), &rsp.get_parameters()[..])
        }
        _ => Err(HalError::InvalidFrame("malformed CORE_GET_CONFIG_RSP")),
    }
}

/// Serialize a control packet.
pub fn serialize(packet: impl Into<ControlPacket>) -> Bytes {
    Bytes::from(packet.into().to_vec())
}

/// Build a control packet of type `mt` in any group.
pub fn control_packet(mt: MessageType, gid: u8, oid: u8, payload: &[u8]) -> Bytes {
    let header = packets::PacketHeaderBuilder {
        gid: gid & 0x0f,
        pbf: PacketBoundaryFlag::CompleteOrFinal,
        mt,
        oid: oid & 0x3f,
        payload_length: payload.len() as u8,
    }
    .build();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&header.to_vec());
    buf.put_slice(payload);
    buf.freeze()
}

#[allow(missing_docs)]
pub fn core_reset_cmd(reset_type: ResetType) -> Bytes {
    serialize(packets::CoreResetCommandBuilder { reset_type })
}

/// CORE_INIT_CMD in the layout of `version`: NCI 2.0 carries a two byte
/// feature enable field, NCI 1.x has no payload.
pub fn core_init_cmd(version: NciVersion) -> Bytes {
    let feature_enable = if version.is_v2() { vec![0x00, 0x00] } else { vec![] };
    serialize(packets::CoreInitCommandBuilder { feature_enable })
}

#[allow(missing_docs)]
pub fn core_set_config_cmd(params: &[ConfigParam]) -> Bytes {
    serialize(packets::CoreSetConfigCommandBuilder {
        parameter_count: params.len() as u8,
        parameters: encode_config_params(params),
    })
}

#[allow(missing_docs)]
pub fn core_get_config_cmd(ids: &[ConfigParamId]) -> Bytes {
    serialize(packets::CoreGetConfigCommandBuilder {
        parameter_count: ids.len() as u8,
        parameter_ids: encode_config_ids(ids),
    })
}

/// Whether the controller will follow `rsp` with a notification before the
/// exchange started by `cmd` is complete. NCI 2.0 controllers answer
/// CORE_RESET_CMD with a one byte response followed by CORE_RESET_NTF.
pub fn awaits_notification(cmd: &[u8], rsp: &Frame) -> bool {
    if !rsp.is_response_to(cmd) || !rsp.is(MessageType::Response, gid::CORE, oid::CORE_RESET) {
        return false;
    }
    match rsp.core_packet() {
        Ok(CorePacketChild::CoreResetResponse(rsp)) => {
            rsp.get_status() == Status::Ok && rsp.get_version_information().is_empty()
        }
        _ => false,
    }
}

/// Information reported by the controller when it resets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResetInfo {
    /// NCI version the controller runs.
    pub version: NciVersion,
    #[allow(missing_docs)]
    pub config_status: ConfigStatus,
    /// Manufacturer Specific Information, empty for NCI 1.x controllers.
    pub manufacturer_info: Vec<u8>,
}

/// Decode CORE_RESET_RSP and, for NCI 2.0 controllers, CORE_RESET_NTF.
pub fn parse_reset(rsp: &Frame, ntf: Option<&Frame>) -> Result<ResetInfo> {
    let rsp = match rsp.core_packet()? {
        CorePacketChild::CoreResetResponse(rsp) => rsp,
        _ => return Err(HalError::InvalidFrame("not a CORE_RESET_RSP")),
    };
    if rsp.get_status() != Status::Ok {
        return Err(HalError::Status(rsp.get_status()));
    }

    match (&rsp.get_version_information()[..], ntf) {
        // NCI 1.x: NCI Version, Configuration Status.
        ([version, config_status], _) => Ok(ResetInfo {
            version: NciVersion::try_from(*version)
                .map_err(|_| HalError::InvalidFrame("unknown NCI version"))?,
            config_status: ConfigStatus::try_from(*config_status)
                .map_err(|_| HalError::InvalidFrame("unknown configuration status"))?,
            manufacturer_info: vec![],
        }),
        ([], Some(ntf)) => match ntf.core_packet() {
            Ok(CorePacketChild::CoreResetNotification(ntf)) => Ok(ResetInfo {
                version: ntf.get_nci_version(),
                config_status: ntf.get_config_status(),
                manufacturer_info: ntf.get_manufacturer_specific_information().to_vec(),
            }),
            _ => Err(HalError::InvalidFrame("malformed CORE_RESET_NTF")),
        },
        ([], None) => Err(HalError::InvalidFrame("missing CORE_RESET_NTF")),
        _ => Err(HalError::InvalidFrame("malformed CORE_RESET_RSP")),
    }
}

/// Manufacturer Specific Information trailing an NCI 1.x CORE_INIT_RSP.
pub fn core_init_manufacturer_info(rsp: &Frame) -> Option<Vec<u8>> {
    const MANUFACTURER_INFO_SIZE: usize = 4;
    match rsp.core_packet().ok()? {
        CorePacketChild::CoreInitResponse(rsp) => {
            let parameters = rsp.get_parameters();
            let start = parameters.len().checked_sub(MANUFACTURER_INFO_SIZE)?;
            Some(parameters[start..].to_vec())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let header = PacketHeader::parse(&[0x6f, 0x02, 0x05]).unwrap();
        assert_eq!(header.get_mt(), MessageType::Notification);
        assert_eq!(header.get_pbf(), PacketBoundaryFlag::CompleteOrFinal);
        assert_eq!(header.get_gid(), gid::PROPRIETARY);
        assert_eq!(header.get_oid(), 0x02);
        assert_eq!(header.get_payload_length(), 5);

        let header = PacketHeader::parse(&[0x10, 0x00, 0xff]).unwrap();
        assert_eq!(header.get_mt(), MessageType::Data);
        assert_eq!(header.get_pbf(), PacketBoundaryFlag::Incomplete);
    }

    #[test]
    fn frame_rejects_length_mismatch() {
        assert!(Frame::parse(vec![0x40, 0x00, 0x03, 0x00]).is_err());
        assert!(Frame::parse(vec![0x40, 0x00]).is_err());
        assert!(Frame::parse(vec![0xe0, 0x00, 0x00]).is_err());
        let frame = Frame::parse(vec![0x40, 0x00, 0x01, 0x09]).unwrap();
        assert_eq!(frame.status(), Some(Status::InvalidParam));
    }

    #[test]
    fn status_bytes() {
        for status in [0x00, 0x07, 0x09, 0x0b, 0xa1, 0xe3, 0xff] {
            assert_eq!(u8::from(Status::from_byte(status)), status);
        }
        // CORE_GENERIC_ERROR_NTF carries a status, other notifications do not.
        let ntf = Frame::parse(vec![0x60, 0x07, 0x01, 0x03]).unwrap();
        assert_eq!(ntf.status(), Some(Status::Failed));
        let ntf = Frame::parse(vec![0x61, 0x05, 0x01, 0x03]).unwrap();
        assert_eq!(ntf.status(), None);
    }

    #[test]
    fn command_layouts() {
        assert_eq!(&core_reset_cmd(ResetType::KeepConfig)[..], &[0x20, 0x00, 0x01, 0x00]);
        assert_eq!(&core_reset_cmd(ResetType::ResetConfig)[..], &[0x20, 0x00, 0x01, 0x01]);
        assert_eq!(&core_init_cmd(NciVersion::Version11)[..], &[0x20, 0x01, 0x00]);
        assert_eq!(
            &core_get_config_cmd(&[ConfigParamId(0x32), ConfigParamId(0xa0ec)])[..],
            &[0x20, 0x03, 0x04, 0x02, 0x32, 0xa0, 0xec]
        );
        assert_eq!(
            &control_packet(MessageType::Response, gid::PROPRIETARY, 0x02, &[0x00])[..],
            &[0x4f, 0x02, 0x01, 0x00]
        );
    }

    #[test]
    fn response_matching() {
        let cmd = core_init_cmd(NciVersion::Version20);
        assert_eq!(&cmd[..], &[0x20, 0x01, 0x02, 0x00, 0x00]);
        let rsp = Frame::parse(vec![0x40, 0x01, 0x01, 0x00]).unwrap();
        assert!(rsp.is_response_to(&cmd));
        assert!(!rsp.is_response_to(&core_reset_cmd(ResetType::KeepConfig)));
    }

    #[test]
    fn extended_parameter_ids() {
        let cmd = core_set_config_cmd(&[
            ConfigParam { id: ConfigParamId(0x32), value: vec![0x60] },
            ConfigParam { id: ConfigParamId(0xa003), value: vec![0x02] },
        ]);
        assert_eq!(
            &cmd[..],
            &[0x20, 0x02, 0x08, 0x02, 0x32, 0x01, 0x60, 0xa0, 0x03, 0x01, 0x02]
        );
        let frame = Frame::parse(cmd).unwrap();
        let params = set_config_params(&frame).unwrap();
        assert_eq!(params[1].id, ConfigParamId(0xa003));
        assert_eq!(params[1].value, vec![0x02]);
    }

    #[test]
    fn truncated_parameters() {
        assert!(parse_config_params(1, &[0xa0]).is_err());
        assert!(parse_config_params(1, &[0x32, 0x02, 0x00]).is_err());
        assert!(parse_config_params(1, &[]).is_err());
        assert!(parse_config_ids(2, &[0x32]).is_err());
    }

    #[test]
    fn get_config_response() {
        let rsp = Frame::parse(vec![0x40, 0x03, 0x06, 0x00, 0x01, 0xa0, 0xec, 0x01, 0x01]).unwrap();
        let params = get_config_params(&rsp).unwrap();
        assert_eq!(params, vec![ConfigParam { id: ConfigParamId(0xa0ec), value: vec![0x01] }]);

        let rsp = Frame::parse(vec![0x40, 0x03, 0x01, 0x09]).unwrap();
        assert!(matches!(get_config_params(&rsp), Err(HalError::Status(Status::InvalidParam))));
    }

    #[test]
    fn reset_nci_20() {
        let cmd = core_reset_cmd(ResetType::KeepConfig);
        let rsp = Frame::parse(vec![0x40, 0x00, 0x01, 0x00]).unwrap();
        assert!(awaits_notification(&cmd, &rsp));
        let ntf = Frame::parse(vec![
            0x60, 0x00, 0x09, 0x02, 0x00, 0x20, 0x04, 0x04, 0x51, 0x01, 0x02, 0x03,
        ])
        .unwrap();
        let info = parse_reset(&rsp, Some(&ntf)).unwrap();
        assert_eq!(info.version, NciVersion::Version20);
        assert_eq!(info.config_status, ConfigStatus::ConfigKept);
        assert_eq!(info.manufacturer_info, vec![0x51, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn reset_nci_1x() {
        let cmd = core_reset_cmd(ResetType::KeepConfig);
        let rsp = Frame::parse(vec![0x40, 0x00, 0x03, 0x00, 0x11, 0x01]).unwrap();
        assert!(!awaits_notification(&cmd, &rsp));
        let info = parse_reset(&rsp, None).unwrap();
        assert_eq!(info.version, NciVersion::Version11);
        assert_eq!(info.config_status, ConfigStatus::ConfigReset);
        assert!(info.manufacturer_info.is_empty());
    }

    #[test]
    fn reset_failure_status() {
        let rsp = Frame::parse(vec![0x40, 0x00, 0x01, 0x03]).unwrap();
        assert!(matches!(parse_reset(&rsp, None), Err(HalError::Status(Status::Failed))));
    }
}

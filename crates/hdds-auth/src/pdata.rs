// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Participant built-in topic data key extraction.
//!
//! The `c.pdata` handshake property carries the peer's serialized
//! ParticipantBuiltinTopicData (PL_CDR encapsulation + parameter list).
//! The authentication core only needs the participant GUID out of it, to
//! check that the claimed key matches the peer's certificate-derived
//! identity; full deserialization belongs to the discovery layer.

use crate::error::{AuthErrorKind, SecResult, SecurityException};
use crate::guid::GUID;

/// PL_CDR big-endian encapsulation identifier.
const PL_CDR_BE: u16 = 0x0002;
/// PL_CDR little-endian encapsulation identifier.
const PL_CDR_LE: u16 = 0x0003;

const PID_PARTICIPANT_GUID: u16 = 0x0050;
const PID_SENTINEL: u16 = 0x0001;

/// Extract the participant GUID from serialized participant data.
pub(crate) fn participant_guid_from_pdata(
    context: &'static str,
    data: &[u8],
) -> SecResult<GUID> {
    let fail = |msg: String| SecurityException::new(context, AuthErrorKind::PDataMismatch, msg);

    if data.len() < 4 {
        return Err(fail("c.pdata too short for an encapsulation header".into()));
    }

    // Encapsulation header is always big-endian per the CDR spec
    let encapsulation = u16::from_be_bytes([data[0], data[1]]);
    let little_endian = match encapsulation {
        PL_CDR_LE => true,
        PL_CDR_BE => false,
        other => {
            return Err(fail(format!(
                "c.pdata has unsupported encapsulation 0x{:04x}",
                other
            )));
        }
    };

    let read_u16 = |bytes: [u8; 2]| {
        if little_endian {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        }
    };

    // Walk the parameter list: pid(2), length(2), value(length, 4-aligned)
    let mut offset = 4;
    while offset + 4 <= data.len() {
        let pid = read_u16([data[offset], data[offset + 1]]);
        let len = read_u16([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if pid == PID_SENTINEL {
            break;
        }
        if offset + len > data.len() {
            return Err(fail(format!(
                "c.pdata parameter 0x{:04x} overruns the buffer",
                pid
            )));
        }
        if pid == PID_PARTICIPANT_GUID {
            if len < 16 {
                return Err(fail(format!(
                    "c.pdata participant GUID has invalid length {}",
                    len
                )));
            }
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&data[offset..offset + 16]);
            return Ok(GUID::from_bytes(bytes));
        }
        // parameter values are padded to a 4-byte boundary
        offset += (len + 3) & !3;
    }

    Err(fail("c.pdata does not carry a participant GUID".into()))
}

/// Serialize a minimal ParticipantBuiltinTopicData carrying only the
/// participant GUID (PL_CDR_LE). Used by the handshake test fixtures.
#[cfg(test)]
pub(crate) fn serialize_pdata(guid: &GUID) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + 16 + 4);
    out.extend_from_slice(&PL_CDR_LE.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]); // options
    out.extend_from_slice(&PID_PARTICIPANT_GUID.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(&guid.as_bytes());
    out.extend_from_slice(&PID_SENTINEL.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_guid() -> GUID {
        GUID::new(
            [0x80, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb],
            [0x00, 0x00, 0x01, 0xc1],
        )
    }

    #[test]
    fn test_roundtrip_little_endian() {
        let guid = sample_guid();
        let data = serialize_pdata(&guid);
        let parsed = participant_guid_from_pdata("test", &data).unwrap();
        assert_eq!(parsed, guid);
    }

    #[test]
    fn test_big_endian_parameter_list() {
        let guid = sample_guid();
        let mut data = Vec::new();
        data.extend_from_slice(&PL_CDR_BE.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]);
        data.extend_from_slice(&PID_PARTICIPANT_GUID.to_be_bytes());
        data.extend_from_slice(&16u16.to_be_bytes());
        data.extend_from_slice(&guid.as_bytes());
        data.extend_from_slice(&PID_SENTINEL.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());

        let parsed = participant_guid_from_pdata("test", &data).unwrap();
        assert_eq!(parsed, guid);
    }

    #[test]
    fn test_guid_after_other_parameters() {
        let guid = sample_guid();
        let mut data = Vec::new();
        data.extend_from_slice(&PL_CDR_LE.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]);
        // a 6-byte parameter padded to 8
        data.extend_from_slice(&0x0016u16.to_le_bytes());
        data.extend_from_slice(&8u16.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 0, 0]);
        data.extend_from_slice(&PID_PARTICIPANT_GUID.to_le_bytes());
        data.extend_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(&guid.as_bytes());
        data.extend_from_slice(&PID_SENTINEL.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());

        let parsed = participant_guid_from_pdata("test", &data).unwrap();
        assert_eq!(parsed, guid);
    }

    #[test]
    fn test_truncated_data() {
        let guid = sample_guid();
        let data = serialize_pdata(&guid);
        let err = participant_guid_from_pdata("test", &data[..10]).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::PDataMismatch);
    }

    #[test]
    fn test_unsupported_encapsulation() {
        let err = participant_guid_from_pdata("test", &[0x01, 0x42, 0, 0]).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::PDataMismatch);
    }

    #[test]
    fn test_missing_guid_parameter() {
        let mut data = Vec::new();
        data.extend_from_slice(&PL_CDR_LE.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]);
        data.extend_from_slice(&PID_SENTINEL.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        let err = participant_guid_from_pdata("test", &data).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::PDataMismatch);
    }
}

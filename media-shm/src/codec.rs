// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed message framing
//!
//! Each message is a big-endian `u32` byte count followed by a JSON
//! document. The host side reads the same framing with tokio.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::MAX_MESSAGE_SIZE;
use crate::{MediaError, Result};

/// Serialize `message` into its JSON body, checking the size limit
pub fn encode_body<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    check_len(body.len())?;
    Ok(body)
}

/// Parse a JSON body
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Reject bodies over [`MAX_MESSAGE_SIZE`]
pub fn check_len(len: usize) -> Result<()> {
    if len > MAX_MESSAGE_SIZE {
        return Err(MediaError::InvalidArgument(format!(
            "message of {len} bytes exceeds limit of {MAX_MESSAGE_SIZE}"
        )));
    }
    Ok(())
}

/// Write one framed message
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = encode_body(message)?;
    writer.write_u32::<BigEndian>(body.len() as u32)?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    check_len(len)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode_body(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Pts, RpcCall, RpcRequest};
    use std::io::Cursor;

    #[test]
    fn test_framed_request() {
        let request = RpcRequest {
            task_id: 3,
            call: RpcCall::ReceiveOutputData(Pts { pts: 12 }),
        };
        let mut wire = Vec::new();
        write_message(&mut wire, &request).unwrap();

        let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(len, wire.len() - 4);
        let json: serde_json::Value = serde_json::from_slice(&wire[4..]).unwrap();
        assert_eq!(json["call"]["method"], "ReceiveOutputData");
        assert_eq!(json["call"]["params"]["pts"], 12);

        let decoded: RpcRequest = read_message(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut wire = Vec::new();
        wire.write_u32::<BigEndian>(MAX_MESSAGE_SIZE as u32 + 1).unwrap();
        let result: Result<RpcRequest> = read_message(&mut Cursor::new(wire));
        assert!(matches!(result, Err(MediaError::InvalidArgument(_))));
    }

    #[test]
    fn test_truncated_stream_is_io_error() {
        let mut wire = Vec::new();
        wire.write_u32::<BigEndian>(64).unwrap();
        wire.extend_from_slice(b"{\"taskId\"");
        let result: Result<RpcRequest> = read_message(&mut Cursor::new(wire));
        assert!(matches!(result, Err(MediaError::Io(_))));
    }

    #[test]
    fn test_garbage_body_is_operation_failure() {
        let result: Result<RpcRequest> = decode_body(b"not json");
        assert!(matches!(result, Err(MediaError::OperationFailed(_))));
    }
}

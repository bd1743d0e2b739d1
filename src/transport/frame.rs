//! Frame wire schema for the reliable stream layer.
//!
//! A frame is the unit exchanged between the two stream multiplexers. The
//! kinds are modeled as enum variants so that a payload exists exactly on
//! `Data` and an identifier list exactly on `Ack`/`Req`; a frame with the
//! wrong shape is unrepresentable. Retransmission bookkeeping is deliberately
//! absent here: it is private state of the send window, not wire data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One unit of wire exchange between two stream multiplexers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A numbered slice of the byte stream.
    Data {
        /// Frame identifier in `[0, max_id]`, wrapping.
        id: u32,
        /// Stream bytes; between 1 and the negotiated frame size.
        payload: Vec<u8>,
    },

    /// Acknowledgment of received DATA frame identifiers.
    Ack {
        /// Identifiers seen by the peer since its last tick, in no
        /// particular order.
        ids: Vec<u32>,
    },

    /// Request to retransmit DATA frame identifiers.
    Req {
        /// Identifiers the peer believes were lost.
        ids: Vec<u32>,
    },
}

impl Frame {
    /// Encode into the wire representation.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        bincode::serialize(self).map_err(|e| FrameError::Encode(e.to_string()))
    }

    /// Decode from the wire representation.
    ///
    /// Fails on truncated input and on unknown frame kinds, which callers
    /// are expected to drop.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        bincode::deserialize(data).map_err(|e| FrameError::Decode(e.to_string()))
    }
}

/// Errors from the frame wire codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Serialization failed.
    #[error("frame encode failed: {0}")]
    Encode(String),

    /// Input was not a well-formed frame.
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_roundtrip() {
        let frame = Frame::Data {
            id: 42,
            payload: b"hello".to_vec(),
        };
        let wire = frame.encode().unwrap();
        assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_ack_roundtrip() {
        let frame = Frame::Ack {
            ids: vec![0, 7, 3],
        };
        let wire = frame.encode().unwrap();
        assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_req_roundtrip() {
        let frame = Frame::Req { ids: vec![999_999] };
        let wire = frame.encode().unwrap();
        assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // Variant tags beyond Req are unknown kinds.
        assert!(Frame::decode(&[0xFF; 16]).is_err());
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let wire = Frame::Data {
            id: 1,
            payload: vec![1, 2, 3, 4],
        }
        .encode()
        .unwrap();
        assert!(Frame::decode(&wire[..wire.len() - 2]).is_err());
    }
}

//! Wire protocol: message types, framing and message payloads.
//!
//! Frame format: `[1B type][4B length (big-endian)][payload]`
//!
//! Payloads are a varint followed by length-prefixed blobs. An empty blob
//! means the field is absent.

use cellcnn::matrix::{get_uvarint, put_uvarint};
use cellcnn::{CnnError, Matrix};
use thiserror::Error;

// ─── Message types ───────────────────────────────────────────────────────

/// Protocol message type tags (1 byte on the wire).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Sync = 0x01,
    Iteration = 0x10,
    LocalGradient = 0x11,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Sync),
            0x10 => Some(Self::Iteration),
            0x11 => Some(Self::LocalGradient),
            _ => None,
        }
    }
}

// ─── Frame encoding ──────────────────────────────────────────────────────

/// Maximum allowed frame payload size (256 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 256 * 1024 * 1024;

/// Wire frame: 1B type + 4B big-endian length + payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Encode to `[type][length][payload]`, refusing oversized payloads.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let len = self.payload.len() as u32;
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a frame from bytes. Returns (frame, bytes_consumed).
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < 5 {
            return Err(FrameError::Incomplete);
        }
        let msg_type = MessageType::from_u8(data[0]).ok_or(FrameError::UnknownType(data[0]))?;
        let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(len));
        }
        if data.len() < 5 + len {
            return Err(FrameError::Incomplete);
        }
        let payload = data[5..5 + len].to_vec();
        Ok((Self { msg_type, payload }, 5 + len))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("incomplete frame")]
    Incomplete,
    #[error("unknown message type: 0x{0:02x}")]
    UnknownType(u8),
    #[error("payload too large: {0} bytes (max {max})", max = MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),
}

// ─── Payloads ────────────────────────────────────────────────────────────

/// Root-to-children weights for iteration `n`. Cleartext weights travel
/// beside the ciphertexts when cleartext training runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationMsg {
    pub n: u64,
    pub c: Option<Vec<u8>>,
    pub w: Option<Vec<u8>>,
    pub ct_c: Option<Vec<u8>>,
    pub ct_w: Option<Vec<u8>>,
}

/// Child-to-parent contribution: cleartext reference deltas and the
/// encrypted updates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradientMsg {
    pub dc: Option<Vec<u8>>,
    pub dw: Option<Vec<u8>>,
    pub ct_dc: Option<Vec<u8>>,
    pub ct_dw: Option<Vec<u8>>,
}

fn put_blob(buf: &mut Vec<u8>, blob: &Option<Vec<u8>>) {
    let bytes = blob.as_deref().unwrap_or_default();
    put_uvarint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn get_blob(data: &[u8], pos: &mut usize) -> cellcnn::Result<Option<Vec<u8>>> {
    let len = get_uvarint(data, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| CnnError::Serialization(format!("blob of {} bytes overruns payload", len)))?;
    let blob = &data[*pos..end];
    *pos = end;
    Ok((!blob.is_empty()).then(|| blob.to_vec()))
}

fn expect_end(data: &[u8], pos: usize) -> cellcnn::Result<()> {
    if pos != data.len() {
        return Err(CnnError::Serialization(format!(
            "{} trailing bytes",
            data.len() - pos
        )));
    }
    Ok(())
}

impl IterationMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, self.n);
        for blob in [&self.c, &self.w, &self.ct_c, &self.ct_w] {
            put_blob(&mut buf, blob);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> cellcnn::Result<Self> {
        let mut pos = 0;
        let n = get_uvarint(data, &mut pos)?;
        let msg = Self {
            n,
            c: get_blob(data, &mut pos)?,
            w: get_blob(data, &mut pos)?,
            ct_c: get_blob(data, &mut pos)?,
            ct_w: get_blob(data, &mut pos)?,
        };
        expect_end(data, pos)?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Iteration, self.encode())
    }
}

impl GradientMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for blob in [&self.dc, &self.dw, &self.ct_dc, &self.ct_dw] {
            put_blob(&mut buf, blob);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> cellcnn::Result<Self> {
        let mut pos = 0;
        let msg = Self {
            dc: get_blob(data, &mut pos)?,
            dw: get_blob(data, &mut pos)?,
            ct_dc: get_blob(data, &mut pos)?,
            ct_dw: get_blob(data, &mut pos)?,
        };
        expect_end(data, pos)?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::LocalGradient, self.encode())
    }
}

/// Matrix blob, absent for `None`.
pub fn matrix_blob(m: Option<&Matrix>) -> Option<Vec<u8>> {
    m.map(Matrix::to_bytes)
}

pub fn matrix_from_blob(blob: Option<&[u8]>) -> cellcnn::Result<Option<Matrix>> {
    blob.map(Matrix::from_bytes).transpose()
}

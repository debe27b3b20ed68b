//! DSM Wire Protocol
//!
//! Messages exchanged between engines over transport streams. Each message
//! is an envelope: a 6-byte big-endian header (`u16` message kind, `u32` body
//! length) followed by the bincode-encoded body.
//!
//! Page transfers travel on `Data` streams; lease, invalidation and array
//! lifecycle messages travel on `Control` streams.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::array::ArrayDescriptor;
use super::error::{DsmError, DsmResult};
use super::types::{ArrayId, Lease, LeaseId, LeaseType, PageId, Version};
use crate::membership::types::NodeId;
use crate::transport::StreamKind;
use crate::transport::frame::MAX_FRAME_SIZE;

/// Envelope header length in bytes.
pub const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DsmRequest {
    /// Read a page from its owner. `version` is the array version the reader observed.
    FetchPage {
        array: ArrayId,
        page: PageId,
        version: Version,
    },
    /// Commit a flushed page at its owner. `lease` is the pusher's Write
    /// lease, checked with the home before the commit.
    PushPage {
        array: ArrayId,
        page: PageId,
        version: Version,
        lease: LeaseId,
        data: Vec<u8>,
    },
    /// Grant a lease under the id chosen by the requester.
    AcquireLease {
        array: ArrayId,
        page: PageId,
        lease_type: LeaseType,
        owner: NodeId,
        version: Version,
        lease: LeaseId,
    },
    ReleaseLease {
        lease: LeaseId,
    },
    ValidateLease {
        lease: LeaseId,
    },
    RevokeLease {
        array: ArrayId,
        page: PageId,
    },
    /// Drop cached copies of the listed pages.
    Invalidate {
        array: ArrayId,
        pages: Vec<PageId>,
    },
    /// Advance the array version at its home.
    BumpVersion {
        array: ArrayId,
    },
    AnnounceArray {
        descriptor: ArrayDescriptor,
    },
    DropArray {
        array: ArrayId,
    },
    /// Undo an acquisition the requester abandoned, granted or not.
    WithdrawLease {
        array: ArrayId,
        page: PageId,
        lease: LeaseId,
    },
}

impl DsmRequest {
    pub fn kind_code(&self) -> u16 {
        match self {
            DsmRequest::FetchPage { .. } => 1,
            DsmRequest::PushPage { .. } => 2,
            DsmRequest::AcquireLease { .. } => 3,
            DsmRequest::ReleaseLease { .. } => 4,
            DsmRequest::ValidateLease { .. } => 5,
            DsmRequest::RevokeLease { .. } => 6,
            DsmRequest::Invalidate { .. } => 7,
            DsmRequest::BumpVersion { .. } => 8,
            DsmRequest::AnnounceArray { .. } => 9,
            DsmRequest::DropArray { .. } => 10,
            DsmRequest::WithdrawLease { .. } => 11,
        }
    }

    pub fn stream_kind(&self) -> StreamKind {
        match self {
            DsmRequest::FetchPage { .. } | DsmRequest::PushPage { .. } => StreamKind::Data,
            _ => StreamKind::Control,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DsmResponse {
    Page {
        version: Version,
        data: Vec<u8>,
    },
    /// A granted lease plus the page's owner of record at the home.
    LeaseGranted {
        lease: Lease,
        owner: Option<NodeId>,
    },
    Lease(Lease),
    Version(Version),
    Ack,
    Error(DsmError),
}

impl DsmResponse {
    pub fn kind_code(&self) -> u16 {
        match self {
            DsmResponse::Page { .. } => 101,
            DsmResponse::LeaseGranted { .. } => 102,
            DsmResponse::Lease(_) => 103,
            DsmResponse::Version(_) => 104,
            DsmResponse::Ack => 105,
            DsmResponse::Error(_) => 106,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DsmResponse::Page { .. } => "Page",
            DsmResponse::LeaseGranted { .. } => "LeaseGranted",
            DsmResponse::Lease(_) => "Lease",
            DsmResponse::Version(_) => "Version",
            DsmResponse::Ack => "Ack",
            DsmResponse::Error(_) => "Error",
        }
    }
}

/// Builds the error for a well-formed reply of the wrong kind.
pub fn unexpected(expected: &str, got: &DsmResponse) -> DsmError {
    DsmError::Protocol(format!("expected {} response, got {}", expected, got.name()))
}

fn encode<T: Serialize>(kind: u16, message: &T) -> DsmResult<Vec<u8>> {
    let body = bincode::serialize(message)
        .map_err(|e| DsmError::Protocol(format!("failed to encode message: {}", e)))?;
    if body.len() + HEADER_LEN > MAX_FRAME_SIZE {
        return Err(DsmError::Protocol(format!(
            "message of {} bytes exceeds the frame limit",
            body.len()
        )));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&kind.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DsmResult<(u16, T)> {
    if bytes.len() < HEADER_LEN {
        return Err(DsmError::Protocol(format!(
            "envelope of {} bytes is shorter than its header",
            bytes.len()
        )));
    }

    let kind = u16::from_be_bytes([bytes[0], bytes[1]]);
    let len = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    let body = &bytes[HEADER_LEN..];
    if len != body.len() {
        return Err(DsmError::Protocol(format!(
            "header announces {} body bytes, found {}",
            len,
            body.len()
        )));
    }

    let message = bincode::deserialize(body)
        .map_err(|e| DsmError::Protocol(format!("failed to decode message: {}", e)))?;
    Ok((kind, message))
}

pub fn encode_request(request: &DsmRequest) -> DsmResult<Vec<u8>> {
    encode(request.kind_code(), request)
}

pub fn decode_request(bytes: &[u8]) -> DsmResult<DsmRequest> {
    let (kind, request): (u16, DsmRequest) = decode(bytes)?;
    if kind != request.kind_code() {
        return Err(DsmError::Protocol(format!(
            "header kind {} does not match request kind {}",
            kind,
            request.kind_code()
        )));
    }
    Ok(request)
}

pub fn encode_response(response: &DsmResponse) -> DsmResult<Vec<u8>> {
    encode(response.kind_code(), response)
}

pub fn decode_response(bytes: &[u8]) -> DsmResult<DsmResponse> {
    let (kind, response): (u16, DsmResponse) = decode(bytes)?;
    if kind != response.kind_code() {
        return Err(DsmError::Protocol(format!(
            "header kind {} does not match response kind {}",
            kind,
            response.kind_code()
        )));
    }
    Ok(response)
}

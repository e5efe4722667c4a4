//! Conversions between protocol messages and core types.

use std::time::SystemTime;

use depot::FileInfo;
use depot::transfer::Frame;
use tonic::Status;

use crate::proto::{self, WriteRequest, write_request::Member};

impl From<Frame> for WriteRequest {
    fn from(frame: Frame) -> Self {
        let member = match frame {
            Frame::Metadata { name } => Member::Name(name),
            Frame::Data(data) => Member::Data(data),
            Frame::Commit { size } => Member::Commit(size),
        };
        WriteRequest {
            member: Some(member),
        }
    }
}

impl TryFrom<WriteRequest> for Frame {
    type Error = Status;

    fn try_from(req: WriteRequest) -> Result<Self, Self::Error> {
        match req.member {
            Some(Member::Name(name)) => Ok(Frame::Metadata { name }),
            Some(Member::Data(data)) => Ok(Frame::Data(data)),
            Some(Member::Commit(size)) => Ok(Frame::Commit { size }),
            None => Err(Status::invalid_argument("empty write request")),
        }
    }
}

impl From<FileInfo> for proto::FileInfo {
    fn from(info: FileInfo) -> Self {
        proto::FileInfo {
            name: info.name,
            size: info.size,
            mode: info.mode,
            mod_time: Some(prost_types::Timestamp::from(info.mod_time)),
            dir: info.dir,
        }
    }
}

/// Rebuild a [`FileInfo`] from the wire, rejecting a missing or out of range
/// timestamp.
pub(crate) fn file_info_from_proto(info: proto::FileInfo) -> Result<FileInfo, String> {
    let ts = info
        .mod_time
        .ok_or_else(|| format!("no modification time for {}", info.name))?;
    let mod_time = SystemTime::try_from(ts).map_err(|e| format!("bad modification time: {e}"))?;
    Ok(FileInfo {
        name: info.name,
        size: info.size,
        mode: info.mode,
        mod_time,
        dir: info.dir,
    })
}

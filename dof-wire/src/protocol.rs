//! Control-socket wire protocol between a tracing client and `dtprobed`.
//!
//! This is the chunked ioctl state machine from
//! `original_source/dtprobed/dtprobed.c` (`DOF_STATE_START` ->
//! `DOF_STATE_HDR` -> `DOF_STATE_DOFHDR` -> `DOF_STATE_DOF` /
//! `DOF_STATE_DOFCHUNK` -> back to `DOF_STATE_START`) carried over a Unix
//! domain socket instead of `/dev/dtrace/helper` ioctls: each request is one
//! [`Request`] frame, each reply is one [`Response`] frame, both length
//! prefixed with [`crate::record::write_frame`] / [`crate::record::read_frame`].
//!
//! A caller always opens with [`Request::Begin`], then streams the DOF with
//! one or more [`Request::Chunk`]s, then [`Request::Commit`]. Registration is
//! undone with [`Request::Remove`]. Anything out of order is a protocol
//! error, not a DOF validation error — see `dtprobed::protocol::CallerState`.

const TAG_BEGIN: u8 = 0;
const TAG_CHUNK: u8 = 1;
const TAG_COMMIT: u8 = 2;
const TAG_REMOVE: u8 = 3;

const TAG_ACK: u8 = 0;
const TAG_REGISTERED: u8 = 1;
const TAG_REMOVED: u8 = 2;
const TAG_NACK: u8 = 3;

use std::io;

/// A message sent from the tracing client to `dtprobed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Opens a registration. `helper` is the raw 64-byte `dof_helper_t`
    /// (module name + load address); `total_len` is the claimed size of the
    /// DOF blob that will follow across the subsequent `Chunk`s.
    Begin { helper: [u8; 64], total_len: u64 },
    /// One slice of the DOF blob announced by the preceding `Begin`. The
    /// caller may split the blob across as many chunks as it likes; the
    /// server reassembles until `total_len` bytes have arrived.
    Chunk { data: Vec<u8> },
    /// All chunks have been sent; validate and (if valid) register the
    /// accumulated DOF.
    Commit,
    /// Tear down a previous registration identified by `generation`.
    Remove { generation: u64 },
}

/// A message sent from `dtprobed` back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Acknowledges a `Begin` or `Chunk`; more data is expected.
    Ack,
    /// `Commit` succeeded; `generation` identifies the registration for a
    /// later `Remove`.
    Registered { generation: u64 },
    /// `Remove` succeeded.
    Removed,
    /// The request was rejected. `errno` is the closest POSIX errno
    /// (`EINVAL`, `E2BIG`, `ENOMEM`, ...); `message` is a human-readable
    /// detail for logging.
    Nack { errno: i32, message: String },
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::Begin { helper, total_len } => {
                buf.push(TAG_BEGIN);
                buf.extend_from_slice(&total_len.to_le_bytes());
                buf.extend_from_slice(helper);
            }
            Request::Chunk { data } => {
                buf.push(TAG_CHUNK);
                buf.extend_from_slice(data);
            }
            Request::Commit => buf.push(TAG_COMMIT),
            Request::Remove { generation } => {
                buf.push(TAG_REMOVE);
                buf.extend_from_slice(&generation.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Request> {
        let (&tag, rest) = buf.split_first().ok_or_else(|| invalid("empty request"))?;
        match tag {
            TAG_BEGIN => {
                if rest.len() != 8 + 64 {
                    return Err(invalid("malformed Begin request"));
                }
                let total_len = u64::from_le_bytes(rest[..8].try_into().unwrap());
                let mut helper = [0u8; 64];
                helper.copy_from_slice(&rest[8..]);
                Ok(Request::Begin { helper, total_len })
            }
            TAG_CHUNK => Ok(Request::Chunk {
                data: rest.to_vec(),
            }),
            TAG_COMMIT => {
                if !rest.is_empty() {
                    return Err(invalid("malformed Commit request"));
                }
                Ok(Request::Commit)
            }
            TAG_REMOVE => {
                if rest.len() != 8 {
                    return Err(invalid("malformed Remove request"));
                }
                Ok(Request::Remove {
                    generation: u64::from_le_bytes(rest.try_into().unwrap()),
                })
            }
            other => Err(invalid(&format!("unknown request tag {other}"))),
        }
    }
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::Ack => buf.push(TAG_ACK),
            Response::Registered { generation } => {
                buf.push(TAG_REGISTERED);
                buf.extend_from_slice(&generation.to_le_bytes());
            }
            Response::Removed => buf.push(TAG_REMOVED),
            Response::Nack { errno, message } => {
                buf.push(TAG_NACK);
                buf.extend_from_slice(&errno.to_le_bytes());
                buf.extend_from_slice(message.as_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Response> {
        let (&tag, rest) = buf.split_first().ok_or_else(|| invalid("empty response"))?;
        match tag {
            TAG_ACK => Ok(Response::Ack),
            TAG_REGISTERED => {
                if rest.len() != 8 {
                    return Err(invalid("malformed Registered response"));
                }
                Ok(Response::Registered {
                    generation: u64::from_le_bytes(rest.try_into().unwrap()),
                })
            }
            TAG_REMOVED => Ok(Response::Removed),
            TAG_NACK => {
                if rest.len() < 4 {
                    return Err(invalid("malformed Nack response"));
                }
                let errno = i32::from_le_bytes(rest[..4].try_into().unwrap());
                let message = String::from_utf8(rest[4..].to_vec())
                    .map_err(|_| invalid("non-utf8 Nack message"))?;
                Ok(Response::Nack { errno, message })
            }
            other => Err(invalid(&format!("unknown response tag {other}"))),
        }
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_round_trips() {
        let req = Request::Begin {
            helper: [7u8; 64],
            total_len: 4096,
        };
        assert_eq!(req, Request::decode(&req.encode()).unwrap());
    }

    #[test]
    fn chunk_round_trips() {
        let req = Request::Chunk {
            data: vec![1, 2, 3, 4],
        };
        assert_eq!(req, Request::decode(&req.encode()).unwrap());
    }

    #[test]
    fn commit_and_remove_round_trip() {
        assert_eq!(Request::Commit, Request::decode(&Request::Commit.encode()).unwrap());
        let req = Request::Remove { generation: 42 };
        assert_eq!(req, Request::decode(&req.encode()).unwrap());
    }

    #[test]
    fn responses_round_trip() {
        for resp in [
            Response::Ack,
            Response::Registered { generation: 9 },
            Response::Removed,
            Response::Nack {
                errno: 12,
                message: "out of memory".to_string(),
            },
        ] {
            assert_eq!(resp.clone(), Response::decode(&resp.encode()).unwrap());
        }
    }

    #[test]
    fn malformed_begin_is_rejected() {
        let mut buf = vec![TAG_BEGIN];
        buf.extend_from_slice(&1u64.to_le_bytes());
        assert!(Request::decode(&buf).is_err());
    }
}

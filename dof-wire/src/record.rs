//! Typed record stream emitted by the sandboxed parser, and the framing used
//! to carry it over the two anonymous pipes between the daemon and the
//! parser child.
//!
//! This is the direct translation of the original `dof_parsed_t` tagged
//! union (`DIT_PROVIDER` / `DIT_PROBE` / `DIT_TRACEPOINT` / `DIT_ERR`)
//! described in `original_source/libcommon/dof_parser.h`.

use std::io::{self, Read, Write};

const TAG_PROVIDER: u8 = 0;
const TAG_PROBE: u8 = 1;
const TAG_TRACEPOINT: u8 = 2;
const TAG_ERR: u8 = 3;

/// One record in the stream a successful (or failed) parse emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRecord {
    /// One per provider section; `nprobes` lets the host pre-size its
    /// accumulator for the probes that follow.
    Provider { name: String, nprobes: u32 },
    /// One per probe descriptor. `module` comes from the registration's
    /// helper struct, not the DOF itself.
    Probe {
        module: String,
        function: String,
        name: String,
        ntracepoints: u32,
    },
    /// One per probe offset (`is_enabled = false`) and then one per
    /// is-enabled offset (`is_enabled = true`), in that order, for the probe
    /// most recently emitted.
    Tracepoint { addr: u64, is_enabled: bool },
    /// Terminal: the parse failed. No further records follow in this
    /// response.
    Err { errno: i32, message: String },
}

impl ParsedRecord {
    /// Encode just this record's body (tag + payload), without a length
    /// prefix — callers add framing appropriate to their transport (sync
    /// pipe on the parser side, async pipe on the daemon side).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ParsedRecord::Provider { name, nprobes } => {
                buf.push(TAG_PROVIDER);
                buf.extend_from_slice(&nprobes.to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
            }
            ParsedRecord::Probe {
                module,
                function,
                name,
                ntracepoints,
            } => {
                buf.push(TAG_PROBE);
                buf.extend_from_slice(&ntracepoints.to_le_bytes());
                // module \0 function \0 name, matching the original's
                // single NUL-separated buffer.
                buf.extend_from_slice(module.as_bytes());
                buf.push(0);
                buf.extend_from_slice(function.as_bytes());
                buf.push(0);
                buf.extend_from_slice(name.as_bytes());
            }
            ParsedRecord::Tracepoint { addr, is_enabled } => {
                buf.push(TAG_TRACEPOINT);
                buf.extend_from_slice(&addr.to_le_bytes());
                buf.push(*is_enabled as u8);
            }
            ParsedRecord::Err { errno, message } => {
                buf.push(TAG_ERR);
                buf.extend_from_slice(&errno.to_le_bytes());
                buf.extend_from_slice(message.as_bytes());
            }
        }
        buf
    }

    /// Decode a record body previously produced by [`ParsedRecord::encode`].
    pub fn decode(buf: &[u8]) -> io::Result<ParsedRecord> {
        let (&tag, rest) = buf
            .split_first()
            .ok_or_else(|| invalid("empty parsed record"))?;
        match tag {
            TAG_PROVIDER => {
                let (nprobes, name) = split_u32(rest)?;
                Ok(ParsedRecord::Provider {
                    nprobes,
                    name: utf8(name)?,
                })
            }
            TAG_PROBE => {
                let (ntracepoints, rest) = split_u32(rest)?;
                let mut parts = rest.splitn(3, |&b| b == 0);
                let module = utf8(parts.next().unwrap_or(&[]))?;
                let function = utf8(parts.next().unwrap_or(&[]))?;
                let name = utf8(parts.next().unwrap_or(&[]))?;
                Ok(ParsedRecord::Probe {
                    module,
                    function,
                    name,
                    ntracepoints,
                })
            }
            TAG_TRACEPOINT => {
                if rest.len() < 9 {
                    return Err(invalid("truncated tracepoint record"));
                }
                let addr = u64::from_le_bytes(rest[..8].try_into().unwrap());
                Ok(ParsedRecord::Tracepoint {
                    addr,
                    is_enabled: rest[8] != 0,
                })
            }
            TAG_ERR => {
                if rest.len() < 4 {
                    return Err(invalid("truncated error record"));
                }
                let errno = i32::from_le_bytes(rest[..4].try_into().unwrap());
                Ok(ParsedRecord::Err {
                    errno,
                    message: utf8(&rest[4..])?,
                })
            }
            other => Err(invalid(&format!("unknown parsed record tag {other}"))),
        }
    }
}

fn split_u32(buf: &[u8]) -> io::Result<(u32, &[u8])> {
    if buf.len() < 4 {
        return Err(invalid("truncated record"));
    }
    Ok((u32::from_le_bytes(buf[..4].try_into().unwrap()), &buf[4..]))
}

fn utf8(buf: &[u8]) -> io::Result<String> {
    String::from_utf8(buf.to_vec()).map_err(|_| invalid("non-utf8 string in parsed record"))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Maximum size of a single framed message on the parser pipes or the
/// control-socket protocol. Guards against a misbehaving peer claiming an
/// absurd length prefix.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Write one length-prefixed frame (used on the parser's synchronous pipes).
pub fn write_frame<W: Write>(w: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| invalid("frame too large"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(body)?;
    w.flush()
}

/// Read one length-prefixed frame, or `Ok(None)` on clean EOF before any
/// bytes of the length prefix arrive.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(invalid("frame exceeds maximum length"));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips() {
        let rec = ParsedRecord::Provider {
            name: "myprov".to_string(),
            nprobes: 3,
        };
        let decoded = ParsedRecord::decode(&rec.encode()).unwrap();
        assert_eq!(rec, decoded);
    }

    #[test]
    fn probe_round_trips_with_nul_separated_fields() {
        let rec = ParsedRecord::Probe {
            module: "m".to_string(),
            function: "f".to_string(),
            name: "pr".to_string(),
            ntracepoints: 1,
        };
        let decoded = ParsedRecord::decode(&rec.encode()).unwrap();
        assert_eq!(rec, decoded);
    }

    #[test]
    fn tracepoint_round_trips() {
        let rec = ParsedRecord::Tracepoint {
            addr: 0x400100,
            is_enabled: false,
        };
        assert_eq!(rec, ParsedRecord::decode(&rec.encode()).unwrap());
    }

    #[test]
    fn err_round_trips() {
        let rec = ParsedRecord::Err {
            errno: 22,
            message: "bad magic".to_string(),
        };
        assert_eq!(rec, ParsedRecord::decode(&rec.encode()).unwrap());
    }

    #[test]
    fn frame_round_trips_through_a_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        let mut cursor = &buf[..];
        let got = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(got, b"hello");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut cursor = &buf[..];
        assert!(read_frame(&mut cursor).is_err());
    }
}

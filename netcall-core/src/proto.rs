//! Wire protocol codec.
//!
//! Frames are opaque byte strings. The codec never looks at routing frames
//! beyond locating [`SEP`] and slicing around it.

use std::fmt::{Display, Formatter};

use crate::error::{Error, Result};

/// Ordered multipart message.
pub type Frames = Vec<Vec<u8>>;

/// Marker frame separating routing identities from the message body.
pub const SEP: &[u8] = b"|";

pub const ACK: &[u8] = b"ACK";
pub const OK: &[u8] = b"OK";
pub const YIELD: &[u8] = b"YIELD";
pub const FAIL: &[u8] = b"FAIL";

/// Resumes a remote generator with a value.
pub const PROC_SEND: &str = "_SEND";
/// Raises an error inside a remote generator.
pub const PROC_THROW: &str = "_THROW";
/// Closes a remote generator.
pub const PROC_CLOSE: &str = "_CLOSE";

/// Number of body frames following the separator in a request.
const REQUEST_BODY_FRAMES: usize = 5;

/// Returns true for the generator control pseudo-procedures.
pub fn is_control_proc(name: &str) -> bool {
    name == PROC_SEND || name == PROC_THROW || name == PROC_CLOSE
}

/// Position of the separator frame, if present.
pub fn find_sep(frames: &[Vec<u8>]) -> Option<usize> {
    frames.iter().position(|f| f.as_slice() == SEP)
}

/// Kind of a reply message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ReplyType {
    /// Request was received, nothing more
    Ack,
    /// Terminal success carrying the result
    Ok,
    /// One streamed value, or stream start when the payload is empty
    Yield,
    /// Terminal error, or end of a stream
    Fail,
}

impl ReplyType {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            ReplyType::Ack => ACK,
            ReplyType::Ok => OK,
            ReplyType::Yield => YIELD,
            ReplyType::Fail => FAIL,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"ACK" => Some(ReplyType::Ack),
            b"OK" => Some(ReplyType::Ok),
            b"YIELD" => Some(ReplyType::Yield),
            b"FAIL" => Some(ReplyType::Fail),
            _ => None,
        }
    }

    /// OK and FAIL end the exchange for a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplyType::Ok | ReplyType::Fail)
    }
}

impl Display for ReplyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Decoded request message.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Routing identities accumulated on the way in
    pub route: Vec<Vec<u8>>,
    pub req_id: Vec<u8>,
    pub proc_name: String,
    pub args: Vec<u8>,
    pub kwargs: Vec<u8>,
    /// Caller doesn't want a reply
    pub ignore: bool,
}

impl Request {
    pub fn new(req_id: Vec<u8>, proc_name: &str, args: Vec<u8>, kwargs: Vec<u8>, ignore: bool) -> Self {
        Self {
            route: Vec::new(),
            req_id,
            proc_name: proc_name.to_string(),
            args,
            kwargs,
            ignore,
        }
    }

    pub fn is_control(&self) -> bool {
        is_control_proc(&self.proc_name)
    }

    pub fn into_frames(self) -> Frames {
        let mut frames = self.route;
        frames.reserve(REQUEST_BODY_FRAMES + 1);
        frames.push(SEP.to_vec());
        frames.push(self.req_id);
        frames.push(self.proc_name.into_bytes());
        frames.push(self.args);
        frames.push(self.kwargs);
        frames.push(if self.ignore { b"1".to_vec() } else { b"0".to_vec() });
        frames
    }
}

/// Decoded reply message.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub route: Vec<Vec<u8>>,
    pub req_id: Vec<u8>,
    pub type_: ReplyType,
    pub payload: Vec<Vec<u8>>,
}

impl Reply {
    pub fn new(route: Vec<Vec<u8>>, req_id: Vec<u8>, type_: ReplyType, payload: Vec<Vec<u8>>) -> Self {
        Self {
            route,
            req_id,
            type_,
            payload,
        }
    }

    pub fn into_frames(self) -> Frames {
        let mut frames = self.route;
        frames.reserve(3 + self.payload.len());
        frames.push(SEP.to_vec());
        frames.push(self.req_id);
        frames.push(self.type_.as_bytes().to_vec());
        frames.extend(self.payload);
        frames
    }

    /// YIELD with no payload announces that the call returned a stream.
    pub fn is_stream_start(&self) -> bool {
        self.type_ == ReplyType::Yield && self.payload.is_empty()
    }
}

/// Parses an incoming request.
///
/// Fails on a missing separator, a wrong number of body frames, a non-UTF-8
/// procedure name or a non-numeric ignore flag. Callers are expected to
/// log and drop the message, since there's no trustworthy `req_id` to
/// correlate a reply to.
pub fn parse_request(mut frames: Frames) -> Result<Request> {
    let sep = find_sep(&frames).ok_or_else(|| Error::ParseError("missing separator".to_string()))?;
    let body_len = frames.len() - sep - 1;
    if body_len != REQUEST_BODY_FRAMES {
        return Err(Error::ParseError(format!(
            "expected {} frames after separator, got {}",
            REQUEST_BODY_FRAMES, body_len
        )));
    }
    let mut body = frames.split_off(sep + 1);
    frames.truncate(sep);
    let ignore = parse_flag(&body[4])?;
    let kwargs = body.remove(3);
    let args = body.remove(2);
    let proc_name = String::from_utf8(body.remove(1))
        .map_err(|_| Error::ParseError("procedure name is not valid utf-8".to_string()))?;
    let req_id = body.remove(0);
    Ok(Request {
        route: frames,
        req_id,
        proc_name,
        args,
        kwargs,
        ignore,
    })
}

/// Parses an ASCII integer flag, nonzero meaning true.
fn parse_flag(bytes: &[u8]) -> Result<bool> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(|n| n != 0)
        .ok_or_else(|| {
            Error::ParseError(format!(
                "ignore flag is not numeric: {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

/// Parses an incoming reply, returning `None` on anything malformed.
pub fn parse_reply(mut frames: Frames) -> Option<Reply> {
    let sep = find_sep(&frames)?;
    if frames.len() < sep + 3 {
        return None;
    }
    let type_ = ReplyType::from_bytes(&frames[sep + 2])?;
    let payload = frames.split_off(sep + 3);
    frames.truncate(sep + 2);
    let req_id = frames.pop()?;
    frames.truncate(sep);
    Some(Reply {
        route: frames,
        req_id,
        type_,
        payload,
    })
}

/// Summary of a request as seen by an intermediary that forwards it
/// without decoding arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader<'a> {
    pub route: &'a [Vec<u8>],
    pub req_id: &'a [u8],
    pub proc_name: &'a [u8],
    pub ignore: bool,
}

impl<'a> RequestHeader<'a> {
    pub fn is_control(&self) -> bool {
        std::str::from_utf8(self.proc_name)
            .map(is_control_proc)
            .unwrap_or(false)
    }
}

/// Borrowing variant of [`parse_request`] used on the forwarding path.
pub fn peek_request(frames: &[Vec<u8>]) -> Option<RequestHeader<'_>> {
    let sep = find_sep(frames)?;
    if frames.len() - sep - 1 != REQUEST_BODY_FRAMES {
        return None;
    }
    Some(RequestHeader {
        route: &frames[..sep],
        req_id: &frames[sep + 1],
        proc_name: &frames[sep + 2],
        ignore: parse_flag(&frames[sep + 5]).ok()?,
    })
}

/// Summary of a reply as seen by an intermediary.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyHeader<'a> {
    pub route: &'a [Vec<u8>],
    pub req_id: &'a [u8],
    pub type_: ReplyType,
    pub payload_len: usize,
}

/// Borrowing variant of [`parse_reply`] used on the forwarding path.
pub fn peek_reply(frames: &[Vec<u8>]) -> Option<ReplyHeader<'_>> {
    let sep = find_sep(frames)?;
    if frames.len() < sep + 3 {
        return None;
    }
    Some(ReplyHeader {
        route: &frames[..sep],
        req_id: &frames[sep + 1],
        type_: ReplyType::from_bytes(&frames[sep + 2])?,
        payload_len: frames.len() - sep - 3,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(parts: &[&[u8]]) -> Frames {
        parts.iter().map(|p| p.to_vec()).collect()
    }

    #[test]
    fn request_with_route() {
        let req = parse_request(f(&[b"client", SEP, b"7", b"echo", b"a", b"k", b"0"])).unwrap();
        assert_eq!(req.route, vec![b"client".to_vec()]);
        assert_eq!(req.req_id, b"7");
        assert_eq!(req.proc_name, "echo");
        assert_eq!(req.args, b"a");
        assert_eq!(req.kwargs, b"k");
        assert!(!req.ignore);
        assert!(!req.is_control());
    }

    #[test]
    fn request_frames_layout() {
        let mut req = Request::new(b"1".to_vec(), "_SEND", vec![], vec![], true);
        req.route = vec![b"a".to_vec(), b"b".to_vec()];
        assert!(req.is_control());
        assert_eq!(
            req.into_frames(),
            f(&[b"a", b"b", SEP, b"1", b"_SEND", b"", b"", b"1"])
        );
    }

    #[test]
    fn malformed_requests_are_errors() {
        let cases = vec![
            f(&[]),
            f(&[b"1", b"echo", b"a", b"k", b"0"]),
            f(&[SEP, b"1", b"echo", b"a", b"k"]),
            f(&[SEP, b"1", b"echo", b"a", b"k", b"yes"]),
            f(&[SEP, b"1", b"echo", b"a", b"k", b""]),
            f(&[SEP, b"1", b"\xff\xfe", b"a", b"k", b"0"]),
        ];
        for frames in cases {
            assert!(matches!(parse_request(frames), Err(Error::ParseError(_))));
        }
    }

    #[test]
    fn numeric_ignore_flag() {
        let req = parse_request(f(&[SEP, b"1", b"p", b"", b"", b"2"])).unwrap();
        assert!(req.ignore);
    }

    #[test]
    fn reply_parsing() {
        let rep = parse_reply(f(&[b"x", SEP, b"9", b"OK", b"val"])).unwrap();
        assert_eq!(rep.route, vec![b"x".to_vec()]);
        assert_eq!(rep.req_id, b"9");
        assert_eq!(rep.type_, ReplyType::Ok);
        assert_eq!(rep.payload, vec![b"val".to_vec()]);

        let start = parse_reply(f(&[SEP, b"9", b"YIELD"])).unwrap();
        assert!(start.is_stream_start());
        assert!(!ReplyType::Yield.is_terminal());
        assert!(ReplyType::Fail.is_terminal());
    }

    #[test]
    fn malformed_replies_are_none() {
        assert!(parse_reply(f(&[])).is_none());
        assert!(parse_reply(f(&[b"9", b"OK"])).is_none());
        assert!(parse_reply(f(&[SEP, b"9"])).is_none());
        assert!(parse_reply(f(&[SEP, b"9", b"NOPE", b"x"])).is_none());
    }

    #[test]
    fn reply_frames_layout() {
        let rep = Reply::new(vec![b"c".to_vec()], b"3".to_vec(), ReplyType::Ack, vec![b"svc".to_vec()]);
        assert_eq!(rep.into_frames(), f(&[b"c", SEP, b"3", b"ACK", b"svc"]));
    }

    #[test]
    fn peeking() {
        let frames = f(&[b"w", b"c", SEP, b"3", b"_CLOSE", b"", b"", b"0"]);
        let head = peek_request(&frames[1..]).unwrap();
        assert_eq!(head.route, &[b"c".to_vec()][..]);
        assert!(head.is_control());
        assert!(!head.ignore);
        assert!(peek_request(&frames[..4]).is_none());

        let reply = f(&[b"c", SEP, b"3", b"YIELD"]);
        let head = peek_reply(&reply).unwrap();
        assert_eq!(head.type_, ReplyType::Yield);
        assert_eq!(head.payload_len, 0);
    }
}

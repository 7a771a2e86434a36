//! Text wire protocol spoken on the broker TCP port
//!
//! Line-oriented control verbs with `\r\n` framing and length-prefixed
//! payloads, compatible in shape with the NATS client protocol:
//!
//! ```text
//! C: CONNECT {"name":"worker-anpr","verbose":false}\r\n
//! C: SUB frames.cam_01 1\r\n
//! C: PUB detections.cam_01 42\r\n<42 bytes>\r\n
//! S: MSG frames.cam_01 1 1024\r\n<1024 bytes>\r\n
//! ```

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// One protocol operation, in either direction.
#[derive(Debug)]
pub enum Op {
    Connect(serde_json::Value),
    Info(serde_json::Value),
    Pub { subject: String, payload: Bytes },
    Msg { subject: String, sid: u64, payload: Bytes },
    Sub { subject: String, sid: u64 },
    Unsub { sid: u64 },
    Ping,
    Pong,
    Err(String),
}

fn proto_err(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

/// Reads the next operation, or `None` on clean EOF.
pub async fn read_op<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_payload: usize,
) -> std::io::Result<Option<Op>> {
    let mut line = Vec::with_capacity(64);
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&line);
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(proto_err("empty control line"));
    }

    let (verb, rest) = match line.split_once(' ') {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };

    let op = match verb.to_ascii_uppercase().as_str() {
        "PING" => Op::Ping,
        "PONG" => Op::Pong,
        "CONNECT" => {
            let value = serde_json::from_str(rest).map_err(|_| proto_err("bad CONNECT json"))?;
            Op::Connect(value)
        }
        "INFO" => {
            let value = serde_json::from_str(rest).map_err(|_| proto_err("bad INFO json"))?;
            Op::Info(value)
        }
        "SUB" => {
            let mut parts = rest.split_whitespace();
            let subject = parts.next().ok_or_else(|| proto_err("SUB missing subject"))?;
            let sid: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| proto_err("SUB missing sid"))?;
            Op::Sub {
                subject: subject.to_string(),
                sid,
            }
        }
        "UNSUB" => {
            let sid: u64 = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| proto_err("UNSUB missing sid"))?;
            Op::Unsub { sid }
        }
        "PUB" => {
            let mut parts = rest.split_whitespace();
            let subject = parts.next().ok_or_else(|| proto_err("PUB missing subject"))?;
            let len: usize = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| proto_err("PUB missing length"))?;
            if len > max_payload {
                return Err(proto_err("payload exceeds maximum"));
            }
            let payload = read_payload(reader, len).await?;
            Op::Pub {
                subject: subject.to_string(),
                payload,
            }
        }
        "MSG" => {
            let mut parts = rest.split_whitespace();
            let subject = parts.next().ok_or_else(|| proto_err("MSG missing subject"))?;
            let sid: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| proto_err("MSG missing sid"))?;
            let len: usize = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| proto_err("MSG missing length"))?;
            if len > max_payload {
                return Err(proto_err("payload exceeds maximum"));
            }
            let payload = read_payload(reader, len).await?;
            Op::Msg {
                subject: subject.to_string(),
                sid,
                payload,
            }
        }
        "-ERR" => Op::Err(rest.trim_matches('\'').to_string()),
        "+OK" => Op::Pong, // tolerated, carries no information
        other => return Err(proto_err(&format!("unknown verb {}", other))),
    };

    Ok(Some(op))
}

async fn read_payload<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    len: usize,
) -> std::io::Result<Bytes> {
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if &crlf != b"\r\n" {
        return Err(proto_err("payload not terminated by CRLF"));
    }
    Ok(Bytes::from(payload))
}

pub fn encode_connect(info: &serde_json::Value) -> Vec<u8> {
    format!("CONNECT {}\r\n", info).into_bytes()
}

pub fn encode_info(info: &serde_json::Value) -> Vec<u8> {
    format!("INFO {}\r\n", info).into_bytes()
}

pub fn encode_pub(subject: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(subject.len() + payload.len() + 32);
    buf.extend_from_slice(format!("PUB {} {}\r\n", subject, payload.len()).as_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn encode_msg(subject: &str, sid: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(subject.len() + payload.len() + 40);
    buf.extend_from_slice(format!("MSG {} {} {}\r\n", subject, sid, payload.len()).as_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn encode_sub(subject: &str, sid: u64) -> Vec<u8> {
    format!("SUB {} {}\r\n", subject, sid).into_bytes()
}

pub fn encode_unsub(sid: u64) -> Vec<u8> {
    format!("UNSUB {}\r\n", sid).into_bytes()
}

pub fn encode_err(msg: &str) -> Vec<u8> {
    format!("-ERR '{}'\r\n", msg).into_bytes()
}

pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_roundtrip_pub() {
        let frame = encode_pub("frames.cam_01", b"hello");
        let mut reader = BufReader::new(&frame[..]);
        let op = read_op(&mut reader, 1024).await.unwrap().unwrap();
        match op {
            Op::Pub { subject, payload } => {
                assert_eq!(subject, "frames.cam_01");
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_msg_and_sub() {
        let mut stream = encode_sub("events.>", 7);
        stream.extend(encode_msg("events.anpr", 7, b"x"));
        let mut reader = BufReader::new(&stream[..]);

        match read_op(&mut reader, 1024).await.unwrap().unwrap() {
            Op::Sub { subject, sid } => {
                assert_eq!(subject, "events.>");
                assert_eq!(sid, 7);
            }
            other => panic!("unexpected op: {:?}", other),
        }
        match read_op(&mut reader, 1024).await.unwrap().unwrap() {
            Op::Msg { subject, sid, payload } => {
                assert_eq!(subject, "events.anpr");
                assert_eq!(sid, 7);
                assert_eq!(&payload[..], b"x");
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let frame = encode_pub("a", &[0u8; 64]);
        let mut reader = BufReader::new(&frame[..]);
        assert!(read_op(&mut reader, 16).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_is_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_op(&mut reader, 16).await.unwrap().is_none());
    }
}

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::{Error, Message, Result};

/// Upper bound on a single frame body. Anything larger is rejected before
/// allocation; a garbled length prefix must not take the process down.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Everything that travels on a broker connection after authentication.
///
/// The unit variants are the control tokens: `Init` establishes the
/// broker's control connection, `NewPubSub` is the endpoint handshake,
/// `Stop` signals disconnect or shutdown, `NewConn` tells the forwarder a
/// client was added. Being enum variants, the tokens can never collide
/// with a payload. Every token except `Stop` is acknowledged by echoing
/// it; `Stop` and payloads are unacknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Init,
    NewPubSub,
    Stop,
    NewConn,
    Payload(Message),
}

/// Writes one length-prefixed frame: a `u32` big-endian body length
/// followed by the JSON body.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(Error::FrameTooLarge(body.len() as u64));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. A clean EOF on the length prefix reads as
/// [`Error::Disconnected`].
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let body = read_block(reader, MAX_FRAME_LEN)?;
    Ok(serde_json::from_slice(&body)?)
}

pub(crate) fn write_block<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

pub(crate) fn read_block<R: Read>(reader: &mut R, max_len: u32) -> Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    read_exact(reader, &mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > max_len {
        return Err(Error::FrameTooLarge(len as u64));
    }
    let mut body = vec![0u8; len as usize];
    read_exact(reader, &mut body)?;
    Ok(body)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::Disconnected
        } else {
            Error::Io(err)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Payload, Topic};

    fn roundtrip(frame: &Frame) -> Frame {
        let mut buf = Vec::new();
        write_frame(&mut buf, frame).unwrap();
        read_frame(&mut buf.as_slice()).unwrap()
    }

    #[test]
    fn tokens_and_payloads_are_distinct_on_the_wire() {
        let message = Message {
            topic: Topic::from(["a", "b"]),
            payload: Payload::new().with("n", 1),
        };
        let frames = [
            Frame::Init,
            Frame::NewPubSub,
            Frame::Stop,
            Frame::NewConn,
            Frame::Payload(message),
        ];
        for frame in &frames {
            assert_eq!(&roundtrip(frame), frame);
        }
        for window in frames.windows(2) {
            assert_ne!(window[0], window[1]);
        }
    }

    #[test]
    fn eof_reads_as_disconnected() {
        let mut empty: &[u8] = &[];
        assert!(matches!(read_frame(&mut empty), Err(Error::Disconnected)));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.extend_from_slice(b"garbage");
        assert!(matches!(
            read_frame(&mut buf.as_slice()),
            Err(Error::FrameTooLarge(_))
        ));
    }
}

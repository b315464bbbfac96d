// Length-prefixed TCP framing state machine (spec §4.1).
//
// Grounded in the teacher's `pipe.rs` `RecvOperation`: reads accumulate
// across calls until the declared length is satisfied. O2 uses a 4-byte
// big-endian length prefix (not the 8-byte nanomsg one the teacher reads),
// and the payload itself is the already-network-order message body, so no
// further decoding happens here — this module only knows how to find frame
// boundaries in a byte stream.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use byteorder::{BigEndian, ByteOrder};

/// Incremental reader: accumulates a 4-byte length prefix, then that many
/// payload bytes, handing back complete frames as they become available.
pub struct FrameReader {
    prefix: [u8; 4],
    prefix_read: usize,
    body: Vec<u8>,
    body_read: usize,
    body_len: usize,
    reading_prefix: bool,
}

impl Default for FrameReader {
    fn default() -> Self {
        FrameReader { prefix: [0; 4], prefix_read: 0, body: Vec::new(), body_read: 0, body_len: 0, reading_prefix: true }
    }
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader::default()
    }

    /// Pulls as many complete frames as the readable stream currently
    /// offers. Returns `Ok(frames)`; an empty vec means "no complete frame
    /// yet, try again on the next readable event." Propagates `WouldBlock`
    /// transparently by treating it as "no more data right now."
    pub fn pump<R: Read>(&mut self, stream: &mut R) -> io::Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        loop {
            if self.reading_prefix {
                match stream.read(&mut self.prefix[self.prefix_read..]) {
                    Ok(0) => return Ok(frames),
                    Ok(n) => {
                        self.prefix_read += n;
                        if self.prefix_read < 4 {
                            continue;
                        }
                        self.body_len = BigEndian::read_u32(&self.prefix) as usize;
                        self.body = vec![0u8; self.body_len];
                        self.body_read = 0;
                        self.prefix_read = 0;
                        self.reading_prefix = false;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(frames),
                    Err(e) => return Err(e),
                }
            } else if self.body_len == 0 {
                frames.push(Vec::new());
                self.reading_prefix = true;
            } else {
                match stream.read(&mut self.body[self.body_read..]) {
                    Ok(0) => return Ok(frames),
                    Ok(n) => {
                        self.body_read += n;
                        if self.body_read == self.body_len {
                            frames.push(std::mem::take(&mut self.body));
                            self.reading_prefix = true;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(frames),
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

/// Per-socket outbound FIFO. Spec §4.1: "A second user-level send while a
/// message is pending returns O2_BLOCKED rather than queuing; internal
/// control traffic may queue unbounded." `push_user` enforces the single
/// slot; `push_control` never refuses.
#[derive(Default)]
pub struct SendQueue {
    queue: VecDeque<Vec<u8>>,
    user_pending: bool,
    offset: usize,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue::default()
    }

    pub fn push_user(&mut self, bytes: Vec<u8>) -> bool {
        if self.user_pending {
            return false;
        }
        self.user_pending = true;
        self.queue.push_back(bytes);
        true
    }

    pub fn push_control(&mut self, bytes: Vec<u8>) {
        self.queue.push_back(bytes);
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Drains as much as the stream will currently accept. Returns `true`
    /// once the whole queue has drained.
    pub fn drain<W: Write>(&mut self, stream: &mut W) -> io::Result<bool> {
        while let Some(front) = self.queue.front() {
            match stream.write(&front[self.offset..]) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.offset += n;
                    if self.offset == front.len() {
                        self.queue.pop_front();
                        self.offset = 0;
                        self.user_pending = false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_reader_reassembles_split_reads() {
        let mut reader = FrameReader::new();
        let mut payload = vec![0u8, 0, 0, 3];
        payload.extend_from_slice(b"abc");
        // Simulate a short read by feeding only part first.
        let mut first = Cursor::new(payload[..5].to_vec());
        let frames = reader.pump(&mut first).unwrap();
        assert!(frames.is_empty());

        let mut second = Cursor::new(payload[5..].to_vec());
        let frames = reader.pump(&mut second).unwrap();
        assert_eq!(frames, vec![b"abc".to_vec()]);
    }

    #[test]
    fn frame_reader_handles_zero_length_frame() {
        let mut reader = FrameReader::new();
        let mut cursor = Cursor::new(vec![0u8, 0, 0, 0]);
        let frames = reader.pump(&mut cursor).unwrap();
        assert_eq!(frames, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn send_queue_rejects_second_user_send_while_pending() {
        let mut q = SendQueue::new();
        assert!(q.push_user(vec![1, 2, 3]));
        assert!(!q.push_user(vec![4, 5, 6]));
    }

    #[test]
    fn send_queue_drains_fully_written_buffers() {
        let mut q = SendQueue::new();
        q.push_user(vec![1, 2, 3]);
        let mut out = Vec::new();
        let done = q.drain(&mut out).unwrap();
        assert!(done);
        assert_eq!(out, vec![1, 2, 3]);
        assert!(!q.has_pending());
    }
}

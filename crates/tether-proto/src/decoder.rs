use tether_utils::fatal;

use crate::{ByteBuffer, framing};

const ACCUM_CAPACITY: u32 = 2048;

/// Incremental frame parser.
///
/// Feed it raw socket bytes in whatever chunks arrive; it learns the header
/// length from the first byte, the frame length from the completed header,
/// and emits every completed frame (header included) with its header size.
/// Chunk boundaries may fall anywhere, including inside the header.
///
/// Internal inconsistency means the byte stream can no longer be trusted and
/// is reported through `fatal!` rather than silently resynchronising.
pub struct FrameDecoder {
    accum: ByteBuffer,
    header_size: u32,
    frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        let mut d = Self { accum: ByteBuffer::new(), header_size: 0, frame_size: 0 };
        d.restart();
        d
    }

    pub fn restart(&mut self) {
        self.header_size = 0;
        self.frame_size = 0;
        self.accum.init(ACCUM_CAPACITY);
    }

    /// Consumes `data`, invoking `on_frame(frame, header_size)` for every
    /// frame completed by it. The emitted buffer holds exactly
    /// `header_size + body_size` bytes.
    pub fn push_data(&mut self, mut data: &[u8], on_frame: &mut impl FnMut(ByteBuffer, u32)) {
        while !data.is_empty() {
            if self.header_size == 0 {
                self.header_size = framing::packet_header_size(data[0]);
                self.accum.append(&data[..1]);
                data = &data[1..];
            }
            if (self.accum.size() as u32) < self.header_size {
                let take =
                    data.len().min((self.header_size - self.accum.size() as u32) as usize);
                self.accum.append(&data[..take]);
                data = &data[take..];
            }
            if (self.accum.size() as u32) < self.header_size {
                if !data.is_empty() {
                    fatal!(
                        "frame decoder broken: accum {}/{} header bytes with {} input left",
                        self.accum.size(),
                        self.header_size,
                        data.len()
                    );
                }
                break;
            }

            if self.accum.size() as u32 == self.header_size {
                let body = framing::packet_body_size(self.accum.as_slice());
                self.frame_size = self.header_size + body;
                self.accum.reserve(self.frame_size as usize);
            } else if self.frame_size == 0 {
                fatal!(
                    "frame decoder broken: {} accumulated past a {}-byte header with no frame size",
                    self.accum.size(),
                    self.header_size
                );
                return;
            }

            if (self.accum.size() as u32) < self.frame_size {
                let take = data.len().min((self.frame_size - self.accum.size() as u32) as usize);
                self.accum.append(&data[..take]);
                data = &data[take..];
            } else {
                fatal!(
                    "frame decoder broken: accum {} >= frame size {} before completion",
                    self.accum.size(),
                    self.frame_size
                );
                return;
            }

            if self.accum.size() as u32 == self.frame_size {
                let header_size = self.header_size;
                let frame = std::mem::take(&mut self.accum);
                self.restart();
                on_frame(frame, header_size);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Flags, WireWriter};

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut w = WireWriter::new(body.len() as u32);
        w.write_raw(body);
        let frame = w.finish(Flags::RELIABLE).unwrap();
        frame.as_slice().to_vec()
    }

    fn collect(decoder: &mut FrameDecoder, chunks: &[&[u8]]) -> Vec<(Vec<u8>, u32)> {
        let mut out = Vec::new();
        for chunk in chunks {
            decoder.push_data(chunk, &mut |frame, hs| {
                out.push((frame.as_slice().to_vec(), hs));
            });
        }
        out
    }

    #[test]
    fn one_read_many_frames() {
        let mut wire = framed(b"abc");
        wire.extend_from_slice(&framed(b"defgh"));
        wire.extend_from_slice(&framed(&[9u8; 100]));

        let mut d = FrameDecoder::new();
        let frames = collect(&mut d, &[&wire]);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0].0[frames[0].1 as usize..], b"abc");
        assert_eq!(&frames[1].0[frames[1].1 as usize..], b"defgh");
        assert_eq!(&frames[2].0[frames[2].1 as usize..], &[9u8; 100]);
    }

    #[test]
    fn split_at_every_byte() {
        // 3-byte header (body > 4096) plus a small tail pattern.
        let body: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let wire = framed(&body);
        assert_eq!(wire.len(), 3 + 5000);

        for split in 1..wire.len().min(16) {
            let mut d = FrameDecoder::new();
            let (a, b) = wire.split_at(split);
            let frames = collect(&mut d, &[a, b]);
            assert_eq!(frames.len(), 1, "split at {split}");
            assert_eq!(frames[0].1, 3);
            assert_eq!(&frames[0].0[3..], &body[..]);
        }
    }

    #[test]
    fn trickled_header_then_bulk_body() {
        let body = vec![0x5Au8; 5000];
        let wire = framed(&body);
        let mut d = FrameDecoder::new();

        let reads: [&[u8]; 6] =
            [&wire[0..1], &wire[1..2], &wire[2..3], &wire[3..4], &wire[4..5002], &wire[5002..5003]];
        let mut frames = Vec::new();
        for r in reads {
            d.push_data(r, &mut |frame, hs| frames.push((frame, hs)));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, 3);
        assert_eq!(frames[0].0.size(), 5003);
        assert_eq!(&frames[0].0.as_slice()[3..], &body[..]);
    }

    #[test]
    fn concatenation_is_lossless_with_trailing_partial() {
        let mut wire = framed(b"one");
        wire.extend_from_slice(&framed(b"two"));
        let partial = framed(b"three");
        wire.extend_from_slice(&partial[..3]); // header + 2 of the 5 body bytes

        let mut d = FrameDecoder::new();
        let frames = collect(&mut d, &[&wire]);
        let replayed: Vec<u8> = frames.iter().flat_map(|(f, _)| f.iter().copied()).collect();
        assert_eq!(&replayed[..], &wire[..wire.len() - 3]);

        // Completing the partial frame emits it.
        let frames = collect(&mut d, &[&partial[3..]]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].0[frames[0].1 as usize..], b"three");
    }
}

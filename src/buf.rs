use std::collections::VecDeque;
use std::io::Read;

use bytes::{Bytes, BytesMut};

pub fn fill_buf<R: Read>(data: &mut R, buf: &mut [u8]) -> std::io::Result<(bool, usize)> {
    let mut buf_read = 0;

    while buf_read < buf.len() {
        match data.read(&mut buf[buf_read..]) {
            Ok(0) => return Ok((true, buf_read)),
            Ok(x) => buf_read += x,
            Err(e) => return Err(e),
        };
    }
    Ok((false, buf_read))
}

// Accumulates caller writes and carves them back out as fixed-size parts.
// Runs are kept as appended; a run straddling a part boundary is split when
// the part is drained, so nothing is copied more than once on the way out.
//
// Contract: the concatenation of everything drained equals the concatenation
// of everything appended, in order.
pub struct PartBuffer {
    runs: VecDeque<Bytes>,
    len: usize,
    part_size: usize,
}

impl PartBuffer {
    pub fn new(part_size: usize) -> Self {
        PartBuffer {
            runs: VecDeque::new(),
            len: 0,
            part_size,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.runs.push_back(Bytes::copy_from_slice(data));
        self.len += data.len();
    }

    // The first part_size bytes as one contiguous buffer, or None until that
    // much has accumulated. The remainder stays queued.
    pub fn drain_full_part(&mut self) -> Option<Bytes> {
        if self.len < self.part_size {
            return None;
        }

        let mut part = BytesMut::with_capacity(self.part_size);
        while part.len() < self.part_size {
            let Some(mut run) = self.runs.pop_front() else {
                break;
            };

            let want = self.part_size - part.len();
            if run.len() > want {
                part.extend_from_slice(&run.split_to(want));
                self.runs.push_front(run);
            } else {
                part.extend_from_slice(&run);
            }
        }

        self.len -= part.len();
        Some(part.freeze())
    }

    // Everything left over; zero bytes if nothing was ever appended
    pub fn drain_final(&mut self) -> Bytes {
        let mut tail = BytesMut::with_capacity(self.len);
        for run in self.runs.drain(..) {
            tail.extend_from_slice(&run);
        }
        self.len = 0;
        tail.freeze()
    }
}


#[cfg(test)]
mod test_part_buffer {
    use super::*;

    #[test]
    fn empty_buffer() {
        let mut buf = PartBuffer::new(4);

        assert!(buf.is_empty());
        assert_eq!(buf.drain_full_part(), None);
        assert_eq!(buf.drain_final(), Bytes::new());
    }

    #[test]
    fn below_capacity_holds() {
        let mut buf = PartBuffer::new(4);
        buf.append(&[1, 2, 3]);

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.drain_full_part(), None);
        assert_eq!(buf.drain_final(), Bytes::from_static(&[1, 2, 3]));
        assert!(buf.is_empty());
    }

    #[test]
    fn exact_capacity_drains() {
        let mut buf = PartBuffer::new(4);
        buf.append(&[1, 2, 3, 4]);

        assert_eq!(buf.drain_full_part(), Some(Bytes::from_static(&[1, 2, 3, 4])));
        assert_eq!(buf.drain_full_part(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn straddling_run_splits() {
        // One append of 1.5 parts becomes a full part plus a retained tail
        let mut buf = PartBuffer::new(4);
        buf.append(&[1, 2, 3, 4, 5, 6]);

        assert_eq!(buf.drain_full_part(), Some(Bytes::from_static(&[1, 2, 3, 4])));
        assert_eq!(buf.drain_full_part(), None);
        assert_eq!(buf.drain_final(), Bytes::from_static(&[5, 6]));
    }

    #[test]
    fn part_spans_many_runs() {
        let mut buf = PartBuffer::new(4);
        buf.append(&[1]);
        buf.append(&[2]);
        buf.append(&[3]);
        buf.append(&[4, 5]);

        assert_eq!(buf.drain_full_part(), Some(Bytes::from_static(&[1, 2, 3, 4])));
        assert_eq!(buf.drain_final(), Bytes::from_static(&[5]));
    }

    #[test]
    fn multiple_parts_in_order() {
        let mut buf = PartBuffer::new(2);
        buf.append(&[1, 2, 3, 4, 5]);

        assert_eq!(buf.drain_full_part(), Some(Bytes::from_static(&[1, 2])));
        assert_eq!(buf.drain_full_part(), Some(Bytes::from_static(&[3, 4])));
        assert_eq!(buf.drain_full_part(), None);
        assert_eq!(buf.drain_final(), Bytes::from_static(&[5]));
    }

    #[test]
    fn concatenation_is_preserved() {
        // Odd-sized appends against an odd part size, drained as the writer
        // would: every byte comes back out exactly once, in order
        let part_size = 16;
        let mut buf = PartBuffer::new(part_size);

        let mut expected = Vec::new();
        let mut drained = Vec::new();

        for i in 0u8..50 {
            let chunk = [i; 7];
            expected.extend_from_slice(&chunk);
            buf.append(&chunk);

            while let Some(part) = buf.drain_full_part() {
                assert_eq!(part.len(), part_size);
                drained.extend_from_slice(&part);
            }
        }
        drained.extend_from_slice(&buf.drain_final());

        assert_eq!(drained, expected);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_append_is_noop() {
        let mut buf = PartBuffer::new(4);
        buf.append(&[]);

        assert!(buf.is_empty());
        assert_eq!(buf.drain_final(), Bytes::new());
    }
}

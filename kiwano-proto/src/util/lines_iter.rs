use core::{iter, mem};

use bytes::{Buf, Bytes};

/// Iterate over the `\r\n` separated lines of a header block
///
/// Iteration stops at the first empty line, which terminates the block.
pub(crate) fn lines_iter(mut bytes: Bytes) -> impl Iterator<Item = Bytes> {
    iter::from_fn(move || {
        if bytes.is_empty() {
            return None;
        }

        let line = match memchr::memmem::find(&bytes, b"\r\n") {
            Some(i) => {
                let line = bytes.split_to(i);
                bytes.advance("\r\n".len());
                line
            }
            None => mem::take(&mut bytes),
        };
        if line.is_empty() {
            bytes.clear();
            None
        } else {
            Some(line)
        }
    })
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use bytes::Bytes;

    use super::lines_iter;

    #[test]
    fn stops_at_block_terminator() {
        let block = Bytes::from_static(b"NATS/1.0\r\nA: 1\r\nB: 2\r\n\r\ntrailing");
        let lines = lines_iter(block).collect::<Vec<_>>();
        assert_eq!(
            lines,
            [
                Bytes::from_static(b"NATS/1.0"),
                Bytes::from_static(b"A: 1"),
                Bytes::from_static(b"B: 2"),
            ]
        );
    }

    #[test]
    fn unterminated_last_line() {
        let block = Bytes::from_static(b"NATS/1.0 404\r\nA: 1");
        let lines = lines_iter(block).collect::<Vec<_>>();
        assert_eq!(
            lines,
            [
                Bytes::from_static(b"NATS/1.0 404"),
                Bytes::from_static(b"A: 1"),
            ]
        );
    }

    #[test]
    fn empty() {
        assert_eq!(lines_iter(Bytes::new()).count(), 0);
    }
}

use bytes::{Buf, Bytes};

/// Split `bytes` on runs of spaces or tabs into at most `N` chunks
///
/// The last chunk keeps any remaining whitespace, so free-form trailing
/// text (such as a status description) survives intact.
pub(crate) fn split_spaces<const N: usize>(mut bytes: Bytes) -> impl Iterator<Item = Bytes> {
    let mut chunks = core::array::from_fn::<_, N, _>(|_| Bytes::new());
    let mut found = 0;

    for (i, chunk) in chunks.iter_mut().enumerate() {
        let leading = bytes
            .iter()
            .take_while(|b| matches!(b, b' ' | b'\t'))
            .count();
        bytes.advance(leading);
        if bytes.is_empty() {
            break;
        }

        let end = if i + 1 == N {
            None
        } else {
            memchr::memchr2(b' ', b'\t', &bytes)
        };
        *chunk = match end {
            Some(end) => bytes.split_to(end),
            None => core::mem::take(&mut bytes),
        };
        found += 1;
    }

    chunks.into_iter().take(found)
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use bytes::Bytes;

    use super::split_spaces;

    #[test]
    fn combinations() {
        let tests: &[(&str, &[&str])] = &[
            ("", &[]),
            ("NATS/1.0", &["NATS/1.0"]),
            ("NATS/1.0 404", &["NATS/1.0", "404"]),
            ("NATS/1.0\t404", &["NATS/1.0", "404"]),
            ("NATS/1.0  404 ", &["NATS/1.0", "404"]),
            (
                "NATS/1.0 404 No Messages",
                &["NATS/1.0", "404", "No Messages"],
            ),
            (
                "NATS/1.0 100 Idle  Heartbeat",
                &["NATS/1.0", "100", "Idle  Heartbeat"],
            ),
            (
                "NATS/1.0 \t408\t Request Timeout",
                &["NATS/1.0", "408", "Request Timeout"],
            ),
        ];

        for (input, output) in tests {
            let chunks =
                split_spaces::<3>(Bytes::from_static(input.as_bytes())).collect::<Vec<Bytes>>();
            let expected = output
                .iter()
                .map(|s| Bytes::from_static(s.as_bytes()))
                .collect::<Vec<_>>();
            assert_eq!(chunks, expected, "input {input:?}");
        }
    }
}

//! Bidirectional stream relay.
//!
//! Both directions are driven as poll-based state machines inside a
//! single future, so back-pressure on one direction never stalls the
//! other. Flushes are deferred until the reader runs dry (`Pending`) or
//! hits EOF, which batches write cycles on buffered layers like TLS.
//! EOF on one direction half-closes the peer's write side; the relay
//! returns once both directions finished.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use super::pool;

/// One copy direction.
enum Pipe {
    // accumulated unflushed bytes
    Reading(usize),
    // (write pos, filled len, accumulated)
    Writing(usize, usize, usize),
    // (bytes to report, eof)
    Flushing(usize, bool),
    HalfClosing,
    Done,
}

enum PipeEvent {
    /// Bytes reached the peer (flushed).
    Moved(usize),
    /// This direction finished (EOF and half-close done).
    Finished,
}

fn poll_pipe<R, W>(
    cx: &mut Context<'_>,
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    state: &mut Pipe,
) -> Poll<io::Result<PipeEvent>>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        match state {
            Pipe::Reading(acc) => {
                let mut read_buf = ReadBuf::new(buf);
                match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            *state = if *acc > 0 {
                                Pipe::Flushing(*acc, true)
                            } else {
                                Pipe::HalfClosing
                            };
                        } else {
                            *state = Pipe::Writing(0, n, *acc);
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        // reader dry; flush whatever accumulated
                        if *acc > 0 {
                            *state = Pipe::Flushing(*acc, false);
                        } else {
                            return Poll::Pending;
                        }
                    }
                }
            }
            Pipe::Writing(pos, len, acc) => {
                match Pin::new(&mut *writer).poll_write(cx, &buf[*pos..*len]) {
                    Poll::Ready(Ok(n)) => {
                        *pos += n;
                        if *pos >= *len {
                            // keep reading before flushing
                            *state = Pipe::Reading(*acc + *len);
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            Pipe::Flushing(bytes, eof) => {
                let (bytes, eof) = (*bytes, *eof);
                match Pin::new(&mut *writer).poll_flush(cx) {
                    Poll::Ready(Ok(())) => {
                        *state = if eof { Pipe::HalfClosing } else { Pipe::Reading(0) };
                        return Poll::Ready(Ok(PipeEvent::Moved(bytes)));
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            Pipe::HalfClosing => match Pin::new(&mut *writer).poll_shutdown(cx) {
                Poll::Ready(_) => {
                    *state = Pipe::Done;
                    return Poll::Ready(Ok(PipeEvent::Finished));
                }
                Poll::Pending => return Poll::Pending,
            },
            Pipe::Done => return Poll::Ready(Ok(PipeEvent::Finished)),
        }
    }
}

/// Bytes moved in each direction during a relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// a → b bytes.
    pub a_to_b: u64,
    /// b → a bytes.
    pub b_to_a: u64,
}

impl RelayStats {
    pub fn total(self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Relay bytes between `a` and `b` until both directions finish.
///
/// `idle_timeout` of `None` means no idle limit; otherwise the deadline
/// is pushed forward on every successful byte movement and expiry ends
/// the relay with whatever was counted so far. Buffers are borrowed from
/// the shared pool and returned when the relay ends.
pub async fn relay_streams<A, B>(
    a: A,
    b: B,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_r, mut a_w) = tokio::io::split(a);
    let (mut b_r, mut b_w) = tokio::io::split(b);

    let mut buf_ab = pool::get(buffer_size);
    let mut buf_ba = pool::get(buffer_size);
    let mut pipe_ab = Pipe::Reading(0);
    let mut pipe_ba = Pipe::Reading(0);

    // Far-future fallback keeps the select arm alive when no idle limit
    // is configured.
    let sleep_for = |d: Option<Duration>| d.unwrap_or(Duration::from_secs(86400 * 365));
    let idle = tokio::time::sleep(sleep_for(idle_timeout));
    tokio::pin!(idle);

    let mut ab_done = false;
    let mut ba_done = false;
    let mut stats = RelayStats::default();

    loop {
        if ab_done && ba_done {
            return Ok(stats);
        }

        // Poll both directions under one waker context; each registers
        // its own interest so either can progress independently.
        let both = std::future::poll_fn(|cx| {
            let mut ready = false;
            let mut moved = false;
            let mut error: Option<io::Error> = None;

            if !ab_done {
                match poll_pipe(cx, &mut a_r, &mut b_w, &mut buf_ab, &mut pipe_ab) {
                    Poll::Ready(Ok(PipeEvent::Moved(n))) => {
                        stats.a_to_b += n as u64;
                        moved = true;
                        ready = true;
                    }
                    Poll::Ready(Ok(PipeEvent::Finished)) => {
                        ab_done = true;
                        ready = true;
                    }
                    Poll::Ready(Err(e)) => {
                        error = Some(e);
                        ready = true;
                    }
                    Poll::Pending => {}
                }
            }

            if !ba_done {
                match poll_pipe(cx, &mut b_r, &mut a_w, &mut buf_ba, &mut pipe_ba) {
                    Poll::Ready(Ok(PipeEvent::Moved(n))) => {
                        stats.b_to_a += n as u64;
                        moved = true;
                        ready = true;
                    }
                    Poll::Ready(Ok(PipeEvent::Finished)) => {
                        ba_done = true;
                        ready = true;
                    }
                    Poll::Ready(Err(e)) => {
                        error = Some(e);
                        ready = true;
                    }
                    Poll::Pending => {}
                }
            }

            if let Some(e) = error {
                return Poll::Ready(Err(e));
            }
            if ready {
                Poll::Ready(Ok(moved))
            } else {
                Poll::Pending
            }
        });

        tokio::select! {
            result = both => {
                if result? && idle_timeout.is_some() {
                    idle.as_mut().reset(Instant::now() + sleep_for(idle_timeout));
                }
            }
            _ = &mut idle => return Ok(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn bytes_arrive_in_order_on_both_sides() {
        let (client, near) = duplex(64);
        let (far, target) = duplex(64);

        let relay = tokio::spawn(relay_streams(near, far, 1024, None));

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut target_r, mut target_w) = tokio::io::split(target);

        client_w.write_all(b"hello from the client").await.unwrap();
        drop(client_w);

        let mut forward = Vec::new();
        target_r.read_to_end(&mut forward).await.unwrap();
        assert_eq!(forward, b"hello from the client");

        target_w.write_all(b"reply").await.unwrap();
        drop(target_w);

        let mut back = Vec::new();
        client_r.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"reply");

        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 21);
        assert_eq!(stats.b_to_a, 5);
    }

    #[tokio::test]
    async fn conservation_across_chunked_writes() {
        let (client, near) = duplex(16);
        let (far, target) = duplex(16);

        let relay = tokio::spawn(relay_streams(near, far, 512, None));

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let (_, mut client_w) = tokio::io::split(client);
        let (mut target_r, _target_w) = tokio::io::split(target);

        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(100) {
                client_w.write_all(chunk).await.unwrap();
            }
            // dropping client_w half-closes the client side
        });

        let mut got = Vec::new();
        let mut buf = [0u8; 333];
        while got.len() < expected.len() {
            let n = target_r.read(&mut buf).await.unwrap();
            assert!(n > 0, "premature EOF at {} bytes", got.len());
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, expected);
        writer.await.unwrap();

        drop(target_r);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 4096);
    }

    #[tokio::test]
    async fn idle_timeout_ends_a_quiet_relay() {
        let (_client, near) = duplex(64);
        let (far, _target) = duplex(64);

        let start = Instant::now();
        let stats = relay_streams(near, far, 512, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(stats.total(), 0);
    }

    #[tokio::test]
    async fn one_sided_eof_still_relays_the_other_direction() {
        let (client, near) = duplex(64);
        let (far, target) = duplex(64);

        let relay = tokio::spawn(relay_streams(near, far, 512, None));

        let (mut client_r, client_w) = tokio::io::split(client);
        let (mut target_r, mut target_w) = tokio::io::split(target);
        // client immediately half-closes its write side
        drop(client_w);

        let mut buf = Vec::new();
        target_r.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        // target can still push data back
        target_w.write_all(b"late data").await.unwrap();
        drop(target_w);

        let mut back = Vec::new();
        client_r.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"late data");

        relay.await.unwrap().unwrap();
    }
}

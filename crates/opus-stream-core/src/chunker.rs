//! Producer side of a session: slices transcoder output into ordered chunks.
//!
//! The sender half of the hand-off channel is moved into [`pump`], so the
//! channel closes exactly once, when the producer returns, and nothing can be
//! pushed after that.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::transcoder::TranscodeJob;

/// One slice of encoded output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the session's output, starting at 0.
    pub seq: u64,
    pub data: Bytes,
}

pub type ChunkSender = mpsc::Sender<Chunk>;
pub type ChunkReceiver = mpsc::Receiver<Chunk>;

/// Create the bounded hand-off channel for one session.
pub fn hand_off(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Producer counters returned when the chunker stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkerStats {
    pub chunks: u64,
    pub bytes: u64,
    /// Stopped early because the session was cancelled or the consumer left.
    pub cancelled: bool,
}

/// Read `reader` in `packet_size` slices and send each one into `tx`.
///
/// Every slice is a fresh copy; the read buffer is reused. Blocks while the
/// channel is full. Returns once the reader hits EOF (after flushing the short
/// final slice), on a read error, or when `cancel` fires.
pub async fn pump<R>(
    mut reader: R,
    packet_size: usize,
    tx: ChunkSender,
    cancel: &CancellationToken,
) -> Result<ChunkerStats, StreamError>
where
    R: AsyncRead + Unpin,
{
    let packet_size = packet_size.max(1);
    let mut buf = vec![0u8; packet_size];
    let mut stats = ChunkerStats::default();

    loop {
        let (filled, read_err) = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                stats.cancelled = true;
                return Ok(stats);
            }
            res = fill(&mut reader, &mut buf) => res,
        };

        if filled > 0 {
            let chunk = Chunk {
                seq: stats.chunks,
                data: Bytes::copy_from_slice(&buf[..filled]),
            };
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => false,
                res = tx.send(chunk) => res.is_ok(),
            };
            if !sent {
                stats.cancelled = true;
                return Ok(stats);
            }
            stats.chunks += 1;
            stats.bytes += filled as u64;
        }

        if let Some(err) = read_err {
            return Err(StreamError::TranscoderOutput(err));
        }
        if filled < packet_size {
            return Ok(stats);
        }
    }
}

/// Read until `buf` is full or EOF. A read error is returned alongside the
/// bytes already read so they can still be flushed.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> (usize, Option<std::io::Error>)
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return (filled, Some(err)),
        }
    }
    (filled, None)
}

/// Body of a session's producer task: chunk the job's stdout, then collect the
/// process exit status.
///
/// The returned result is the session's error slot. The channel is already
/// closed by the time the exit status is awaited, so the consumer sees every
/// chunk before it learns about a failure.
pub async fn produce(
    mut job: TranscodeJob,
    packet_size: usize,
    tx: ChunkSender,
    cancel: CancellationToken,
) -> Result<ChunkerStats, StreamError> {
    let Some(output) = job.take_output() else {
        job.kill().await;
        return Err(StreamError::TranscoderRuntime {
            reason: "output stream unavailable".to_string(),
        });
    };

    match pump(output, packet_size, tx, &cancel).await {
        Ok(stats) if stats.cancelled => {
            job.kill().await;
            Ok(stats)
        }
        Ok(stats) => {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Ok(ChunkerStats { cancelled: true, ..stats }),
                res = job.finish() => res.map(|()| stats),
            }
        }
        Err(err) => {
            job.kill().await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, ReadBuf};

    use super::*;

    async fn drain(mut rx: ChunkReceiver) -> Vec<Chunk> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn thousand_bytes_split_into_full_and_remainder() {
        let data = vec![7u8; 1000];
        let (tx, rx) = hand_off(16);
        let cancel = CancellationToken::new();

        let stats = pump(&data[..], 512, tx, &cancel).await.unwrap();
        let chunks = drain(rx).await;

        let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, [512, 488]);
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(chunks[1].seq, 1);
        assert_eq!(stats, ChunkerStats { chunks: 2, bytes: 1000, cancelled: false });
    }

    #[tokio::test]
    async fn exact_multiple_has_no_empty_tail() {
        let data = vec![1u8; 1024];
        let (tx, rx) = hand_off(16);
        let stats = pump(&data[..], 512, tx, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.chunks, 2);
        assert_eq!(drain(rx).await.len(), 2);
    }

    #[tokio::test]
    async fn empty_stream_closes_channel_without_chunks() {
        let (tx, rx) = hand_off(4);
        let stats = pump(&b""[..], 512, tx, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.chunks, 0);
        assert!(drain(rx).await.is_empty());
    }

    #[tokio::test]
    async fn irregular_reads_preserve_byte_order() {
        let expected: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let (mut writer, reader) = tokio::io::duplex(64);
        let source = expected.clone();
        let feeder = tokio::spawn(async move {
            let mut offset = 0;
            let mut step = 1;
            while offset < source.len() {
                let end = (offset + step).min(source.len());
                writer.write_all(&source[offset..end]).await.unwrap();
                offset = end;
                step = step % 97 + 13;
            }
        });

        let (tx, rx) = hand_off(4);
        let consumer = tokio::spawn(drain(rx));
        let stats = pump(reader, 300, tx, &CancellationToken::new()).await.unwrap();
        feeder.await.unwrap();
        let chunks = consumer.await.unwrap();

        assert_eq!(stats.bytes, 5000);
        let (last, full) = chunks.split_last().unwrap();
        assert!(full.iter().all(|c| c.data.len() == 300));
        assert_eq!(last.data.len(), 5000 % 300);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq, i as u64);
        }
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        assert_eq!(joined, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_consumer_blocks_producer_without_loss() {
        let data: Vec<u8> = (0..40u8).collect();
        let (tx, mut rx) = hand_off(2);
        let cancel = CancellationToken::new();
        let producer = tokio::spawn({
            let cancel = cancel.clone();
            async move { pump(&data[..], 4, tx, &cancel).await }
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.seq, second.seq), (0, 1));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!producer.is_finished(), "producer should be blocked on a full channel");

        let mut rest = Vec::new();
        while let Some(chunk) = rx.recv().await {
            rest.push(chunk);
        }
        let stats = producer.await.unwrap().unwrap();
        assert_eq!(stats.chunks, 10);
        assert!(!stats.cancelled);
        let seqs: Vec<u64> = rest.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, (2..10).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_blocked_producer() {
        let data = vec![0u8; 64];
        let (tx, mut rx) = hand_off(1);
        let cancel = CancellationToken::new();
        let producer = tokio::spawn({
            let cancel = cancel.clone();
            async move { pump(&data[..], 8, tx, &cancel).await }
        });

        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!producer.is_finished());

        cancel.cancel();
        let stats = producer.await.unwrap().unwrap();
        assert!(stats.cancelled);
        assert!(stats.chunks < 8);
    }

    #[tokio::test]
    async fn dropped_consumer_stops_producer() {
        let data = vec![0u8; 64];
        let (tx, rx) = hand_off(1);
        drop(rx);
        let stats = pump(&data[..], 8, tx, &CancellationToken::new()).await.unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.chunks, 0);
    }

    struct FailAfter {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for FailAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke"))),
            }
        }
    }

    #[tokio::test]
    async fn read_error_flushes_partial_data_then_fails() {
        let reader = FailAfter { data: Some(vec![9u8; 10]) };
        let (tx, rx) = hand_off(4);
        let err = pump(reader, 512, tx, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StreamError::TranscoderOutput(_)));

        let chunks = drain(rx).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.len(), 10);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_process_delivers_output_then_error() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg("head -c 200 /dev/zero; exit 1");
        let job = TranscodeJob::spawn(cmd).unwrap();
        let (tx, rx) = hand_off(16);

        let result = produce(job, 512, tx, CancellationToken::new()).await;
        let chunks = drain(rx).await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.len(), 200);
        assert!(matches!(result, Err(StreamError::TranscoderRuntime { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_process_reports_stats() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg("head -c 1000 /dev/zero");
        let job = TranscodeJob::spawn(cmd).unwrap();
        let (tx, rx) = hand_off(16);

        let stats = produce(job, 512, tx, CancellationToken::new()).await.unwrap();
        let sizes: Vec<usize> = drain(rx).await.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, [512, 488]);
        assert_eq!(stats.bytes, 1000);
    }
}

//! Data pumps shared by the client and server workers.
//!
//! Workers count locally and hand their counters to the test at most every
//! [`FLUSH_PERIOD`], keeping the test lock off the per-write path.

use crate::results::TestResult;
use crate::test::{Test, FLUSH_PERIOD};
use crate::throttle::Throttle;
use crate::Result;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Local `(units, bytes)` counter flushed into a test as intermediate
/// results.
#[derive(Debug)]
pub struct Tally {
    units: u64,
    bytes: u64,
    last_flush: Instant,
    report: fn(u64, u64) -> TestResult,
}

impl Tally {
    /// `report` turns the pending `(units, bytes)` into a result.
    pub fn new(report: fn(u64, u64) -> TestResult) -> Self {
        Self {
            units: 0,
            bytes: 0,
            last_flush: Instant::now(),
            report,
        }
    }

    /// Counter for byte streams.
    pub fn bytes() -> Self {
        Self::new(|_, bytes| TestResult::bandwidth(bytes))
    }

    /// Counter for datagrams.
    pub fn packets() -> Self {
        Self::new(TestResult::packets)
    }

    pub fn add(&mut self, test: &Test, units: u64, bytes: u64) {
        self.units += units;
        self.bytes += bytes;
        if self.last_flush.elapsed() >= FLUSH_PERIOD {
            self.flush(test);
        }
    }

    pub fn flush(&mut self, test: &Test) {
        if self.units > 0 || self.bytes > 0 {
            test.add_intermediate_result((self.report)(self.units, self.bytes));
        }
        self.units = 0;
        self.bytes = 0;
        self.last_flush = Instant::now();
    }
}

/// Writes `buffer` repeatedly at the test's bandwidth cap until `stop`
/// fires or the peer goes away. Returns the bytes written.
pub async fn send_bytes<W>(
    test: &Test,
    writer: &mut W,
    buffer: &[u8],
    stop: &CancellationToken,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut throttle = Throttle::begin(test.clock().clone(), test.params().bw_rate, buffer.len());
    let mut tally = Tally::bytes();
    let mut total = 0u64;

    let outcome = loop {
        let chunk = throttle.bytes_to_send().clamp(1, buffer.len());
        let written = tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            written = writer.write(&buffer[..chunk]) => written,
        };
        let n = match written {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        total += n as u64;
        tally.add(test, 0, n as u64);

        tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            _ = throttle.record_sent(n) => {}
        }
    };

    tally.flush(test);
    outcome?;
    Ok(total)
}

/// Reads until EOF or `stop`. Returns the bytes read.
pub async fn receive_bytes<R>(
    test: &Test,
    reader: &mut R,
    buffer: &mut [u8],
    stop: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut tally = Tally::bytes();
    let mut total = 0u64;

    let outcome = loop {
        let read = tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            read = reader.read(buffer) => read,
        };
        match read {
            Ok(0) => break Ok(()),
            Ok(n) => {
                total += n as u64;
                tally.add(test, 0, n as u64);
            }
            Err(e) => break Err(e),
        }
    };

    tally.flush(test);
    outcome?;
    Ok(total)
}

/// Echoes fixed-size messages back to the peer until EOF or `stop`.
pub async fn echo<S>(stream: &mut S, buffer: &mut [u8], stop: &CancellationToken) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut echoed = 0u64;
    loop {
        let read = tokio::select! {
            _ = stop.cancelled() => return Ok(echoed),
            read = stream.read_exact(buffer) => read,
        };
        match read {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(echoed),
            Err(e) => return Err(e.into()),
        }
        stream.write_all(buffer).await?;
        echoed += 1;
    }
}

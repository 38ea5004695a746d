use anyhow::Context;
use config::Config as CConfig;
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const CONFIG_FILE: &str = "config.toml";

// Wire layout of one record: A(4) + B(2) + C(4) + D(1) + E(256) = 267 bytes.
const RECORD_WIRE_SIZE: usize = 267;
const TEXT_FIELD_WIDTH: usize = 256;
const PADDING_BYTE: u8 = 0x20;

// Packets are built in a fixed 1200-byte buffer: a 4-byte big-endian length
// header followed by up to 4 records (4 + 4*267 = 1072 used bytes when full).
// The header value counts the full used length, header included.
const HEADER_SIZE: usize = 4;
const RECORDS_PER_PACKET: usize = 4;
const PACKET_BUFFER_SIZE: usize = 1200;

// Every run draws its A values from a pool of 5 distinct integers in [1,255]
// and its text from this fixed dictionary.
const POOL_SIZE: usize = 5;
const WORDS: [&str; 5] = ["apple", "banana", "cherry", "dates", "elderberry"];

// Domain of the C field, encoded as IEEE-754 binary32.
const FLOAT_MIN: f32 = 1.18e-38;
const FLOAT_MAX: f32 = 3.40e38;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::new(CONFIG_FILE).context("Error loading config")?;
    tracing_subscriber::fmt::init();

    // All the work happens inside the workers. We wait for every one of them
    // here so the process cannot exit while connections are still draining.
    let head = TestHead::new(config);
    head.run().await;
    Ok(())
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
struct Config {
    log_level: String,
    target_host: String,
    port: u32,
    records_per_worker: usize,
    workers: usize,
    // Base seed for the per-worker random sources. When unset, each worker
    // seeds itself from OS entropy instead.
    seed: Option<u64>,
}

impl Config {
    fn new(path: &str) -> anyhow::Result<Self> {
        let mut c = CConfig::new();
        // The file is optional: without it we run on the defaults below.
        c.merge(config::File::with_name(path).required(false))?;
        let config: Self = c.try_into()?;
        std::env::set_var("RUST_LOG", &config.log_level);
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            target_host: "127.0.0.1".to_string(),
            port: 9000,
            records_per_worker: 1_000_000,
            workers: 10,
            seed: None,
        }
    }
}

// One synthetic record, held in native types until the encoder commits it to
// the wire. The text field stays a String here; the 0x20 padding to 256 bytes
// is part of the encoding, not of the record.
#[derive(Debug, Clone, PartialEq)]
struct TestRecord {
    a: u32,
    b: u16,
    c: f32,
    d: i8,
    text: String,
}

impl TestRecord {
    // Appends the 267-byte wire form of this record to the buffer. Field
    // order and widths are fixed; all multi-byte fields are big-endian.
    fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), HeadError> {
        let text = self.text.as_bytes();
        // A text longer than the field must fail here, before any bytes are
        // written, so it can never overflow into the next record.
        if text.len() > TEXT_FIELD_WIDTH {
            return Err(HeadError::TextTooLong {
                len: text.len(),
                max: TEXT_FIELD_WIDTH,
            });
        }
        buf.extend_from_slice(&self.a.to_be_bytes());
        buf.extend_from_slice(&self.b.to_be_bytes());
        // The float is committed to its binary32 bit pattern right here; a
        // native numeric value never crosses the buffer boundary unencoded.
        buf.extend_from_slice(&self.c.to_be_bytes());
        buf.extend_from_slice(&self.d.to_be_bytes());
        buf.extend_from_slice(text);
        buf.extend(std::iter::repeat(PADDING_BYTE).take(TEXT_FIELD_WIDTH - text.len()));
        Ok(())
    }
}

// Produces the full record sequence for one worker. Each generator owns its
// random source, so parallel workers never share or inherit RNG state, and a
// seeded source makes the whole sequence reproducible.
struct RecordGenerator {
    rng: StdRng,
    // The 5 distinct A values drawn once per run, not re-sampled per record.
    pool: Vec<u32>,
}

impl RecordGenerator {
    fn new(mut rng: StdRng) -> Self {
        let pool = (1..=255u32).choose_multiple(&mut rng, POOL_SIZE);
        Self { rng, pool }
    }

    // Builds the whole sequence eagerly; transmission only starts once every
    // record of the run exists in memory.
    fn generate(&mut self, count: usize) -> Vec<TestRecord> {
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let first = WORDS[self.rng.gen_range(0..WORDS.len())];
            let second = WORDS[self.rng.gen_range(0..WORDS.len())];
            records.push(TestRecord {
                a: self.pool[self.rng.gen_range(0..self.pool.len())],
                b: self.rng.gen(),
                c: self.rng.gen_range(FLOAT_MIN..=FLOAT_MAX),
                d: self.rng.gen(),
                text: format!("{} {}", first, second),
            });
        }
        records
    }
}

// Batches records into length-prefixed packets, 4 records per packet, and
// closes the stream with a zero-filled sentinel record.
struct PacketEncoder {
    packets: Vec<Vec<u8>>,
    buf: Vec<u8>,
    records_in_packet: usize,
}

impl PacketEncoder {
    fn new() -> Self {
        Self {
            packets: Vec::new(),
            buf: Self::fresh_buffer(),
            records_in_packet: 0,
        }
    }

    // Every buffer starts with 4 placeholder bytes where the header goes.
    // The real value is only known at flush time, when the batch is closed.
    fn fresh_buffer() -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_BUFFER_SIZE);
        buf.extend_from_slice(&[0u8; HEADER_SIZE]);
        buf
    }

    fn push(&mut self, record: &TestRecord) -> Result<(), HeadError> {
        record.write_to(&mut self.buf)?;
        self.records_in_packet += 1;
        if self.records_in_packet == RECORDS_PER_PACKET {
            self.flush();
        }
        Ok(())
    }

    // Closes the current batch: the header is recomputed from the used
    // length every time, so partial final batches carry a correct value
    // (4 + 267*k) and full batches the fixed 1072.
    fn flush(&mut self) {
        let used = self.buf.len() as u32;
        self.buf[..HEADER_SIZE].copy_from_slice(&used.to_be_bytes());
        let packet = std::mem::replace(&mut self.buf, Self::fresh_buffer());
        self.packets.push(packet);
        self.records_in_packet = 0;
    }

    // Appends the end-of-stream sentinel to whatever batch is pending
    // (possibly none) and emits the final packet. The sentinel never counts
    // toward the 4-record batch limit.
    fn finish(mut self) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(&[0u8; RECORD_WIRE_SIZE]);
        self.flush();
        self.packets
    }

    fn encode(records: &[TestRecord]) -> Result<Vec<Vec<u8>>, HeadError> {
        let mut encoder = Self::new();
        for record in records {
            encoder.push(record)?;
        }
        Ok(encoder.finish())
    }
}

// Owns one TCP connection and streams the encoded packets to it in order.
struct TransmissionClient {
    addr: String,
}

impl TransmissionClient {
    fn new(host: &str, port: u32) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
        }
    }

    // Writes every packet's used bytes to the stream, in order. write_all
    // absorbs short writes, so each packet is either delivered whole or the
    // error surfaces; the stream is dropped (closed) on every return path.
    async fn send(&self, packets: &[Vec<u8>]) -> Result<(), HeadError> {
        let mut stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|source| HeadError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;
        let mut packets_sent = 0;
        for packet in packets {
            stream
                .write_all(packet)
                .await
                .map_err(|source| HeadError::Transmission {
                    packets_sent,
                    source,
                })?;
            packets_sent += 1;
        }
        // Shut the write half down explicitly so the peer sees EOF as soon
        // as the last packet is flushed, not whenever the socket is dropped.
        stream
            .shutdown()
            .await
            .map_err(|source| HeadError::Transmission {
                packets_sent,
                source,
            })?;
        Ok(())
    }
}

// The fan-out orchestrator. Launches one independent generate->encode->send
// pipeline per worker, each on its own task with its own connection and its
// own random source. Workers share nothing and never synchronize.
struct TestHead {
    config: Config,
}

impl TestHead {
    fn new(config: Config) -> Self {
        Self { config }
    }

    // Fire-and-forget mode: spawns every worker and returns immediately with
    // their handles. Callers that need completion go through run() instead.
    fn launch(&self) -> Vec<JoinHandle<Result<usize, HeadError>>> {
        (0..self.config.workers)
            .map(|id| {
                let config = self.config.clone();
                tokio::spawn(async move { Self::run_worker(id, config).await })
            })
            .collect()
    }

    // Launches all workers and waits for every one of them, folding the
    // per-worker results into an aggregate report.
    async fn run(&self) -> FanoutReport {
        let handles = self.launch();
        let mut report = FanoutReport::default();
        for handle in handles {
            match handle.await {
                Ok(Ok(records)) => {
                    report.workers_ok += 1;
                    report.records_sent += records;
                }
                // The worker already logged its own failure with the cause.
                Ok(Err(_)) => report.workers_failed += 1,
                Err(err) => {
                    tracing::error!("Worker task failed to complete: {}", err);
                    report.workers_failed += 1;
                }
            }
        }
        tracing::info!("{}", report);
        report
    }

    // One complete pipeline: generate everything, encode everything, then
    // stream it over a dedicated connection. Any failure stays inside this
    // worker; siblings keep running on their own connections.
    async fn run_worker(id: usize, config: Config) -> Result<usize, HeadError> {
        let rng = match config.seed {
            // Derive a distinct seed per worker so siblings never replay
            // each other's sequences.
            Some(base) => StdRng::seed_from_u64(base.wrapping_add(id as u64)),
            None => StdRng::from_entropy(),
        };
        let mut generator = RecordGenerator::new(rng);
        let records = generator.generate(config.records_per_worker);
        let packets = match PacketEncoder::encode(&records) {
            Ok(packets) => packets,
            Err(err) => {
                tracing::warn!("Worker {} could not encode its records: {}", id, err);
                return Err(err);
            }
        };

        let client = TransmissionClient::new(&config.target_host, config.port);
        match client.send(&packets).await {
            Ok(()) => {
                tracing::info!(
                    "Worker {} sent {} records to {}",
                    id,
                    records.len(),
                    config.target_host
                );
                Ok(records.len())
            }
            Err(err) => {
                let sent = records_before_failure(&err, records.len());
                tracing::warn!(
                    "Worker {} failed after sending {} records: {}",
                    id,
                    sent,
                    err
                );
                Err(err)
            }
        }
    }
}

// How many real records made it out whole before the error. Only fully
// written packets count; the sentinel is not a record.
fn records_before_failure(err: &HeadError, total: usize) -> usize {
    match err {
        HeadError::Transmission { packets_sent, .. } => {
            (packets_sent * RECORDS_PER_PACKET).min(total)
        }
        _ => 0,
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct FanoutReport {
    workers_ok: usize,
    workers_failed: usize,
    records_sent: usize,
}

impl std::fmt::Display for FanoutReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} workers finished, {} failed. Records sent: {}",
            self.workers_ok, self.workers_failed, self.records_sent
        )
    }
}

#[derive(Debug, Error)]
enum HeadError {
    // The TCP connection could not be established. Fatal for the issuing
    // worker, never retried.
    #[error("connecting to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    // A write failed mid-stream after `packets_sent` whole packets.
    #[error("write failed after {packets_sent} packets: {source}")]
    Transmission {
        packets_sent: usize,
        source: std::io::Error,
    },

    // A record's text exceeds the 256-byte field. Not reachable with the
    // fixed dictionary, but a value wider than its field must never be
    // truncated silently.
    #[error("record text is {len} bytes, exceeds the {max}-byte field")]
    TextTooLong { len: usize, max: usize },
}

//! One-shot client for a plumedb gateway.
//!
//! Speaks the framed-JSON protocol: `query` consumes a chunk stream,
//! `status`/`cancel`/`health` are single round trips, and `bench` runs
//! the same query repeatedly and reports latency statistics.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use plumedb_core::{QueryChunk, QueryFilter};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "plumedb-cli")]
#[command(about = "Client for plumedb query gateways", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug, Default)]
struct FilterArgs {
    /// Pollutant parameter to match (repeatable)
    #[arg(short, long = "parameter")]
    parameters: Vec<String>,
    /// Site name to match (repeatable)
    #[arg(short, long = "site")]
    sites: Vec<String>,
    /// AQS code to match (repeatable)
    #[arg(long = "aqs-code")]
    aqs_codes: Vec<String>,
    #[arg(long)]
    min_aqi: Option<i32>,
    #[arg(long)]
    max_aqi: Option<i32>,
    #[arg(long)]
    min_concentration: Option<f64>,
    #[arg(long)]
    max_concentration: Option<f64>,
    #[arg(long)]
    min_latitude: Option<f64>,
    #[arg(long)]
    max_latitude: Option<f64>,
    #[arg(long)]
    min_longitude: Option<f64>,
    #[arg(long)]
    max_longitude: Option<f64>,
    /// Earliest UTC timestamp, inclusive (ISO-8601)
    #[arg(long)]
    start_utc: Option<String>,
    /// Latest UTC timestamp, inclusive (ISO-8601)
    #[arg(long)]
    end_utc: Option<String>,
}

impl FilterArgs {
    fn into_filter(self) -> QueryFilter {
        QueryFilter {
            parameters: self.parameters,
            site_names: self.sites,
            aqs_codes: self.aqs_codes,
            min_aqi: self.min_aqi,
            max_aqi: self.max_aqi,
            min_concentration: self.min_concentration,
            max_concentration: self.max_concentration,
            min_latitude: self.min_latitude,
            max_latitude: self.max_latitude,
            min_longitude: self.min_longitude,
            max_longitude: self.max_longitude,
            start_utc: self.start_utc,
            end_utc: self.end_utc,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a filtered query and print the chunk stream
    Query {
        /// Gateway address (host:port)
        #[arg(short = 'H', long, default_value = "127.0.0.1:50051")]
        host: String,
        /// Request id; random when omitted
        #[arg(long)]
        request_id: Option<u64>,
        /// Records per chunk (0 lets the server pick)
        #[arg(long, default_value_t = 100)]
        chunk_size: u32,
        /// Print every record instead of per-chunk summaries
        #[arg(long)]
        records: bool,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Fetch the status of a previously submitted request
    Status {
        #[arg(short = 'H', long, default_value = "127.0.0.1:50051")]
        host: String,
        request_id: u64,
    },
    /// Cancel an in-flight request
    Cancel {
        #[arg(short = 'H', long, default_value = "127.0.0.1:50051")]
        host: String,
        request_id: u64,
    },
    /// Check a node is alive and report its partition size
    Health {
        #[arg(short = 'H', long, default_value = "127.0.0.1:50051")]
        host: String,
    },
    /// Run the same query repeatedly and report latency statistics
    Bench {
        #[arg(short = 'H', long, default_value = "127.0.0.1:50051")]
        host: String,
        /// Number of timed runs
        #[arg(short, long, default_value_t = 5)]
        runs: u32,
        #[arg(long, default_value_t = 1000)]
        chunk_size: u32,
        #[command(flatten)]
        filter: FilterArgs,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Query {
            host,
            request_id,
            chunk_size,
            records,
            filter,
        } => {
            let request_id = request_id.unwrap_or_else(|| rand::random::<u32>() as u64);
            let chunks = run_query(&host, request_id, &filter.into_filter(), chunk_size)?;
            let total: usize = chunks.iter().map(|c| c.records.len()).sum();
            for chunk in &chunks {
                if records {
                    for r in &chunk.records {
                        println!(
                            "{} | {} | {} | AQI {} | {:.2} | ({:.4}, {:.4})",
                            r.timestamp_utc,
                            r.site_name,
                            r.parameter,
                            r.aqi,
                            r.concentration,
                            r.latitude,
                            r.longitude
                        );
                    }
                } else {
                    println!(
                        "chunk {}/{}: {} records{}",
                        chunk.chunk_index + 1,
                        chunk.total_chunks,
                        chunk.records.len(),
                        if chunk.is_last_chunk { " (last)" } else { "" }
                    );
                }
            }
            println!("request {request_id}: {total} records in {} chunks", chunks.len());
        }
        Commands::Status { host, request_id } => {
            let reply = round_trip(&host, &json!({"op": "get_status", "request_id": request_id}))?;
            print_status(&reply);
        }
        Commands::Cancel { host, request_id } => {
            let reply = round_trip(&host, &json!({"op": "cancel", "request_id": request_id}))?;
            println!(
                "request {request_id}: {}",
                reply["status"].as_str().unwrap_or("unknown")
            );
        }
        Commands::Health { host } => {
            let reply = round_trip(&host, &json!({"op": "health"}))?;
            if reply["status"] != "ok" {
                bail!("unhealthy reply: {reply}");
            }
            println!(
                "node {} ok: {} records loaded (root={})",
                reply["node_id"].as_str().unwrap_or("?"),
                reply["record_count"],
                reply["root"]
            );
        }
        Commands::Bench {
            host,
            runs,
            chunk_size,
            filter,
        } => {
            run_bench(&host, runs, chunk_size, &filter.into_filter())?;
        }
    }
    Ok(())
}

fn run_bench(host: &str, runs: u32, chunk_size: u32, filter: &QueryFilter) -> Result<()> {
    let mut elapsed = Vec::with_capacity(runs as usize);
    let mut total_records = 0usize;
    let base: u64 = rand::random::<u32>() as u64;

    for run in 0..runs {
        let start = Instant::now();
        let chunks = run_query(host, base + run as u64, filter, chunk_size)?;
        let took = start.elapsed();
        total_records = chunks.iter().map(|c| c.records.len()).sum();
        println!(
            "run {}: {} chunks, {} records, {:.1} ms",
            run + 1,
            chunks.len(),
            total_records,
            took.as_secs_f64() * 1000.0
        );
        elapsed.push(took);
    }

    let mean = elapsed.iter().sum::<Duration>() / runs.max(1);
    let min = elapsed.iter().min().copied().unwrap_or_default();
    let max = elapsed.iter().max().copied().unwrap_or_default();
    println!(
        "{} runs, {} records each: mean {:.1} ms, min {:.1} ms, max {:.1} ms",
        runs,
        total_records,
        mean.as_secs_f64() * 1000.0,
        min.as_secs_f64() * 1000.0,
        max.as_secs_f64() * 1000.0
    );
    Ok(())
}

fn run_query(
    host: &str,
    request_id: u64,
    filter: &QueryFilter,
    chunk_size: u32,
) -> Result<Vec<QueryChunk>> {
    let mut stream = connect(host)?;
    let request = json!({
        "op": "query",
        "request_id": request_id,
        "filter": filter,
        "max_results_per_chunk": chunk_size,
    });
    send_frame(&mut stream, &request)?;

    let header: Value = serde_json::from_slice(&read_frame(&mut stream)?)
        .context("malformed query header")?;
    if header["status"] != "ok" {
        bail!(
            "query rejected: {}",
            header["error"].as_str().unwrap_or("unknown error")
        );
    }

    let mut chunks = Vec::new();
    loop {
        let frame = read_frame(&mut stream)?;
        if frame.is_empty() {
            break;
        }
        let chunk: QueryChunk =
            serde_json::from_slice(&frame).context("malformed chunk frame")?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

fn print_status(reply: &Value) {
    match reply["status"].as_str() {
        Some("not_found") => println!("request {}: not found", reply["request_id"]),
        Some(status) => println!(
            "request {}: {} ({}/{} chunks delivered)",
            reply["request_id"],
            status,
            reply["chunks_delivered"],
            reply["total_chunks"]
        ),
        None => println!("unexpected reply: {reply}"),
    }
}

fn connect(host: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(host).with_context(|| format!("connect to {host}"))?;
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;
    Ok(stream)
}

fn round_trip(host: &str, request: &Value) -> Result<Value> {
    let mut stream = connect(host)?;
    send_frame(&mut stream, request)?;
    let frame = read_frame(&mut stream)?;
    serde_json::from_slice(&frame).map_err(|e| anyhow!("malformed reply: {e}"))
}

fn send_frame(stream: &mut TcpStream, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(&bytes)?;
    Ok(())
}

/// Read one frame. The empty frame is the stream's end sentinel and
/// comes back as an empty vec.
fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).context("read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut buf).context("read frame payload")?;
    }
    Ok(buf)
}

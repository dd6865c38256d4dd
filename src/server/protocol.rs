//! Per-connection command dispatch (spec.md section 4.6): the first byte
//! of the request line selects `R` (query), `S` (subscribe), `C` (status),
//! `D` (debug), or `V` (protocol version handshake).

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;

use query::{self, QueryEngine};
use raw::{DiskHeader, SERVER_MAJOR, SERVER_MINOR};
use server::Shared;
use subscribe;

pub fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to clone connection socket: {}", e);
            return;
        }
    };
    let mut reader = BufReader::new(reader_stream);
    let mut writer = stream;

    let mut line = String::new();
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return;
    }
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }
    let (cmd, rest) = line.split_at(1);

    match cmd {
        "R" => handle_query(rest, &shared, &mut writer),
        "S" => handle_subscribe(rest, &shared, &mut writer),
        "C" => handle_status(rest, &shared, &mut writer),
        "D" => handle_debug(&shared, &mut writer),
        "V" => handle_version(rest, &mut writer),
        other => {
            let _ = writer.write_all(format!("bad request: unknown command {:?}\n", other).as_bytes());
        }
    }
}

fn handle_query(rest: &str, shared: &Shared, writer: &mut TcpStream) {
    let fa_entry_count = shared.ctx.config().fa_entry_count;
    let request = match query::parse(rest, fa_entry_count) {
        Ok(r) => r,
        Err(e) => {
            let _ = writer.write_all(format!("{}\n", e).as_bytes());
            return;
        }
    };

    let engine = QueryEngine::new(&shared.ctx, &shared.pool);
    if let Err(e) = engine.execute(&request, writer) {
        let _ = writer.write_all(format!("{}\n", e).as_bytes());
    }
}

fn handle_subscribe(rest: &str, shared: &Shared, writer: &mut TcpStream) {
    let fa_entry_count = shared.ctx.config().fa_entry_count;
    let request = match subscribe::parse(rest, fa_entry_count) {
        Ok(r) => r,
        Err(e) => {
            let _ = writer.write_all(format!("{}\n", e).as_bytes());
            return;
        }
    };

    let buffer = if request.options.decimated {
        &shared.decimated_buffer
    } else {
        &shared.fa_buffer
    };
    let reader_id = buffer.open_reader(false);
    shared.register_subscriber(request.options.decimated, reader_id);

    if let Err(e) = subscribe::run(&request, &shared.ctx, buffer, reader_id, writer, &shared.shutdown) {
        debug!("subscriber disconnected: {}", e);
    }

    shared.deregister_subscriber(reader_id);
    buffer.close_reader(reader_id);
}

/// `C` batches independent single-letter subcommands, one output line per
/// letter in request order (spec.md section 4.6): `F` mean frame rate,
/// `d`/`D` decimation factors, `T` earliest archived timestamp, `V`
/// protocol version, `M` raw archive mask, `C` live decimation factor or
/// 0, `S` sniffer status tuple, `I` connected-client timestamps. An
/// unrecognised letter ends the batch with an error line, matching a
/// pre-flight client-request error (spec.md section 7) rather than a
/// mid-stream one since nothing but whole lines has been written so far.
fn handle_status(rest: &str, shared: &Shared, writer: &mut TcpStream) {
    let header = shared.ctx.header();
    for c in rest.chars() {
        let result = match c {
            'F' => writeln!(writer, "{:.2}", mean_frame_rate(&header)),
            'd' => writeln!(writer, "{}", header.first_decimation_log2),
            'D' => writeln!(writer, "{}", header.second_decimation_log2),
            'T' => writeln!(writer, "{}", earliest_timestamp(shared, &header)),
            'V' => writeln!(writer, "{}.{}", SERVER_MAJOR, SERVER_MINOR),
            'M' => writeln!(writer, "{}", header.archive_mask().to_hex(header.fa_entry_count as usize)),
            'C' => writeln!(writer, "{}", shared.decimation_factor()),
            'S' => {
                let status = shared.source_status();
                writeln!(
                    writer,
                    "{},{}",
                    if status.link_up { 1 } else { 0 },
                    status.last_error.as_deref().unwrap_or("")
                )
            }
            'I' => {
                let timestamps = shared.subscriber_timestamps();
                let joined = timestamps.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(",");
                writeln!(writer, "{}", joined)
            }
            other => writeln!(writer, "bad request: unknown status field {:?}", other),
        };
        if result.is_err() {
            return;
        }
    }
}

/// `major_sample_count` frames completed divided by the IIR-smoothed
/// duration of a major block (spec.md's "mean frame rate"), 0 before the
/// first major block has completed and `last_duration` is still its
/// initial zero.
fn mean_frame_rate(header: &DiskHeader) -> f64 {
    if header.last_duration == 0 {
        0.0
    } else {
        header.major_sample_count as f64 * 1_000_000.0 / header.last_duration as f64
    }
}

/// Earliest timestamp among currently valid index entries, skipping the
/// "current" (in-progress) block the way the query engine's
/// `valid_blocks` does (spec.md section 4.4 step 1, "skipping the
/// 'current' block").
fn earliest_timestamp(shared: &Shared, header: &DiskHeader) -> u64 {
    let count = header.major_block_count as usize;
    let current = header.current_major_block as usize;
    (0..count)
        .filter(|&slot| slot != current)
        .map(|slot| shared.ctx.index_entry(slot))
        .filter(|entry| entry.is_valid())
        .map(|entry| entry.timestamp_us)
        .min()
        .unwrap_or(0)
}

fn handle_debug(shared: &Shared, writer: &mut TcpStream) {
    let header = shared.ctx.header();
    let _ = writeln!(
        writer,
        "current_major_block={} last_duration={}",
        header.current_major_block, header.last_duration
    );
}

/// Validates a client-declared protocol version, preserving the original
/// device's off-by-one acceptance check rather than correcting it: a
/// client whose minor version exactly equals ours is rejected as
/// incompatible (see DESIGN.md's Open Question entry on this comparison).
fn version_compatible(major: u32, minor: u32) -> bool {
    !(major > SERVER_MAJOR || minor >= SERVER_MINOR)
}

fn handle_version(rest: &str, writer: &mut TcpStream) {
    let mut parts = rest.splitn(2, '.');
    let parsed = parts
        .next()
        .and_then(|m| m.parse::<u32>().ok())
        .and_then(|major| parts.next().and_then(|n| n.parse::<u32>().ok()).map(|minor| (major, minor)));

    match parsed {
        Some((major, minor)) if version_compatible(major, minor) => {
            let _ = writeln!(writer, "V{}.{}", SERVER_MAJOR, SERVER_MINOR);
        }
        Some((major, minor)) => {
            let _ = writeln!(writer, "incompatible client version {}.{}", major, minor);
        }
        None => {
            let _ = writeln!(writer, "bad request: malformed version {:?}", rest);
        }
    }
}
